use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha384, Sha512};

use crate::ReferenceError;

/// Hash algorithms a [`Digest`] may be tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    /// SHA-256, the canonical algorithm for OCI content.
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

impl Algorithm {
    /// The algorithm name as it appears before the `:` in a digest.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex-encoded hash.
    pub fn encoded_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha384 => 96,
            Algorithm::Sha512 => 128,
        }
    }

    /// Hash `data` in one shot and hex encode the result.
    pub fn hash(&self, data: &[u8]) -> String {
        match self {
            Algorithm::Sha256 => hex::encode(Sha256::digest(data)),
            Algorithm::Sha384 => hex::encode(Sha384::digest(data)),
            Algorithm::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }

    /// Start hashing a stream.
    pub fn digester(&self) -> Digester {
        let state = match self {
            Algorithm::Sha256 => DigesterState::Sha256(Sha256::new()),
            Algorithm::Sha384 => DigesterState::Sha384(Sha384::new()),
            Algorithm::Sha512 => DigesterState::Sha512(Sha512::new()),
        };
        Digester { state }
    }
}

/// Computes a [`Digest`] over data that arrives in pieces.
#[derive(Clone)]
pub struct Digester {
    state: DigesterState,
}

#[derive(Clone)]
enum DigesterState {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Digester {
    /// The algorithm being computed.
    pub fn algorithm(&self) -> Algorithm {
        match self.state {
            DigesterState::Sha256(_) => Algorithm::Sha256,
            DigesterState::Sha384(_) => Algorithm::Sha384,
            DigesterState::Sha512(_) => Algorithm::Sha512,
        }
    }

    /// Feed the next piece.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            DigesterState::Sha256(h) => h.update(data),
            DigesterState::Sha384(h) => h.update(data),
            DigesterState::Sha512(h) => h.update(data),
        }
    }

    /// The digest of everything fed so far.
    pub fn finish(self) -> Digest {
        let algorithm = self.algorithm();
        let encoded = match self.state {
            DigesterState::Sha256(h) => hex::encode(h.finalize()),
            DigesterState::Sha384(h) => hex::encode(h.finalize()),
            DigesterState::Sha512(h) => hex::encode(h.finalize()),
        };
        Digest { algorithm, encoded }
    }
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Digester")
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha384" => Ok(Algorithm::Sha384),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(ReferenceError::UnsupportedAlgorithm(other.to_owned())),
        }
    }
}

/// An algorithm-tagged content hash, e.g. `sha256:e3b0c442...`.
///
/// Parsing checks the algorithm is known and that the encoded part is
/// lowercase hex of the right length, so both halves are safe to use as
/// path components.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    encoded: String,
}

impl Digest {
    /// Build a digest from an algorithm and an already-encoded hash.
    pub fn new(algorithm: Algorithm, encoded: &str) -> Result<Self, ReferenceError> {
        validate_encoded(algorithm, encoded).map_err(|reason| ReferenceError::InvalidDigest {
            input: format!("{algorithm}:{encoded}"),
            reason,
        })?;
        Ok(Self {
            algorithm,
            encoded: encoded.to_owned(),
        })
    }

    /// Compute the digest of `data`.
    pub fn from_content(algorithm: Algorithm, data: &[u8]) -> Self {
        Self {
            algorithm,
            encoded: algorithm.hash(data),
        }
    }

    /// Compute the sha256 digest of `data`.
    pub fn sha256(data: &[u8]) -> Self {
        Self::from_content(Algorithm::Sha256, data)
    }

    /// The hash algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The hex-encoded hash, without the algorithm prefix.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

fn validate_encoded(algorithm: Algorithm, encoded: &str) -> Result<(), &'static str> {
    if encoded.len() != algorithm.encoded_len() {
        return Err("encoded hash has the wrong length");
    }
    if !encoded
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err("encoded hash must be lowercase hex");
    }
    Ok(())
}

impl FromStr for Digest {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, encoded) = s.split_once(':').ok_or_else(|| ReferenceError::InvalidDigest {
            input: s.to_owned(),
            reason: "missing algorithm separator",
        })?;
        let algorithm: Algorithm = algorithm.parse()?;
        Digest::new(algorithm, encoded)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn parse_and_display() {
        let digest: Digest = EMPTY_SHA256.parse().unwrap();
        assert_eq!(digest.algorithm(), Algorithm::Sha256);
        assert_eq!(digest.to_string(), EMPTY_SHA256);
        assert_eq!(Digest::sha256(b""), digest);
    }

    #[test]
    fn rejects_bad_digests() {
        for input in [
            "",
            "sha256",
            "sha256:",
            "md5:d41d8cd98f00b204e9800998ecf8427e",
            "sha256:E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855",
            "sha256:../../etc/passwd",
            "sha256:abc123",
        ] {
            assert!(input.parse::<Digest>().is_err(), "{input:?} should not parse");
        }
    }

    #[test]
    fn digester_matches_one_shot_hash() {
        for algorithm in [Algorithm::Sha256, Algorithm::Sha384, Algorithm::Sha512] {
            let mut digester = algorithm.digester();
            digester.update(b"split ");
            digester.update(b"");
            digester.update(b"across pieces");
            assert_eq!(
                digester.finish(),
                Digest::from_content(algorithm, b"split across pieces")
            );
        }
    }

    #[test]
    fn serde_as_string() {
        let digest = Digest::sha256(b"hello");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{digest}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }

    #[test]
    fn other_algorithms() {
        let digest = Digest::from_content(Algorithm::Sha512, b"hello");
        assert_eq!(digest.encoded().len(), 128);
        assert_eq!(digest.to_string().parse::<Digest>().unwrap(), digest);
    }
}
