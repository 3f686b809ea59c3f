use std::fmt;
use std::str::FromStr;

use crate::image_id::is_full_image_id;
use crate::{Digest, ReferenceError};

/// Registry used for names that don't carry one, once normalized.
pub const DEFAULT_DOMAIN: &str = "docker.io";

/// Historical spelling of [`DEFAULT_DOMAIN`], rewritten on normalization.
pub const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";

/// Single-component repositories on the default registry live under this prefix.
pub const OFFICIAL_REPO_PREFIX: &str = "library/";

/// Tag assumed when a name carries neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

const NAME_TOTAL_LENGTH_MAX: usize = 255;
const TAG_LENGTH_MAX: usize = 128;

/// A parsed docker-style image name, as a user typed it.
///
/// The name may be short (no registry domain), and may carry a tag, a digest,
/// both, or neither. Use [`ImageName::normalized`] or
/// [`crate::RegistryImageReference`] to get something canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName {
    domain: Option<String>,
    path: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl ImageName {
    /// Parse `input` following the docker reference grammar.
    ///
    /// A bare 64 character hex string is rejected with
    /// [`ReferenceError::LooksLikeImageId`], so callers can tell "this was an
    /// ID" apart from a malformed name.
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        if input.is_empty() {
            return Err(ReferenceError::Empty);
        }
        if is_full_image_id(input) {
            return Err(ReferenceError::LooksLikeImageId(input.to_owned()));
        }

        let invalid = |reason| ReferenceError::InvalidFormat {
            input: input.to_owned(),
            reason,
        };

        let (rest, digest) = match input.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.parse::<Digest>()?)),
            None => (input, None),
        };

        let (name, tag) = match rest.rfind(':') {
            Some(i) if !rest[i + 1..].contains('/') => (&rest[..i], Some(&rest[i + 1..])),
            _ => (rest, None),
        };

        if let Some(tag) = tag {
            if !valid_tag(tag) {
                return Err(invalid("invalid tag"));
            }
        }
        if name.is_empty() {
            return Err(invalid("missing repository name"));
        }
        if name.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(invalid("repository name too long"));
        }

        let (domain, path) = split_domain(name);
        if let Some(domain) = domain {
            if !valid_domain(domain) {
                return Err(invalid("invalid registry domain"));
            }
        }
        if path.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(invalid("repository name must be lowercase"));
        }
        if !path.split('/').all(valid_component) {
            return Err(invalid("invalid repository path component"));
        }

        Ok(Self {
            domain: domain.map(str::to_owned),
            path: path.to_owned(),
            tag: tag.map(str::to_owned),
            digest,
        })
    }

    /// The registry domain, if the name carried one.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// The repository path below the domain.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The tag, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The digest, if any.
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// A short name has no registry domain and must be resolved against
    /// aliases or search registries before it can be pulled.
    pub fn is_short_name(&self) -> bool {
        self.domain.is_none()
    }

    /// The name without tag or digest, as written.
    pub fn repository_name(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{domain}/{}", self.path),
            None => self.path.clone(),
        }
    }

    /// Place this name on `domain`, applying the official-repository rule for
    /// the default registry. Tag and digest are kept.
    pub fn with_domain(&self, domain: &str) -> ImageName {
        let domain = if domain == LEGACY_DEFAULT_DOMAIN {
            DEFAULT_DOMAIN
        } else {
            domain
        };
        let path = if domain == DEFAULT_DOMAIN && !self.path.contains('/') {
            format!("{OFFICIAL_REPO_PREFIX}{}", self.path)
        } else {
            self.path.clone()
        };
        ImageName {
            domain: Some(domain.to_owned()),
            path,
            tag: self.tag.clone(),
            digest: self.digest.clone(),
        }
    }

    /// Qualify with the default registry if the name is short.
    pub fn normalized(&self) -> ImageName {
        self.with_domain(self.domain.as_deref().unwrap_or(DEFAULT_DOMAIN))
    }
}

impl FromStr for ImageName {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageName::parse(s)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository_name())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// The first component is a domain if it looks like a host: it has a dot or a
/// port, is `localhost`, or has uppercase letters (which paths never do).
fn split_domain(name: &str) -> (Option<&str>, &str) {
    match name.split_once('/') {
        Some((first, rest))
            if first.contains('.')
                || first.contains(':')
                || first == "localhost"
                || first.bytes().any(|b| b.is_ascii_uppercase()) =>
        {
            (Some(first), rest)
        }
        _ => (None, name),
    }
}

fn valid_domain(domain: &str) -> bool {
    let (host, port) = match domain.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (domain, None),
    };
    if let Some(port) = port {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        })
}

/// `[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*`
fn valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    match (bytes.first(), bytes.last()) {
        (Some(&first), Some(&last)) if alnum(first) && alnum(last) => {}
        _ => return false,
    }

    let mut i = 0;
    while i < bytes.len() {
        if alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !alnum(bytes[i]) {
            i += 1;
        }
        let separator = &component[start..i];
        let ok = matches!(separator, "." | "_" | "__") || separator.bytes().all(|b| b == b'-');
        if !ok {
            return false;
        }
    }
    true
}

/// `[\w][\w.-]{0,127}`
fn valid_tag(tag: &str) -> bool {
    let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let bytes = tag.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= TAG_LENGTH_MAX
        && word(bytes[0])
        && bytes[1..].iter().all(|&b| word(b) || b == b'.' || b == b'-')
}
