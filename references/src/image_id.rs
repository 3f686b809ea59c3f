use std::fmt;

use crate::{Algorithm, Digest, ReferenceError};

const IMAGE_ID_LEN: usize = 64;

/// True if `s` has the shape of a full image ID: 64 lowercase hex characters.
pub(crate) fn is_full_image_id(s: &str) -> bool {
    s.len() == IMAGE_ID_LEN && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// The full, content-derived ID of an image in local storage.
///
/// Never a prefix and never empty. There is deliberately no `Display` or
/// `AsRef<str>`: handing the raw string to a lookup that also accepts names or
/// ID prefixes is exactly the confusion this type exists to prevent. Use
/// [`StorageImageID::id_string_for_out_of_process_consumption_only`] when the
/// ID has to leave the process.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageImageID(String);

impl StorageImageID {
    /// Validate and wrap a full image ID.
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        if input.is_empty() {
            return Err(ReferenceError::Empty);
        }
        if !is_full_image_id(input) {
            return Err(ReferenceError::InvalidImageId(input.to_owned()));
        }
        Ok(Self(input.to_owned()))
    }

    /// Image IDs are the encoded part of the sha256 config digest.
    pub fn from_config_digest(digest: &Digest) -> Result<Self, ReferenceError> {
        if digest.algorithm() != Algorithm::Sha256 {
            return Err(ReferenceError::InvalidImageId(digest.to_string()));
        }
        Self::parse(digest.encoded())
    }

    /// The raw ID, for serialization to external protocols and for logs.
    pub fn id_string_for_out_of_process_consumption_only(&self) -> &str {
        &self.0
    }

    /// True if `prefix` is a prefix of this ID.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Debug for StorageImageID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageImageID({})", self.0)
    }
}
