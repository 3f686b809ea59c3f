use thiserror::Error;

/// Errors produced while validating identity values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    /// The input was empty.
    #[error("empty reference")]
    Empty,

    /// A digest was malformed.
    #[error("invalid digest {input:?}: {reason}")]
    InvalidDigest {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The digest algorithm is not one we can verify.
    #[error("unsupported digest algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    /// The input is a 64 character hex string, which is an image ID rather
    /// than a repository name.
    #[error("invalid repository name {0:?}: cannot specify 64-byte hexadecimal strings")]
    LooksLikeImageId(String),

    /// An image name failed to parse.
    #[error("invalid reference format {input:?}: {reason}")]
    InvalidFormat {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A name was expected to be fully qualified but carries no registry.
    #[error("reference {0:?} is not fully qualified")]
    NotQualified(String),

    /// A storage image ID was not a full 64 character lowercase hex string.
    #[error("invalid image ID {0:?}")]
    InvalidImageId(String),
}
