use camino::Utf8PathBuf;
use references::ReferenceError;

/// Result type for blob cache operations.
pub type BlobCacheResult<T> = Result<T, BlobCacheError>;

/// Errors returned by the blob cache.
#[derive(Debug, thiserror::Error)]
pub enum BlobCacheError {
    /// The cache root was the empty string.
    #[error("blob cache directory cannot be empty")]
    EmptyDirectory,

    /// The cache root was not an absolute path.
    #[error("blob cache directory must be an absolute path: {0}")]
    RelativePath(Utf8PathBuf),

    /// A digest failed to parse.
    #[error("invalid digest: {0}")]
    InvalidDigest(#[from] ReferenceError),

    /// The stored bytes did not hash to the expected digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest the caller asked for.
        expected: String,
        /// The digest of the bytes actually read.
        actual: String,
    },

    /// Filesystem failure.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The metadata file could not be encoded.
    #[error("blob cache metadata: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BlobCacheError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| BlobCacheError::Io { context, source }
    }
}
