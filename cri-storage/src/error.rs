//! Error types for the image and runtime servers.

use std::error::Error as StdError;

use blobcache::BlobCacheError;
use references::ReferenceError;
use store::{MultiError, StoreError};

/// Result type for image and runtime server operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by [`crate::ImageServer`], [`crate::RuntimeServer`] and
/// [`crate::MultiStoreServer`].
///
/// The unit-like variants are identities callers match on. They are always
/// returned bare, before anything was changed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Pod name or pod ID was empty.
    #[error("invalid pod name")]
    InvalidPodName,

    /// Container name was empty.
    #[error("invalid container name")]
    InvalidContainerName,

    /// No pod sandbox with that ID or name.
    #[error("invalid sandbox ID")]
    InvalidSandboxID,

    /// No container with that ID or name.
    #[error("invalid container ID")]
    InvalidContainerID,

    /// The input looks like an image ID but no local image has it.
    #[error("cannot parse an image ID {0:?}")]
    CannotParseImageID(String),

    /// Refusing to delete an image by ID while several names refer to it.
    #[error("image {0} is tagged with multiple names, use force to remove it")]
    ImageMultiplyTagged(String),

    /// No local image matches.
    #[error("image {0:?} not known")]
    ImageUnknown(String),

    /// An image name, reference or ID failed validation.
    #[error("invalid image reference {input:?}: {source}")]
    Reference {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        #[source]
        source: ReferenceError,
    },

    /// A short name could not be expanded to any registry.
    #[error("short name {0:?} did not resolve to any registry: no unqualified-search registries are configured")]
    ShortNameUnresolvable(String),

    /// The signature policy rejects the source.
    #[error("pulling {0} is rejected by the signature policy")]
    PolicyRejected(String),

    /// Content did not hash to its advertised digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Advertised digest.
        expected: String,
        /// Digest of the received bytes.
        actual: String,
    },

    /// The image's manifest or configuration could not be used.
    #[error("image {image}: {reason}")]
    InvalidImage {
        /// Image ID or reference.
        image: String,
        /// What was wrong.
        reason: String,
    },

    /// The registry transport failed.
    #[error("copying image from {source_ref}: {error}")]
    Transport {
        /// The transport-qualified source.
        source_ref: String,
        /// The underlying failure.
        #[source]
        error: Box<dyn StdError + Send + Sync + 'static>,
    },

    /// The isolated pull worker failed.
    #[error("isolated pull failed ({status}): {stderr}")]
    IsolatedPull {
        /// Exit status as reported by the OS.
        status: String,
        /// Everything the worker wrote to stderr.
        stderr: String,
    },

    /// The isolated pull worker broke the stdin/stdout framing.
    #[error("isolated pull protocol: {0}")]
    PullProtocol(String),

    /// The worker could not be moved into its own cgroup scope.
    #[error("moving pull worker into scope {scope}: {error}")]
    Cgroup {
        /// The scope name.
        scope: String,
        /// The underlying failure.
        #[source]
        error: Box<dyn StdError + Send + Sync + 'static>,
    },

    /// The pull was cancelled.
    #[error("pull cancelled")]
    Cancelled,

    /// The blob cache could not be opened.
    #[error("blob cache: {0}")]
    BlobCache(#[from] BlobCacheError),

    /// A storage library call failed.
    #[error("{context}: {source}")]
    Store {
        /// What was being attempted.
        context: String,
        /// The underlying error.
        #[source]
        source: StoreError,
    },

    /// Every backend of a multi-store failed.
    #[error("all storage backends failed: {0}")]
    Backends(#[source] MultiError<Error>),

    /// Container metadata could not be encoded or decoded.
    #[error("container metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Configuration could not be parsed.
    #[error("configuration: {0}")]
    Config(#[from] toml_edit::de::Error),

    /// Filesystem or process failure.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// A closure for `.map_err()` that wraps a storage error with context.
    pub(crate) fn store(context: impl Into<String>) -> impl FnOnce(StoreError) -> Error {
        let context = context.into();
        move |source| Error::Store { context, source }
    }

    /// A closure for `.map_err()` that wraps an I/O error with context.
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Error {
        let context = context.into();
        move |source| Error::Io { context, source }
    }

    pub(crate) fn reference(input: &str) -> impl FnOnce(ReferenceError) -> Error + '_ {
        move |source| Error::Reference {
            input: input.to_owned(),
            source,
        }
    }

    /// True when the object asked for does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ImageUnknown(_) => true,
            Error::Store { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// True for the identities that signal a problem with the caller's
    /// input rather than with one backend, so trying another backend is
    /// pointless.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::CannotParseImageID(_) | Error::ImageMultiplyTagged(_)
        )
    }
}
