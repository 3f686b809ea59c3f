//! # Blob cache
//!
//! A local, content-addressed cache of compressed layer blobs that sits
//! beside the image store. Pulls write every layer into it as a side channel
//! so the node can later serve those blobs to peers.
//!
//! ```no_run
//! # async fn example() -> Result<(), blobcache::BlobCacheError> {
//! use std::collections::HashSet;
//!
//! let cache = blobcache::BlobCache::new("/var/lib/blob-cache").await?;
//! let data = b"layer bytes";
//! let digest = references::Digest::sha256(data).to_string();
//! cache
//!     .store_blob(&digest, &mut &data[..], "docker.io", "library/alpine")
//!     .await?;
//! cache.garbage_collect(&HashSet::from([digest])).await?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod error;
mod metadata;

pub use cache::{BlobCache, GcStats};
pub use error::{BlobCacheError, BlobCacheResult};
pub use metadata::{BlobInfo, Metadata, Source};
