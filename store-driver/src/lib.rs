//! # Storage library interface
//!
//! The capability set the image and runtime servers need from a storage
//! library: image, layer and container records, big-data blobs attached to
//! images, and the mount/directory primitives behind a container.

mod driver;
mod error;
mod records;

pub use driver::{Reader, Store};
pub use error::{StoreError, StoreErrorBuilder, StoreErrorKind};
pub use records::{
    ContainerOptions, ContainerRecord, IdMap, IdMappings, ImageRecord, LayerRecord,
    IMAGE_DIGEST_BIG_DATA_KEY,
};
