//! # Image identity
//!
//! Validated value types for the two ways an image is named:
//!
//! - [`StorageImageID`]: the content-derived ID of an image in local storage.
//! - [`RegistryImageReference`]: a fully-qualified name on a registry, carrying
//!   exactly one of a tag or a digest.
//!
//! Both can only be built through validating constructors, so an empty or
//! half-initialized value never reaches a lookup where it could act as a
//! wildcard. [`ImageName`] is the looser parsed form of user input, which may
//! still be a short name that needs resolving against search registries.

mod digest;
mod error;
mod image_id;
mod name;
mod reference;

pub use digest::{Algorithm, Digest, Digester};
pub use error::ReferenceError;
pub use image_id::StorageImageID;
pub use name::{ImageName, DEFAULT_DOMAIN, DEFAULT_TAG, LEGACY_DEFAULT_DOMAIN, OFFICIAL_REPO_PREFIX};
pub use reference::RegistryImageReference;
