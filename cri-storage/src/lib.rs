//! # CRI storage
//!
//! The storage half of a container runtime: an [`ImageServer`] that pulls,
//! lists and removes images, a [`RuntimeServer`] that creates and tears down
//! pod sandboxes and containers on top of those images, and a
//! [`MultiStoreServer`] that spreads both across several storage drivers.
//!
//! Everything here talks to storage through the [`store::Store`] interface.
//! Registries are reached through an [`ImageTransport`].

mod config;
mod destination;
mod error;
mod image;
pub mod isolated;
mod multi;
mod policy;
mod pull;
mod runtime;
mod tee;
pub mod transport;

#[cfg(test)]
mod testing;

#[doc(inline)]
pub use config::{Config, ImageServerConfig, IsolatedPullConfig, RuntimeConfig};
#[doc(inline)]
pub use destination::{Committed, PullProgress, StoreDestination};
#[doc(inline)]
pub use error::{Error, Result};
#[doc(inline)]
pub use image::{ImageResult, ImageServer, Resolved};
#[doc(inline)]
pub use multi::MultiStoreServer;
#[doc(inline)]
pub use policy::{PolicyRequirement, SignaturePolicy};
#[doc(inline)]
pub use pull::{
    CgroupProbe, PullGuard, PullOptions, PullOutcome, PullRegistry, CGROUP_CONTROLLERS,
};
#[doc(inline)]
pub use runtime::{
    ContainerInfo, ContainerRequest, PodSandboxRequest, RuntimeContainerMetadata, RuntimeServer,
};
#[doc(inline)]
pub use tee::CachingDestination;
#[doc(inline)]
pub use transport::{BlobDescriptor, BlobKind, ImageDestination, ImageTransport};
