//! The seam between the image servers and a registry client.
//!
//! A registry client implements [`ImageTransport`]. A pull hands it a
//! transport-qualified source and an [`ImageDestination`]; the transport
//! pushes the image's config blob, then its layers bottom-up, then the
//! manifest, and finally commits.

use std::fmt;

use camino::Utf8Path;
use references::Digest;
use store::Reader;

use crate::error::Result;

/// Transport prefix for registries.
pub const DOCKER_TRANSPORT: &str = "docker://";

const KNOWN_TRANSPORTS: &[&str] = &[
    DOCKER_TRANSPORT,
    "containers-storage:",
    "dir:",
    "docker-archive:",
    "docker-daemon:",
    "oci:",
    "oci-archive:",
];

/// The transport `source` names, if any.
pub fn transport_of(source: &str) -> Option<&'static str> {
    KNOWN_TRANSPORTS
        .iter()
        .copied()
        .find(|transport| source.starts_with(transport))
}

/// Prefix `name` with `default_transport` unless it already names a transport.
///
/// Registry names can contain `:` (ports, tags), so only known transport
/// prefixes count.
pub fn with_default_transport(name: &str, default_transport: &str) -> String {
    match transport_of(name) {
        Some(_) => name.to_owned(),
        None => format!("{default_transport}{name}"),
    }
}

/// What kind of blob a transport is handing over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    /// The image configuration.
    Config,
    /// A filesystem layer.
    Layer,
}

/// A blob as described by the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    /// Advertised digest of the blob's bytes.
    pub digest: Digest,
    /// Advertised size, when known.
    pub size: Option<u64>,
    /// Media type from the manifest.
    pub media_type: String,
}

/// Where a transport writes an image.
#[async_trait::async_trait]
pub trait ImageDestination: fmt::Debug + Send {
    /// Receive one blob. The stream must be read to the end.
    async fn put_blob(
        &mut self,
        blob: &BlobDescriptor,
        kind: BlobKind,
        stream: &mut Reader<'_>,
    ) -> Result<()>;

    /// Receive the manifest, after every blob it references.
    async fn put_manifest(&mut self, manifest: &[u8]) -> Result<()>;

    /// Make the image visible.
    async fn commit(&mut self) -> Result<()>;
}

/// A registry client.
#[async_trait::async_trait]
pub trait ImageTransport: fmt::Debug + Send + Sync {
    /// Copy the image at the transport-qualified `source` into
    /// `destination`, authenticating with `auth_file` when given.
    async fn copy(
        &self,
        source: &str,
        auth_file: Option<&Utf8Path>,
        destination: &mut dyn ImageDestination,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transport_is_applied_once() {
        assert_eq!(
            with_default_transport("quay.io/a/b:v1", DOCKER_TRANSPORT),
            "docker://quay.io/a/b:v1"
        );
        assert_eq!(
            with_default_transport("docker://quay.io/a/b:v1", DOCKER_TRANSPORT),
            "docker://quay.io/a/b:v1"
        );
        assert_eq!(
            with_default_transport("oci:/srv/layout:v1", DOCKER_TRANSPORT),
            "oci:/srv/layout:v1"
        );
    }

    #[test]
    fn ports_are_not_transports() {
        assert_eq!(transport_of("localhost:5000/app"), None);
        assert_eq!(
            with_default_transport("localhost:5000/app", DOCKER_TRANSPORT),
            "docker://localhost:5000/app"
        );
        assert_eq!(transport_of("containers-storage:app"), Some("containers-storage:"));
    }

    static_assertions::assert_obj_safe!(ImageDestination, ImageTransport);
}
