use std::fmt;

use crate::{Digest, ImageName, ReferenceError, DEFAULT_TAG};

/// A fully-qualified registry reference carrying exactly one of a tag or a
/// digest.
///
/// Never a bare repository name and never both: a tag-and-digest input keeps
/// only the digest, a bare name gets [`DEFAULT_TAG`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RegistryImageReference {
    registry: String,
    repository: String,
    identifier: Identifier,
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum Identifier {
    Tag(String),
    Digest(Digest),
}

impl RegistryImageReference {
    /// Parse user input, qualifying short names with the default registry.
    pub fn parse_normalized(input: &str) -> Result<Self, ReferenceError> {
        Self::from_qualified(&ImageName::parse(input)?.normalized())
    }

    /// Parse input that must already name a registry.
    pub fn parse_qualified(input: &str) -> Result<Self, ReferenceError> {
        Self::from_qualified(&ImageName::parse(input)?)
    }

    /// Build from a parsed name that carries a registry domain.
    pub fn from_qualified(name: &ImageName) -> Result<Self, ReferenceError> {
        let registry = name
            .domain()
            .ok_or_else(|| ReferenceError::NotQualified(name.to_string()))?;
        let identifier = match (name.digest(), name.tag()) {
            (Some(digest), _) => Identifier::Digest(digest.clone()),
            (None, Some(tag)) => Identifier::Tag(tag.to_owned()),
            (None, None) => Identifier::Tag(DEFAULT_TAG.to_owned()),
        };
        Ok(Self {
            registry: registry.to_owned(),
            repository: name.path().to_owned(),
            identifier,
        })
    }

    /// The same repository, pinned to `digest`.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            identifier: Identifier::Digest(digest),
        }
    }

    /// Registry host, e.g. `docker.io` or `localhost:5000`.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path on the registry, e.g. `library/busybox`.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// `registry/repository`, without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The tag, unless the reference is by digest.
    pub fn tag(&self) -> Option<&str> {
        match &self.identifier {
            Identifier::Tag(tag) => Some(tag),
            Identifier::Digest(_) => None,
        }
    }

    /// The digest, if the reference is by digest.
    pub fn digest(&self) -> Option<&Digest> {
        match &self.identifier {
            Identifier::Tag(_) => None,
            Identifier::Digest(digest) => Some(digest),
        }
    }

    /// The canonical string form, for external protocols, storage name lists
    /// and logs.
    pub fn string_for_out_of_process_consumption_only(&self) -> String {
        match &self.identifier {
            Identifier::Tag(tag) => format!("{}/{}:{tag}", self.registry, self.repository),
            Identifier::Digest(digest) => {
                format!("{}/{}@{digest}", self.registry, self.repository)
            }
        }
    }
}

impl fmt::Debug for RegistryImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RegistryImageReference({})",
            self.string_for_out_of_process_consumption_only()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_short_names() {
        let r = RegistryImageReference::parse_normalized("busybox").unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.repository(), "library/busybox");
        assert_eq!(r.tag(), Some("latest"));
        assert_eq!(
            r.string_for_out_of_process_consumption_only(),
            "docker.io/library/busybox:latest"
        );
    }

    #[test]
    fn tag_and_digest_keeps_digest() {
        let digest = Digest::sha256(b"manifest");
        let r = RegistryImageReference::parse_normalized(&format!("quay.io/a/b:v1@{digest}"))
            .unwrap();
        assert_eq!(r.tag(), None);
        assert_eq!(r.digest(), Some(&digest));
        assert_eq!(
            r.string_for_out_of_process_consumption_only(),
            format!("quay.io/a/b@{digest}")
        );
    }

    #[test]
    fn qualified_requires_registry() {
        assert!(matches!(
            RegistryImageReference::parse_qualified("busybox"),
            Err(ReferenceError::NotQualified(_))
        ));
        let r = RegistryImageReference::parse_qualified("registry.k8s.io/pause:3.9").unwrap();
        assert_eq!(r.name(), "registry.k8s.io/pause");
    }

    #[test]
    fn with_digest_replaces_tag() {
        let digest = Digest::sha256(b"x");
        let r = RegistryImageReference::parse_normalized("alpine:3.19")
            .unwrap()
            .with_digest(digest.clone());
        assert_eq!(r.tag(), None);
        assert_eq!(r.digest(), Some(&digest));
    }

    static_assertions::assert_impl_all!(RegistryImageReference: Send, Sync, Clone);
    static_assertions::assert_not_impl_any!(RegistryImageReference: Default, fmt::Display);
    static_assertions::assert_not_impl_any!(crate::StorageImageID: Default, fmt::Display);
}
