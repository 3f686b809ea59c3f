//! Daemon configuration for the storage core.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use store::MultiStoreConfig;

use crate::error::{Error, Result};
use crate::policy::SignaturePolicy;

/// Everything the storage core reads from its configuration file.
///
/// Every field has a default, so an empty document is a valid
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Storage backends.
    #[serde(default)]
    pub storage: MultiStoreConfig,

    /// Image resolution and pulling.
    #[serde(default)]
    pub image: ImageServerConfig,

    /// Pod sandbox creation.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml_str(document: &str) -> Result<Self> {
        Ok(toml_edit::de::from_str(document)?)
    }

    /// Read and parse a TOML file.
    pub async fn from_toml_file(path: impl AsRef<Utf8Path>) -> Result<Self> {
        let path = path.as_ref();
        let document = tokio::fs::read_to_string(path)
            .await
            .map_err(Error::io(format!("read configuration {path}")))?;
        Self::from_toml_str(&document)
    }
}

/// How images are named, found and pulled.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ImageServerConfig {
    /// Transport prefix applied to pull sources that don't carry one.
    pub default_transport: String,

    /// Registries tried, in order, for short names without an alias.
    pub unqualified_search_registries: Vec<String>,

    /// Short name to fully qualified name.
    pub short_name_aliases: BTreeMap<String, String>,

    /// Patterns of image names that are never garbage collected by the
    /// kubelet. A trailing `*` matches any suffix.
    pub pinned_images: Vec<String>,

    /// Directory of the blob cache. Pulls don't feed a cache when unset.
    pub blob_cache_dir: Option<Utf8PathBuf>,

    /// Run pulls in a separate worker process.
    pub isolated_pull: IsolatedPullConfig,

    /// Which sources may be pulled from.
    pub policy: SignaturePolicy,
}

impl Default for ImageServerConfig {
    fn default() -> Self {
        Self {
            default_transport: "docker://".into(),
            unqualified_search_registries: Vec::new(),
            short_name_aliases: BTreeMap::new(),
            pinned_images: Vec::new(),
            blob_cache_dir: None,
            isolated_pull: IsolatedPullConfig::default(),
            policy: SignaturePolicy::default(),
        }
    }
}

/// The worker process used for isolated pulls.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct IsolatedPullConfig {
    /// Whether pulls run in the worker at all.
    pub enabled: bool,

    /// Program to execute, normally the daemon itself.
    pub program: Utf8PathBuf,

    /// Arguments selecting the worker entry point.
    pub args: Vec<String>,

    /// Prefix of the transient scope each worker is moved into.
    pub scope_prefix: String,
}

impl Default for IsolatedPullConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: "/proc/self/exe".into(),
            args: vec!["pull-worker".into()],
            scope_prefix: "crio-pull".into(),
        }
    }
}

/// Pod sandbox settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RuntimeConfig {
    /// Image every pod's infra container runs.
    pub pause_image: String,

    /// Credentials used when the pause image has to be pulled.
    pub pause_image_auth_file: Option<Utf8PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pause_image: "registry.k8s.io/pause:3.10".into(),
            pause_image_auth_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyRequirement;
    use store::StoreConfig;

    #[test]
    fn empty_document_is_default() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.image.default_transport, "docker://");
        assert_eq!(config.storage.default_driver, "overlay");
        assert!(!config.image.isolated_pull.enabled);
    }

    #[test]
    fn full_document() {
        let config = Config::from_toml_str(
            r#"
            [storage]
            default-driver = "vfs"

            [[storage.stores]]
            backend = "memory"
            driver = "vfs"

            [[storage.stores]]
            backend = "local"
            driver = "overlay"
            graph-root = "/var/lib/containers/storage"
            run-root = "/run/containers/storage"

            [image]
            unqualified-search-registries = ["quay.io", "docker.io"]
            pinned-images = ["registry.k8s.io/pause*"]
            blob-cache-dir = "/var/lib/blob-cache"

            [image.short-name-aliases]
            busybox = "docker.io/library/busybox"

            [image.isolated-pull]
            enabled = true
            program = "/usr/bin/crio"

            [image.policy]
            default = "reject"

            [image.policy.transports]
            "quay.io" = "insecure-accept-anything"

            [runtime]
            pause-image = "registry.k8s.io/pause:3.9"
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.default_driver, "vfs");
        assert_eq!(
            config.storage.stores[0],
            StoreConfig::Memory {
                driver: "vfs".into()
            }
        );
        assert_eq!(config.storage.stores[1].driver(), "overlay");

        assert_eq!(
            config.image.unqualified_search_registries,
            vec!["quay.io", "docker.io"]
        );
        assert_eq!(
            config.image.short_name_aliases["busybox"],
            "docker.io/library/busybox"
        );
        assert_eq!(
            config.image.blob_cache_dir.as_deref(),
            Some(Utf8Path::new("/var/lib/blob-cache"))
        );

        let isolated = &config.image.isolated_pull;
        assert!(isolated.enabled);
        assert_eq!(isolated.program, "/usr/bin/crio");
        assert_eq!(isolated.args, vec!["pull-worker"]);

        assert_eq!(config.image.policy.default, PolicyRequirement::Reject);
        assert_eq!(
            config.image.policy.transports["quay.io"],
            PolicyRequirement::InsecureAcceptAnything
        );
        assert_eq!(config.runtime.pause_image, "registry.k8s.io/pause:3.9");
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = Config::from_toml_str(
            r#"
            [[storage.stores]]
            backend = "zfs"
            driver = "zfs"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.downcast_ref::<toml_edit::de::Error>().is_some());
    }
}
