use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Big-data key holding an image's manifest.
pub const IMAGE_DIGEST_BIG_DATA_KEY: &str = "manifest";

/// An image as recorded by the storage library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageRecord {
    /// Full image ID.
    pub id: String,

    /// Digest of the image's manifest, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Other manifest digests this image is known by.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub digests: Vec<String>,

    /// Tags and digested names, e.g. `docker.io/library/busybox:latest`.
    #[serde(default)]
    pub names: Vec<String>,

    /// Names this image used to carry, most recent first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names_history: Vec<String>,

    /// The unmapped top layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_layer: Option<String>,

    /// Copies of the top layer created for ID-mapped containers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapped_top_layers: Vec<String>,

    /// Opaque caller metadata.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,

    /// Sizes of attached big-data items, by key.
    #[serde(default)]
    pub big_data_sizes: BTreeMap<String, u64>,

    /// Digests of attached big-data items, by key.
    #[serde(default)]
    pub big_data_digests: BTreeMap<String, String>,

    /// When the record was created.
    pub created: DateTime<Utc>,
}

impl ImageRecord {
    /// A record with only an ID and creation time.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            digest: None,
            digests: Vec::new(),
            names: Vec::new(),
            names_history: Vec::new(),
            top_layer: None,
            mapped_top_layers: Vec::new(),
            metadata: String::new(),
            big_data_sizes: BTreeMap::new(),
            big_data_digests: BTreeMap::new(),
            created: Utc::now(),
        }
    }
}

/// A filesystem layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LayerRecord {
    /// Layer ID.
    pub id: String,

    /// Human-readable names.
    #[serde(default)]
    pub names: Vec<String>,

    /// The layer below this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Digest of the diff this layer was created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_digest: Option<String>,

    /// Size of the diff in bytes.
    #[serde(default)]
    pub size: u64,

    /// ID mappings applied to this layer's contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_mappings: Option<IdMappings>,

    /// Mount label, while mounted.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mount_label: String,

    /// Number of outstanding mounts.
    #[serde(default)]
    pub mount_count: u32,

    /// When the record was created.
    pub created: DateTime<Utc>,
}

/// A container (or pod sandbox) record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContainerRecord {
    /// Container ID.
    pub id: String,

    /// Names, e.g. the container name and, for infra containers, the pod name.
    #[serde(default)]
    pub names: Vec<String>,

    /// The image the container was created from.
    pub image_id: String,

    /// The container's writable layer.
    pub layer_id: String,

    /// Opaque caller metadata, JSON in practice.
    #[serde(default)]
    pub metadata: String,

    /// SELinux mount label, empty when labeling is disabled.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mount_label: String,

    /// SELinux process label, empty when labeling is disabled.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub process_label: String,

    /// When the record was created.
    pub created: DateTime<Utc>,
}

impl ContainerRecord {
    /// The container's SELinux mount label.
    pub fn mount_label(&self) -> &str {
        &self.mount_label
    }

    /// The container's SELinux process label.
    pub fn process_label(&self) -> &str {
        &self.process_label
    }
}

/// One contiguous range of a user namespace mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IdMap {
    /// First ID inside the container.
    pub container_id: u32,
    /// First ID on the host.
    pub host_id: u32,
    /// Length of the range.
    pub size: u32,
}

/// UID and GID mappings for a user-namespaced container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IdMappings {
    /// UID ranges.
    #[serde(default)]
    pub uid_map: Vec<IdMap>,
    /// GID ranges.
    #[serde(default)]
    pub gid_map: Vec<IdMap>,
}

impl IdMappings {
    /// Mappings that map nothing are the same as no mappings at all.
    pub fn is_empty(&self) -> bool {
        self.uid_map.is_empty() && self.gid_map.is_empty()
    }
}

/// Options for creating a container record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerOptions {
    /// Run the container in a user namespace with these mappings.
    pub id_mappings: Option<IdMappings>,

    /// SELinux label options, e.g. `level:s0:c1,c2` or `disable`.
    pub label_opts: Vec<String>,
}
