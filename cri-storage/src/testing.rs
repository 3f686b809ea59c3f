//! Fakes shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use references::{Digest, StorageImageID};
use serde_json::json;
use store::{
    ContainerOptions, ContainerRecord, ImageRecord, LayerRecord, Reader, Storage, Store,
    StoreError, StoreErrorKind,
};

use crate::error::{Error, Result};
use crate::transport::{
    BlobDescriptor, BlobKind, ImageDestination, ImageTransport, DOCKER_TRANSPORT,
};

/// An image as a registry would serve it.
#[derive(Debug, Clone)]
pub(crate) struct FakeImage {
    pub(crate) layers: Vec<Vec<u8>>,
    pub(crate) config: Vec<u8>,
    pub(crate) manifest: Vec<u8>,
}

impl FakeImage {
    /// Images with different users have different IDs.
    pub(crate) fn new(layers: &[&[u8]], user: &str) -> Self {
        let layers: Vec<Vec<u8>> = layers.iter().map(|layer| layer.to_vec()).collect();
        let diff_ids: Vec<String> = layers
            .iter()
            .map(|layer| Digest::sha256(layer).to_string())
            .collect();

        let config = serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "User": user,
                "Labels": { "org.example.user": user },
            },
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        }))
        .unwrap();

        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": Digest::sha256(&config).to_string(),
                "size": config.len(),
            },
            "layers": layers.iter().map(|layer| json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": Digest::sha256(layer).to_string(),
                "size": layer.len(),
            })).collect::<Vec<_>>(),
        }))
        .unwrap();

        Self {
            layers,
            config,
            manifest,
        }
    }

    pub(crate) fn config_digest(&self) -> Digest {
        Digest::sha256(&self.config)
    }

    pub(crate) fn manifest_digest(&self) -> Digest {
        Digest::sha256(&self.manifest)
    }

    pub(crate) fn id(&self) -> StorageImageID {
        StorageImageID::from_config_digest(&self.config_digest()).unwrap()
    }

    /// Drive `destination` the way a registry copy does.
    pub(crate) async fn push_into(&self, destination: &mut dyn ImageDestination) -> Result<()> {
        let config = BlobDescriptor {
            digest: self.config_digest(),
            size: Some(self.config.len() as u64),
            media_type: "application/vnd.oci.image.config.v1+json".into(),
        };
        destination
            .put_blob(&config, BlobKind::Config, &mut &self.config[..])
            .await?;

        for layer in &self.layers {
            let blob = BlobDescriptor {
                digest: Digest::sha256(layer),
                size: Some(layer.len() as u64),
                media_type: "application/vnd.oci.image.layer.v1.tar".into(),
            };
            destination
                .put_blob(&blob, BlobKind::Layer, &mut &layer[..])
                .await?;
        }

        destination.put_manifest(&self.manifest).await?;
        destination.commit().await
    }
}

/// Serves images from memory, keyed by qualified reference.
#[derive(Debug, Default)]
pub(crate) struct FakeTransport {
    images: Mutex<HashMap<String, FakeImage>>,
    sources: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub(crate) fn insert(&self, name: &str, image: FakeImage) {
        self.images.lock().insert(name.to_owned(), image);
    }

    /// Every source copied so far.
    pub(crate) fn sources(&self) -> Vec<String> {
        self.sources.lock().clone()
    }
}

#[async_trait::async_trait]
impl ImageTransport for FakeTransport {
    async fn copy(
        &self,
        source: &str,
        _auth_file: Option<&Utf8Path>,
        destination: &mut dyn ImageDestination,
    ) -> Result<()> {
        self.sources.lock().push(source.to_owned());
        let unknown = || Error::Transport {
            source_ref: source.to_owned(),
            error: "manifest unknown".into(),
        };
        let name = source.strip_prefix(DOCKER_TRANSPORT).ok_or_else(unknown)?;
        let image = self.images.lock().get(name).cloned().ok_or_else(unknown)?;
        image.push_into(destination).await
    }
}

/// Counts container creation and deletion, and fails directory lookups or
/// image big data writes on request.
#[derive(Debug)]
pub(crate) struct CountingStore {
    inner: Storage,
    pub(crate) created: AtomicUsize,
    pub(crate) deleted: AtomicUsize,
    pub(crate) fail_directories: AtomicBool,
    pub(crate) fail_big_data: AtomicBool,
}

impl CountingStore {
    pub(crate) fn new(inner: Storage) -> Self {
        Self {
            inner,
            created: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
            fail_directories: AtomicBool::new(false),
            fail_big_data: AtomicBool::new(false),
        }
    }

    fn check_directories(&self, id: &str) -> Result<(), StoreError> {
        Self::check(&self.fail_directories, id)
    }

    fn check(flag: &AtomicBool, id: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::builder(
                "counting",
                StoreErrorKind::Io,
                std::io::Error::other("injected failure"),
            )
            .id(id)
            .build());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Store for CountingStore {
    fn engine(&self) -> &'static str {
        "counting"
    }

    fn driver_name(&self) -> &str {
        self.inner.driver_name()
    }

    fn graph_root(&self) -> &Utf8Path {
        self.inner.graph_root()
    }

    fn run_root(&self) -> &Utf8Path {
        self.inner.run_root()
    }

    async fn images(&self) -> Result<Vec<ImageRecord>, StoreError> {
        self.inner.images().await
    }

    async fn image(&self, id_or_name: &str) -> Result<ImageRecord, StoreError> {
        self.inner.image(id_or_name).await
    }

    async fn create_image(
        &self,
        id: &str,
        names: &[String],
        top_layer: Option<&str>,
        metadata: &str,
    ) -> Result<ImageRecord, StoreError> {
        self.inner.create_image(id, names, top_layer, metadata).await
    }

    async fn delete_image(&self, id: &str) -> Result<Vec<String>, StoreError> {
        self.inner.delete_image(id).await
    }

    async fn names(&self, id: &str) -> Result<Vec<String>, StoreError> {
        self.inner.names(id).await
    }

    async fn set_names(&self, id: &str, names: &[String]) -> Result<(), StoreError> {
        self.inner.set_names(id, names).await
    }

    async fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.image_big_data(id, key).await
    }

    async fn set_image_big_data(
        &self,
        id: &str,
        key: &str,
        data: &[u8],
    ) -> Result<(), StoreError> {
        Self::check(&self.fail_big_data, id)?;
        self.inner.set_image_big_data(id, key, data).await
    }

    async fn image_big_data_digest(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        self.inner.image_big_data_digest(id, key).await
    }

    async fn image_size(&self, id: &str) -> Result<u64, StoreError> {
        self.inner.image_size(id).await
    }

    async fn layer(&self, id_or_name: &str) -> Result<LayerRecord, StoreError> {
        self.inner.layer(id_or_name).await
    }

    async fn create_layer(
        &self,
        id: Option<&str>,
        parent: Option<&str>,
        names: &[String],
        diff: &mut Reader<'_>,
    ) -> Result<LayerRecord, StoreError> {
        self.inner.create_layer(id, parent, names, diff).await
    }

    async fn delete_layer(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete_layer(id).await
    }

    async fn containers(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        self.inner.containers().await
    }

    async fn container(&self, id_or_name: &str) -> Result<ContainerRecord, StoreError> {
        self.inner.container(id_or_name).await
    }

    async fn create_container(
        &self,
        id: &str,
        names: &[String],
        image_id: &str,
        metadata: &str,
        options: &ContainerOptions,
    ) -> Result<ContainerRecord, StoreError> {
        let record = self
            .inner
            .create_container(id, names, image_id, metadata, options)
            .await?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn delete_container(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete_container(id).await?;
        self.deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn metadata(&self, id: &str) -> Result<String, StoreError> {
        self.inner.metadata(id).await
    }

    async fn set_metadata(&self, id: &str, metadata: &str) -> Result<(), StoreError> {
        self.inner.set_metadata(id, metadata).await
    }

    async fn container_directory(&self, id: &str) -> Result<Utf8PathBuf, StoreError> {
        self.check_directories(id)?;
        self.inner.container_directory(id).await
    }

    async fn container_run_directory(&self, id: &str) -> Result<Utf8PathBuf, StoreError> {
        self.check_directories(id)?;
        self.inner.container_run_directory(id).await
    }

    async fn mount(&self, id: &str, mount_label: &str) -> Result<Utf8PathBuf, StoreError> {
        self.inner.mount(id, mount_label).await
    }

    async fn unmount(&self, id: &str, force: bool) -> Result<bool, StoreError> {
        self.inner.unmount(id, force).await
    }

    async fn shutdown(&self, force: bool) -> Result<Vec<String>, StoreError> {
        self.inner.shutdown(force).await
    }

    async fn reload(&self) -> Result<(), StoreError> {
        self.inner.reload().await
    }
}
