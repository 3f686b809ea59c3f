//! # Storage backends
//!
//! Backends for the [`Store`] interface, selected by configuration, and the
//! [`MultiStore`] composite that presents several of them as one.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

mod catalog;
mod config;
mod local;
mod memory;
pub mod multi;

#[doc(inline)]
pub use config::{MultiStoreConfig, StoreConfig};
#[doc(inline)]
pub use local::LocalStore;
#[doc(inline)]
pub use memory::MemoryStore;
#[doc(inline)]
pub use multi::{BackendError, Gathered, MultiError, MultiStore};

#[doc(inline)]
pub use store_driver::{
    ContainerOptions, ContainerRecord, IdMap, IdMappings, ImageRecord, LayerRecord, Reader,
    Store, StoreError, StoreErrorKind, IMAGE_DIGEST_BIG_DATA_KEY,
};

pub(crate) type ArcStore = Arc<dyn Store + Send + Sync>;

/// A cheaply cloneable handle to one storage library instance.
///
/// Every call is forwarded to the backend inside a tracing span that records
/// the backend and driver.
#[derive(Debug, Clone)]
pub struct Storage {
    store: ArcStore,
}

impl From<MemoryStore> for Storage {
    fn from(value: MemoryStore) -> Self {
        Storage::new(value)
    }
}

impl From<LocalStore> for Storage {
    fn from(value: LocalStore) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a backend.
    pub fn new<S: Store + Send + Sync + 'static>(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// Wrap a backend that is already shared.
    pub fn from_arc(store: ArcStore) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Store for Storage {
    fn engine(&self) -> &'static str {
        self.store.engine()
    }

    fn driver_name(&self) -> &str {
        self.store.driver_name()
    }

    fn graph_root(&self) -> &Utf8Path {
        self.store.graph_root()
    }

    fn run_root(&self) -> &Utf8Path {
        self.store.run_root()
    }

    #[tracing::instrument(level = "trace", skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn images(&self) -> Result<Vec<ImageRecord>, StoreError> {
        self.store.images().await
    }

    #[tracing::instrument(level = "trace", skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn image(&self, id_or_name: &str) -> Result<ImageRecord, StoreError> {
        self.store.image(id_or_name).await
    }

    #[tracing::instrument(skip(self, metadata), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn create_image(
        &self,
        id: &str,
        names: &[String],
        top_layer: Option<&str>,
        metadata: &str,
    ) -> Result<ImageRecord, StoreError> {
        self.store
            .create_image(id, names, top_layer, metadata)
            .await
    }

    #[tracing::instrument(skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn delete_image(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let deleted = self.store.delete_image(id).await?;
        tracing::debug!(layers = deleted.len(), "deleted image {id}");
        Ok(deleted)
    }

    #[tracing::instrument(level = "trace", skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn names(&self, id: &str) -> Result<Vec<String>, StoreError> {
        self.store.names(id).await
    }

    #[tracing::instrument(skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn set_names(&self, id: &str, names: &[String]) -> Result<(), StoreError> {
        self.store.set_names(id, names).await
    }

    #[tracing::instrument(level = "trace", skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.store.image_big_data(id, key).await
    }

    #[tracing::instrument(level = "trace", skip(self, data), fields(engine = self.store.engine(), driver = self.store.driver_name(), size = data.len()))]
    async fn set_image_big_data(
        &self,
        id: &str,
        key: &str,
        data: &[u8],
    ) -> Result<(), StoreError> {
        self.store.set_image_big_data(id, key, data).await
    }

    async fn image_big_data_digest(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        self.store.image_big_data_digest(id, key).await
    }

    async fn image_size(&self, id: &str) -> Result<u64, StoreError> {
        self.store.image_size(id).await
    }

    #[tracing::instrument(level = "trace", skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn layer(&self, id_or_name: &str) -> Result<LayerRecord, StoreError> {
        self.store.layer(id_or_name).await
    }

    #[tracing::instrument(skip(self, diff), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn create_layer(
        &self,
        id: Option<&str>,
        parent: Option<&str>,
        names: &[String],
        diff: &mut Reader<'_>,
    ) -> Result<LayerRecord, StoreError> {
        let layer = self.store.create_layer(id, parent, names, diff).await?;
        tracing::trace!(layer = %layer.id, size = layer.size, "created layer");
        Ok(layer)
    }

    #[tracing::instrument(skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn delete_layer(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete_layer(id).await
    }

    #[tracing::instrument(level = "trace", skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn containers(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        self.store.containers().await
    }

    #[tracing::instrument(level = "trace", skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn container(&self, id_or_name: &str) -> Result<ContainerRecord, StoreError> {
        self.store.container(id_or_name).await
    }

    #[tracing::instrument(skip(self, metadata, options), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn create_container(
        &self,
        id: &str,
        names: &[String],
        image_id: &str,
        metadata: &str,
        options: &ContainerOptions,
    ) -> Result<ContainerRecord, StoreError> {
        self.store
            .create_container(id, names, image_id, metadata, options)
            .await
    }

    #[tracing::instrument(skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn delete_container(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete_container(id).await
    }

    async fn metadata(&self, id: &str) -> Result<String, StoreError> {
        self.store.metadata(id).await
    }

    #[tracing::instrument(level = "trace", skip(self, metadata), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn set_metadata(&self, id: &str, metadata: &str) -> Result<(), StoreError> {
        self.store.set_metadata(id, metadata).await
    }

    async fn container_directory(&self, id: &str) -> Result<Utf8PathBuf, StoreError> {
        self.store.container_directory(id).await
    }

    async fn container_run_directory(&self, id: &str) -> Result<Utf8PathBuf, StoreError> {
        self.store.container_run_directory(id).await
    }

    #[tracing::instrument(skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn mount(&self, id: &str, mount_label: &str) -> Result<Utf8PathBuf, StoreError> {
        self.store.mount(id, mount_label).await
    }

    #[tracing::instrument(skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn unmount(&self, id: &str, force: bool) -> Result<bool, StoreError> {
        self.store.unmount(id, force).await
    }

    #[tracing::instrument(skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn shutdown(&self, force: bool) -> Result<Vec<String>, StoreError> {
        let mounted = self.store.shutdown(force).await?;
        if !mounted.is_empty() {
            tracing::debug!(?mounted, "layers still mounted at shutdown");
        }
        Ok(mounted)
    }

    #[tracing::instrument(skip(self), fields(engine = self.store.engine(), driver = self.store.driver_name()))]
    async fn reload(&self) -> Result<(), StoreError> {
        self.store.reload().await
    }
}
