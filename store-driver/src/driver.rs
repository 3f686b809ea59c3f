use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io;

use crate::error::StoreError;
use crate::records::{ContainerOptions, ContainerRecord, ImageRecord, LayerRecord};

/// A reader stream for layer contents.
pub type Reader<'r> = dyn io::AsyncRead + Unpin + Send + 'r;

/// A storage library instance backed by one storage driver.
///
/// Lookups that take `id_or_name` accept a full ID, one of the record's names,
/// or (for images) an unambiguous ID prefix. Every operation that names a
/// missing record fails with a not-found [`crate::StoreErrorKind`].
#[async_trait::async_trait]
pub trait Store: fmt::Debug {
    /// The name of the backend implementation, used in errors.
    fn engine(&self) -> &'static str;

    /// The storage driver this store manages layers with, e.g. `overlay`.
    fn driver_name(&self) -> &str;

    /// Root directory for persistent data.
    fn graph_root(&self) -> &Utf8Path;

    /// Root directory for runtime data.
    fn run_root(&self) -> &Utf8Path;

    /// All image records.
    async fn images(&self) -> Result<Vec<ImageRecord>, StoreError>;

    /// Look up one image by ID, name, or unambiguous ID prefix.
    async fn image(&self, id_or_name: &str) -> Result<ImageRecord, StoreError>;

    /// Create an image record. Names already held by other images move to
    /// the new one.
    async fn create_image(
        &self,
        id: &str,
        names: &[String],
        top_layer: Option<&str>,
        metadata: &str,
    ) -> Result<ImageRecord, StoreError>;

    /// Delete an image and any of its layers nothing else uses. Returns the
    /// IDs of deleted layers.
    async fn delete_image(&self, id: &str) -> Result<Vec<String>, StoreError>;

    /// Names of any image, layer or container.
    async fn names(&self, id: &str) -> Result<Vec<String>, StoreError>;

    /// Replace the names of any image, layer or container.
    async fn set_names(&self, id: &str, names: &[String]) -> Result<(), StoreError>;

    /// Read a big-data item attached to an image.
    async fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Attach a big-data item to an image.
    async fn set_image_big_data(&self, id: &str, key: &str, data: &[u8])
        -> Result<(), StoreError>;

    /// The digest of a big-data item, if the item exists.
    async fn image_big_data_digest(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Total size of an image's layers and big data.
    async fn image_size(&self, id: &str) -> Result<u64, StoreError>;

    /// Look up a layer by ID or name.
    async fn layer(&self, id_or_name: &str) -> Result<LayerRecord, StoreError>;

    /// Create a layer from a diff stream. The stream is read to the end.
    async fn create_layer(
        &self,
        id: Option<&str>,
        parent: Option<&str>,
        names: &[String],
        diff: &mut Reader<'_>,
    ) -> Result<LayerRecord, StoreError>;

    /// Delete a layer that nothing depends on.
    async fn delete_layer(&self, id: &str) -> Result<(), StoreError>;

    /// All container records.
    async fn containers(&self) -> Result<Vec<ContainerRecord>, StoreError>;

    /// Look up a container by ID or name.
    async fn container(&self, id_or_name: &str) -> Result<ContainerRecord, StoreError>;

    /// Create a container and its writable layer on top of `image_id`.
    async fn create_container(
        &self,
        id: &str,
        names: &[String],
        image_id: &str,
        metadata: &str,
        options: &ContainerOptions,
    ) -> Result<ContainerRecord, StoreError>;

    /// Delete a container, its writable layer and its directories.
    async fn delete_container(&self, id: &str) -> Result<(), StoreError>;

    /// The opaque metadata stored with a container.
    async fn metadata(&self, id: &str) -> Result<String, StoreError>;

    /// Replace the opaque metadata stored with a container.
    async fn set_metadata(&self, id: &str, metadata: &str) -> Result<(), StoreError>;

    /// Per-container persistent directory.
    async fn container_directory(&self, id: &str) -> Result<Utf8PathBuf, StoreError>;

    /// Per-container runtime directory.
    async fn container_run_directory(&self, id: &str) -> Result<Utf8PathBuf, StoreError>;

    /// Mount a container's root filesystem and return the mount point.
    async fn mount(&self, id: &str, mount_label: &str) -> Result<Utf8PathBuf, StoreError>;

    /// Unmount a container. Returns true if the layer is still mounted
    /// elsewhere afterwards.
    async fn unmount(&self, id: &str, force: bool) -> Result<bool, StoreError>;

    /// Release the store. Returns the layers that were still mounted.
    async fn shutdown(&self, force: bool) -> Result<Vec<String>, StoreError>;

    /// Pick up records written by another process sharing the same roots.
    async fn reload(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S> Store for Arc<S>
where
    S: ?Sized + Store + Send + Sync + 'static,
{
    fn engine(&self) -> &'static str {
        self.deref().engine()
    }

    fn driver_name(&self) -> &str {
        self.deref().driver_name()
    }

    fn graph_root(&self) -> &Utf8Path {
        self.deref().graph_root()
    }

    fn run_root(&self) -> &Utf8Path {
        self.deref().run_root()
    }

    async fn images(&self) -> Result<Vec<ImageRecord>, StoreError> {
        self.deref().images().await
    }

    async fn image(&self, id_or_name: &str) -> Result<ImageRecord, StoreError> {
        self.deref().image(id_or_name).await
    }

    async fn create_image(
        &self,
        id: &str,
        names: &[String],
        top_layer: Option<&str>,
        metadata: &str,
    ) -> Result<ImageRecord, StoreError> {
        self.deref()
            .create_image(id, names, top_layer, metadata)
            .await
    }

    async fn delete_image(&self, id: &str) -> Result<Vec<String>, StoreError> {
        self.deref().delete_image(id).await
    }

    async fn names(&self, id: &str) -> Result<Vec<String>, StoreError> {
        self.deref().names(id).await
    }

    async fn set_names(&self, id: &str, names: &[String]) -> Result<(), StoreError> {
        self.deref().set_names(id, names).await
    }

    async fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.deref().image_big_data(id, key).await
    }

    async fn set_image_big_data(
        &self,
        id: &str,
        key: &str,
        data: &[u8],
    ) -> Result<(), StoreError> {
        self.deref().set_image_big_data(id, key, data).await
    }

    async fn image_big_data_digest(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        self.deref().image_big_data_digest(id, key).await
    }

    async fn image_size(&self, id: &str) -> Result<u64, StoreError> {
        self.deref().image_size(id).await
    }

    async fn layer(&self, id_or_name: &str) -> Result<LayerRecord, StoreError> {
        self.deref().layer(id_or_name).await
    }

    async fn create_layer(
        &self,
        id: Option<&str>,
        parent: Option<&str>,
        names: &[String],
        diff: &mut Reader<'_>,
    ) -> Result<LayerRecord, StoreError> {
        self.deref().create_layer(id, parent, names, diff).await
    }

    async fn delete_layer(&self, id: &str) -> Result<(), StoreError> {
        self.deref().delete_layer(id).await
    }

    async fn containers(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        self.deref().containers().await
    }

    async fn container(&self, id_or_name: &str) -> Result<ContainerRecord, StoreError> {
        self.deref().container(id_or_name).await
    }

    async fn create_container(
        &self,
        id: &str,
        names: &[String],
        image_id: &str,
        metadata: &str,
        options: &ContainerOptions,
    ) -> Result<ContainerRecord, StoreError> {
        self.deref()
            .create_container(id, names, image_id, metadata, options)
            .await
    }

    async fn delete_container(&self, id: &str) -> Result<(), StoreError> {
        self.deref().delete_container(id).await
    }

    async fn metadata(&self, id: &str) -> Result<String, StoreError> {
        self.deref().metadata(id).await
    }

    async fn set_metadata(&self, id: &str, metadata: &str) -> Result<(), StoreError> {
        self.deref().set_metadata(id, metadata).await
    }

    async fn container_directory(&self, id: &str) -> Result<Utf8PathBuf, StoreError> {
        self.deref().container_directory(id).await
    }

    async fn container_run_directory(&self, id: &str) -> Result<Utf8PathBuf, StoreError> {
        self.deref().container_run_directory(id).await
    }

    async fn mount(&self, id: &str, mount_label: &str) -> Result<Utf8PathBuf, StoreError> {
        self.deref().mount(id, mount_label).await
    }

    async fn unmount(&self, id: &str, force: bool) -> Result<bool, StoreError> {
        self.deref().unmount(id, force).await
    }

    async fn shutdown(&self, force: bool) -> Result<Vec<String>, StoreError> {
        self.deref().shutdown(force).await
    }

    async fn reload(&self) -> Result<(), StoreError> {
        self.deref().reload().await
    }
}
