use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use references::Digest;
use store_driver::{
    ContainerOptions, ContainerRecord, ImageRecord, LayerRecord, Reader, Store, StoreError,
    StoreErrorKind,
};

use crate::catalog::{Catalog, NewLayer};

const ENGINE: &str = "memory";

#[derive(Debug)]
struct MemoryState {
    catalog: Catalog,
    big_data: HashMap<(String, String), Vec<u8>>,
}

/// A store that keeps every record and big-data item in memory.
///
/// Directory and mount paths are computed under the configured roots but
/// never created, which makes this the store of choice for tests.
#[derive(Debug)]
pub struct MemoryStore {
    driver: String,
    graph_root: Utf8PathBuf,
    run_root: Utf8PathBuf,
    state: RwLock<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("vfs")
    }
}

impl MemoryStore {
    /// Create an empty store that reports `driver` as its storage driver.
    pub fn new(driver: impl Into<String>) -> Self {
        Self::with_roots(
            driver,
            Utf8PathBuf::from("/var/lib/containers/storage"),
            Utf8PathBuf::from("/run/containers/storage"),
        )
    }

    /// Create an empty store with explicit roots.
    pub fn with_roots(
        driver: impl Into<String>,
        graph_root: Utf8PathBuf,
        run_root: Utf8PathBuf,
    ) -> Self {
        Self {
            driver: driver.into(),
            graph_root,
            run_root,
            state: RwLock::new(MemoryState {
                catalog: Catalog::new(ENGINE),
                big_data: HashMap::new(),
            }),
        }
    }

    fn container_path(&self, root: &Utf8Path, id: &str) -> Utf8PathBuf {
        root.join(format!("{}-containers", self.driver))
            .join(id)
            .join("userdata")
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    fn engine(&self) -> &'static str {
        ENGINE
    }

    fn driver_name(&self) -> &str {
        &self.driver
    }

    fn graph_root(&self) -> &Utf8Path {
        &self.graph_root
    }

    fn run_root(&self) -> &Utf8Path {
        &self.run_root
    }

    async fn images(&self) -> Result<Vec<ImageRecord>, StoreError> {
        Ok(self.state.read().await.catalog.images())
    }

    async fn image(&self, id_or_name: &str) -> Result<ImageRecord, StoreError> {
        self.state.read().await.catalog.image(id_or_name).cloned()
    }

    async fn create_image(
        &self,
        id: &str,
        names: &[String],
        top_layer: Option<&str>,
        metadata: &str,
    ) -> Result<ImageRecord, StoreError> {
        self.state
            .write()
            .await
            .catalog
            .create_image(id, names, top_layer, metadata)
    }

    async fn delete_image(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.write().await;
        let image_id = state.catalog.image(id)?.id.clone();
        let deleted = state.catalog.delete_image(&image_id)?;
        state.big_data.retain(|(owner, _), _| owner != &image_id);
        Ok(deleted)
    }

    async fn names(&self, id: &str) -> Result<Vec<String>, StoreError> {
        self.state.read().await.catalog.names(id)
    }

    async fn set_names(&self, id: &str, names: &[String]) -> Result<(), StoreError> {
        self.state.write().await.catalog.set_names(id, names)
    }

    async fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let state = self.state.read().await;
        let image_id = &state.catalog.image(id)?.id;
        state
            .big_data
            .get(&(image_id.clone(), key.to_owned()))
            .cloned()
            .ok_or_else(|| {
                StoreError::builder(
                    ENGINE,
                    StoreErrorKind::NotFound,
                    format!("image has no big data item {key:?}"),
                )
                .id(image_id.as_str())
                .build()
            })
    }

    async fn set_image_big_data(
        &self,
        id: &str,
        key: &str,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let image_id = state.catalog.image(id)?.id.clone();
        let digest = Digest::sha256(data).to_string();
        state
            .catalog
            .record_big_data(&image_id, key, data.len() as u64, digest)?;
        state
            .big_data
            .insert((image_id, key.to_owned()), data.to_vec());
        Ok(())
    }

    async fn image_big_data_digest(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        self.state.read().await.catalog.big_data_digest(id, key)
    }

    async fn image_size(&self, id: &str) -> Result<u64, StoreError> {
        self.state.read().await.catalog.image_size(id)
    }

    async fn layer(&self, id_or_name: &str) -> Result<LayerRecord, StoreError> {
        self.state.read().await.catalog.layer(id_or_name).cloned()
    }

    async fn create_layer(
        &self,
        id: Option<&str>,
        parent: Option<&str>,
        names: &[String],
        diff: &mut Reader<'_>,
    ) -> Result<LayerRecord, StoreError> {
        let mut buf = Vec::new();
        diff.read_to_end(&mut buf)
            .await
            .map_err(StoreError::with(ENGINE, StoreErrorKind::Io))?;

        self.state.write().await.catalog.create_layer(NewLayer {
            id: id.map(ToOwned::to_owned),
            parent: parent.map(ToOwned::to_owned),
            names: names.to_vec(),
            compressed_digest: Some(Digest::sha256(&buf).to_string()),
            size: buf.len() as u64,
        })
    }

    async fn delete_layer(&self, id: &str) -> Result<(), StoreError> {
        self.state.write().await.catalog.delete_layer(id)?;
        Ok(())
    }

    async fn containers(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        Ok(self.state.read().await.catalog.containers())
    }

    async fn container(&self, id_or_name: &str) -> Result<ContainerRecord, StoreError> {
        self.state.read().await.catalog.container(id_or_name).cloned()
    }

    async fn create_container(
        &self,
        id: &str,
        names: &[String],
        image_id: &str,
        metadata: &str,
        options: &ContainerOptions,
    ) -> Result<ContainerRecord, StoreError> {
        self.state
            .write()
            .await
            .catalog
            .create_container(id, names, image_id, metadata, options)
    }

    async fn delete_container(&self, id: &str) -> Result<(), StoreError> {
        self.state.write().await.catalog.delete_container(id)?;
        Ok(())
    }

    async fn metadata(&self, id: &str) -> Result<String, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .catalog
            .container(id)?
            .metadata
            .clone())
    }

    async fn set_metadata(&self, id: &str, metadata: &str) -> Result<(), StoreError> {
        self.state.write().await.catalog.set_metadata(id, metadata)
    }

    async fn container_directory(&self, id: &str) -> Result<Utf8PathBuf, StoreError> {
        let state = self.state.read().await;
        let container = state.catalog.container(id)?;
        Ok(self.container_path(&self.graph_root, &container.id))
    }

    async fn container_run_directory(&self, id: &str) -> Result<Utf8PathBuf, StoreError> {
        let state = self.state.read().await;
        let container = state.catalog.container(id)?;
        Ok(self.container_path(&self.run_root, &container.id))
    }

    async fn mount(&self, id: &str, mount_label: &str) -> Result<Utf8PathBuf, StoreError> {
        let layer = self.state.write().await.catalog.mount(id, mount_label)?;
        Ok(self.graph_root.join(&self.driver).join(layer).join("merged"))
    }

    async fn unmount(&self, id: &str, force: bool) -> Result<bool, StoreError> {
        self.state.write().await.catalog.unmount(id, force)
    }

    async fn shutdown(&self, force: bool) -> Result<Vec<String>, StoreError> {
        Ok(self.state.write().await.catalog.shutdown(force))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_image() -> MemoryStore {
        let store = MemoryStore::new("overlay");
        let layer = store
            .create_layer(Some("l1"), None, &[], &mut &b"layer contents"[..])
            .await
            .unwrap();
        store
            .create_image("abcd", &["localhost/a:1".into()], Some(&layer.id), "")
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn big_data_round_trip() {
        let store = store_with_image().await;
        store
            .set_image_big_data("abcd", "manifest", b"{}")
            .await
            .unwrap();

        assert_eq!(store.image_big_data("abcd", "manifest").await.unwrap(), b"{}");
        assert_eq!(
            store
                .image_big_data_digest("abcd", "manifest")
                .await
                .unwrap(),
            Some(Digest::sha256(b"{}").to_string())
        );
        assert_eq!(
            store.image_size("abcd").await.unwrap(),
            2 + b"layer contents".len() as u64
        );

        let missing = store.image_big_data("abcd", "other").await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn container_paths() {
        let store = store_with_image().await;
        store
            .create_container("c1", &["web".into()], "abcd", "{}", &ContainerOptions::default())
            .await
            .unwrap();

        assert_eq!(
            store.container_directory("web").await.unwrap(),
            "/var/lib/containers/storage/overlay-containers/c1/userdata"
        );
        assert_eq!(
            store.container_run_directory("c1").await.unwrap(),
            "/run/containers/storage/overlay-containers/c1/userdata"
        );

        store.delete_container("c1").await.unwrap();
        let err = store.container_directory("c1").await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::ContainerUnknown);
    }

    #[tokio::test]
    async fn delete_image_drops_big_data() {
        let store = store_with_image().await;
        store.set_image_big_data("abcd", "k", b"v").await.unwrap();
        assert_eq!(store.delete_image("abcd").await.unwrap(), vec!["l1".to_string()]);
        assert!(store.state.read().await.big_data.is_empty());
    }
}
