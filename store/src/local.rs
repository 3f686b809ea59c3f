use base64::Engine as _;
use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;

use store_driver::{
    ContainerOptions, ContainerRecord, ImageRecord, LayerRecord, Reader, Store, StoreError,
    StoreErrorKind,
};

use crate::catalog::{random_id, Catalog, NewLayer};

const ENGINE: &str = "local";
const CATALOG_FILE: &str = "storage.json";

/// A store that persists its records as JSON under the graph root.
///
/// Layout, relative to the graph root:
///
/// * `storage.json`: all image, layer and container records
/// * `<driver>-images/<id>/=<base64 key>`: image big data
/// * `<driver>-layers/<id>.diff`: layer diffs as received
/// * `<driver>-containers/<id>/userdata`: per-container directories
/// * `<driver>/<layer>/merged`: mount points
///
/// The run root holds `<driver>-containers/<id>/userdata`.
#[derive(Debug)]
pub struct LocalStore {
    driver: String,
    graph_root: Utf8PathBuf,
    run_root: Utf8PathBuf,
    catalog: RwLock<Catalog>,
}

impl LocalStore {
    /// Open the store, creating both roots if needed and loading any
    /// existing records.
    #[tracing::instrument(level = "debug")]
    pub async fn open(
        driver: String,
        graph_root: Utf8PathBuf,
        run_root: Utf8PathBuf,
    ) -> Result<Self, StoreError> {
        for root in [&graph_root, &run_root] {
            tokio::fs::create_dir_all(root)
                .await
                .wrap_err_with(|| format!("create storage root {root}"))
                .map_err(StoreError::with(ENGINE, StoreErrorKind::Io))?;
        }

        let catalog = load_catalog(&graph_root).await?;

        Ok(Self {
            driver,
            graph_root,
            run_root,
            catalog: RwLock::new(catalog),
        })
    }

    fn images_dir(&self, id: &str) -> Utf8PathBuf {
        self.graph_root
            .join(format!("{}-images", self.driver))
            .join(id)
    }

    fn big_data_path(&self, id: &str, key: &str) -> Utf8PathBuf {
        let encoded = base64::engine::general_purpose::URL_SAFE.encode(key);
        self.images_dir(id).join(format!("={encoded}"))
    }

    fn layers_dir(&self) -> Utf8PathBuf {
        self.graph_root.join(format!("{}-layers", self.driver))
    }

    fn layer_path(&self, id: &str) -> Utf8PathBuf {
        self.layers_dir().join(format!("{id}.diff"))
    }

    fn mount_root(&self, layer: &str) -> Utf8PathBuf {
        self.graph_root.join(&self.driver).join(layer)
    }

    fn container_path(&self, root: &Utf8Path, id: &str) -> Utf8PathBuf {
        root.join(format!("{}-containers", self.driver))
            .join(id)
            .join("userdata")
    }

    /// Apply `op` to a copy of the records, persist the copy, then swap it in.
    async fn update<T>(
        &self,
        op: impl FnOnce(&mut Catalog) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut catalog = self.catalog.write().await;
        let mut next = catalog.clone();
        let value = op(&mut next)?;
        self.persist(&next).await?;
        *catalog = next;
        Ok(value)
    }

    async fn persist(&self, catalog: &Catalog) -> Result<(), StoreError> {
        let data = catalog.to_json()?;
        let target = self.graph_root.join(CATALOG_FILE);
        let temp = self
            .graph_root
            .join(format!("{CATALOG_FILE}.{}.tmp", uuid::Uuid::new_v4().simple()));

        write_atomic(&temp, &target, &data)
            .await
            .map_err(StoreError::with(ENGINE, StoreErrorKind::Io))
    }

    async fn create_dir(&self, path: Utf8PathBuf) -> Result<Utf8PathBuf, StoreError> {
        tokio::fs::create_dir_all(&path)
            .await
            .wrap_err_with(|| format!("create directory {path}"))
            .map_err(StoreError::with(ENGINE, StoreErrorKind::Io))?;
        Ok(path)
    }
}

async fn load_catalog(graph_root: &Utf8Path) -> Result<Catalog, StoreError> {
    match tokio::fs::read(graph_root.join(CATALOG_FILE)).await {
        Ok(data) => Catalog::from_json(ENGINE, &data),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(%graph_root, "no records yet, starting empty");
            Ok(Catalog::new(ENGINE))
        }
        Err(err) => Err(StoreError::builder(ENGINE, StoreErrorKind::Io, err)
            .context("read storage records")
            .build()),
    }
}

async fn write_atomic(temp: &Utf8Path, target: &Utf8Path, data: &[u8]) -> eyre::Result<()> {
    let mut file = tokio::fs::File::create(temp)
        .await
        .wrap_err_with(|| format!("create {temp}"))?;
    file.write_all(data).await.wrap_err("write")?;
    file.sync_all().await.wrap_err("sync")?;
    drop(file);

    if let Err(err) = tokio::fs::rename(temp, target).await {
        let _ = tokio::fs::remove_file(temp).await;
        return Err(err).wrap_err_with(|| format!("rename into {target}"));
    }
    Ok(())
}

async fn remove_ignoring_missing(path: &Utf8Path, dir: bool) -> eyre::Result<()> {
    let result = if dir {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).wrap_err_with(|| format!("remove {path}")),
    }
}

#[async_trait::async_trait]
impl Store for LocalStore {
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
        Ok(self.catalog.read().await.images())
    }

    async fn image(&self, id_or_name: &str) -> Result<ImageRecord, StoreError> {
        self.catalog.read().await.image(id_or_name).cloned()
    }

    async fn create_image(
        &self,
        id: &str,
        names: &[String],
        top_layer: Option<&str>,
        metadata: &str,
    ) -> Result<ImageRecord, StoreError> {
        self.update(|catalog| catalog.create_image(id, names, top_layer, metadata))
            .await
    }

    async fn delete_image(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let (image_id, deleted) = self
            .update(|catalog| {
                let image_id = catalog.image(id)?.id.clone();
                let deleted = catalog.delete_image(&image_id)?;
                Ok((image_id, deleted))
            })
            .await?;

        remove_ignoring_missing(&self.images_dir(&image_id), true)
            .await
            .map_err(StoreError::with(ENGINE, StoreErrorKind::Io))?;
        for layer in &deleted {
            remove_ignoring_missing(&self.layer_path(layer), false)
                .await
                .map_err(StoreError::with(ENGINE, StoreErrorKind::Io))?;
        }
        Ok(deleted)
    }

    async fn names(&self, id: &str) -> Result<Vec<String>, StoreError> {
        self.catalog.read().await.names(id)
    }

    async fn set_names(&self, id: &str, names: &[String]) -> Result<(), StoreError> {
        self.update(|catalog| catalog.set_names(id, names)).await
    }

    async fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let image_id = {
            let catalog = self.catalog.read().await;
            catalog.has_big_data(id, key)?;
            catalog.image(id)?.id.clone()
        };

        let path = self.big_data_path(&image_id, key);
        tokio::fs::read(&path)
            .await
            .wrap_err_with(|| format!("read big data {key:?} of image {image_id}"))
            .map_err(StoreError::with(ENGINE, StoreErrorKind::Io))
    }

    async fn set_image_big_data(
        &self,
        id: &str,
        key: &str,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let image_id = self.catalog.read().await.image(id)?.id.clone();
        let dir = self.create_dir(self.images_dir(&image_id)).await?;
        let target = self.big_data_path(&image_id, key);
        let temp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        write_atomic(&temp, &target, data)
            .await
            .map_err(StoreError::with(ENGINE, StoreErrorKind::Io))?;

        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        self.update(|catalog| catalog.record_big_data(&image_id, key, data.len() as u64, digest))
            .await
    }

    async fn image_big_data_digest(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        self.catalog.read().await.big_data_digest(id, key)
    }

    async fn image_size(&self, id: &str) -> Result<u64, StoreError> {
        self.catalog.read().await.image_size(id)
    }

    async fn layer(&self, id_or_name: &str) -> Result<LayerRecord, StoreError> {
        self.catalog.read().await.layer(id_or_name).cloned()
    }

    async fn create_layer(
        &self,
        id: Option<&str>,
        parent: Option<&str>,
        names: &[String],
        diff: &mut Reader<'_>,
    ) -> Result<LayerRecord, StoreError> {
        let id = id.map(ToOwned::to_owned).unwrap_or_else(random_id);
        let dir = self.create_dir(self.layers_dir()).await?;
        let temp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));

        let written = async {
            let mut file = tokio::fs::File::create(&temp)
                .await
                .wrap_err_with(|| format!("create {temp}"))?;
            let mut hasher = Sha256::new();
            let mut size = 0u64;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = diff.read(&mut buf).await.wrap_err("read layer diff")?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).await.wrap_err("write layer diff")?;
                size += n as u64;
            }
            file.sync_all().await.wrap_err("sync layer diff")?;
            Ok::<_, eyre::Report>((format!("sha256:{}", hex::encode(hasher.finalize())), size))
        }
        .await;

        let (digest, size) = match written {
            Ok(written) => written,
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(StoreError::new(ENGINE, StoreErrorKind::Io, err));
            }
        };

        let record = self
            .update(|catalog| {
                catalog.create_layer(NewLayer {
                    id: Some(id.clone()),
                    parent: parent.map(ToOwned::to_owned),
                    names: names.to_vec(),
                    compressed_digest: Some(digest),
                    size,
                })
            })
            .await;

        match record {
            Ok(record) => {
                tokio::fs::rename(&temp, self.layer_path(&record.id))
                    .await
                    .wrap_err("commit layer diff")
                    .map_err(StoreError::with(ENGINE, StoreErrorKind::Io))?;
                Ok(record)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp).await;
                Err(err)
            }
        }
    }

    async fn delete_layer(&self, id: &str) -> Result<(), StoreError> {
        let layer = self.update(|catalog| catalog.delete_layer(id)).await?;
        remove_ignoring_missing(&self.layer_path(&layer.id), false)
            .await
            .map_err(StoreError::with(ENGINE, StoreErrorKind::Io))?;
        remove_ignoring_missing(&self.mount_root(&layer.id), true)
            .await
            .map_err(StoreError::with(ENGINE, StoreErrorKind::Io))
    }

    async fn containers(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        Ok(self.catalog.read().await.containers())
    }

    async fn container(&self, id_or_name: &str) -> Result<ContainerRecord, StoreError> {
        self.catalog.read().await.container(id_or_name).cloned()
    }

    async fn create_container(
        &self,
        id: &str,
        names: &[String],
        image_id: &str,
        metadata: &str,
        options: &ContainerOptions,
    ) -> Result<ContainerRecord, StoreError> {
        self.update(|catalog| catalog.create_container(id, names, image_id, metadata, options))
            .await
    }

    async fn delete_container(&self, id: &str) -> Result<(), StoreError> {
        let removed = self.update(|catalog| catalog.delete_container(id)).await?;
        let id = &removed.record.id;

        for root in [&self.graph_root, &self.run_root] {
            let dir = root.join(format!("{}-containers", self.driver)).join(id);
            remove_ignoring_missing(&dir, true)
                .await
                .map_err(StoreError::with(ENGINE, StoreErrorKind::Io))?;
        }
        if let Some(layer) = removed.layer {
            remove_ignoring_missing(&self.mount_root(&layer.id), true)
                .await
                .map_err(StoreError::with(ENGINE, StoreErrorKind::Io))?;
        }
        Ok(())
    }

    async fn metadata(&self, id: &str) -> Result<String, StoreError> {
        Ok(self.catalog.read().await.container(id)?.metadata.clone())
    }

    async fn set_metadata(&self, id: &str, metadata: &str) -> Result<(), StoreError> {
        self.update(|catalog| catalog.set_metadata(id, metadata))
            .await
    }

    async fn container_directory(&self, id: &str) -> Result<Utf8PathBuf, StoreError> {
        let id = self.catalog.read().await.container(id)?.id.clone();
        self.create_dir(self.container_path(&self.graph_root, &id))
            .await
    }

    async fn container_run_directory(&self, id: &str) -> Result<Utf8PathBuf, StoreError> {
        let id = self.catalog.read().await.container(id)?.id.clone();
        self.create_dir(self.container_path(&self.run_root, &id))
            .await
    }

    async fn mount(&self, id: &str, mount_label: &str) -> Result<Utf8PathBuf, StoreError> {
        let layer = self
            .update(|catalog| catalog.mount(id, mount_label))
            .await?;
        self.create_dir(self.mount_root(&layer).join("merged")).await
    }

    async fn unmount(&self, id: &str, force: bool) -> Result<bool, StoreError> {
        self.update(|catalog| catalog.unmount(id, force)).await
    }

    async fn shutdown(&self, force: bool) -> Result<Vec<String>, StoreError> {
        self.update(|catalog| Ok(catalog.shutdown(force))).await
    }

    async fn reload(&self) -> Result<(), StoreError> {
        let mut catalog = self.catalog.write().await;
        *catalog = load_catalog(&self.graph_root).await?;
        Ok(())
    }
}
