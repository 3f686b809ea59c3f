//! Record bookkeeping shared by every backend.
//!
//! A [`Catalog`] owns the image, layer and container records and enforces
//! the relationships between them. Backends wrap it in a lock and decide
//! where layer contents, big data and directories live.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use store_driver::{
    ContainerOptions, ContainerRecord, IdMappings, ImageRecord, LayerRecord, StoreError,
    StoreErrorKind,
};

const DEFAULT_SELINUX_LEVEL: &str = "s0";

/// A fresh 64 character hex ID.
pub(crate) fn random_id() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Catalog {
    #[serde(skip)]
    engine: &'static str,
    #[serde(default)]
    images: BTreeMap<String, ImageRecord>,
    #[serde(default)]
    layers: BTreeMap<String, LayerRecord>,
    #[serde(default)]
    containers: BTreeMap<String, ContainerRecord>,
}

/// A layer the caller should create contents for.
#[derive(Debug)]
pub(crate) struct NewLayer {
    pub id: Option<String>,
    pub parent: Option<String>,
    pub names: Vec<String>,
    pub compressed_digest: Option<String>,
    pub size: u64,
}

/// Outcome of [`Catalog::delete_container`].
#[derive(Debug)]
pub(crate) struct RemovedContainer {
    pub record: ContainerRecord,
    pub layer: Option<LayerRecord>,
}

impl Catalog {
    pub(crate) fn new(engine: &'static str) -> Self {
        Self {
            engine,
            ..Default::default()
        }
    }

    pub(crate) fn from_json(engine: &'static str, data: &[u8]) -> Result<Self, StoreError> {
        let mut catalog: Catalog = serde_json::from_slice(data)
            .map_err(StoreError::with(engine, StoreErrorKind::Serialization))?;
        catalog.engine = engine;
        Ok(catalog)
    }

    pub(crate) fn to_json(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec_pretty(self)
            .map_err(StoreError::with(self.engine, StoreErrorKind::Serialization))
    }

    fn unknown(&self, kind: StoreErrorKind, id: &str) -> StoreError {
        StoreError::unknown(self.engine, kind, id)
    }

    fn invalid(&self, kind: StoreErrorKind, id: &str, message: String) -> StoreError {
        StoreError::builder(self.engine, kind, message).id(id).build()
    }

    // Images

    pub(crate) fn images(&self) -> Vec<ImageRecord> {
        self.images.values().cloned().collect()
    }

    /// Exact ID, then exact name, then unique ID prefix.
    pub(crate) fn image(&self, id_or_name: &str) -> Result<&ImageRecord, StoreError> {
        if let Some(image) = self.images.get(id_or_name) {
            return Ok(image);
        }

        if let Some(image) = self
            .images
            .values()
            .find(|image| image.names.iter().any(|name| name == id_or_name))
        {
            return Ok(image);
        }

        if id_or_name.is_empty() {
            return Err(self.unknown(StoreErrorKind::ImageUnknown, id_or_name));
        }

        let mut matches = self
            .images
            .range(id_or_name.to_owned()..)
            .take_while(|(id, _)| id.starts_with(id_or_name))
            .map(|(_, image)| image);

        match (matches.next(), matches.next()) {
            (Some(image), None) => Ok(image),
            (Some(_), Some(_)) => Err(self.invalid(
                StoreErrorKind::Ambiguous,
                id_or_name,
                format!("image ID prefix {id_or_name} matches more than one image"),
            )),
            (None, _) => Err(self.unknown(StoreErrorKind::ImageUnknown, id_or_name)),
        }
    }

    fn image_mut(&mut self, id_or_name: &str) -> Result<&mut ImageRecord, StoreError> {
        let id = self.image(id_or_name)?.id.clone();
        self.images
            .get_mut(&id)
            .ok_or_else(|| StoreError::unknown(self.engine, StoreErrorKind::ImageUnknown, &id))
    }

    /// Move `names` onto image `id`, taking them away from any other image.
    fn claim_image_names(&mut self, id: &str, names: &[String]) {
        for (other_id, other) in self.images.iter_mut() {
            if other_id == id {
                continue;
            }
            let before = other.names.len();
            other.names.retain(|name| !names.contains(name));
            if other.names.len() != before {
                tracing::debug!(image = %other_id, "image lost names to {id}");
            }
        }
    }

    pub(crate) fn create_image(
        &mut self,
        id: &str,
        names: &[String],
        top_layer: Option<&str>,
        metadata: &str,
    ) -> Result<ImageRecord, StoreError> {
        if id.is_empty() {
            return Err(self.invalid(
                StoreErrorKind::InvalidRequest,
                id,
                "image ID must not be empty".into(),
            ));
        }
        if self.images.contains_key(id) {
            return Err(self.invalid(
                StoreErrorKind::Duplicate,
                id,
                format!("image {id} already exists"),
            ));
        }
        if let Some(layer) = top_layer {
            if !self.layers.contains_key(layer) {
                return Err(self.unknown(StoreErrorKind::LayerUnknown, layer));
            }
        }

        let names = dedup(names);
        self.claim_image_names(id, &names);

        let mut record = ImageRecord::new(id);
        record.names = names;
        record.top_layer = top_layer.map(ToOwned::to_owned);
        record.metadata = metadata.to_owned();
        self.images.insert(id.to_owned(), record.clone());
        Ok(record)
    }

    /// Remove an image and every layer only it was using.
    pub(crate) fn delete_image(&mut self, id: &str) -> Result<Vec<String>, StoreError> {
        let image = self.image(id)?.clone();

        if let Some(container) = self
            .containers
            .values()
            .find(|container| container.image_id == image.id)
        {
            return Err(self.invalid(
                StoreErrorKind::LayerInUse,
                &image.id,
                format!("image is in use by container {}", container.id),
            ));
        }

        self.images.remove(&image.id);

        let mut deleted = Vec::new();
        for mapped in &image.mapped_top_layers {
            if self.layer_is_free(mapped) {
                self.layers.remove(mapped);
                deleted.push(mapped.clone());
            }
        }

        let mut next = image.top_layer.clone();
        while let Some(layer_id) = next.take() {
            if !self.layer_is_free(&layer_id) {
                break;
            }
            if let Some(layer) = self.layers.remove(&layer_id) {
                next = layer.parent;
                deleted.push(layer_id);
            }
        }

        Ok(deleted)
    }

    /// True if nothing references the layer.
    fn layer_is_free(&self, layer_id: &str) -> bool {
        let used_by_image = self.images.values().any(|image| {
            image.top_layer.as_deref() == Some(layer_id)
                || image.mapped_top_layers.iter().any(|l| l == layer_id)
        });
        let used_by_container = self
            .containers
            .values()
            .any(|container| container.layer_id == layer_id);
        let has_children = self
            .layers
            .values()
            .any(|layer| layer.parent.as_deref() == Some(layer_id));

        !(used_by_image || used_by_container || has_children)
    }

    pub(crate) fn record_big_data(
        &mut self,
        id: &str,
        key: &str,
        size: u64,
        digest: String,
    ) -> Result<(), StoreError> {
        let image = self.image_mut(id)?;
        image.big_data_sizes.insert(key.to_owned(), size);
        if key == store_driver::IMAGE_DIGEST_BIG_DATA_KEY {
            if !image.digests.contains(&digest) {
                image.digests.push(digest.clone());
            }
            image.digest = Some(digest.clone());
        }
        image.big_data_digests.insert(key.to_owned(), digest);
        Ok(())
    }

    pub(crate) fn big_data_digest(&self, id: &str, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.image(id)?.big_data_digests.get(key).cloned())
    }

    pub(crate) fn has_big_data(&self, id: &str, key: &str) -> Result<(), StoreError> {
        let image = self.image(id)?;
        if image.big_data_sizes.contains_key(key) {
            Ok(())
        } else {
            Err(self.invalid(
                StoreErrorKind::NotFound,
                &image.id,
                format!("image has no big data item {key:?}"),
            ))
        }
    }

    /// Layer sizes along the top layer's chain plus all big data.
    pub(crate) fn image_size(&self, id: &str) -> Result<u64, StoreError> {
        let image = self.image(id)?;
        let mut size: u64 = image.big_data_sizes.values().sum();

        let mut next = image.top_layer.as_deref();
        while let Some(layer_id) = next {
            let layer = self
                .layers
                .get(layer_id)
                .ok_or_else(|| self.unknown(StoreErrorKind::LayerUnknown, layer_id))?;
            size += layer.size;
            next = layer.parent.as_deref();
        }

        Ok(size)
    }

    // Names

    pub(crate) fn names(&self, id: &str) -> Result<Vec<String>, StoreError> {
        if let Some(image) = self.images.get(id) {
            return Ok(image.names.clone());
        }
        if let Some(layer) = self.layers.get(id) {
            return Ok(layer.names.clone());
        }
        if let Some(container) = self.containers.get(id) {
            return Ok(container.names.clone());
        }
        Err(self.unknown(StoreErrorKind::NotFound, id))
    }

    pub(crate) fn set_names(&mut self, id: &str, names: &[String]) -> Result<(), StoreError> {
        let names = dedup(names);

        if self.images.contains_key(id) {
            self.claim_image_names(id, &names);
            let image = self.image_mut(id)?;
            for old in &image.names {
                if !names.contains(old) {
                    image.names_history.insert(0, old.clone());
                }
            }
            image.names = names;
            return Ok(());
        }

        if self.layers.contains_key(id) {
            self.ensure_unique_names(id, &names, self.layers.values().map(|l| (&l.id, &l.names)))?;
            if let Some(layer) = self.layers.get_mut(id) {
                layer.names = names;
            }
            return Ok(());
        }

        if self.containers.contains_key(id) {
            self.ensure_unique_names(
                id,
                &names,
                self.containers.values().map(|c| (&c.id, &c.names)),
            )?;
            if let Some(container) = self.containers.get_mut(id) {
                container.names = names;
            }
            return Ok(());
        }

        Err(self.unknown(StoreErrorKind::NotFound, id))
    }

    fn ensure_unique_names<'a>(
        &self,
        id: &str,
        names: &[String],
        mut records: impl Iterator<Item = (&'a String, &'a Vec<String>)>,
    ) -> Result<(), StoreError> {
        match records.find(|(other, taken)| {
            other.as_str() != id && taken.iter().any(|name| names.contains(name))
        }) {
            Some((other, _)) => Err(self.invalid(
                StoreErrorKind::Duplicate,
                id,
                format!("name already in use by {other}"),
            )),
            None => Ok(()),
        }
    }

    // Layers

    pub(crate) fn layer(&self, id_or_name: &str) -> Result<&LayerRecord, StoreError> {
        self.layers
            .get(id_or_name)
            .or_else(|| {
                self.layers
                    .values()
                    .find(|layer| layer.names.iter().any(|name| name == id_or_name))
            })
            .ok_or_else(|| self.unknown(StoreErrorKind::LayerUnknown, id_or_name))
    }

    pub(crate) fn create_layer(&mut self, layer: NewLayer) -> Result<LayerRecord, StoreError> {
        let id = layer.id.unwrap_or_else(random_id);
        if self.layers.contains_key(&id) {
            return Err(self.invalid(
                StoreErrorKind::Duplicate,
                &id,
                format!("layer {id} already exists"),
            ));
        }
        if let Some(parent) = layer.parent.as_deref() {
            if !self.layers.contains_key(parent) {
                return Err(self.unknown(StoreErrorKind::LayerUnknown, parent));
            }
        }
        let names = dedup(&layer.names);
        self.ensure_unique_names(&id, &names, self.layers.values().map(|l| (&l.id, &l.names)))?;

        let record = LayerRecord {
            id: id.clone(),
            names,
            parent: layer.parent,
            compressed_digest: layer.compressed_digest,
            size: layer.size,
            id_mappings: None,
            mount_label: String::new(),
            mount_count: 0,
            created: Utc::now(),
        };
        self.layers.insert(id, record.clone());
        Ok(record)
    }

    pub(crate) fn delete_layer(&mut self, id: &str) -> Result<LayerRecord, StoreError> {
        let id = self.layer(id)?.id.clone();

        let blocked = self
            .images
            .values()
            .any(|image| image.top_layer.as_deref() == Some(id.as_str()))
            || self.containers.values().any(|c| c.layer_id == id)
            || self
                .layers
                .values()
                .any(|layer| layer.parent.as_deref() == Some(id.as_str()));
        if blocked {
            return Err(self.invalid(
                StoreErrorKind::LayerInUse,
                &id,
                format!("layer {id} is in use"),
            ));
        }

        for image in self.images.values_mut() {
            image.mapped_top_layers.retain(|layer| layer != &id);
        }

        self.layers
            .remove(&id)
            .ok_or_else(|| StoreError::unknown(self.engine, StoreErrorKind::LayerUnknown, &id))
    }

    // Containers

    pub(crate) fn containers(&self) -> Vec<ContainerRecord> {
        self.containers.values().cloned().collect()
    }

    pub(crate) fn container(&self, id_or_name: &str) -> Result<&ContainerRecord, StoreError> {
        self.containers
            .get(id_or_name)
            .or_else(|| {
                self.containers
                    .values()
                    .find(|container| container.names.iter().any(|name| name == id_or_name))
            })
            .ok_or_else(|| self.unknown(StoreErrorKind::ContainerUnknown, id_or_name))
    }

    fn container_mut(&mut self, id_or_name: &str) -> Result<&mut ContainerRecord, StoreError> {
        let id = self.container(id_or_name)?.id.clone();
        self.containers
            .get_mut(&id)
            .ok_or_else(|| StoreError::unknown(self.engine, StoreErrorKind::ContainerUnknown, &id))
    }

    /// Find or create the copy of an image's top layer for `mappings`.
    fn mapped_top_layer(
        &mut self,
        image_id: &str,
        mappings: &IdMappings,
    ) -> Result<String, StoreError> {
        let image = self.image(image_id)?.clone();

        if let Some(existing) = image.mapped_top_layers.iter().find(|layer| {
            self.layers
                .get(layer.as_str())
                .is_some_and(|layer| layer.id_mappings.as_ref() == Some(mappings))
        }) {
            return Ok(existing.clone());
        }

        let top = match image.top_layer.as_deref() {
            Some(top) => self.layer(top)?.clone(),
            None => {
                return Err(self.invalid(
                    StoreErrorKind::InvalidRequest,
                    &image.id,
                    "image has no layers to map".into(),
                ))
            }
        };

        let mut mapped = self.create_layer(NewLayer {
            id: None,
            parent: top.parent.clone(),
            names: Vec::new(),
            compressed_digest: top.compressed_digest.clone(),
            size: top.size,
        })?;
        mapped.id_mappings = Some(mappings.clone());
        self.layers.insert(mapped.id.clone(), mapped.clone());
        self.image_mut(&image.id)?
            .mapped_top_layers
            .push(mapped.id.clone());

        tracing::debug!(image = %image.id, layer = %mapped.id, "created ID-mapped top layer");
        Ok(mapped.id)
    }

    pub(crate) fn create_container(
        &mut self,
        id: &str,
        names: &[String],
        image_id: &str,
        metadata: &str,
        options: &ContainerOptions,
    ) -> Result<ContainerRecord, StoreError> {
        if id.is_empty() {
            return Err(self.invalid(
                StoreErrorKind::InvalidRequest,
                id,
                "container ID must not be empty".into(),
            ));
        }
        if self.containers.contains_key(id) {
            return Err(self.invalid(
                StoreErrorKind::Duplicate,
                id,
                format!("container {id} already exists"),
            ));
        }
        let names = dedup(names);
        self.ensure_unique_names(
            id,
            &names,
            self.containers.values().map(|c| (&c.id, &c.names)),
        )?;

        let image = self.image(image_id)?.clone();
        let (mount_label, process_label) = selinux_labels(&options.label_opts);

        let base = match options.id_mappings.as_ref().filter(|m| !m.is_empty()) {
            Some(mappings) => Some(self.mapped_top_layer(&image.id, mappings)?),
            None => image.top_layer.clone(),
        };

        let layer = self.create_layer(NewLayer {
            id: None,
            parent: base,
            names: Vec::new(),
            compressed_digest: None,
            size: 0,
        })?;

        let record = ContainerRecord {
            id: id.to_owned(),
            names,
            image_id: image.id,
            layer_id: layer.id,
            metadata: metadata.to_owned(),
            mount_label,
            process_label,
            created: Utc::now(),
        };
        self.containers.insert(id.to_owned(), record.clone());
        Ok(record)
    }

    pub(crate) fn delete_container(&mut self, id: &str) -> Result<RemovedContainer, StoreError> {
        let id = self.container(id)?.id.clone();
        let record = self
            .containers
            .remove(&id)
            .ok_or_else(|| StoreError::unknown(self.engine, StoreErrorKind::ContainerUnknown, &id))?;
        let layer = self.layers.remove(&record.layer_id);
        Ok(RemovedContainer { record, layer })
    }

    pub(crate) fn set_metadata(&mut self, id: &str, metadata: &str) -> Result<(), StoreError> {
        self.container_mut(id)?.metadata = metadata.to_owned();
        Ok(())
    }

    /// Bump the mount count of a container's layer and return the layer ID.
    pub(crate) fn mount(&mut self, id: &str, mount_label: &str) -> Result<String, StoreError> {
        let layer_id = self.container(id)?.layer_id.clone();
        let layer = self
            .layers
            .get_mut(&layer_id)
            .ok_or_else(|| StoreError::unknown(self.engine, StoreErrorKind::LayerUnknown, &layer_id))?;
        layer.mount_count += 1;
        layer.mount_label = mount_label.to_owned();
        Ok(layer_id)
    }

    pub(crate) fn unmount(&mut self, id: &str, force: bool) -> Result<bool, StoreError> {
        let layer_id = self.container(id)?.layer_id.clone();
        let layer = self
            .layers
            .get_mut(&layer_id)
            .ok_or_else(|| StoreError::unknown(self.engine, StoreErrorKind::LayerUnknown, &layer_id))?;
        layer.mount_count = if force {
            0
        } else {
            layer.mount_count.saturating_sub(1)
        };
        if layer.mount_count == 0 {
            layer.mount_label.clear();
        }
        Ok(layer.mount_count > 0)
    }

    /// Layers still mounted. With `force` they are unmounted as well.
    pub(crate) fn shutdown(&mut self, force: bool) -> Vec<String> {
        let mut mounted = Vec::new();
        for layer in self.layers.values_mut() {
            if layer.mount_count > 0 {
                mounted.push(layer.id.clone());
                if force {
                    layer.mount_count = 0;
                    layer.mount_label.clear();
                }
            }
        }
        mounted
    }
}

fn dedup(names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !out.contains(name) {
            out.push(name.clone());
        }
    }
    out
}

/// Mount and process labels for `label_opts`.
///
/// No options means labeling is off. `disable` wins over everything else.
fn selinux_labels(label_opts: &[String]) -> (String, String) {
    if label_opts.is_empty() || label_opts.iter().any(|opt| opt == "disable") {
        return (String::new(), String::new());
    }

    let level = label_opts
        .iter()
        .find_map(|opt| opt.strip_prefix("level:"))
        .unwrap_or(DEFAULT_SELINUX_LEVEL);

    (
        format!("system_u:object_r:container_file_t:{level}"),
        format!("system_u:system_r:container_t:{level}"),
    )
}
