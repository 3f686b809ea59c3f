//! Pods and containers as storage-library container records.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use oci_spec::image::ImageConfiguration;
use references::{RegistryImageReference, StorageImageID};
use serde::{Deserialize, Serialize};
use store::{ContainerOptions, ContainerRecord, IdMappings, Storage, Store, StoreErrorKind};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::image::ImageServer;
use crate::pull::PullOptions;

/// The JSON stored with every pod sandbox and container record.
///
/// Unknown keys are ignored on read, so records written by newer versions
/// stay readable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RuntimeContainerMetadata {
    /// True for a pod's infra container.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub pod: bool,
    /// Name of the pod the container belongs to.
    pub pod_name: String,
    /// ID of the pod the container belongs to.
    pub pod_id: String,
    /// The image as the user asked for it. It may no longer resolve to the
    /// same image.
    pub image_name: String,
    /// The image the container was created from.
    pub image_id: String,
    /// The container's name.
    #[serde(rename = "name")]
    pub container_name: String,
    /// The name from the container's metadata.
    pub metadata_name: String,
    /// Pod UID.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Pod namespace.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// SELinux mount label.
    #[serde(rename = "mountlabel", skip_serializing_if = "String::is_empty")]
    pub mount_label: String,
    /// Creation time, in seconds since the epoch.
    pub created_at: i64,
    /// How many times this container has been created.
    #[serde(skip_serializing_if = "is_zero")]
    pub attempt: u32,
    /// Whether the container is privileged.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl RuntimeContainerMetadata {
    /// Record the mount label. Persist with
    /// [`RuntimeServer::set_container_metadata`].
    pub fn set_mount_label(&mut self, mount_label: impl Into<String>) {
        self.mount_label = mount_label.into();
    }
}

/// What a newly created pod sandbox or container looks like on disk.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Container ID.
    pub id: String,
    /// Persistent per-container directory.
    pub dir: Utf8PathBuf,
    /// Runtime per-container directory.
    pub run_dir: Utf8PathBuf,
    /// Configuration of the image the container runs.
    pub config: Arc<ImageConfiguration>,
    /// SELinux process label.
    pub process_label: String,
    /// SELinux mount label.
    pub mount_label: String,
}

/// A pod's infra container.
#[derive(Debug, Clone, Default)]
pub struct PodSandboxRequest {
    /// Pod name.
    pub pod_name: String,
    /// Pod ID, also the infra container's ID.
    pub pod_id: String,
    /// Image to run instead of the configured pause image.
    pub pause_image: Option<RegistryImageReference>,
    /// Credentials for pulling the pause image.
    pub auth_file: Option<Utf8PathBuf>,
    /// Infra container name.
    pub container_name: String,
    /// Name from the sandbox metadata. Defaults to the container name.
    pub metadata_name: String,
    /// Pod UID.
    pub uid: String,
    /// Pod namespace.
    pub namespace: String,
    /// Creation attempt.
    pub attempt: u32,
    /// Run in a user namespace with these mappings.
    pub id_mappings: Option<IdMappings>,
    /// SELinux label options.
    pub label_opts: Vec<String>,
    /// Whether the sandbox is privileged.
    pub privileged: bool,
}

/// A workload container in an existing pod.
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    /// Name of the pod.
    pub pod_name: String,
    /// ID of the pod.
    pub pod_id: String,
    /// The image as the user asked for it.
    pub user_requested_image: String,
    /// The resolved image.
    pub image_id: StorageImageID,
    /// Container name.
    pub container_name: String,
    /// Container ID.
    pub container_id: String,
    /// Name from the container metadata. Defaults to the container name.
    pub metadata_name: String,
    /// Creation attempt.
    pub attempt: u32,
    /// Run in a user namespace with these mappings.
    pub id_mappings: Option<IdMappings>,
    /// SELinux label options.
    pub label_opts: Vec<String>,
    /// Whether the container is privileged.
    pub privileged: bool,
}

struct Template {
    pod_name: String,
    pod_id: String,
    user_requested_image: String,
    image_id: StorageImageID,
    container_name: String,
    metadata_name: String,
    uid: String,
    namespace: String,
    attempt: u32,
    privileged: bool,
}

/// Creates and tears down the storage side of pods and containers.
#[derive(Debug, Clone)]
pub struct RuntimeServer {
    images: Arc<ImageServer>,
    store: Storage,
    pause_image: RegistryImageReference,
    pause_image_auth_file: Option<Utf8PathBuf>,
}

impl RuntimeServer {
    /// Work on the store `images` serves.
    pub fn new(images: Arc<ImageServer>, config: &RuntimeConfig) -> Result<Self> {
        let pause_image = RegistryImageReference::parse_normalized(&config.pause_image)
            .map_err(Error::reference(&config.pause_image))?;
        Ok(Self {
            store: images.store().clone(),
            images,
            pause_image,
            pause_image_auth_file: config.pause_image_auth_file.clone(),
        })
    }

    /// The image server containers are created from.
    pub fn image_server(&self) -> &Arc<ImageServer> {
        &self.images
    }

    /// Create a pod's infra container, pulling the pause image if needed.
    #[tracing::instrument(skip(self, request), fields(pod = %request.pod_name, pod_id = %request.pod_id))]
    pub async fn create_pod_sandbox(&self, request: PodSandboxRequest) -> Result<ContainerInfo> {
        let pause_image = request
            .pause_image
            .unwrap_or_else(|| self.pause_image.clone());

        let image_id = match self.images.image_status_by_name(&pause_image).await {
            Ok(status) => status.id,
            Err(error) if error.is_not_found() => {
                tracing::info!(
                    image = %pause_image.string_for_out_of_process_consumption_only(),
                    "pause image not present, pulling it"
                );
                let options = PullOptions {
                    auth_file: request
                        .auth_file
                        .or_else(|| self.pause_image_auth_file.clone()),
                    ..PullOptions::default()
                };
                self.images.pull_image(&pause_image, &options).await?;
                self.images.image_status_by_name(&pause_image).await?.id
            }
            Err(error) => return Err(error),
        };

        let template = Template {
            pod_name: request.pod_name,
            pod_id: request.pod_id.clone(),
            user_requested_image: pause_image.string_for_out_of_process_consumption_only(),
            image_id,
            container_name: request.container_name,
            metadata_name: request.metadata_name,
            uid: request.uid,
            namespace: request.namespace,
            attempt: request.attempt,
            privileged: request.privileged,
        };
        let options = ContainerOptions {
            id_mappings: request.id_mappings,
            label_opts: request.label_opts,
        };
        self.create_container_or_pod_sandbox(&request.pod_id, template, &options)
            .await
    }

    /// Create a workload container.
    #[tracing::instrument(skip(self, request), fields(pod = %request.pod_name, container = %request.container_name))]
    pub async fn create_container(&self, request: ContainerRequest) -> Result<ContainerInfo> {
        let template = Template {
            pod_name: request.pod_name,
            pod_id: request.pod_id,
            user_requested_image: request.user_requested_image,
            image_id: request.image_id,
            container_name: request.container_name,
            metadata_name: request.metadata_name,
            uid: String::new(),
            namespace: String::new(),
            attempt: request.attempt,
            privileged: request.privileged,
        };
        let options = ContainerOptions {
            id_mappings: request.id_mappings,
            label_opts: request.label_opts,
        };
        self.create_container_or_pod_sandbox(&request.container_id, template, &options)
            .await
    }

    async fn create_container_or_pod_sandbox(
        &self,
        container_id: &str,
        mut template: Template,
        options: &ContainerOptions,
    ) -> Result<ContainerInfo> {
        if template.pod_name.is_empty() || template.pod_id.is_empty() {
            return Err(Error::InvalidPodName);
        }
        if template.container_name.is_empty() {
            return Err(Error::InvalidContainerName);
        }
        if template.metadata_name.is_empty() {
            template.metadata_name = template.container_name.clone();
        }

        // Nothing is written until the image is known to be usable.
        let config = self
            .images
            .image_status_by_id(&template.image_id)
            .await?
            .oci_config;

        let image_id = template
            .image_id
            .id_string_for_out_of_process_consumption_only()
            .to_owned();
        let metadata = RuntimeContainerMetadata {
            pod: container_id == template.pod_id,
            pod_name: template.pod_name,
            pod_id: template.pod_id,
            image_name: template.user_requested_image,
            image_id: image_id.clone(),
            container_name: template.container_name,
            metadata_name: template.metadata_name,
            uid: template.uid,
            namespace: template.namespace,
            mount_label: String::new(),
            created_at: chrono::Utc::now().timestamp(),
            attempt: template.attempt,
            privileged: template.privileged,
        };
        let encoded = serde_json::to_string(&metadata)?;

        let mut names = vec![metadata.container_name.clone()];
        if metadata.pod {
            names.push(metadata.pod_name.clone());
        }

        let record = self
            .store
            .create_container(container_id, &names, &image_id, &encoded, options)
            .await
            .map_err(Error::store(format!("create container {container_id}")))?;

        match self.finish_container(&record, &metadata.container_name).await {
            Ok((dir, run_dir)) => Ok(ContainerInfo {
                id: record.id.clone(),
                dir,
                run_dir,
                config,
                process_label: record.process_label().to_owned(),
                mount_label: record.mount_label().to_owned(),
            }),
            Err(error) => {
                if let Err(cleanup) = self.store.delete_container(&record.id).await {
                    tracing::warn!(container = %record.id, "failed to remove partially created container: {cleanup}");
                }
                Err(error)
            }
        }
    }

    /// Name the writable layer after the container and find its
    /// directories.
    async fn finish_container(
        &self,
        record: &ContainerRecord,
        container_name: &str,
    ) -> Result<(Utf8PathBuf, Utf8PathBuf)> {
        let layer = &record.layer_id;
        let mut names = self
            .store
            .names(layer)
            .await
            .map_err(Error::store(format!("read names of layer {layer}")))?;
        names.push(format!("{container_name}-layer"));
        self.store
            .set_names(layer, &names)
            .await
            .map_err(Error::store(format!("name layer {layer}")))?;

        let dir = self
            .store
            .container_directory(&record.id)
            .await
            .map_err(Error::store(format!("find directory of container {}", record.id)))?;
        let run_dir = self
            .store
            .container_run_directory(&record.id)
            .await
            .map_err(Error::store(format!("find run directory of container {}", record.id)))?;
        Ok((dir, run_dir))
    }

    /// Remove a pod's infra container.
    #[tracing::instrument(skip(self))]
    pub async fn remove_pod_sandbox(&self, id_or_name: &str) -> Result<()> {
        let record = match self.store.container(id_or_name).await {
            Ok(record) => record,
            Err(error) if error.kind() == StoreErrorKind::ContainerUnknown => {
                return Err(Error::InvalidSandboxID)
            }
            Err(error) => return Err(Error::store(format!("look up pod {id_or_name}"))(error)),
        };
        self.store
            .delete_container(&record.id)
            .await
            .map_err(Error::store(format!("delete pod {}", record.id)))
    }

    /// Read a container's metadata.
    pub async fn get_container_metadata(&self, id_or_name: &str) -> Result<RuntimeContainerMetadata> {
        let encoded = self
            .store
            .metadata(id_or_name)
            .await
            .map_err(Error::store(format!("read metadata of {id_or_name}")))?;
        Ok(serde_json::from_str(&encoded)?)
    }

    /// Replace a container's metadata.
    pub async fn set_container_metadata(
        &self,
        id_or_name: &str,
        metadata: &RuntimeContainerMetadata,
    ) -> Result<()> {
        let encoded = serde_json::to_string(metadata)?;
        self.store
            .set_metadata(id_or_name, &encoded)
            .await
            .map_err(Error::store(format!("write metadata of {id_or_name}")))
    }

    /// Delete a container and, once nothing uses it, its ID-mapped base
    /// layer. A container that is already gone is not an error.
    #[tracing::instrument(skip(self))]
    pub async fn delete_container(&self, id_or_name: &str) -> Result<()> {
        if id_or_name.is_empty() {
            return Err(Error::InvalidContainerID);
        }
        let record = match self.store.container(id_or_name).await {
            Ok(record) => record,
            Err(error) if error.kind() == StoreErrorKind::ContainerUnknown => {
                tracing::info!("container not known, assuming it was already removed");
                return Ok(());
            }
            Err(error) => {
                return Err(Error::store(format!("look up container {id_or_name}"))(error))
            }
        };

        let layer = match self.store.layer(&record.layer_id).await {
            Ok(layer) => Some(layer),
            Err(error) => {
                tracing::debug!(layer = %record.layer_id, "layer of container not found: {error}");
                None
            }
        };

        self.store
            .delete_container(&record.id)
            .await
            .map_err(Error::store(format!("delete container {}", record.id)))?;

        if let Some(parent) = layer.and_then(|layer| layer.parent) {
            if let Err(error) = self.delete_layer_if_mapped(&record.image_id, &parent).await {
                tracing::warn!(layer = %parent, "failed to remove ID-mapped layer: {error}");
            }
        }
        Ok(())
    }

    /// Delete `layer` if it is one of the image's ID-mapped top layers.
    /// The unmapped top layer is never touched.
    async fn delete_layer_if_mapped(&self, image_id: &str, layer: &str) -> Result<()> {
        if layer.is_empty() {
            return Ok(());
        }
        let image = match self.store.image(image_id).await {
            Ok(image) => image,
            Err(error) if error.kind() == StoreErrorKind::ImageUnknown => return Ok(()),
            Err(error) => return Err(Error::store(format!("look up image {image_id}"))(error)),
        };
        if image.top_layer.as_deref() == Some(layer) {
            return Ok(());
        }
        if !image.mapped_top_layers.iter().any(|mapped| mapped == layer) {
            return Ok(());
        }
        match self.store.delete_layer(layer).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == StoreErrorKind::LayerUnknown => Ok(()),
            Err(error) => Err(Error::store(format!("delete layer {layer}"))(error)),
        }
    }

    /// Mount a container's root filesystem with its recorded mount label.
    #[tracing::instrument(skip(self))]
    pub async fn start_container(&self, id_or_name: &str) -> Result<Utf8PathBuf> {
        let record = self.known_container(id_or_name).await?;
        let metadata: RuntimeContainerMetadata = serde_json::from_str(&record.metadata)?;
        self.store
            .mount(&record.id, &metadata.mount_label)
            .await
            .map_err(Error::store(format!("mount container {}", record.id)))
    }

    /// Unmount a container. A container or layer that is already gone is not
    /// an error.
    #[tracing::instrument(skip(self))]
    pub async fn stop_container(&self, id_or_name: &str) -> Result<()> {
        if id_or_name.is_empty() {
            return Err(Error::InvalidContainerID);
        }
        let record = match self.store.container(id_or_name).await {
            Ok(record) => record,
            Err(error) if error.kind() == StoreErrorKind::ContainerUnknown => {
                tracing::info!("container not known, assuming it was already removed");
                return Ok(());
            }
            Err(error) => {
                return Err(Error::store(format!("look up container {id_or_name}"))(error))
            }
        };

        match self.store.unmount(&record.id, true).await {
            Ok(_) => Ok(()),
            Err(error) if error.kind() == StoreErrorKind::LayerUnknown => {
                tracing::info!(container = %record.id, "layer of container not known");
                Ok(())
            }
            Err(error) => Err(Error::store(format!("unmount container {}", record.id))(error)),
        }
    }

    /// The container's persistent directory.
    pub async fn get_work_dir(&self, id: &str) -> Result<Utf8PathBuf> {
        let record = self.known_container(id).await?;
        self.store
            .container_directory(&record.id)
            .await
            .map_err(Error::store(format!("find directory of container {}", record.id)))
    }

    /// The container's runtime directory.
    pub async fn get_run_dir(&self, id: &str) -> Result<Utf8PathBuf> {
        let record = self.known_container(id).await?;
        self.store
            .container_run_directory(&record.id)
            .await
            .map_err(Error::store(format!("find run directory of container {}", record.id)))
    }

    async fn known_container(&self, id_or_name: &str) -> Result<ContainerRecord> {
        match self.store.container(id_or_name).await {
            Ok(record) => Ok(record),
            Err(error) if error.kind() == StoreErrorKind::ContainerUnknown => {
                Err(Error::InvalidContainerID)
            }
            Err(error) => Err(Error::store(format!("look up container {id_or_name}"))(error)),
        }
    }

    /// The graph root of the backing store.
    pub fn graph_root(&self) -> &Utf8Path {
        self.store.graph_root()
    }
}
