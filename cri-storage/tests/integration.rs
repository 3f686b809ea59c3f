//! End-to-end tests for the image and runtime servers

use std::collections::HashMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cri_storage::{
    BlobDescriptor, BlobKind, Config, ContainerRequest, Error, ImageDestination, ImageTransport,
    MultiStoreServer, PodSandboxRequest, PullOptions, RuntimeServer,
};
use parking_lot::Mutex;
use references::{Digest, RegistryImageReference};
use serde_json::json;
use sha2::{Digest as _, Sha256};
use store::{IdMap, IdMappings, Store};

fn sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// An image as a registry serves it.
#[derive(Debug, Clone)]
struct Image {
    config: Vec<u8>,
    layers: Vec<Vec<u8>>,
    manifest: Vec<u8>,
}

impl Image {
    fn new(user: &str, layers: &[&str]) -> Self {
        let layers: Vec<Vec<u8>> = layers.iter().map(|l| l.as_bytes().to_vec()).collect();
        let config = serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "User": user },
            "rootfs": {
                "type": "layers",
                "diff_ids": layers.iter().map(|l| sha256(l)).collect::<Vec<_>>(),
            },
        }))
        .unwrap();
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": sha256(&config),
                "size": config.len(),
            },
            "layers": layers.iter().map(|l| json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": sha256(l),
                "size": l.len(),
            })).collect::<Vec<_>>(),
        }))
        .unwrap();
        Self {
            config,
            layers,
            manifest,
        }
    }

    fn id(&self) -> String {
        hex::encode(Sha256::digest(&self.config))
    }
}

/// Serves images by `docker://` source.
#[derive(Debug, Default)]
struct Registry {
    images: Mutex<HashMap<String, Image>>,
}

impl Registry {
    fn push(&self, name: &str, image: Image) {
        self.images.lock().insert(format!("docker://{name}"), image);
    }
}

#[async_trait::async_trait]
impl ImageTransport for Registry {
    async fn copy(
        &self,
        source: &str,
        _auth_file: Option<&Utf8Path>,
        destination: &mut dyn ImageDestination,
    ) -> cri_storage::Result<()> {
        let image = self
            .images
            .lock()
            .get(source)
            .cloned()
            .ok_or_else(|| Error::Transport {
                source_ref: source.to_owned(),
                error: "manifest unknown".into(),
            })?;

        let blobs = std::iter::once((BlobKind::Config, &image.config))
            .chain(image.layers.iter().map(|l| (BlobKind::Layer, l)));
        for (kind, data) in blobs {
            let blob = BlobDescriptor {
                digest: sha256(data).parse::<Digest>().unwrap(),
                size: Some(data.len() as u64),
                media_type: match kind {
                    BlobKind::Config => "application/vnd.oci.image.config.v1+json".into(),
                    BlobKind::Layer => "application/vnd.oci.image.layer.v1.tar".into(),
                },
            };
            destination.put_blob(&blob, kind, &mut &data[..]).await?;
        }
        destination.put_manifest(&image.manifest).await?;
        destination.commit().await
    }
}

struct Node {
    _root: tempfile::TempDir,
    cache_dir: Utf8PathBuf,
    server: MultiStoreServer,
    runtime: RuntimeServer,
}

async fn node() -> Node {
    let root = tempfile::tempdir().unwrap();
    let base = Utf8Path::from_path(root.path()).unwrap().to_owned();
    let cache_dir = base.join("blob-cache");

    let config = Config::from_toml_str(&format!(
        r#"
        [storage]
        default-driver = "overlay"

        [[storage.stores]]
        backend = "local"
        driver = "overlay"
        graph-root = "{base}/graph"
        run-root = "{base}/run"

        [[storage.stores]]
        backend = "memory"
        driver = "vfs"

        [image]
        unqualified-search-registries = ["quay.io"]
        pinned-images = ["registry.k8s.io/pause*"]
        blob-cache-dir = "{cache_dir}"

        [runtime]
        pause-image = "registry.k8s.io/pause:3.10"
        "#
    ))
    .unwrap();

    let registry = Arc::new(Registry::default());
    registry.push("registry.k8s.io/pause:3.10", Image::new("65535", &["pause"]));
    registry.push("quay.io/team/web:v1", Image::new("1000", &["base", "web"]));

    let store = config.storage.build().await.unwrap();
    let server = MultiStoreServer::new(store, registry, config.image)
        .await
        .unwrap();
    let runtime =
        RuntimeServer::new(server.default_image_server().clone(), &config.runtime).unwrap();

    Node {
        _root: root,
        cache_dir,
        server,
        runtime,
    }
}

#[tokio::test]
async fn pod_lifecycle() {
    let node = node().await;

    let sandbox = node
        .runtime
        .create_pod_sandbox(PodSandboxRequest {
            pod_name: "web-0".into(),
            pod_id: "pod-web-0".into(),
            container_name: "k8s_POD_web-0".into(),
            namespace: "default".into(),
            uid: "a1b2".into(),
            ..PodSandboxRequest::default()
        })
        .await
        .unwrap();
    assert!(sandbox.dir.exists());
    assert!(sandbox.run_dir.exists());

    let pause = node
        .server
        .image_status("registry.k8s.io/pause:3.10")
        .await
        .unwrap();
    assert!(pause.pinned);
    assert_eq!(pause.user, "65535");

    let outcome = node
        .server
        .pull_image(
            &RegistryImageReference::parse_normalized("quay.io/team/web:v1").unwrap(),
            &PullOptions::default(),
        )
        .await
        .unwrap();
    let web = Image::new("1000", &["base", "web"]);
    assert_eq!(
        outcome.image_id.id_string_for_out_of_process_consumption_only(),
        web.id()
    );

    // Short names resolve through the search registries.
    let status = node.server.image_status("team/web:v1").await.unwrap();
    assert_eq!(status.id, outcome.image_id);
    assert!(!status.pinned);
    assert_eq!(
        status.repo_digests,
        vec![format!("quay.io/team/web@{}", sha256(&web.manifest))]
    );

    let container = node
        .runtime
        .create_container(ContainerRequest {
            pod_name: "web-0".into(),
            pod_id: "pod-web-0".into(),
            user_requested_image: "team/web:v1".into(),
            image_id: outcome.image_id.clone(),
            container_name: "k8s_web_web-0".into(),
            container_id: "ctr-web".into(),
            metadata_name: "web".into(),
            attempt: 0,
            id_mappings: None,
            label_opts: vec!["level:s0:c1,c2".into()],
            privileged: false,
        })
        .await
        .unwrap();
    assert_eq!(
        container.mount_label,
        "system_u:object_r:container_file_t:s0:c1,c2"
    );

    let mut metadata = node.runtime.get_container_metadata("ctr-web").await.unwrap();
    assert_eq!(metadata.metadata_name, "web");
    metadata.set_mount_label(container.mount_label.clone());
    node.runtime
        .set_container_metadata("ctr-web", &metadata)
        .await
        .unwrap();

    node.runtime.start_container("ctr-web").await.unwrap();
    node.runtime.stop_container("ctr-web").await.unwrap();

    // The image is in use.
    assert!(node.server.remove_image("team/web:v1", false).await.is_err());

    node.runtime.delete_container("ctr-web").await.unwrap();
    node.runtime.remove_pod_sandbox("pod-web-0").await.unwrap();
    node.server.remove_image("team/web:v1", false).await.unwrap();

    let (images, error) = node.server.list_all_images(None).await.split();
    assert!(error.is_none());
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].id, pause.id);

    let stats = node
        .server
        .default_image_server()
        .prune_blob_cache()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.blobs_removed, 2);
    assert!(node.cache_dir.join("metadata.json").exists());

    assert!(node.server.shutdown(false).await.is_complete());
}

#[tokio::test]
async fn user_namespaced_containers_share_a_mapped_layer() {
    let node = node().await;
    let outcome = node
        .server
        .pull_image(
            &RegistryImageReference::parse_normalized("quay.io/team/web:v1").unwrap(),
            &PullOptions::default(),
        )
        .await
        .unwrap();

    let mappings = IdMappings {
        uid_map: vec![IdMap {
            container_id: 0,
            host_id: 200_000,
            size: 65536,
        }],
        gid_map: vec![IdMap {
            container_id: 0,
            host_id: 200_000,
            size: 65536,
        }],
    };
    for n in 0..2 {
        node.runtime
            .create_container(ContainerRequest {
                pod_name: "web-0".into(),
                pod_id: "pod-web-0".into(),
                user_requested_image: "quay.io/team/web:v1".into(),
                image_id: outcome.image_id.clone(),
                container_name: format!("k8s_web_{n}"),
                container_id: format!("ctr-{n}"),
                metadata_name: String::new(),
                attempt: 0,
                id_mappings: Some(mappings.clone()),
                label_opts: Vec::new(),
                privileged: false,
            })
            .await
            .unwrap();
    }

    let store = node.server.store().default_store();
    let raw = outcome.image_id.id_string_for_out_of_process_consumption_only();
    assert_eq!(store.image(raw).await.unwrap().mapped_top_layers.len(), 1);

    // Still used by the second container.
    node.runtime.delete_container("ctr-0").await.unwrap();
    assert_eq!(store.image(raw).await.unwrap().mapped_top_layers.len(), 1);

    node.runtime.delete_container("ctr-1").await.unwrap();
    assert!(store.image(raw).await.unwrap().mapped_top_layers.is_empty());
}

#[tokio::test]
async fn missing_images_fail_cleanly() {
    let node = node().await;
    let error = node
        .server
        .pull_image(
            &RegistryImageReference::parse_normalized("quay.io/team/missing:v1").unwrap(),
            &PullOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Transport { .. }));
    assert!(node.server.image_status("missing:v1").await.unwrap_err().is_not_found());

    // Nothing is left behind in any backend.
    let (images, _) = node.server.list_all_images(None).await.split();
    assert!(images.is_empty());
}
