use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use pin_project::pin_project;
use references::{Digest, Digester, RegistryImageReference, StorageImageID};
use serde::{Deserialize, Serialize};
use store::{Reader, Storage, Store, IMAGE_DIGEST_BIG_DATA_KEY};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::{BlobDescriptor, BlobKind, ImageDestination};

/// One blob finished arriving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    /// The blob's digest.
    pub digest: String,
    /// Bytes received so far.
    pub offset: u64,
    /// Advertised size, when known.
    pub total: Option<u64>,
}

/// The outcome of a committed pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    /// The stored image.
    pub image_id: StorageImageID,
    /// Digest of the manifest as received.
    pub manifest_digest: Digest,
}

/// Writes a pulled image into a storage library.
///
/// Layers are created as they arrive, each on top of the previous one. The
/// config blob and manifest are buffered and attached to the image as big
/// data on commit. The image is named with the canonical form of the
/// destination reference, which is also the key pulls are tracked under.
///
/// Pulling an image that is already stored adds the name and replaces the
/// manifest, so the record's digest is always that of the latest manifest
/// received. Earlier manifest digests stay in its digest list.
#[derive(Debug)]
pub struct StoreDestination {
    store: Storage,
    reference: RegistryImageReference,
    progress: Option<mpsc::UnboundedSender<PullProgress>>,
    config: Option<(Digest, Vec<u8>)>,
    layers: Vec<String>,
    manifest: Option<Vec<u8>>,
    committed: Option<Committed>,
}

impl StoreDestination {
    /// A destination writing `reference` into `store`.
    pub fn new(store: Storage, reference: RegistryImageReference) -> Self {
        Self {
            store,
            reference,
            progress: None,
            config: None,
            layers: Vec::new(),
            manifest: None,
            committed: None,
        }
    }

    /// Report every completed blob on `progress`.
    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<PullProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The stored image, once committed.
    pub fn committed(&self) -> Option<&Committed> {
        self.committed.as_ref()
    }

    /// Delete layers written for an image that was never committed.
    pub async fn discard(&mut self) {
        while let Some(layer) = self.layers.pop() {
            if let Err(error) = self.store.delete_layer(&layer).await {
                tracing::warn!(%layer, "failed to remove layer of an abandoned pull: {error}");
            }
        }
    }

    fn report(&self, blob: &BlobDescriptor, received: u64) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(PullProgress {
                digest: blob.digest.to_string(),
                offset: received,
                total: blob.size,
            });
        }
    }

    fn name(&self) -> String {
        self.reference.string_for_out_of_process_consumption_only()
    }

    async fn write_big_data(
        &self,
        id: &str,
        config_key: &str,
        config: &[u8],
        manifest: &[u8],
    ) -> Result<()> {
        self.store
            .set_image_big_data(id, config_key, config)
            .await
            .map_err(Error::store(format!("store configuration of {id}")))?;
        self.store
            .set_image_big_data(id, IMAGE_DIGEST_BIG_DATA_KEY, manifest)
            .await
            .map_err(Error::store(format!("store manifest of {id}")))
    }
}

/// Hashes everything read through it.
#[pin_project]
struct DigestingReader<R> {
    #[pin]
    inner: R,
    digester: Digester,
}

impl<R> DigestingReader<R> {
    fn new(inner: R, digester: Digester) -> Self {
        Self { inner, digester }
    }

    fn finish(self) -> Digest {
        self.digester.finish()
    }
}

impl<R: AsyncRead> AsyncRead for DigestingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        this.digester.update(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

#[async_trait::async_trait]
impl ImageDestination for StoreDestination {
    #[tracing::instrument(skip_all, fields(digest = %blob.digest, ?kind))]
    async fn put_blob(
        &mut self,
        blob: &BlobDescriptor,
        kind: BlobKind,
        stream: &mut Reader<'_>,
    ) -> Result<()> {
        match kind {
            BlobKind::Config => {
                let mut data = Vec::new();
                stream
                    .read_to_end(&mut data)
                    .await
                    .map_err(Error::io(format!("read configuration blob {}", blob.digest)))?;
                let actual = Digest::from_content(blob.digest.algorithm(), &data);
                if actual != blob.digest {
                    return Err(Error::DigestMismatch {
                        expected: blob.digest.to_string(),
                        actual: actual.to_string(),
                    });
                }
                self.report(blob, data.len() as u64);
                self.config = Some((blob.digest.clone(), data));
            }
            BlobKind::Layer => {
                let parent = self.layers.last().cloned();
                let digester = blob.digest.algorithm().digester();
                let mut verified = DigestingReader::new(stream, digester);
                let layer = self
                    .store
                    .create_layer(None, parent.as_deref(), &[], &mut verified)
                    .await
                    .map_err(Error::store(format!("create layer for {}", blob.digest)))?;

                let actual = verified.finish();
                if actual != blob.digest {
                    if let Err(error) = self.store.delete_layer(&layer.id).await {
                        tracing::warn!(layer = %layer.id, "failed to remove corrupt layer: {error}");
                    }
                    return Err(Error::DigestMismatch {
                        expected: blob.digest.to_string(),
                        actual: actual.to_string(),
                    });
                }

                self.report(blob, layer.size);
                self.layers.push(layer.id);
            }
        }
        Ok(())
    }

    async fn put_manifest(&mut self, manifest: &[u8]) -> Result<()> {
        self.manifest = Some(manifest.to_vec());
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(reference = %self.name()))]
    async fn commit(&mut self) -> Result<()> {
        let name = self.name();
        let invalid = |reason: &str| Error::InvalidImage {
            image: name.clone(),
            reason: reason.to_owned(),
        };
        let (config_digest, config) = self
            .config
            .take()
            .ok_or_else(|| invalid("no configuration blob was received"))?;
        let manifest = self
            .manifest
            .take()
            .ok_or_else(|| invalid("no manifest was received"))?;

        let config_key = config_digest.to_string();
        let image_id =
            StorageImageID::from_config_digest(&config_digest).map_err(Error::reference(&config_key))?;
        let id = image_id.id_string_for_out_of_process_consumption_only();

        match self.store.image(id).await {
            Ok(existing) => {
                // Same config, same image: the layers just written duplicate its own.
                self.discard().await;
                if !existing.names.contains(&name) {
                    let mut names = existing.names;
                    names.push(name.clone());
                    self.store
                        .set_names(id, &names)
                        .await
                        .map_err(Error::store(format!("name image {id}")))?;
                }
                self.write_big_data(id, &config_key, &config, &manifest).await?;
            }
            Err(error) if error.is_not_found() => {
                let top_layer = self.layers.last().cloned();
                self.store
                    .create_image(id, std::slice::from_ref(&name), top_layer.as_deref(), "")
                    .await
                    .map_err(Error::store(format!("create image {id}")))?;
                self.layers.clear();

                // An image without its config or manifest can't be described.
                if let Err(error) = self.write_big_data(id, &config_key, &config, &manifest).await {
                    if let Err(cleanup) = self.store.delete_image(id).await {
                        tracing::warn!(image = %id, "failed to remove partially committed image: {cleanup}");
                    }
                    return Err(error);
                }
            }
            Err(error) => return Err(Error::store(format!("look up image {id}"))(error)),
        }

        tracing::debug!(image = %id, "committed image");
        self.committed = Some(Committed {
            image_id,
            manifest_digest: Digest::sha256(&manifest),
        });
        Ok(())
    }
}
