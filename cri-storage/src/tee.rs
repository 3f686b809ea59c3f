//! Feeding the blob cache alongside the primary layer write.
//!
//! Every layer stream is read exactly once. A [`TeeReader`] hands each chunk
//! the primary destination reads to a bounded channel, and a side task
//! stores whatever arrives on that channel in the [`BlobCache`]. Both see
//! byte-identical data.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use blobcache::BlobCache;
use bytes::Bytes;
use pin_project::pin_project;
use store::Reader;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::transport::{BlobDescriptor, BlobKind, ImageDestination};

/// Chunks buffered between the primary reader and the cache.
const TEE_DEPTH: usize = 16;

/// A reader that forwards every chunk it yields to a channel.
///
/// If the receiving side goes away the reader keeps serving the primary
/// consumer and stops forwarding.
#[pin_project]
pub(crate) struct TeeReader<R> {
    #[pin]
    inner: R,
    sender: Option<PollSender<Bytes>>,
    pending: Option<Bytes>,
}

impl<R> TeeReader<R> {
    pub(crate) fn new(inner: R, sender: mpsc::Sender<Bytes>) -> Self {
        Self {
            inner,
            sender: Some(PollSender::new(sender)),
            pending: None,
        }
    }

    /// Forward the last chunk and close the channel, which is end of stream
    /// for the receiver.
    pub(crate) async fn close(&mut self) {
        std::future::poll_fn(|cx| forward(&mut self.sender, &mut self.pending, cx)).await;
        self.sender = None;
    }
}

fn forward(
    sender: &mut Option<PollSender<Bytes>>,
    pending: &mut Option<Bytes>,
    cx: &mut Context<'_>,
) -> Poll<()> {
    let Some(tx) = sender.as_mut() else {
        *pending = None;
        return Poll::Ready(());
    };
    if pending.is_none() {
        return Poll::Ready(());
    }

    match ready!(tx.poll_reserve(cx)) {
        Ok(()) => {
            if let Some(chunk) = pending.take() {
                if tx.send_item(chunk).is_err() {
                    *sender = None;
                }
            }
        }
        Err(_) => {
            *sender = None;
            *pending = None;
        }
    }
    Poll::Ready(())
}

impl<R: AsyncRead> AsyncRead for TeeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        ready!(forward(this.sender, this.pending, cx));

        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;

        if this.sender.is_some() {
            let read = &buf.filled()[before..];
            if !read.is_empty() {
                *this.pending = Some(Bytes::copy_from_slice(read));
            }
        }
        Poll::Ready(Ok(()))
    }
}

/// Wraps a destination so every layer is also stored in a blob cache.
///
/// A failed primary write aborts the cache write and is returned. A failed
/// cache write is only recorded as a warning.
#[derive(Debug)]
pub struct CachingDestination<D> {
    inner: D,
    cache: Arc<BlobCache>,
    registry: String,
    repository: String,
    cancel: CancellationToken,
    warnings: Vec<String>,
}

impl<D> CachingDestination<D> {
    /// Cache layers written to `inner` as coming from `registry/repository`.
    pub fn new(
        inner: D,
        cache: Arc<BlobCache>,
        registry: impl Into<String>,
        repository: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            cache,
            registry: registry.into(),
            repository: repository.into(),
            cancel,
            warnings: Vec::new(),
        }
    }

    /// The wrapped destination.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Unwrap the destination.
    pub fn into_inner(self) -> D {
        self.inner
    }

    /// Cache failures so far.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    fn warn(&mut self, message: String) {
        tracing::warn!("{message}");
        self.warnings.push(message);
    }
}

async fn store_in_cache(
    cache: Arc<BlobCache>,
    digest: String,
    registry: String,
    repository: String,
    chunks: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> Result<()> {
    let chunks = futures::stream::unfold(chunks, |mut chunks| async move {
        chunks
            .recv()
            .await
            .map(|chunk| (Ok::<_, io::Error>(chunk), chunks))
    });
    let mut reader = StreamReader::new(Box::pin(chunks));

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        stored = cache.store_blob(&digest, &mut reader, &registry, &repository) => Ok(stored?),
    }
}

#[async_trait::async_trait]
impl<D: ImageDestination> ImageDestination for CachingDestination<D> {
    async fn put_blob(
        &mut self,
        blob: &BlobDescriptor,
        kind: BlobKind,
        stream: &mut Reader<'_>,
    ) -> Result<()> {
        if kind == BlobKind::Config {
            return self.inner.put_blob(blob, kind, stream).await;
        }

        let (tx, rx) = mpsc::channel(TEE_DEPTH);
        let side = tokio::spawn(
            store_in_cache(
                self.cache.clone(),
                blob.digest.to_string(),
                self.registry.clone(),
                self.repository.clone(),
                rx,
                self.cancel.child_token(),
            )
            .in_current_span(),
        );

        let mut tee = TeeReader::new(stream, tx);
        if let Err(error) = self.inner.put_blob(blob, kind, &mut tee).await {
            side.abort();
            return Err(error);
        }

        // The cache gets the whole blob even if the primary stopped short.
        if let Err(error) = tokio::io::copy(&mut tee, &mut tokio::io::sink()).await {
            tracing::debug!(digest = %blob.digest, "reading the rest of the layer for the cache: {error}");
        }
        tee.close().await;

        match side.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => self.warn(format!("caching layer {}: {error}", blob.digest)),
            Err(error) => self.warn(format!("caching layer {}: {error}", blob.digest)),
        }
        Ok(())
    }

    async fn put_manifest(&mut self, manifest: &[u8]) -> Result<()> {
        self.inner.put_manifest(manifest).await
    }

    async fn commit(&mut self) -> Result<()> {
        self.inner.commit().await
    }
}
