use std::collections::HashSet;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use references::{Algorithm, Digest};
use tempfile::{NamedTempFile, TempPath};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;

use crate::error::{BlobCacheError, BlobCacheResult};
use crate::metadata::{BlobInfo, Metadata, Source};

const BLOBS_DIR: &str = "blobs";
const METADATA_FILE: &str = "metadata.json";
const COPY_BUFFER: usize = 64 * 1024;
const TEMP_PREFIX: &str = ".tmp-";

/// Counts from one [`BlobCache::garbage_collect`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Metadata entries dropped.
    pub blobs_removed: u64,
    /// Bytes of blob files deleted.
    pub bytes_freed: u64,
}

/// A content-addressed cache of compressed layer blobs.
///
/// Blobs live at `<root>/blobs/<algorithm>/<encoded>`, and
/// `<root>/metadata.json` indexes them with their sources and access times.
/// A blob file only ever appears at its final path through an atomic rename
/// of a fully verified temp file. Metadata changes are serialized behind one
/// lock and persisted atomically.
#[derive(Debug)]
pub struct BlobCache {
    root: Utf8PathBuf,
    blobs_dir: Utf8PathBuf,
    metadata_path: Utf8PathBuf,
    metadata: RwLock<Metadata>,
}

impl BlobCache {
    /// Open or create a cache at `root`, which must be a non-empty absolute
    /// path. Symlinks in `root` are resolved.
    #[tracing::instrument(level = "debug", skip_all, fields(root = %root.as_ref()))]
    pub async fn new(root: impl AsRef<Utf8Path>) -> BlobCacheResult<Self> {
        let root = root.as_ref();
        if root.as_str().is_empty() {
            return Err(BlobCacheError::EmptyDirectory);
        }
        if !root.is_absolute() {
            return Err(BlobCacheError::RelativePath(root.to_owned()));
        }

        tokio::fs::create_dir_all(root)
            .await
            .map_err(BlobCacheError::io(format!("create {root}")))?;
        let resolved = tokio::fs::canonicalize(root)
            .await
            .map_err(BlobCacheError::io(format!("resolve {root}")))?;
        let root = Utf8PathBuf::try_from(resolved).map_err(|err| BlobCacheError::Io {
            context: format!("resolve {root}"),
            source: err.into_io_error(),
        })?;

        let blobs_dir = root.join(BLOBS_DIR);
        tokio::fs::create_dir_all(&blobs_dir)
            .await
            .map_err(BlobCacheError::io(format!("create {blobs_dir}")))?;

        let metadata_path = root.join(METADATA_FILE);
        let metadata = match Metadata::load(&metadata_path).await? {
            Some(metadata) => metadata,
            None => {
                let metadata = Metadata::default();
                metadata.persist(&metadata_path).await?;
                metadata
            }
        };
        tracing::debug!(%root, blobs = metadata.blobs.len(), "opened blob cache");

        Ok(Self {
            root,
            blobs_dir,
            metadata_path,
            metadata: RwLock::new(metadata),
        })
    }

    /// The resolved cache root.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Where the blob for `digest` lives, whether or not it is present.
    pub fn blob_path(&self, digest: &Digest) -> Utf8PathBuf {
        self.blobs_dir
            .join(digest.algorithm().as_str())
            .join(digest.encoded())
    }

    /// True if a blob file exists for `digest`.
    pub async fn has_blob(&self, digest: &Digest) -> bool {
        tokio::fs::try_exists(self.blob_path(digest))
            .await
            .unwrap_or(false)
    }

    /// The metadata entry for `digest`.
    pub async fn blob_info(&self, digest: &Digest) -> Option<BlobInfo> {
        self.metadata
            .read()
            .await
            .blobs
            .get(&digest.to_string())
            .cloned()
    }

    /// Every metadata entry.
    pub async fn list_blobs(&self) -> Vec<BlobInfo> {
        self.metadata.read().await.blobs.values().cloned().collect()
    }

    /// Sum of the recorded sizes of every entry.
    pub async fn total_size(&self) -> u64 {
        self.metadata
            .read()
            .await
            .blobs
            .values()
            .map(|info| info.size)
            .sum()
    }

    /// Open a cached blob for reading and mark it accessed.
    pub async fn open_blob(&self, digest: &Digest) -> BlobCacheResult<tokio::fs::File> {
        let path = self.blob_path(digest);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(BlobCacheError::io(format!("open {path}")))?;

        let mut metadata = self.metadata.write().await;
        if let Some(info) = metadata.blobs.get_mut(&digest.to_string()) {
            info.last_accessed = Utc::now();
            metadata.persist(&self.metadata_path).await?;
        }
        Ok(file)
    }

    /// Store the blob read from `reader` under `digest`, recording where it
    /// came from.
    ///
    /// `reader` is always read to the end, even on failure, so a stream
    /// shared with another consumer is never left stalled. A blob that is
    /// already present only gains a source and a fresh access time.
    #[tracing::instrument(skip(self, reader))]
    pub async fn store_blob<R>(
        &self,
        digest: &str,
        reader: &mut R,
        registry: &str,
        repository: &str,
    ) -> BlobCacheResult<()>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let source = Source {
            registry: registry.to_owned(),
            repository: repository.to_owned(),
        };

        let parsed = match Digest::from_str(digest) {
            Ok(parsed) => parsed,
            Err(err) => {
                drain(reader).await;
                return Err(err.into());
            }
        };

        let path = self.blob_path(&parsed);
        if let Ok(stat) = tokio::fs::metadata(&path).await {
            drain(reader).await;
            let created = stat.modified().map(DateTime::<Utc>::from).ok();
            return self.record(&parsed, stat.len(), created, source).await;
        }

        let dir = self.blobs_dir.join(parsed.algorithm().as_str());
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            drain(reader).await;
            return Err(BlobCacheError::io(format!("create {dir}"))(err));
        }

        // Dropping `temp` before the rename, including when this future is
        // dropped mid-write, deletes the file.
        let (file, temp) = match create_temp(&dir).await {
            Ok(temp) => temp.into_parts(),
            Err(err) => {
                drain(reader).await;
                return Err(BlobCacheError::io(format!("create a temp file in {dir}"))(err));
            }
        };
        let file = tokio::fs::File::from_std(file);
        let written = write_verified(reader, file, parsed.algorithm()).await;

        let (actual, size) = match written {
            Ok(written) => written,
            Err(err) => {
                drain(reader).await;
                return Err(BlobCacheError::io(format!("write {}", temp.display()))(err));
            }
        };

        if actual != parsed {
            tracing::debug!(expected = %parsed, "discarding blob with wrong digest");
            return Err(BlobCacheError::DigestMismatch {
                expected: parsed.to_string(),
                actual: actual.to_string(),
            });
        }

        commit_temp(temp, &path)
            .await
            .map_err(BlobCacheError::io(format!("commit {path}")))?;
        tracing::trace!(%path, size, "stored blob");

        self.record(&parsed, size, None, source).await
    }

    /// Add or refresh the metadata entry for a blob that is on disk.
    async fn record(
        &self,
        digest: &Digest,
        size: u64,
        created: Option<DateTime<Utc>>,
        source: Source,
    ) -> BlobCacheResult<()> {
        let now = Utc::now();
        let key = digest.to_string();

        let mut metadata = self.metadata.write().await;
        match metadata.blobs.get_mut(&key) {
            Some(info) => {
                info.add_source(source);
                info.last_accessed = now;
            }
            None => {
                if created.is_some() {
                    tracing::debug!(digest = %key, "rebuilding missing metadata entry");
                }
                metadata.blobs.insert(
                    key.clone(),
                    BlobInfo {
                        digest: key,
                        size,
                        sources: vec![source],
                        last_accessed: now,
                        created_at: created.unwrap_or(now),
                    },
                );
            }
        }
        metadata.persist(&self.metadata_path).await
    }

    /// Drop every entry whose digest is not in `referenced`, deleting its
    /// blob file.
    ///
    /// Entries whose key is not a valid digest are dropped too. Files that are
    /// already gone are not an error.
    #[tracing::instrument(skip_all, fields(referenced = referenced.len()))]
    pub async fn garbage_collect(&self, referenced: &HashSet<String>) -> BlobCacheResult<GcStats> {
        let mut metadata = self.metadata.write().await;
        let mut stats = GcStats::default();

        let unreferenced: Vec<String> = metadata
            .blobs
            .keys()
            .filter(|key| !referenced.contains(*key))
            .cloned()
            .collect();

        let mut failed = None;
        for key in unreferenced {
            let digest = match Digest::from_str(&key) {
                Ok(digest) => digest,
                Err(err) => {
                    tracing::warn!(%key, "dropping metadata entry with invalid digest: {err}");
                    metadata.blobs.remove(&key);
                    stats.blobs_removed += 1;
                    continue;
                }
            };

            // An entry only goes once its file is gone.
            match self.remove_blob_file(&digest).await {
                Ok(freed) => {
                    metadata.blobs.remove(&key);
                    stats.blobs_removed += 1;
                    stats.bytes_freed += freed;
                }
                Err(err) => {
                    tracing::warn!(%key, "keeping blob that could not be removed: {err}");
                    failed.get_or_insert(err);
                }
            }
        }

        if stats.blobs_removed > 0 {
            metadata.persist(&self.metadata_path).await?;
        }
        if let Some(err) = failed {
            return Err(err);
        }

        tracing::info!(
            removed = stats.blobs_removed,
            freed = stats.bytes_freed,
            "blob cache garbage collection done"
        );
        Ok(stats)
    }

    /// Delete the file for `digest`, returning its size. A file that is
    /// already gone frees nothing.
    async fn remove_blob_file(&self, digest: &Digest) -> BlobCacheResult<u64> {
        let path = self.blob_path(digest);
        let size = match tokio::fs::metadata(&path).await {
            Ok(stat) => stat.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(BlobCacheError::io(format!("stat {path}"))(err)),
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(size),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(BlobCacheError::io(format!("remove {path}"))(err)),
        }
    }
}

/// A new temp file in `dir`.
///
/// The file is created on the blocking pool, so if the caller goes away
/// first the pool drops it and the file is deleted there.
async fn create_temp(dir: &Utf8Path) -> io::Result<NamedTempFile> {
    let dir = dir.to_owned();
    tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)
    })
    .await
    .map_err(io::Error::other)?
}

/// Rename `temp` to `path`. On failure `temp` is deleted.
async fn commit_temp(temp: TempPath, path: &Utf8Path) -> io::Result<()> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || temp.persist(path).map_err(|err| err.error))
        .await
        .map_err(io::Error::other)?
}

/// Copy `reader` into `file`, hashing as it goes.
async fn write_verified<R>(
    reader: &mut R,
    mut file: tokio::fs::File,
    algorithm: Algorithm,
) -> io::Result<(Digest, u64)>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    let mut hasher = algorithm.digester();
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        size += n as u64;
    }
    file.sync_all().await?;

    Ok((hasher.finish(), size))
}

/// Read and discard whatever is left of `reader`.
async fn drain<R>(reader: &mut R)
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    if let Err(err) = io::copy(reader, &mut io::sink()).await {
        tracing::debug!("error draining blob stream: {err}");
    }
}
