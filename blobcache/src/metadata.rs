use std::collections::BTreeMap;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{BlobCacheError, BlobCacheResult};

/// Where a blob was pulled from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    /// Registry host, e.g. `docker.io`.
    pub registry: String,
    /// Repository path, e.g. `library/alpine`.
    pub repository: String,
}

/// What the cache knows about one blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobInfo {
    /// The blob's digest string.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
    /// Every distinct registry/repository the blob was stored from.
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Last time the blob was stored or served.
    pub last_accessed: DateTime<Utc>,
    /// When the blob was first stored.
    pub created_at: DateTime<Utc>,
}

impl BlobInfo {
    /// Add `source` unless it is already listed.
    pub(crate) fn add_source(&mut self, source: Source) {
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
    }
}

/// The persisted index of cached blobs, keyed by digest string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Blob entries.
    #[serde(default)]
    pub blobs: BTreeMap<String, BlobInfo>,
}

impl Metadata {
    /// Load from `path`. A missing file is an empty index; so is a corrupt
    /// one, since blobs are re-registered when stored again.
    pub(crate) async fn load(path: &Utf8Path) -> BlobCacheResult<Option<Self>> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(BlobCacheError::io(format!("read {path}"))(err)),
        };

        match serde_json::from_slice(&data) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(err) => {
                tracing::warn!(%path, "discarding unreadable blob cache metadata: {err}");
                Ok(None)
            }
        }
    }

    /// Write to `path` through a sibling temp file and an atomic rename.
    pub(crate) async fn persist(&self, path: &Utf8Path) -> BlobCacheResult<()> {
        let data = serde_json::to_vec_pretty(self)?;
        let temp = path.with_file_name(format!(
            ".metadata-{}.tmp",
            uuid::Uuid::new_v4().simple()
        ));

        let written = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp, path).await
        }
        .await;

        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(BlobCacheError::io(format!("persist {path}"))(err));
        }

        tracing::trace!(%path, blobs = self.blobs.len(), "persisted blob cache metadata");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case() {
        let now = Utc::now();
        let mut metadata = Metadata::default();
        metadata.blobs.insert(
            "sha256:abc".into(),
            BlobInfo {
                digest: "sha256:abc".into(),
                size: 3,
                sources: vec![Source {
                    registry: "docker.io".into(),
                    repository: "library/test".into(),
                }],
                last_accessed: now,
                created_at: now,
            },
        );

        let json = serde_json::to_value(&metadata).unwrap();
        let entry = &json["blobs"]["sha256:abc"];
        assert!(entry.get("lastAccessed").is_some());
        assert!(entry.get("createdAt").is_some());
        assert_eq!(entry["sources"][0]["registry"], "docker.io");
    }

    #[test]
    fn sources_are_deduplicated() {
        let now = Utc::now();
        let mut info = BlobInfo {
            digest: "sha256:abc".into(),
            size: 0,
            sources: Vec::new(),
            last_accessed: now,
            created_at: now,
        };
        let source = Source {
            registry: "quay.io".into(),
            repository: "a/b".into(),
        };
        info.add_source(source.clone());
        info.add_source(source);
        assert_eq!(info.sources.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("metadata.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(Metadata::load(&path).await.unwrap().is_none());
    }
}
