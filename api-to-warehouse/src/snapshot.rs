//! Immutable raw snapshots, one JSON blob per entity per run.
//!
//! Paths follow `raw_<entity>/{baseline|incremental}_<YYYYmmdd_HHMMSS>.json`.
//! Blobs are never overwritten or deleted by the pipeline; they stay behind as
//! an audit trail of what each run fetched.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::AsyncWriteExt;

use crate::entity::Entity;

/// Object storage capability: write once, read back by path.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `path`. Fails if the path already holds a blob.
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Vec<u8>>;
}

/// Blob store rooted at a local directory.
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(Path::new(path))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                bail!("Snapshot {} already exists and is immutable", full.display())
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create {}", full.display()))
            }
        };

        file.write_all(&bytes)
            .await
            .with_context(|| format!("Failed to write {}", full.display()))?;
        file.flush()
            .await
            .with_context(|| format!("Failed to flush {}", full.display()))?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        tokio::fs::read(&full)
            .await
            .with_context(|| format!("Failed to read snapshot {}", full.display()))
    }
}

/// Blob store kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn paths(&self) -> Vec<String> {
        self.blobs
            .lock()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| anyhow!("memory blob store lock poisoned"))?;
        if blobs.contains_key(path) {
            bail!("Snapshot {} already exists and is immutable", path);
        }
        blobs.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| anyhow!("memory blob store lock poisoned"))?;
        blobs
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("Snapshot {} not found", path))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// First run for the entity.
    Baseline,
    Incremental,
}

impl SnapshotKind {
    pub fn for_first_run(first_run: bool) -> Self {
        if first_run {
            SnapshotKind::Baseline
        } else {
            SnapshotKind::Incremental
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Baseline => "baseline",
            SnapshotKind::Incremental => "incremental",
        }
    }
}

pub fn snapshot_path(entity: Entity, kind: SnapshotKind, run_label: &str) -> String {
    format!("raw_{}/{}_{}.json", entity, kind.as_str(), run_label)
}

#[derive(Clone)]
pub struct SnapshotStore {
    blobs: Arc<dyn BlobStore>,
}

impl SnapshotStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Persist a raw payload and return its path.
    pub async fn write(
        &self,
        entity: Entity,
        kind: SnapshotKind,
        run_label: &str,
        payload: &JsonValue,
    ) -> Result<String> {
        let path = snapshot_path(entity, kind, run_label);
        let bytes = serde_json::to_vec(payload)
            .with_context(|| format!("Failed to serialise {} payload", entity))?;
        self.blobs.put(&path, bytes).await?;
        tracing::info!(entity = %entity, path = %path, "Saved snapshot");
        Ok(path)
    }

    pub async fn read(&self, path: &str) -> Result<JsonValue> {
        let bytes = self.blobs.get(path).await?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse snapshot {} as JSON", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn paths_follow_baseline_and_incremental_naming() {
        assert_eq!(
            snapshot_path(Entity::Users, SnapshotKind::for_first_run(true), "20250101_120000"),
            "raw_users/baseline_20250101_120000.json"
        );
        assert_eq!(
            snapshot_path(Entity::Carts, SnapshotKind::for_first_run(false), "20250101_120000"),
            "raw_carts/incremental_20250101_120000.json"
        );
    }

    #[tokio::test]
    async fn file_store_round_trips_and_refuses_overwrite() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SnapshotStore::new(Arc::new(FileBlobStore::new(dir.path())));
        let payload = json!({ "users": [{ "id": 1 }] });

        let path = store
            .write(Entity::Users, SnapshotKind::Baseline, "20250101_000000", &payload)
            .await?;
        assert!(dir.path().join(&path).exists());
        assert_eq!(store.read(&path).await?, payload);

        let again = store
            .write(Entity::Users, SnapshotKind::Baseline, "20250101_000000", &json!({}))
            .await;
        assert!(again.is_err());
        assert_eq!(store.read(&path).await?, payload);
        Ok(())
    }

    #[tokio::test]
    async fn memory_store_reports_missing_paths() -> Result<()> {
        let blobs = MemoryBlobStore::new();
        let store = SnapshotStore::new(Arc::new(blobs.clone()));
        assert!(store.read("raw_users/nope.json").await.is_err());

        store
            .write(Entity::Products, SnapshotKind::Incremental, "x", &json!({ "products": [] }))
            .await?;
        assert_eq!(blobs.paths(), vec!["raw_products/incremental_x.json".to_string()]);
        Ok(())
    }
}
