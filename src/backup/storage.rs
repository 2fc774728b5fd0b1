use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::backup::{BackupArtifact, ReplicationRecord, ReplicationStatus};
use crate::error::{AppError, Result};
use crate::state::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocation {
    pub region: String,
    pub uri: String,
}

/// Write-once blob storage for sealed archives.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `key`. Rewriting an existing key with different
    /// bytes is refused.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<StorageLocation>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
    fn region(&self) -> &str;
}

/// Directory-backed store; a mounted volume or synced bucket path.
pub struct LocalObjectStore {
    root: PathBuf,
    region: String,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf, region: impl Into<String>) -> Self {
        Self {
            root,
            region: region.into(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.starts_with('.') {
            return Err(AppError::StorageError(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<StorageLocation> {
        let path = self.path_for(key)?;
        let location = StorageLocation {
            region: self.region.clone(),
            uri: format!("file://{}", path.display()),
        };

        match fs::read(&path).await {
            Ok(existing) if existing == bytes => return Ok(location),
            Ok(_) => {
                return Err(AppError::ConflictingStateError(format!(
                    "object {} already exists with different content",
                    key
                )))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(AppError::StorageError(format!("cannot inspect {}: {}", key, e))),
        }

        write_atomic(&path, &bytes)
            .await
            .map_err(|e| AppError::StorageError(format!("failed to write {}: {}", key, e)))?;
        Ok(location)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => AppError::NotFound(format!("object {} in region {}", key, self.region)),
            _ => AppError::StorageError(format!("failed to read {}: {}", key, e)),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::StorageError(format!("failed to delete {}: {}", key, e))),
        }
    }

    fn region(&self) -> &str {
        &self.region
    }
}

/// In-memory store with failure and latency switches.
pub struct MockObjectStore {
    region: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_puts: AtomicBool,
    fail_gets: AtomicBool,
    put_delay: Mutex<Option<Duration>>,
}

impl MockObjectStore {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            objects: Mutex::new(HashMap::new()),
            fail_puts: AtomicBool::new(false),
            fail_gets: AtomicBool::new(false),
            put_delay: Mutex::new(None),
        }
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    pub fn set_put_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.put_delay.lock() {
            *d = Some(delay);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().map(|o| o.contains_key(key)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces an object behind the store's back.
    pub fn overwrite(&self, key: &str, bytes: Vec<u8>) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key.to_string(), bytes);
        }
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<StorageLocation> {
        let delay = self.put_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(AppError::StorageError(format!("mock {} store rejected put", self.region)));
        }
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| AppError::StorageError("mock store poisoned".to_string()))?;
        if let Some(existing) = objects.get(key) {
            if *existing != bytes {
                return Err(AppError::ConflictingStateError(format!("object {} already exists", key)));
            }
        }
        objects.insert(key.to_string(), bytes);
        Ok(StorageLocation {
            region: self.region.clone(),
            uri: format!("mock://{}/{}", self.region, key),
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(AppError::StorageError(format!("mock {} store rejected get", self.region)));
        }
        self.objects
            .lock()
            .ok()
            .and_then(|o| o.get(key).cloned())
            .ok_or_else(|| AppError::NotFound(format!("object {} in region {}", key, self.region)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if let Ok(mut objects) = self.objects.lock() {
            objects.remove(key);
        }
        Ok(())
    }

    fn region(&self) -> &str {
        &self.region
    }
}

/// An artifact together with its current replication sidecar.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub artifact: BackupArtifact,
    pub replication: ReplicationRecord,
}

/// On-disk index of artifacts: `<id>.json` written once, plus a mutable
/// `<id>.replication.json` sidecar.
#[derive(Debug, Clone)]
pub struct BackupCatalog {
    dir: PathBuf,
}

impl BackupCatalog {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn sidecar_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.replication.json", id))
    }

    pub async fn save(&self, artifact: &BackupArtifact) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(artifact)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.record_path(artifact.id))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => AppError::ConflictingStateError(format!(
                    "catalog record for {} already exists",
                    artifact.id
                )),
                _ => e.into(),
            })?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        Ok(())
    }

    pub async fn load(&self, id: Uuid) -> Result<BackupArtifact> {
        match fs::read(self.record_path(id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("backup artifact {}", id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_replication(&self, id: Uuid, record: &ReplicationRecord) -> Result<()> {
        write_atomic(&self.sidecar_path(id), &serde_json::to_vec_pretty(record)?).await
    }

    pub async fn replication(&self, id: Uuid) -> Result<ReplicationRecord> {
        match fs::read(self.sidecar_path(id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ReplicationRecord::new(ReplicationStatus::PrimaryOnly)),
            Err(e) => Err(e.into()),
        }
    }

    /// Every catalogued artifact, newest first.
    pub async fn list(&self) -> Result<Vec<CatalogEntry>> {
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let Ok(id) = Uuid::parse_str(stem) else {
                continue;
            };
            let artifact = self.load(id).await?;
            let replication = self.replication(id).await?;
            entries.push(CatalogEntry { artifact, replication });
        }

        entries.sort_by(|a, b| b.artifact.created_at.cmp(&a.artifact.created_at));
        Ok(entries)
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        for path in [self.sidecar_path(id), self.record_path(id)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_store_is_write_once() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path().to_path_buf(), "primary");

        let loc = store.put("a.swyd", b"one".to_vec()).await.unwrap();
        assert_eq!(loc.region, "primary");
        assert!(store.put("a.swyd", b"one".to_vec()).await.is_ok());
        assert!(matches!(
            store.put("a.swyd", b"two".to_vec()).await,
            Err(AppError::ConflictingStateError(_))
        ));
        assert_eq!(store.get("a.swyd").await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_local_store_rejects_path_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path().to_path_buf(), "primary");
        assert!(store.put("../escape", b"x".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_local_store_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path().to_path_buf(), "primary");
        assert!(matches!(store.get("nope.swyd").await, Err(AppError::NotFound(_))));
        assert!(store.delete("nope.swyd").await.is_ok());
    }
}
