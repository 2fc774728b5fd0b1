use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backup::ComponentKind;
use crate::config::Secret;
use crate::deployment::environment::Color;
use crate::error::{AppError, Result};
use crate::services::process::ExternalCommand;

/// One piece of persistent state that can be dumped and replayed.
#[async_trait]
pub trait StateComponent: Send + Sync {
    fn kind(&self) -> ComponentKind;
    /// `Ok(None)` means the component has nothing to capture.
    async fn snapshot(&self, source: Color) -> Result<Option<Vec<u8>>>;
    async fn restore(&self, target: Color, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileTree {
    /// Relative path to base64 content.
    files: BTreeMap<String, String>,
}

/// A directory tree (uploads or configuration) captured as JSON.
pub struct DirectoryComponent {
    kind: ComponentKind,
    root: PathBuf,
}

impl DirectoryComponent {
    pub fn new(kind: ComponentKind, root: PathBuf) -> Self {
        Self { kind, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl StateComponent for DirectoryComponent {
    fn kind(&self) -> ComponentKind {
        self.kind
    }

    async fn snapshot(&self, source: Color) -> Result<Option<Vec<u8>>> {
        let root = self.root.clone();
        let tree = tokio::task::spawn_blocking(move || read_tree(&root)).await??;
        debug!(component = %self.kind, color = %source, files = tree.files.len(), "Directory captured");
        Ok(Some(serde_json::to_vec(&tree)?))
    }

    async fn restore(&self, target: Color, bytes: &[u8]) -> Result<()> {
        let tree: FileTree = serde_json::from_slice(bytes)?;
        let count = tree.files.len();
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || write_tree(&root, &tree)).await??;
        info!(component = %self.kind, color = %target, files = count, "Directory restored");
        Ok(())
    }
}

fn read_tree(root: &Path) -> Result<FileTree> {
    if !root.is_dir() {
        return Err(AppError::NotFound(format!("directory {} does not exist", root.display())));
    }

    let mut tree = FileTree::default();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .map_err(|e| AppError::IoError(e.to_string()))?
                    .to_string_lossy()
                    .replace('\\', "/");
                let content = std::fs::read(&path)?;
                tree.files.insert(relative, Base64::encode_string(&content));
            }
        }
    }
    Ok(tree)
}

/// Writes the tree into a staging directory, then swaps it into place.
fn write_tree(root: &Path, tree: &FileTree) -> Result<()> {
    let parent = root
        .parent()
        .ok_or_else(|| AppError::RestoreFailure(format!("{} has no parent directory", root.display())))?;
    std::fs::create_dir_all(parent)?;

    let suffix = uuid::Uuid::new_v4();
    let staging = parent.join(format!(".restore-{}", suffix));
    let previous = parent.join(format!(".previous-{}", suffix));

    let staged = (|| -> Result<()> {
        std::fs::create_dir_all(&staging)?;
        for (relative, encoded) in &tree.files {
            let rel = Path::new(relative);
            if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
                return Err(AppError::RestoreIntegrityError(format!("unsafe path '{}' in file tree", relative)));
            }
            let content = Base64::decode_vec(encoded)
                .map_err(|e| AppError::RestoreIntegrityError(format!("{} is not valid base64: {}", relative, e)))?;
            let dest = staging.join(rel);
            if let Some(dir) = dest.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(dest, content)?;
        }
        Ok(())
    })();

    if let Err(e) = staged {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    let had_previous = root.exists();
    if had_previous {
        std::fs::rename(root, &previous)?;
    }
    if let Err(e) = std::fs::rename(&staging, root) {
        if had_previous {
            let _ = std::fs::rename(&previous, root);
        }
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e.into());
    }
    if had_previous {
        let _ = std::fs::remove_dir_all(&previous);
    }
    Ok(())
}

/// `pg_dump` custom-format dump, replayed with `pg_restore --clean`.
pub struct PostgresComponent {
    database_url: Secret,
    pg_dump: String,
    pg_restore: String,
    timeout: Duration,
}

impl PostgresComponent {
    pub fn new(database_url: Secret, pg_dump: impl Into<String>, pg_restore: impl Into<String>, timeout: Duration) -> Self {
        Self {
            database_url,
            pg_dump: pg_dump.into(),
            pg_restore: pg_restore.into(),
            timeout,
        }
    }
}

#[async_trait]
impl StateComponent for PostgresComponent {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Database
    }

    async fn snapshot(&self, source: Color) -> Result<Option<Vec<u8>>> {
        let output = ExternalCommand::new(&self.pg_dump)
            .args(["--format=custom", "--no-owner", "--dbname"])
            .arg(self.database_url.expose())
            .timeout(self.timeout)
            .run()
            .await?;
        debug!(color = %source, bytes = output.stdout.len(), "Database dumped");
        Ok(Some(output.stdout))
    }

    async fn restore(&self, target: Color, bytes: &[u8]) -> Result<()> {
        ExternalCommand::new(&self.pg_restore)
            .args(["--clean", "--if-exists", "--no-owner", "--dbname"])
            .arg(self.database_url.expose())
            .stdin(bytes.to_vec())
            .timeout(self.timeout)
            .run()
            .await?;
        info!(color = %target, "Database restored");
        Ok(())
    }
}

/// Redis RDB snapshot via `SAVE` and the dump file on disk.
pub struct RedisComponent {
    redis_url: Secret,
    dump_path: PathBuf,
    redis_cli: String,
    timeout: Duration,
}

impl RedisComponent {
    pub fn new(redis_url: Secret, dump_path: PathBuf, timeout: Duration) -> Self {
        Self {
            redis_url,
            dump_path,
            redis_cli: "redis-cli".to_string(),
            timeout,
        }
    }

    fn cli(&self) -> ExternalCommand {
        ExternalCommand::new(&self.redis_cli)
            .arg("-u")
            .arg(self.redis_url.expose())
            .timeout(self.timeout)
    }
}

#[async_trait]
impl StateComponent for RedisComponent {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Cache
    }

    async fn snapshot(&self, source: Color) -> Result<Option<Vec<u8>>> {
        self.cli().arg("SAVE").run().await?;
        match tokio::fs::read(&self.dump_path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(color = %source, path = ?self.dump_path, "Cache dump file not found, skipping cache");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn restore(&self, target: Color, bytes: &[u8]) -> Result<()> {
        crate::state::write_atomic(&self.dump_path, bytes).await?;
        self.cli().args(["DEBUG", "RELOAD", "NOSAVE"]).run().await?;
        info!(color = %target, "Cache restored");
        Ok(())
    }
}

/// In-memory component for tests.
pub struct MockComponent {
    kind: ComponentKind,
    data: Mutex<Option<Vec<u8>>>,
    restored: Mutex<Vec<(Color, Vec<u8>)>>,
    fail_snapshot: AtomicBool,
    transient_restore_failures: AtomicU32,
}

impl MockComponent {
    pub fn new(kind: ComponentKind, data: Option<Vec<u8>>) -> Self {
        Self {
            kind,
            data: Mutex::new(data),
            restored: Mutex::new(Vec::new()),
            fail_snapshot: AtomicBool::new(false),
            transient_restore_failures: AtomicU32::new(0),
        }
    }

    pub fn set_data(&self, data: Option<Vec<u8>>) {
        if let Ok(mut d) = self.data.lock() {
            *d = data;
        }
    }

    pub fn set_fail_snapshot(&self, fail: bool) {
        self.fail_snapshot.store(fail, Ordering::SeqCst);
    }

    /// The next `count` restores fail with a retryable error.
    pub fn fail_restores(&self, count: u32) {
        self.transient_restore_failures.store(count, Ordering::SeqCst);
    }

    pub fn restored(&self) -> Vec<(Color, Vec<u8>)> {
        self.restored.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn restore_count(&self) -> usize {
        self.restored().len()
    }
}

#[async_trait]
impl StateComponent for MockComponent {
    fn kind(&self) -> ComponentKind {
        self.kind
    }

    async fn snapshot(&self, _source: Color) -> Result<Option<Vec<u8>>> {
        if self.fail_snapshot.load(Ordering::SeqCst) {
            return Err(AppError::ExternalServiceError(format!("mock {} snapshot failure", self.kind)));
        }
        Ok(self.data.lock().ok().and_then(|d| d.clone()))
    }

    async fn restore(&self, target: Color, bytes: &[u8]) -> Result<()> {
        let remaining = self.transient_restore_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_restore_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::NetworkError(format!("mock {} restore blip", self.kind)));
        }
        if let Ok(mut restored) = self.restored.lock() {
            restored.push((target, bytes.to_vec()));
        }
        Ok(())
    }
}
