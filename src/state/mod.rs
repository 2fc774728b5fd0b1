//! Durable controller state: the environment record, the deployment audit
//! ledger and the advisory locks that serialize writers.

pub mod ledger;
pub mod lock;
pub mod store;

pub use ledger::AttemptLedger;
pub use lock::AdvisoryLock;
pub use store::{EnvironmentStateStore, StateRecord};

use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::Result;

/// Writes `bytes` to a sibling temp file, fsyncs it, renames it over `path`
/// and fsyncs the parent directory. Readers only ever see a complete file,
/// and a crash never leaves an empty one behind.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(parent).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let written = async {
        let mut file = fs::OpenOptions::new().write(true).create_new(true).open(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        fs::rename(&tmp, path).await
    }
    .await;
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    fsync_dir(parent).await
}

#[cfg(unix)]
async fn fsync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn fsync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_atomic_replaces_content_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("environments.json");

        write_atomic(&path, b"{\"version\":1}").await.unwrap();
        write_atomic(&path, b"{\"version\":2}").await.unwrap();

        assert_eq!(fs::read(&path).await.unwrap(), b"{\"version\":2}".to_vec());
        let mut entries = fs::read_dir(path.parent().unwrap()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["environments.json".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_rename_cleans_up_temp_file() {
        let dir = TempDir::new().unwrap();
        // A directory at the target path makes the rename fail
        let path = dir.path().join("occupied");
        fs::create_dir_all(path.join("child")).await.unwrap();

        assert!(write_atomic(&path, b"data").await.is_err());

        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert!(!entry.file_name().to_string_lossy().ends_with(".tmp"));
        }
    }
}
