use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// A lockfile whose owner line cannot be parsed is only broken after this
/// long, since its creator may still be writing it.
pub const UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(30);

/// A `.break` marker older than this was left by a crashed breaker.
const BREAKER_GRACE: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Owner line: `pid=<pid> token=<uuid> at=<rfc3339>`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Owner {
    pid: u32,
    token: String,
}

impl Owner {
    fn parse(raw: &str) -> Option<Self> {
        let mut pid = None;
        let mut token = None;
        for field in raw.split_whitespace() {
            if let Some(v) = field.strip_prefix("pid=") {
                pid = v.parse().ok();
            } else if let Some(v) = field.strip_prefix("token=") {
                token = Some(v.to_string());
            }
        }
        Some(Self { pid: pid?, token: token? })
    }
}

/// Cross-process advisory lock backed by a `create_new` lockfile.
///
/// The file names its owner's pid and a per-guard token. It is only broken
/// once that pid is gone, and a guard only removes the file while the token
/// in it is still its own.
#[derive(Debug)]
pub struct AdvisoryLock {
    path: PathBuf,
    token: String,
}

impl AdvisoryLock {
    /// Waits up to `wait` for the lock. Gives up with `PreconditionError`
    /// naming the holder.
    pub async fn acquire(dir: &Path, name: &str, wait: Duration) -> Result<Self> {
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(dir, name).await? {
                return Ok(lock);
            }
            if started.elapsed() >= wait {
                let holder = tokio::fs::read_to_string(dir.join(format!("{}.lock", sanitize(name))))
                    .await
                    .map(|raw| raw.trim().to_string())
                    .unwrap_or_default();
                return Err(AppError::PreconditionError(format!(
                    "lock '{}' is held by another operation ({})",
                    name, holder
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Takes the lock if nobody holds it. Breaks a lock whose owning
    /// process no longer exists.
    pub async fn try_acquire(dir: &Path, name: &str) -> Result<Option<Self>> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.lock", sanitize(name)));

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(mut file) => {
                    let token = Uuid::new_v4().to_string();
                    let owner = format!(
                        "pid={} token={} at={}\n",
                        std::process::id(),
                        token,
                        chrono::Utc::now().to_rfc3339()
                    );
                    file.write_all(owner.as_bytes()).await?;
                    file.sync_all().await?;
                    debug!(lock = %name, "Acquired advisory lock");
                    return Ok(Some(Self { path, token }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !break_if_abandoned(&path, name).await? {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return;
        };
        if Owner::parse(&raw).map(|o| o.token == self.token).unwrap_or(false) {
            let _ = std::fs::remove_file(&self.path);
        } else {
            warn!(path = ?self.path, "Lockfile now names another owner, leaving it in place");
        }
    }
}

/// Removes the lockfile when its holder is gone. Breakers serialize on a
/// `.break` marker and re-read the file under it, so a lock taken after the
/// staleness check is never deleted.
async fn break_if_abandoned(path: &Path, name: &str) -> Result<bool> {
    let Some(stale) = abandoned_contents(path).await else {
        return Ok(false);
    };

    let marker = path.with_extension("lock.break");
    match OpenOptions::new().write(true).create_new(true).open(&marker).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            if age(&marker).await.map(|a| a > BREAKER_GRACE).unwrap_or(false) {
                let _ = tokio::fs::remove_file(&marker).await;
            }
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }

    let current = tokio::fs::read_to_string(path).await.ok();
    let broken = if current.as_deref() == Some(stale.as_str()) {
        warn!(lock = %name, holder = %stale.trim(), "Breaking advisory lock of a dead process");
        match tokio::fs::remove_file(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => {
                let _ = tokio::fs::remove_file(&marker).await;
                return Err(e.into());
            }
        }
    } else {
        false
    };

    let _ = tokio::fs::remove_file(&marker).await;
    Ok(broken)
}

/// The lockfile contents when its owner is provably gone.
async fn abandoned_contents(path: &Path) -> Option<String> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    match Owner::parse(&raw) {
        Some(owner) if owner.pid == std::process::id() => None,
        Some(owner) if process_alive(owner.pid).await => None,
        Some(_) => Some(raw),
        None => {
            let old = age(path).await.map(|a| a > UNREADABLE_LOCK_GRACE).unwrap_or(false);
            old.then_some(raw)
        }
    }
}

async fn age(path: &Path) -> Option<Duration> {
    let modified = tokio::fs::metadata(path).await.and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(target_os = "linux")]
async fn process_alive(pid: u32) -> bool {
    tokio::fs::metadata(format!("/proc/{}", pid)).await.is_ok()
}

#[cfg(all(unix, not(target_os = "linux")))]
async fn process_alive(pid: u32) -> bool {
    tokio::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(true)
}

/// Without a liveness check a lock is never broken automatically.
#[cfg(not(unix))]
async fn process_alive(_pid: u32) -> bool {
    true
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lock_is_exclusive_until_dropped() {
        let dir = TempDir::new().unwrap();

        let held = AdvisoryLock::try_acquire(dir.path(), "env-A").await.unwrap();
        assert!(held.is_some());
        assert!(AdvisoryLock::try_acquire(dir.path(), "env-A").await.unwrap().is_none());
        assert!(AdvisoryLock::try_acquire(dir.path(), "env-B").await.unwrap().is_some());

        drop(held);
        assert!(AdvisoryLock::try_acquire(dir.path(), "env-A").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_acquire_gives_up_after_wait() {
        let dir = TempDir::new().unwrap();
        let _held = AdvisoryLock::try_acquire(dir.path(), "state").await.unwrap().unwrap();

        let result = AdvisoryLock::acquire(dir.path(), "state", Duration::from_millis(60)).await;
        assert!(matches!(result, Err(AppError::PreconditionError(_))));
    }

    /// Above the largest Linux `pid_max`, so never a running process.
    const DEAD_PID: u32 = 4_194_305;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lock_of_dead_process_is_broken() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env-A.lock");
        tokio::fs::write(&path, format!("pid={} token=gone at=2020-01-01T00:00:00Z\n", DEAD_PID))
            .await
            .unwrap();

        let lock = AdvisoryLock::try_acquire(dir.path(), "env-A").await.unwrap();
        assert!(lock.is_some());
        assert!(!dir.path().join("env-A.lock.break").exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_lock_of_live_process_is_never_broken() {
        let dir = TempDir::new().unwrap();
        // pid 1 always exists, however old the file is
        tokio::fs::write(dir.path().join("env-A.lock"), "pid=1 token=other at=2000-01-01T00:00:00Z\n")
            .await
            .unwrap();

        assert!(AdvisoryLock::try_acquire(dir.path(), "env-A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drop_leaves_lockfile_owned_by_someone_else() {
        let dir = TempDir::new().unwrap();
        let held = AdvisoryLock::try_acquire(dir.path(), "env-A").await.unwrap().unwrap();
        let path = held.path().to_path_buf();

        tokio::fs::write(&path, "pid=1 token=successor at=2030-01-01T00:00:00Z\n").await.unwrap();
        drop(held);

        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_fresh_unreadable_lockfile_is_respected() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("state.lock"), "").await.unwrap();

        assert!(AdvisoryLock::try_acquire(dir.path(), "state").await.unwrap().is_none());
    }

    #[test]
    fn test_owner_line_parses() {
        let owner = Owner::parse("pid=42 token=abc at=2024-01-01T00:00:00Z\n").unwrap();
        assert_eq!(owner, Owner { pid: 42, token: "abc".to_string() });
        assert!(Owner::parse("garbage").is_none());
    }

    #[test]
    fn test_names_are_sanitized() {
        assert_eq!(sanitize("env/../A"), "env____A");
    }
}
