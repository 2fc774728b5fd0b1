use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::deployment::blue_green::DeploymentAttempt;
use crate::error::{AppError, Result};
use crate::state::write_atomic;

const LEDGER_FILE: &str = "deployments.json";
pub const MAX_RETAINED_ATTEMPTS: usize = 200;

/// Audit log of deployment attempts, oldest first.
pub struct AttemptLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AttemptLedger {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(LEDGER_FILE),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn list(&self) -> Result<Vec<DeploymentAttempt>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Inserts the attempt or replaces the entry with the same id.
    pub async fn record(&self, attempt: &DeploymentAttempt) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut attempts = self.list().await?;
        match attempts.iter_mut().find(|a| a.id == attempt.id) {
            Some(existing) => *existing = attempt.clone(),
            None => attempts.push(attempt.clone()),
        }
        if attempts.len() > MAX_RETAINED_ATTEMPTS {
            let excess = attempts.len() - MAX_RETAINED_ATTEMPTS;
            attempts.drain(0..excess);
        }

        write_atomic(&self.path, &serde_json::to_vec_pretty(&attempts)?).await
    }

    pub async fn get(&self, id: Uuid) -> Result<DeploymentAttempt> {
        self.list()
            .await?
            .into_iter()
            .find(|a| a.id == id)
            .ok_or_else(|| AppError::NotFound(format!("deployment attempt {}", id)))
    }

    pub async fn latest(&self) -> Result<Option<DeploymentAttempt>> {
        Ok(self.list().await?.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::environment::Color;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_record_upserts_by_id() {
        let dir = TempDir::new().unwrap();
        let ledger = AttemptLedger::new(dir.path());

        let mut attempt = DeploymentAttempt::new("v1", None, Color::A);
        ledger.record(&attempt).await.unwrap();
        attempt.failure_reason = Some("probe failed".to_string());
        ledger.record(&attempt).await.unwrap();

        let all = ledger.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].failure_reason.as_deref(), Some("probe failed"));
        assert_eq!(ledger.get(attempt.id).await.unwrap().id, attempt.id);
    }

    #[tokio::test]
    async fn test_ledger_is_bounded() {
        let dir = TempDir::new().unwrap();
        let ledger = AttemptLedger::new(dir.path());

        let mut last = None;
        for i in 0..(MAX_RETAINED_ATTEMPTS + 3) {
            let attempt = DeploymentAttempt::new(&format!("v{}", i), None, Color::A);
            ledger.record(&attempt).await.unwrap();
            last = Some(attempt.id);
        }

        let all = ledger.list().await.unwrap();
        assert_eq!(all.len(), MAX_RETAINED_ATTEMPTS);
        assert_eq!(ledger.latest().await.unwrap().unwrap().id, last.unwrap());
    }
}
