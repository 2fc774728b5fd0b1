use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backup::archive;
use crate::backup::components::StateComponent;
use crate::backup::manager::{env_lock_name, BackupManager};
use crate::backup::{BackupArtifact, ComponentKind};
use crate::deployment::environment::Color;
use crate::error::{AppError, Result, RetryPolicy};
use crate::services::notification::{Alert, AlertChannel};
use crate::state::AdvisoryLock;

const SOURCE: &str = "restore";

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub artifact_id: Uuid,
    pub target: Color,
    /// In the order they were applied.
    pub restored: Vec<ComponentKind>,
    pub skipped: Vec<ComponentKind>,
    pub duration_ms: u64,
}

/// A verified component ready to replay.
struct PlannedStep {
    kind: ComponentKind,
    component: Arc<dyn StateComponent>,
    bytes: Vec<u8>,
}

/// Replays backup archives into an environment.
///
/// Everything is verified before the first component is touched, so an
/// integrity failure leaves the target as it was.
pub struct RestoreManager {
    backups: Arc<BackupManager>,
    alerts: Arc<AlertChannel>,
    retry: RetryPolicy,
    lock_wait: Duration,
}

impl RestoreManager {
    pub fn new(backups: Arc<BackupManager>, alerts: Arc<AlertChannel>) -> Self {
        Self {
            backups,
            alerts,
            retry: RetryPolicy::exponential(3, Duration::from_millis(500), Duration::from_secs(10)),
            lock_wait: Duration::from_secs(5),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub async fn restore_by_id(&self, id: Uuid, target: Color) -> Result<RestoreReport> {
        let artifact = self.backups.get(id).await?;
        self.restore(&artifact, target).await
    }

    pub async fn restore(&self, artifact: &BackupArtifact, target: Color) -> Result<RestoreReport> {
        let started = Instant::now();
        let _lock =
            AdvisoryLock::acquire(self.backups.lock_dir(), &env_lock_name(target), self.lock_wait).await?;

        info!(artifact_id = %artifact.id, target = %target, "Starting restore");

        let (plan, skipped) = match self.verify(artifact).await {
            Ok(verified) => verified,
            Err(e) => {
                error!(artifact_id = %artifact.id, target = %target, error = %e, "Restore aborted before touching target");
                self.alerts
                    .raise(
                        Alert::critical(
                            SOURCE,
                            "Restore integrity check failed",
                            format!("artifact {} cannot be restored to {}: {}", artifact.id, target, e),
                        )
                        .with_dedup_key(format!("restore:{}:{}:integrity", artifact.id, target)),
                    )
                    .await;
                return Err(e);
            }
        };

        let mut restored = Vec::with_capacity(plan.len());
        for step in plan {
            let component = step.component.clone();
            let bytes = &step.bytes;
            let label = format!("restore {}", step.kind);

            let result = self
                .retry
                .execute(&label, || {
                    let component = component.clone();
                    async move { component.restore(target, bytes).await }
                })
                .await;

            if let Err(e) = result {
                error!(
                    artifact_id = %artifact.id,
                    target = %target,
                    component = %step.kind,
                    restored = ?restored,
                    error = %e,
                    "Component restore failed"
                );
                self.alerts
                    .raise(
                        Alert::critical(
                            SOURCE,
                            "Restore failed",
                            format!(
                                "restoring {} from {} into {} failed after {:?}: {}",
                                step.kind, artifact.id, target, restored, e
                            ),
                        )
                        .with_dedup_key(format!("restore:{}:{}:failed", artifact.id, target)),
                    )
                    .await;
                return Err(AppError::RestoreFailure(format!("{} restore failed: {}", step.kind, e)));
            }

            info!(artifact_id = %artifact.id, target = %target, component = %step.kind, "Component restored");
            restored.push(step.kind);
        }

        let report = RestoreReport {
            artifact_id: artifact.id,
            target,
            restored,
            skipped,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            artifact_id = %artifact.id,
            target = %target,
            duration_ms = report.duration_ms,
            "Restore complete"
        );
        self.alerts
            .raise(
                Alert::info(SOURCE, "Restore complete", format!("artifact {} restored into {}", artifact.id, target)),
            )
            .await;

        Ok(report)
    }

    /// Opens the archive and checks every component against the manifest.
    /// Returns the steps in restore order plus the optional components that
    /// will be skipped.
    async fn verify(&self, artifact: &BackupArtifact) -> Result<(Vec<PlannedStep>, Vec<ComponentKind>)> {
        if !artifact.is_restorable() {
            return Err(AppError::RestoreIntegrityError(format!(
                "artifact {} has an incomplete manifest",
                artifact.id
            )));
        }
        if artifact.key_ref != self.backups.cipher().key_ref() {
            return Err(AppError::RestoreIntegrityError(format!(
                "artifact {} was sealed with key {}, current key is {}",
                artifact.id,
                artifact.key_ref,
                self.backups.cipher().key_ref()
            )));
        }

        let sealed = self.backups.load_archive(artifact).await?;
        let cipher = self.backups.cipher().clone();
        let mut contents = tokio::task::spawn_blocking(move || archive::open(&sealed, &cipher)).await??;

        if contents.manifest != artifact.manifest {
            return Err(AppError::RestoreIntegrityError(format!(
                "archive manifest for {} does not match the catalog",
                artifact.id
            )));
        }

        let mut plan = Vec::new();
        let mut skipped = Vec::new();
        for kind in ComponentKind::RESTORE_ORDER {
            let problem = match (contents.manifest.entry(kind), contents.blobs.get(&kind)) {
                (None, _) => Some("missing from manifest".to_string()),
                (Some(_), None) => Some("listed in manifest but absent from archive".to_string()),
                (Some(entry), Some(bytes)) if !entry.matches(bytes) => Some(format!(
                    "checksum mismatch (expected {}, {} bytes)",
                    entry.checksum, entry.size_bytes
                )),
                _ => None,
            };

            if let Some(problem) = problem {
                if kind.is_optional() {
                    warn!(artifact_id = %artifact.id, component = %kind, problem = %problem, "Skipping optional component");
                    skipped.push(kind);
                    continue;
                }
                return Err(AppError::RestoreIntegrityError(format!("{} {}", kind, problem)));
            }

            let Some(component) = self.backups.component(kind) else {
                if kind.is_optional() {
                    warn!(artifact_id = %artifact.id, component = %kind, "No component configured, skipping");
                    skipped.push(kind);
                    continue;
                }
                return Err(AppError::ConfigurationError(format!("no {} component configured", kind)));
            };

            let bytes = contents.blobs.remove(&kind).unwrap_or_default();
            plan.push(PlannedStep { kind, component, bytes });
        }

        Ok((plan, skipped))
    }
}
