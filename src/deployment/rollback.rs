//! Reversal of a deployment attempt, operator cancellation and the
//! `rollback` entry point.

use tracing::{error, info, warn};

use crate::deployment::blue_green::{
    ensure_owner, DeploymentAttempt, DeploymentController, DeploymentState, SOURCE,
};
use crate::deployment::environment::EnvironmentRole;
use crate::deployment::health_checks::HealthOutcome;
use crate::error::{AppError, Result};
use crate::services::notification::Alert;

/// What `rollback` did.
#[derive(Debug, Clone)]
pub enum RollbackAction {
    /// An attempt in this or another process was asked to stop.
    CancelRequested(DeploymentAttempt),
    /// An in-flight or failed attempt was reversed here.
    Reversed(DeploymentAttempt),
    /// The previous build was deployed again as a new attempt.
    Redeployed(DeploymentAttempt),
}

impl RollbackAction {
    pub fn attempt(&self) -> &DeploymentAttempt {
        match self {
            RollbackAction::CancelRequested(a) | RollbackAction::Reversed(a) | RollbackAction::Redeployed(a) => a,
        }
    }
}

impl DeploymentController {
    /// Operator rollback.
    ///
    /// * attempt in flight: request cancellation, or with `force` take the
    ///   attempt over and reverse it here (its owner is assumed dead);
    /// * attempt stuck in `FAILED`: resume its rollback, `force` required;
    /// * idle: redeploy the build that was live before the last promotion.
    pub async fn rollback(&self, force: bool) -> Result<RollbackAction> {
        let record = self.store.load().await?;

        let Some(id) = record.in_flight else {
            let previous = record.previous_build.clone().ok_or_else(|| {
                AppError::PreconditionError("no previous build recorded to roll back to".to_string())
            })?;
            info!(build_ref = %previous, "Rolling back by redeploying previous build");
            let attempt = self.deploy(&previous).await?;
            return Ok(RollbackAction::Redeployed(attempt));
        };

        let mut attempt = self.ledger.get(id).await?;
        match attempt.state {
            DeploymentState::Failed if !force => Err(AppError::PreconditionError(format!(
                "attempt {} failed mid-rollback; rerun with --force to resume it",
                id
            ))),
            DeploymentState::Failed => {
                let reason = attempt
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "forced resume".to_string());
                self.roll_back(&mut attempt, reason).await;
                Ok(RollbackAction::Reversed(attempt))
            }
            _ if force => {
                warn!(attempt_id = %id, state = %attempt.state, "Taking over in-flight attempt");
                self.roll_back(&mut attempt, "forced rollback by operator".to_string()).await;
                Ok(RollbackAction::Reversed(attempt))
            }
            _ => {
                self.request_cancel().await?;
                Ok(RollbackAction::CancelRequested(attempt))
            }
        }
    }

    /// Flags the in-flight attempt for cancellation. Before promotion it
    /// stops at the next checkpoint; after promotion it is reversed.
    pub async fn request_cancel(&self) -> Result<()> {
        let record = self
            .store
            .update(|record| {
                if record.in_flight.is_none() {
                    return Err(AppError::PreconditionError("no deployment in progress".to_string()));
                }
                record.cancel_requested = true;
                Ok(())
            })
            .await?;
        info!(attempt_id = ?record.in_flight, "Cancellation requested");
        Ok(())
    }

    /// Reverses whatever the attempt changed. Ends in `ROLLED_BACK`, or in
    /// `FAILED` with the in-flight marker left in place when a step cannot
    /// be undone.
    pub(crate) async fn roll_back(&self, attempt: &mut DeploymentAttempt, reason: String) {
        warn!(attempt_id = %attempt.id, state = %attempt.state, reason = %reason, "Rolling back deployment");
        attempt.failure_reason = Some(reason.clone());
        self.advance(attempt, DeploymentState::RollingBack, Some(reason.clone())).await;

        match self.reverse(attempt).await {
            Ok(()) => {
                self.advance(attempt, DeploymentState::RolledBack, None).await;
                info!(attempt_id = %attempt.id, "Deployment rolled back");
                self.alerts
                    .raise(
                        Alert::warning(
                            SOURCE,
                            "Deployment rolled back",
                            format!("{} on {} was rolled back: {}", attempt.build_ref, attempt.target, reason),
                        )
                        .with_dedup_key(format!("deploy:{}:rolled_back", attempt.id)),
                    )
                    .await;
            }
            Err(e) => {
                error!(attempt_id = %attempt.id, error = %e, "Rollback failed, manual intervention required");
                attempt.failure_reason = Some(format!("{}; rollback failed: {}", reason, e));
                self.advance(attempt, DeploymentState::Failed, Some(e.to_string())).await;

                let target = attempt.target;
                if let Err(mark) = self
                    .store
                    .update(|record| {
                        record.env_mut(target).set_role(EnvironmentRole::Failed);
                        Ok(())
                    })
                    .await
                {
                    warn!(attempt_id = %attempt.id, error = %mark, "Could not mark target failed");
                }

                self.alerts
                    .raise(
                        Alert::critical(
                            SOURCE,
                            "Deployment rollback failed",
                            format!(
                                "attempt {} ({} on {}) needs manual recovery: {}",
                                attempt.id,
                                attempt.build_ref,
                                attempt.target,
                                attempt.failure_reason.as_deref().unwrap_or_default()
                            ),
                        )
                        .with_dedup_key(format!("deploy:{}:failed", attempt.id)),
                    )
                    .await;
            }
        }
    }

    async fn reverse(&self, attempt: &DeploymentAttempt) -> Result<()> {
        let target = attempt.target;

        if attempt.promoted {
            match attempt.source {
                Some(source) => {
                    self.router.route_to(source).await.map_err(|e| {
                        AppError::RollbackFailed(format!("could not route traffic back to {}: {}", source, e))
                    })?;
                    info!(attempt_id = %attempt.id, color = %source, "Traffic restored to previous environment");
                }
                None => warn!(attempt_id = %attempt.id, "First deployment was promoted; nothing to route back to"),
            }
        }

        if let Err(e) = self.runtime.stop(target).await {
            warn!(attempt_id = %attempt.id, color = %target, error = %e, "Stopping new environment failed");
        }

        if attempt.migrations_applied {
            match (attempt.pre_deploy_backup, attempt.source) {
                (Some(backup_id), Some(source)) => {
                    let report = self.restores.restore_by_id(backup_id, source).await.map_err(|e| {
                        AppError::RollbackFailed(format!("restoring pre-deploy backup {} failed: {}", backup_id, e))
                    })?;
                    info!(
                        attempt_id = %attempt.id,
                        artifact_id = %backup_id,
                        restored = ?report.restored,
                        "Pre-deploy state restored"
                    );
                }
                _ => warn!(
                    attempt_id = %attempt.id,
                    "Migrations ran but there is no pre-deploy backup to restore"
                ),
            }
        }

        let id = attempt.id;
        let source = attempt.source;
        let promoted = attempt.promoted;
        let replaced = attempt.replaced_previous_build.clone();
        self.store
            .update(|record| {
                ensure_owner(record, id)?;
                if let Some(source) = source {
                    record.env_mut(source).set_role(EnvironmentRole::Live);
                    if promoted {
                        record.previous_build = replaced.clone();
                    }
                }
                let env = record.env_mut(target);
                env.set_role(EnvironmentRole::Failed);
                if env.health == HealthOutcome::Healthy {
                    env.health = HealthOutcome::Unknown;
                }
                record.in_flight = None;
                record.cancel_requested = false;
                Ok(())
            })
            .await
            .map_err(|e| AppError::RollbackFailed(format!("recording rollback failed: {}", e)))?;

        Ok(())
    }
}
