use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backup::{BackupManager, RestoreManager, RetentionClass};
use crate::deployment::environment::{Color, EnvironmentRole};
use crate::deployment::health_checks::{HealthMonitor, HealthOutcome};
use crate::deployment::runtime::EnvironmentRuntime;
use crate::deployment::traffic_router::TrafficRouter;
use crate::error::{AppError, Result};
use crate::services::notification::{Alert, AlertChannel};
use crate::state::{AttemptLedger, EnvironmentStateStore, StateRecord};

pub(super) const SOURCE: &str = "deployment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    Idle,
    Provisioning,
    HealthChecking,
    Promoting,
    DrainingOld,
    Complete,
    RollingBack,
    RolledBack,
    Failed,
}

impl DeploymentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentState::Complete | DeploymentState::RolledBack | DeploymentState::Failed
        )
    }

    /// Legal edges of the deployment state machine. `Failed -> RollingBack`
    /// is the forced resume of a rollback that did not finish, and
    /// `Idle -> RollingBack` a forced takeover of an attempt that claimed the
    /// environments but never started.
    pub fn can_transition_to(self, next: DeploymentState) -> bool {
        use DeploymentState::*;
        matches!(
            (self, next),
            (Idle, Provisioning)
                | (Idle, RollingBack)
                | (Provisioning, HealthChecking)
                | (Provisioning, RollingBack)
                | (HealthChecking, Promoting)
                | (HealthChecking, RollingBack)
                | (Promoting, DrainingOld)
                | (Promoting, Complete)
                | (Promoting, RollingBack)
                | (DrainingOld, Complete)
                | (DrainingOld, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, Failed)
                | (Failed, RollingBack)
        )
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentState::Idle => "IDLE",
            DeploymentState::Provisioning => "PROVISIONING",
            DeploymentState::HealthChecking => "HEALTH_CHECKING",
            DeploymentState::Promoting => "PROMOTING",
            DeploymentState::DrainingOld => "DRAINING_OLD",
            DeploymentState::Complete => "COMPLETE",
            DeploymentState::RollingBack => "ROLLING_BACK",
            DeploymentState::RolledBack => "ROLLED_BACK",
            DeploymentState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOutcome {
    Success,
    RolledBack,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: DeploymentState,
    pub to: DeploymentState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentAttempt {
    pub id: Uuid,
    pub build_ref: String,
    /// Color that was live when the attempt started; `None` on first deploy.
    pub source: Option<Color>,
    pub target: Color,
    pub state: DeploymentState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<DeploymentOutcome>,
    pub transitions: Vec<StateTransition>,
    pub pre_deploy_backup: Option<Uuid>,
    pub migrations: Vec<String>,
    /// Set when migrations ran or their effect is unknown.
    pub migrations_applied: bool,
    pub promoted: bool,
    /// `previous_build` as it stood before promotion, put back on rollback.
    #[serde(default)]
    pub replaced_previous_build: Option<String>,
    pub health_samples: u32,
    pub failure_reason: Option<String>,
}

impl DeploymentAttempt {
    pub fn new(build_ref: &str, source: Option<Color>, target: Color) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_ref: build_ref.to_string(),
            source,
            target,
            state: DeploymentState::Idle,
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            transitions: Vec::new(),
            pre_deploy_backup: None,
            migrations: Vec::new(),
            migrations_applied: false,
            promoted: false,
            replaced_previous_build: None,
            health_samples: 0,
            failure_reason: None,
        }
    }

    pub fn transition(&mut self, to: DeploymentState, reason: Option<String>) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(AppError::DeploymentFailed(format!(
                "illegal transition {} -> {} for attempt {}",
                self.state, to, self.id
            )));
        }
        self.transitions.push(StateTransition {
            from: self.state,
            to,
            at: Utc::now(),
            reason,
        });
        self.state = to;

        match to {
            DeploymentState::Complete => self.finish(DeploymentOutcome::Success),
            DeploymentState::RolledBack => self.finish(DeploymentOutcome::RolledBack),
            DeploymentState::Failed => self.finish(DeploymentOutcome::Failed),
            DeploymentState::RollingBack => {
                self.ended_at = None;
                self.outcome = None;
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(&mut self, outcome: DeploymentOutcome) {
        self.outcome = Some(outcome);
        self.ended_at = Some(Utc::now());
    }

    pub fn duration(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    pub health_attempts: u32,
    pub health_interval: Duration,
    /// Consecutive healthy samples that count as a sustained verdict.
    pub healthy_threshold: u32,
    pub drain_grace: Duration,
    pub drain_poll: Duration,
    pub provision_timeout: Duration,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            health_attempts: 30,
            health_interval: Duration::from_secs(10),
            healthy_threshold: 1,
            drain_grace: Duration::from_secs(30),
            drain_poll: Duration::from_secs(1),
            provision_timeout: Duration::from_secs(600),
        }
    }
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatus {
    pub environments: StateRecord,
    pub live: Option<Color>,
    /// The in-flight attempt, or the most recent one when idle.
    pub attempt: Option<DeploymentAttempt>,
}

/// Failure inside the forward path; the message becomes the attempt's
/// failure reason.
pub(super) struct StepFailure(pub String);

impl From<AppError> for StepFailure {
    fn from(e: AppError) -> Self {
        StepFailure(e.to_string())
    }
}

/// Owns the blue/green switch.
pub struct DeploymentController {
    pub(super) store: EnvironmentStateStore,
    pub(super) ledger: Arc<AttemptLedger>,
    pub(super) runtime: Arc<dyn EnvironmentRuntime>,
    pub(super) router: Arc<dyn TrafficRouter>,
    pub(super) monitor: Arc<HealthMonitor>,
    pub(super) backups: Arc<BackupManager>,
    pub(super) restores: Arc<RestoreManager>,
    pub(super) alerts: Arc<AlertChannel>,
    pub(super) config: DeploymentConfig,
}

impl DeploymentController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: EnvironmentStateStore,
        ledger: Arc<AttemptLedger>,
        runtime: Arc<dyn EnvironmentRuntime>,
        router: Arc<dyn TrafficRouter>,
        monitor: Arc<HealthMonitor>,
        backups: Arc<BackupManager>,
        restores: Arc<RestoreManager>,
        alerts: Arc<AlertChannel>,
        config: DeploymentConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            runtime,
            router,
            monitor,
            backups,
            restores,
            alerts,
            config,
        }
    }

    /// Deploys `build_ref` to the color opposite the live one.
    ///
    /// Returns the attempt in its terminal state. Only a rejected start
    /// (another attempt in flight, corrupt state) is an `Err`; a rollback is
    /// reported through the attempt's outcome.
    pub async fn deploy(&self, build_ref: &str) -> Result<DeploymentAttempt> {
        let build_ref = build_ref.trim();
        if build_ref.is_empty() {
            return Err(AppError::PreconditionError("build reference must not be empty".to_string()));
        }

        let mut attempt = self.claim(build_ref).await?;
        info!(
            attempt_id = %attempt.id,
            build_ref = %attempt.build_ref,
            source = ?attempt.source,
            target = %attempt.target,
            "Deployment started"
        );
        self.alerts
            .raise(
                Alert::info(
                    SOURCE,
                    "Deployment started",
                    format!("deploying {} to {}", attempt.build_ref, attempt.target),
                )
                .with_dedup_key(format!("deploy:{}:started", attempt.id)),
            )
            .await;

        self.advance(&mut attempt, DeploymentState::Provisioning, None).await;
        if let Err(StepFailure(reason)) = self.run_forward(&mut attempt).await {
            self.roll_back(&mut attempt, reason).await;
        }

        Ok(attempt)
    }

    /// Claims the single in-flight slot with a compare-and-set write.
    async fn claim(&self, build_ref: &str) -> Result<DeploymentAttempt> {
        let record = self.store.load().await?;
        let live = record.live_color()?;
        if let Some(existing) = record.in_flight {
            return Err(AppError::PreconditionError(format!(
                "deployment {} is already in progress",
                existing
            )));
        }

        let target = live.map(Color::opposite).unwrap_or(Color::A);
        let attempt = DeploymentAttempt::new(build_ref, live, target);

        let mut next = record.clone();
        next.in_flight = Some(attempt.id);
        next.cancel_requested = false;
        next.env_mut(target).reprovision(build_ref);

        match self.store.compare_and_set(record.version, next).await {
            Ok(_) => {}
            Err(AppError::StaleState { .. }) => {
                return Err(AppError::PreconditionError(
                    "another deployment claimed the environments first".to_string(),
                ))
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.ledger.record(&attempt).await {
            warn!(attempt_id = %attempt.id, error = %e, "Failed to write deployment ledger");
        }
        Ok(attempt)
    }

    async fn run_forward(&self, attempt: &mut DeploymentAttempt) -> std::result::Result<(), StepFailure> {
        self.provision(attempt).await?;
        self.advance(attempt, DeploymentState::HealthChecking, None).await;

        self.health_gate(attempt).await?;
        self.ensure_not_cancelled(attempt).await?;

        self.advance(attempt, DeploymentState::Promoting, None).await;
        self.promote(attempt).await?;

        if let Some(source) = attempt.source {
            self.advance(attempt, DeploymentState::DrainingOld, None).await;
            self.drain_old(attempt, source).await?;
        }

        self.complete(attempt).await?;
        Ok(())
    }

    async fn provision(&self, attempt: &mut DeploymentAttempt) -> std::result::Result<(), StepFailure> {
        if let Some(live) = attempt.source {
            let artifact = self
                .backups
                .create_backup(live, RetentionClass::Daily)
                .await
                .map_err(|e| StepFailure(format!("pre-deploy backup failed: {}", e)))?;
            info!(attempt_id = %attempt.id, artifact_id = %artifact.id, "Pre-deploy backup taken");
            attempt.pre_deploy_backup = Some(artifact.id);
            self.save(attempt).await;
        }

        self.ensure_not_cancelled(attempt).await?;

        match tokio::time::timeout(
            self.config.provision_timeout,
            self.runtime.provision(attempt.target, &attempt.build_ref),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(StepFailure(format!("provisioning failed: {}", e))),
            Err(_) => {
                return Err(StepFailure(format!(
                    "provisioning exceeded {:?}",
                    self.config.provision_timeout
                )))
            }
        }

        match self.runtime.run_migrations(attempt.target).await {
            Ok(report) => {
                attempt.migrations_applied = report.is_data_affecting();
                attempt.migrations = report.applied;
                self.save(attempt).await;
            }
            Err(e) => {
                // Partial migrations may have run
                attempt.migrations_applied = true;
                self.save(attempt).await;
                return Err(StepFailure(format!("migrations failed: {}", e)));
            }
        }

        Ok(())
    }

    /// Polls the new color until it is healthy `healthy_threshold` times in a
    /// row or the attempt budget runs out.
    async fn health_gate(&self, attempt: &mut DeploymentAttempt) -> std::result::Result<(), StepFailure> {
        let target = attempt.target;
        self.monitor.reset(target);

        let mut streak = 0u32;
        let mut last_outcome = HealthOutcome::Unknown;
        let mut last_detail = String::new();

        for n in 1..=self.config.health_attempts.max(1) {
            self.ensure_not_cancelled(attempt).await?;

            let result = self.monitor.check(target).await;
            attempt.health_samples = n;
            last_outcome = result.outcome;
            last_detail = result.detail.clone();

            debug!(
                attempt_id = %attempt.id,
                color = %target,
                sample = n,
                outcome = %result.outcome,
                consecutive_failures = result.consecutive_failures,
                "Health gate sample"
            );

            if result.outcome == HealthOutcome::Healthy {
                streak += 1;
                if streak >= self.config.healthy_threshold.max(1) {
                    info!(attempt_id = %attempt.id, color = %target, samples = n, "Health gate passed");
                    self.record_health(target, HealthOutcome::Healthy).await;
                    return Ok(());
                }
            } else {
                streak = 0;
            }

            if n < self.config.health_attempts {
                tokio::time::sleep(self.config.health_interval).await;
            }
        }

        self.record_health(target, last_outcome).await;
        Err(StepFailure(format!(
            "health gate failed after {} probes, last {}: {}",
            attempt.health_samples, last_outcome, last_detail
        )))
    }

    async fn promote(&self, attempt: &mut DeploymentAttempt) -> std::result::Result<(), StepFailure> {
        let target = attempt.target;

        self.router
            .route_to(target)
            .await
            .map_err(|e| StepFailure(format!("traffic switch failed: {}", e)))?;
        attempt.promoted = true;
        self.save(attempt).await;

        let id = attempt.id;
        let source = attempt.source;
        let mut replaced = None;
        self.store
            .update(|record| {
                ensure_owner(record, id)?;
                replaced = record.previous_build.clone();
                if let Some(source) = source {
                    record.previous_build = record.env(source).build_ref.clone();
                    record.env_mut(source).set_role(EnvironmentRole::Draining);
                }
                let env = record.env_mut(target);
                env.set_role(EnvironmentRole::Live);
                env.health = HealthOutcome::Healthy;
                Ok(())
            })
            .await
            .map_err(|e| StepFailure(format!("recording promotion failed: {}", e)))?;
        attempt.replaced_previous_build = replaced;
        self.save(attempt).await;

        info!(attempt_id = %attempt.id, color = %target, build_ref = %attempt.build_ref, "Promoted to live");
        Ok(())
    }

    /// Stops new connections to `source`, waits out the grace period for
    /// open ones, then stops it. Overrunning the grace period only warns.
    async fn drain_old(&self, attempt: &mut DeploymentAttempt, source: Color) -> std::result::Result<(), StepFailure> {
        if let Err(e) = self.router.drain(source).await {
            warn!(attempt_id = %attempt.id, color = %source, error = %e, "Could not put old environment into drain");
        }

        let started = Instant::now();
        let mut drained = false;
        while started.elapsed() < self.config.drain_grace {
            self.ensure_not_cancelled(attempt).await?;
            match self.router.active_connections(source).await {
                Ok(0) => {
                    drained = true;
                    break;
                }
                Ok(open) => debug!(color = %source, open, "Waiting for connections to finish"),
                Err(e) => debug!(color = %source, error = %e, "Connection count unavailable"),
            }
            tokio::time::sleep(self.config.drain_poll.min(self.config.drain_grace)).await;
        }

        if !drained {
            warn!(
                attempt_id = %attempt.id,
                color = %source,
                grace_secs = self.config.drain_grace.as_secs(),
                "Drain grace period elapsed, forcing stop"
            );
            self.alerts
                .raise(
                    Alert::warning(
                        SOURCE,
                        "Forced stop of old environment",
                        format!("{} still had open connections after {:?}", source, self.config.drain_grace),
                    )
                    .with_dedup_key(format!("deploy:{}:forced-drain", attempt.id)),
                )
                .await;
        }

        if let Err(e) = self.runtime.stop(source).await {
            warn!(attempt_id = %attempt.id, color = %source, error = %e, "Stopping old environment failed");
        }

        let id = attempt.id;
        self.store
            .update(|record| {
                ensure_owner(record, id)?;
                record.env_mut(source).set_role(EnvironmentRole::Standby);
                Ok(())
            })
            .await
            .map_err(|e| StepFailure(format!("recording drained environment failed: {}", e)))?;
        Ok(())
    }

    async fn complete(&self, attempt: &mut DeploymentAttempt) -> std::result::Result<(), StepFailure> {
        let id = attempt.id;
        self.store
            .update(|record| {
                ensure_owner(record, id)?;
                record.in_flight = None;
                record.cancel_requested = false;
                Ok(())
            })
            .await
            .map_err(|e| StepFailure(format!("releasing deployment slot failed: {}", e)))?;

        self.advance(attempt, DeploymentState::Complete, None).await;
        info!(
            attempt_id = %attempt.id,
            color = %attempt.target,
            duration_secs = attempt.duration().num_seconds(),
            "Deployment complete"
        );
        self.alerts
            .raise(
                Alert::info(
                    SOURCE,
                    "Deployment complete",
                    format!("{} is live on {}", attempt.build_ref, attempt.target),
                )
                .with_dedup_key(format!("deploy:{}:complete", attempt.id)),
            )
            .await;
        Ok(())
    }

    /// Pure read of the environment record and the relevant attempt.
    pub async fn status(&self) -> Result<DeploymentStatus> {
        let environments = self.store.load().await?;
        let live = environments.live_color()?;
        let attempt = match environments.in_flight {
            Some(id) => Some(self.ledger.get(id).await?),
            None => self.ledger.latest().await?,
        };
        Ok(DeploymentStatus {
            environments,
            live,
            attempt,
        })
    }

    pub async fn history(&self) -> Result<Vec<DeploymentAttempt>> {
        self.ledger.list().await
    }

    pub(super) async fn advance(&self, attempt: &mut DeploymentAttempt, to: DeploymentState, reason: Option<String>) {
        let from = attempt.state;
        if let Err(e) = attempt.transition(to, reason) {
            error!(attempt_id = %attempt.id, error = %e, "Rejected state transition");
            return;
        }
        info!(attempt_id = %attempt.id, from = %from, to = %to, "Deployment state changed");
        self.save(attempt).await;
    }

    pub(super) async fn save(&self, attempt: &DeploymentAttempt) {
        if let Err(e) = self.ledger.record(attempt).await {
            warn!(attempt_id = %attempt.id, error = %e, "Failed to write deployment ledger");
        }
    }

    async fn ensure_not_cancelled(&self, attempt: &DeploymentAttempt) -> std::result::Result<(), StepFailure> {
        match self.store.load().await {
            Ok(record) if record.in_flight == Some(attempt.id) && record.cancel_requested => {
                info!(attempt_id = %attempt.id, state = %attempt.state, "Cancellation requested");
                Err(StepFailure("cancelled by operator".to_string()))
            }
            Ok(_) => Ok(()),
            Err(e) => Err(StepFailure(format!("environment state unreadable: {}", e))),
        }
    }

    async fn record_health(&self, color: Color, outcome: HealthOutcome) {
        let result = self
            .store
            .update(|record| {
                record.env_mut(color).health = outcome;
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!(color = %color, error = %e, "Failed to record health status");
        }
    }
}

/// Refuses to write on behalf of an attempt that no longer owns the record.
pub(super) fn ensure_owner(record: &StateRecord, attempt_id: Uuid) -> Result<()> {
    if record.in_flight != Some(attempt_id) {
        return Err(AppError::ConflictingStateError(format!(
            "attempt {} no longer owns the environment state (in flight: {:?})",
            attempt_id, record.in_flight
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path_is_legal() {
        use DeploymentState::*;
        let path = [Idle, Provisioning, HealthChecking, Promoting, DrainingOld, Complete];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_rollback_branch_reachable_only_before_completion() {
        use DeploymentState::*;
        for state in [Provisioning, HealthChecking, Promoting] {
            assert!(state.can_transition_to(RollingBack));
        }
        assert!(!Idle.can_transition_to(Promoting));
        assert!(!Complete.can_transition_to(RollingBack));
        assert!(!RolledBack.can_transition_to(RollingBack));
    }

    #[test]
    fn test_terminal_transition_sets_outcome() {
        let mut attempt = DeploymentAttempt::new("v2", Some(Color::A), Color::B);
        attempt.transition(DeploymentState::Provisioning, None).unwrap();
        attempt.transition(DeploymentState::RollingBack, Some("boom".into())).unwrap();
        attempt.transition(DeploymentState::RolledBack, None).unwrap();

        assert_eq!(attempt.outcome, Some(DeploymentOutcome::RolledBack));
        assert!(attempt.ended_at.is_some());
        assert_eq!(attempt.transitions.len(), 3);
        assert_eq!(attempt.transitions[1].reason.as_deref(), Some("boom"));
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let mut attempt = DeploymentAttempt::new("v2", None, Color::A);
        assert!(attempt.transition(DeploymentState::Complete, None).is_err());
        assert_eq!(attempt.state, DeploymentState::Idle);
    }

    #[test]
    fn test_state_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&DeploymentState::HealthChecking).unwrap(),
            "\"HEALTH_CHECKING\""
        );
    }
}
