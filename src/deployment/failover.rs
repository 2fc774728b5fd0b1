//! Cross-region failover.
//!
//! The controller listens to health samples of the live color and to an
//! external alarm feed. A failover promotes the standby data replica,
//! repoints the entry point at the secondary region and appends a
//! [`FailoverEvent`]. Only one failover runs at a time across every process
//! sharing the state directory, guarded by the `failover` lock. A completed
//! or timed-out failover in the event log latches further triggers until an
//! operator appends a `cleared` event with [`FailoverController::clear_latch`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::deployment::environment::Color;
use crate::deployment::health_checks::{
    HealthCheckResult, HealthMonitor, HealthOutcome, HealthSubscriber, WatchTarget,
};
use crate::error::{AppError, Result, RetryPolicy};
use crate::services::notification::{Alert, AlertChannel, RecentKeys};
use crate::services::process::ExternalCommand;
use crate::state::{AdvisoryLock, EnvironmentStateStore};

const SOURCE: &str = "failover";
const LOCK_NAME: &str = "failover";
const MAX_SEEN_ALARMS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverOutcome {
    Completed,
    TimedOut,
    Failed,
    /// Operator released the latch.
    Cleared,
}

impl FailoverOutcome {
    /// Whether this outcome leaves the system failed over.
    pub fn latches(self) -> bool {
        matches!(self, FailoverOutcome::Completed | FailoverOutcome::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub id: Uuid,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub promoted_replica: Option<String>,
    pub region: String,
    pub outcome: FailoverOutcome,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Why a trigger did or did not run a failover.
#[derive(Debug, Clone, PartialEq)]
pub enum FailoverDecision {
    Executed(FailoverEvent),
    /// Not enough consecutive unhealthy samples yet.
    Debounced,
    AlreadyInProgress,
    AlreadyFailedOver,
    DuplicateAlarm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAlarm {
    pub alarm_id: String,
    pub reason: String,
}

/// Elevates the standby data replica to primary.
#[async_trait]
pub trait ReplicaPromoter: Send + Sync {
    async fn promote(&self, replica_id: &str) -> Result<()>;
}

/// Repoints the public entry point at another region.
#[async_trait]
pub trait RegionRouter: Send + Sync {
    async fn route_to_region(&self, region: &str, reason: &str) -> Result<()>;
}

/// Runs an operator-supplied command with `REPLICA_ID` set.
pub struct CommandReplicaPromoter {
    command: String,
}

impl CommandReplicaPromoter {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }
}

#[async_trait]
impl ReplicaPromoter for CommandReplicaPromoter {
    async fn promote(&self, replica_id: &str) -> Result<()> {
        // The caller bounds the whole promotion; don't impose a shorter limit.
        let output = ExternalCommand::shell(self.command.clone())
            .env("REPLICA_ID", replica_id)
            .timeout(Duration::from_secs(24 * 60 * 60))
            .run()
            .await?;
        info!(replica = replica_id, output = %output.stdout_lossy().trim(), "Replica promotion command finished");
        Ok(())
    }
}

#[derive(Serialize)]
struct RegionSwitchRequest<'a> {
    region: &'a str,
    reason: &'a str,
}

/// POSTs `{region, reason}` to the DNS/health-check service.
pub struct WebhookRegionRouter {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl WebhookRegionRouter {
    pub fn new(endpoint: url::Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigurationError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl RegionRouter for WebhookRegionRouter {
    async fn route_to_region(&self, region: &str, reason: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&RegionSwitchRequest { region, reason })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::ExternalServiceError(format!(
                "region switch webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Used when no DNS webhook is configured: the switch is left to the
/// operator and only logged.
pub struct LogOnlyRegionRouter;

#[async_trait]
impl RegionRouter for LogOnlyRegionRouter {
    async fn route_to_region(&self, region: &str, reason: &str) -> Result<()> {
        warn!(region, reason, "No region router configured; repoint the entry point manually");
        Ok(())
    }
}

#[derive(Default)]
pub struct MockReplicaPromoter {
    promoted: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
    fail: AtomicBool,
}

impl MockReplicaPromoter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        if let Ok(mut d) = self.delay.lock() {
            *d = Some(delay);
        }
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn promoted(&self) -> Vec<String> {
        self.promoted.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReplicaPromoter for MockReplicaPromoter {
    async fn promote(&self, replica_id: &str) -> Result<()> {
        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::ExternalServiceError("mock promotion refused".to_string()));
        }
        if let Ok(mut promoted) = self.promoted.lock() {
            promoted.push(replica_id.to_string());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockRegionRouter {
    routed: Mutex<Vec<String>>,
    failures_left: AtomicU32,
}

impl MockRegionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls fail with a retryable error.
    pub fn fail_times(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn routed(&self) -> Vec<String> {
        self.routed.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RegionRouter for MockRegionRouter {
    async fn route_to_region(&self, region: &str, _reason: &str) -> Result<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(AppError::NetworkError("mock region router unavailable".to_string()));
        }
        if let Ok(mut routed) = self.routed.lock() {
            routed.push(region.to_string());
        }
        Ok(())
    }
}

/// Append-only JSON lines.
#[derive(Debug, Clone)]
pub struct FailoverEventLog {
    path: PathBuf,
    lock_dir: PathBuf,
}

impl FailoverEventLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("failover-events.jsonl"),
            lock_dir: state_dir.join("locks"),
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Latch state from the newest event that decided it. `None` when no
    /// failover ever completed, timed out or was cleared.
    pub async fn latched(&self) -> Result<Option<bool>> {
        Ok(self
            .list()
            .await?
            .iter()
            .rev()
            .find(|e| e.outcome != FailoverOutcome::Failed)
            .map(|e| e.outcome.latches()))
    }

    pub async fn append(&self, event: &FailoverEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Oldest first. Lines that fail to parse are skipped.
    pub async fn list(&self) -> Result<Vec<FailoverEvent>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable failover event");
                    None
                }
            })
            .collect())
    }
}

/// Alarm feed backed by a spool directory; each `*.json` file is consumed
/// once. Unparseable files are renamed to `*.rejected`.
#[derive(Debug, Clone)]
pub struct SpoolAlarmFeed {
    dir: PathBuf,
}

impl SpoolAlarmFeed {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn poll(&self) -> Result<Vec<ExternalAlarm>> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut alarms = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<ExternalAlarm>(&bytes) {
                Ok(alarm) => {
                    fs::remove_file(&path).await?;
                    alarms.push(alarm);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Rejecting malformed alarm file");
                    fs::rename(&path, path.with_extension("rejected")).await?;
                }
            }
        }
        Ok(alarms)
    }
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Consecutive unhealthy samples required.
    pub threshold: u32,
    /// Most recent samples that must all be unhealthy.
    pub window: usize,
    pub promotion_timeout: Duration,
    pub secondary_region: String,
    pub replica_id: String,
    pub router_retry: RetryPolicy,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            window: 3,
            promotion_timeout: Duration::from_secs(300),
            secondary_region: "secondary".to_string(),
            replica_id: "standby".to_string(),
            router_retry: RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(10)),
        }
    }
}

#[derive(Default)]
struct Observations {
    color: Option<Color>,
    recent: VecDeque<HealthOutcome>,
}

pub struct FailoverController {
    config: FailoverConfig,
    promoter: Arc<dyn ReplicaPromoter>,
    router: Arc<dyn RegionRouter>,
    log: FailoverEventLog,
    alerts: Arc<AlertChannel>,
    in_progress: AtomicBool,
    failed_over: AtomicBool,
    seen_alarms: Mutex<RecentKeys>,
    observations: Mutex<Observations>,
}

impl FailoverController {
    pub fn new(
        config: FailoverConfig,
        promoter: Arc<dyn ReplicaPromoter>,
        router: Arc<dyn RegionRouter>,
        log: FailoverEventLog,
        alerts: Arc<AlertChannel>,
    ) -> Self {
        Self {
            config,
            promoter,
            router,
            log,
            alerts,
            in_progress: AtomicBool::new(false),
            failed_over: AtomicBool::new(false),
            seen_alarms: Mutex::new(RecentKeys::new(MAX_SEEN_ALARMS)),
            observations: Mutex::new(Observations::default()),
        }
    }

    pub fn is_failed_over(&self) -> bool {
        self.failed_over.load(Ordering::SeqCst)
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub async fn events(&self) -> Result<Vec<FailoverEvent>> {
        self.log.list().await
    }

    /// Feeds one health sample through the debounce.
    pub async fn on_health_result(&self, result: &HealthCheckResult) -> Result<FailoverDecision> {
        if !self.sustained_failure(result) {
            return Ok(FailoverDecision::Debounced);
        }
        let reason = format!(
            "{} unhealthy for {} consecutive checks: {}",
            result.target, result.consecutive_failures, result.detail
        );
        self.failover(&reason).await
    }

    pub async fn on_alarm(&self, alarm: &ExternalAlarm) -> Result<FailoverDecision> {
        let fresh = self
            .seen_alarms
            .lock()
            .map(|mut seen| seen.insert(&alarm.alarm_id))
            .unwrap_or(true);
        if !fresh {
            debug!(alarm_id = %alarm.alarm_id, "Duplicate alarm ignored");
            return Ok(FailoverDecision::DuplicateAlarm);
        }
        info!(alarm_id = %alarm.alarm_id, reason = %alarm.reason, "External alarm received");
        self.failover(&format!("alarm {}: {}", alarm.alarm_id, alarm.reason)).await
    }

    /// Runs a failover unless one is running or has already completed.
    ///
    /// A promotion that overruns its bound is `FailoverTimeout` and is not
    /// retried. It latches like a completed failover so a later trigger
    /// cannot start a second, possibly conflicting, promotion.
    pub async fn failover(&self, reason: &str) -> Result<FailoverDecision> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(reason, "Failover in progress, trigger ignored");
            return Ok(FailoverDecision::AlreadyInProgress);
        }

        let result = self.failover_locked(reason).await;
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn failover_locked(&self, reason: &str) -> Result<FailoverDecision> {
        let Some(_lock) = AdvisoryLock::try_acquire(self.log.lock_dir(), LOCK_NAME).await? else {
            info!(reason, "Failover held by another process, trigger ignored");
            return Ok(FailoverDecision::AlreadyInProgress);
        };

        if self.refresh_latch().await? {
            info!(reason, "Failover already performed, trigger ignored");
            return Ok(FailoverDecision::AlreadyFailedOver);
        }
        self.execute(reason).await
    }

    /// Syncs the in-memory latch with the event log. An event that could
    /// not be appended leaves only the in-memory latch behind.
    async fn refresh_latch(&self) -> Result<bool> {
        match self.log.latched().await? {
            Some(latched) => {
                self.failed_over.store(latched, Ordering::SeqCst);
                Ok(latched)
            }
            None => Ok(self.failed_over.load(Ordering::SeqCst)),
        }
    }

    /// Releases the latch so a later trigger may fail over again. Refuses
    /// while a failover is running or when nothing is latched.
    pub async fn clear_latch(&self, reason: &str) -> Result<FailoverEvent> {
        let Some(_lock) = AdvisoryLock::try_acquire(self.log.lock_dir(), LOCK_NAME).await? else {
            return Err(AppError::PreconditionError(
                "a failover is in progress; wait for it to finish".to_string(),
            ));
        };
        if !self.refresh_latch().await? {
            return Err(AppError::PreconditionError("no failover is latched".to_string()));
        }

        let event = FailoverEvent {
            id: Uuid::new_v4(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
            promoted_replica: None,
            region: self.config.secondary_region.clone(),
            outcome: FailoverOutcome::Cleared,
            error: None,
            duration_ms: 0,
        };
        self.log.append(&event).await?;
        self.failed_over.store(false, Ordering::SeqCst);
        if let Ok(mut obs) = self.observations.lock() {
            obs.recent.clear();
        }

        warn!(failover_id = %event.id, reason, "Failover latch cleared");
        self.alerts
            .raise(
                Alert::info(SOURCE, "Failover latch cleared", reason.to_string())
                    .with_dedup_key(format!("failover:{}", event.id)),
            )
            .await;
        Ok(event)
    }

    async fn execute(&self, reason: &str) -> Result<FailoverDecision> {
        let started = Instant::now();
        let id = Uuid::new_v4();
        let region = self.config.secondary_region.clone();
        let replica = self.config.replica_id.clone();
        warn!(failover_id = %id, reason, region = %region, replica = %replica, "Starting failover");

        let mut event = FailoverEvent {
            id,
            reason: reason.to_string(),
            timestamp: Utc::now(),
            promoted_replica: None,
            region: region.clone(),
            outcome: FailoverOutcome::Failed,
            error: None,
            duration_ms: 0,
        };

        let failure = match tokio::time::timeout(self.config.promotion_timeout, self.promoter.promote(&replica)).await {
            Err(_) => {
                // Promotion state is unknown from here on
                self.failed_over.store(true, Ordering::SeqCst);
                event.outcome = FailoverOutcome::TimedOut;
                Some(AppError::FailoverTimeout(format!(
                    "replica {} not promoted within {:?}; manual intervention required",
                    replica, self.config.promotion_timeout
                )))
            }
            Ok(Err(e)) => Some(AppError::FailoverFailure(format!("replica promotion failed: {}", e))),
            Ok(Ok(())) => {
                self.failed_over.store(true, Ordering::SeqCst);
                event.promoted_replica = Some(replica.clone());
                info!(failover_id = %id, replica = %replica, "Replica promoted");

                let router = Arc::clone(&self.router);
                let routed = self
                    .config
                    .router_retry
                    .execute("route to secondary region", || {
                        let router = Arc::clone(&router);
                        let region = region.clone();
                        let reason = reason.to_string();
                        async move { router.route_to_region(&region, &reason).await }
                    })
                    .await;
                match routed {
                    Ok(()) => {
                        event.outcome = FailoverOutcome::Completed;
                        None
                    }
                    Err(e) => Some(AppError::FailoverFailure(format!(
                        "replica promoted but entry point not switched to {}: {}",
                        region, e
                    ))),
                }
            }
        };

        event.error = failure.as_ref().map(|e| e.to_string());
        event.duration_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = self.log.append(&event).await {
            error!(failover_id = %id, error = %e, "Failed to append failover event");
        }

        match failure {
            None => {
                warn!(failover_id = %id, region = %region, duration_ms = event.duration_ms, "Failover complete");
                self.alerts
                    .raise(
                        Alert::critical(
                            SOURCE,
                            "Failover completed",
                            format!("traffic moved to {} after: {}", region, reason),
                        )
                        .with_dedup_key(format!("failover:{}", id)),
                    )
                    .await;
                Ok(FailoverDecision::Executed(event))
            }
            Some(e) => {
                error!(failover_id = %id, error = %e, "Failover did not complete");
                self.alerts
                    .raise(
                        Alert::critical(SOURCE, "Failover failed", e.to_string())
                            .with_dedup_key(format!("failover:{}", id))
                            .with_metadata("outcome", format!("{:?}", event.outcome)),
                    )
                    .await;
                Err(e)
            }
        }
    }

    fn sustained_failure(&self, result: &HealthCheckResult) -> bool {
        let Ok(mut obs) = self.observations.lock() else {
            return false;
        };
        if obs.color != Some(result.target) {
            obs.color = Some(result.target);
            obs.recent.clear();
        }
        obs.recent.push_back(result.outcome);
        let window = self.config.window.max(1);
        while obs.recent.len() > window {
            obs.recent.pop_front();
        }

        result.consecutive_failures >= self.config.threshold
            && obs.recent.len() == window
            && obs.recent.iter().all(|o| *o == HealthOutcome::Unhealthy)
    }

    /// Watches the live color and polls the alarm feed until `shutdown`
    /// flips.
    pub async fn run(
        self: Arc<Self>,
        monitor: Arc<HealthMonitor>,
        state: EnvironmentStateStore,
        interval: Duration,
        alarms: Option<SpoolAlarmFeed>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let subscriber: Arc<dyn HealthSubscriber> = self.clone();
        let watch = monitor.watch(WatchTarget::Live(state), interval, subscriber);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs(), threshold = self.config.threshold, "Failover controller started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let Some(feed) = alarms.as_ref() else { continue };
                    let polled = match feed.poll().await {
                        Ok(polled) => polled,
                        Err(e) => {
                            warn!(error = %e, "Alarm feed unreadable");
                            continue;
                        }
                    };
                    for alarm in polled {
                        if let Err(e) = self.on_alarm(&alarm).await {
                            error!(alarm_id = %alarm.alarm_id, error = %e, "Alarm-triggered failover failed");
                        }
                    }
                }
            }
        }

        watch.cancel().await;
        info!("Failover controller stopped");
    }
}

#[async_trait]
impl HealthSubscriber for FailoverController {
    async fn on_result(&self, result: HealthCheckResult) {
        if let Err(e) = self.on_health_result(&result).await {
            error!(color = %result.target, error = %e, "Health-triggered failover failed");
        }
    }
}
