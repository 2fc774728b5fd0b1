use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::deployment::environment::Color;
use crate::deployment::runtime::EnvironmentRuntime;
use crate::error::{AppError, Result};
use crate::state::EnvironmentStateStore;

/// Results kept per color for `health` output.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthOutcome {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthOutcome {
    fn rank(self) -> u8 {
        match self {
            HealthOutcome::Healthy => 0,
            HealthOutcome::Unknown => 1,
            HealthOutcome::Unhealthy => 2,
        }
    }

    /// `unhealthy` beats `unknown` beats `healthy`.
    pub fn worst(self, other: HealthOutcome) -> HealthOutcome {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for HealthOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthOutcome::Healthy => write!(f, "healthy"),
            HealthOutcome::Unhealthy => write!(f, "unhealthy"),
            HealthOutcome::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub target: Color,
    pub timestamp: DateTime<Utc>,
    pub outcome: HealthOutcome,
    /// Unhealthy samples in a row for `target`, including this one.
    pub consecutive_failures: u32,
    pub detail: String,
    pub response_time_ms: u64,
}

/// What a single probe observed.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub outcome: HealthOutcome,
    pub detail: String,
}

impl ProbeReport {
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self { outcome: HealthOutcome::Healthy, detail: detail.into() }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self { outcome: HealthOutcome::Unhealthy, detail: detail.into() }
    }

    pub fn unknown(detail: impl Into<String>) -> Self {
        Self { outcome: HealthOutcome::Unknown, detail: detail.into() }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, color: Color) -> ProbeReport;
    fn name(&self) -> String;
}

/// GETs the application's readiness endpoint for a color.
pub struct HttpReadinessProbe {
    client: reqwest::Client,
    endpoints: HashMap<Color, url::Url>,
}

impl HttpReadinessProbe {
    pub fn new(endpoints: HashMap<Color, url::Url>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigurationError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, endpoints })
    }
}

#[async_trait]
impl HealthProbe for HttpReadinessProbe {
    async fn probe(&self, color: Color) -> ProbeReport {
        let Some(endpoint) = self.endpoints.get(&color) else {
            return ProbeReport::unknown(format!("no readiness endpoint configured for {}", color));
        };

        match self.client.get(endpoint.clone()).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.bytes().await {
                    Ok(body) => classify_response(status, &body),
                    Err(e) => ProbeReport::unhealthy(format!("HTTP {} with unreadable body: {}", status, e)),
                }
            }
            Err(e) if e.is_timeout() => ProbeReport::unhealthy(format!("request timed out: {}", e)),
            Err(e) => ProbeReport::unhealthy(format!("request failed: {}", e)),
        }
    }

    fn name(&self) -> String {
        "http-readiness".to_string()
    }
}

const PASSING_STATUSES: [&str; 5] = ["ok", "healthy", "ready", "pass", "up"];

/// Classifies a readiness response.
///
/// Non-2xx is unhealthy. A 2xx JSON body must not report a failing status;
/// a 2xx body that is not JSON counts as a plain liveness pass.
pub fn classify_response(status: u16, body: &[u8]) -> ProbeReport {
    if !(200..300).contains(&status) {
        return ProbeReport::unhealthy(format!("HTTP {}", status));
    }

    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(body) else {
        return ProbeReport::healthy(format!("HTTP {} (liveness only)", status));
    };

    if let Some(ready) = payload.get("ready").and_then(|v| v.as_bool()) {
        return if ready {
            ProbeReport::healthy(format!("HTTP {} ready=true", status))
        } else {
            ProbeReport::unhealthy(format!("HTTP {} ready=false", status))
        };
    }

    match payload.get("status").and_then(|v| v.as_str()) {
        Some(s) if PASSING_STATUSES.contains(&s.to_ascii_lowercase().as_str()) => {
            ProbeReport::healthy(format!("HTTP {} status={}", status, s))
        }
        Some(s) => ProbeReport::unhealthy(format!("HTTP {} status={}", status, s)),
        None => ProbeReport::healthy(format!("HTTP {}", status)),
    }
}

/// Infrastructure signal: enough hosts running and none exited non-zero.
pub struct HostCountProbe {
    runtime: Arc<dyn EnvironmentRuntime>,
    min_hosts: u32,
}

impl HostCountProbe {
    pub fn new(runtime: Arc<dyn EnvironmentRuntime>, min_hosts: u32) -> Self {
        Self { runtime, min_hosts }
    }
}

#[async_trait]
impl HealthProbe for HostCountProbe {
    async fn probe(&self, color: Color) -> ProbeReport {
        match self.runtime.host_status(color).await {
            Ok(status) if status.failed_exits > 0 => ProbeReport::unhealthy(format!(
                "{} host(s) exited non-zero",
                status.failed_exits
            )),
            Ok(status) if status.running < self.min_hosts => ProbeReport::unhealthy(format!(
                "{} of {} required hosts running",
                status.running, self.min_hosts
            )),
            Ok(status) => ProbeReport::healthy(format!("{} hosts running", status.running)),
            Err(e) => ProbeReport::unknown(format!("host status unavailable: {}", e)),
        }
    }

    fn name(&self) -> String {
        "host-count".to_string()
    }
}

/// Runs every probe concurrently and reports the worst outcome.
pub struct CompositeProbe {
    probes: Vec<Arc<dyn HealthProbe>>,
}

impl CompositeProbe {
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>) -> Self {
        Self { probes }
    }
}

#[async_trait]
impl HealthProbe for CompositeProbe {
    async fn probe(&self, color: Color) -> ProbeReport {
        if self.probes.is_empty() {
            return ProbeReport::unknown("no probes configured");
        }

        let reports = join_all(self.probes.iter().map(|p| p.probe(color))).await;

        let outcome = reports
            .iter()
            .fold(HealthOutcome::Healthy, |acc, r| acc.worst(r.outcome));
        let detail = self
            .probes
            .iter()
            .zip(&reports)
            .map(|(p, r)| format!("{}: {}", p.name(), r.detail))
            .collect::<Vec<_>>()
            .join("; ");

        ProbeReport { outcome, detail }
    }

    fn name(&self) -> String {
        "composite".to_string()
    }
}

/// Scripted probe. Each color replays its queued outcomes, then repeats the
/// fallback.
pub struct MockHealthProbe {
    scripts: Mutex<HashMap<Color, VecDeque<HealthOutcome>>>,
    fallback: Mutex<HashMap<Color, HealthOutcome>>,
    calls: Mutex<HashMap<Color, u32>>,
    delay: Option<Duration>,
}

impl MockHealthProbe {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn always(self, color: Color, outcome: HealthOutcome) -> Self {
        self.set_fallback(color, outcome);
        self
    }

    pub fn set_fallback(&self, color: Color, outcome: HealthOutcome) {
        if let Ok(mut fallback) = self.fallback.lock() {
            fallback.insert(color, outcome);
        }
    }

    pub fn push(&self, color: Color, outcomes: &[HealthOutcome]) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(color).or_default().extend(outcomes.iter().copied());
        }
    }

    pub fn calls(&self, color: Color) -> u32 {
        self.calls.lock().map(|c| c.get(&color).copied().unwrap_or(0)).unwrap_or(0)
    }
}

impl Default for MockHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for MockHealthProbe {
    async fn probe(&self, color: Color) -> ProbeReport {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(color).or_insert(0) += 1;
        }

        let scripted = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(&color).and_then(|q| q.pop_front()));
        let outcome = scripted.unwrap_or_else(|| {
            self.fallback
                .lock()
                .ok()
                .and_then(|f| f.get(&color).copied())
                .unwrap_or(HealthOutcome::Healthy)
        });

        ProbeReport { outcome, detail: "mock".to_string() }
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}

#[derive(Default)]
struct ColorHistory {
    consecutive_failures: u32,
    results: VecDeque<HealthCheckResult>,
}

/// Probe runner that remembers just enough history to count consecutive
/// failures per color.
pub struct HealthMonitor {
    probe: Arc<dyn HealthProbe>,
    probe_timeout: Duration,
    history: Mutex<HashMap<Color, ColorHistory>>,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, probe_timeout: Duration) -> Self {
        Self {
            probe,
            probe_timeout,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// One bounded probe. A probe that overruns its timeout is unhealthy.
    pub async fn check(&self, color: Color) -> HealthCheckResult {
        let started = Instant::now();
        let report = match tokio::time::timeout(self.probe_timeout, self.probe.probe(color)).await {
            Ok(report) => report,
            Err(_) => ProbeReport::unhealthy(format!("probe timed out after {:?}", self.probe_timeout)),
        };
        let response_time_ms = started.elapsed().as_millis() as u64;

        let consecutive_failures = self.record_outcome(color, report.outcome);
        let result = HealthCheckResult {
            target: color,
            timestamp: Utc::now(),
            outcome: report.outcome,
            consecutive_failures,
            detail: report.detail,
            response_time_ms,
        };

        debug!(
            color = %color,
            outcome = %result.outcome,
            consecutive_failures,
            response_time_ms,
            "Health check completed"
        );

        self.push_history(result.clone());
        result
    }

    /// Most recent first.
    pub fn history(&self, color: Color) -> Vec<HealthCheckResult> {
        self.history
            .lock()
            .map(|h| {
                h.get(&color)
                    .map(|c| c.results.iter().rev().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn consecutive_failures(&self, color: Color) -> u32 {
        self.history
            .lock()
            .map(|h| h.get(&color).map(|c| c.consecutive_failures).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Forgets a color's history, used when it is reprovisioned.
    pub fn reset(&self, color: Color) {
        if let Ok(mut history) = self.history.lock() {
            history.remove(&color);
        }
    }

    /// Samples `target` every `interval` and hands each result to
    /// `subscriber` until the handle is cancelled.
    pub fn watch(
        self: &Arc<Self>,
        target: WatchTarget,
        interval: Duration,
        subscriber: Arc<dyn HealthSubscriber>,
    ) -> WatchHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let monitor = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(target = %target.describe(), interval_ms = interval.as_millis() as u64, "Health watch started");

            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = ticker.tick() => {
                        let Some(color) = target.resolve().await else {
                            continue;
                        };
                        let result = monitor.check(color).await;
                        subscriber.on_result(result).await;
                    }
                }
            }

            info!(target = %target.describe(), "Health watch stopped");
        });

        WatchHandle { cancel_tx, handle }
    }

    fn record_outcome(&self, color: Color, outcome: HealthOutcome) -> u32 {
        let Ok(mut history) = self.history.lock() else {
            return 0;
        };
        let entry = history.entry(color).or_default();
        match outcome {
            HealthOutcome::Healthy => entry.consecutive_failures = 0,
            HealthOutcome::Unhealthy => entry.consecutive_failures += 1,
            HealthOutcome::Unknown => {}
        }
        entry.consecutive_failures
    }

    fn push_history(&self, result: HealthCheckResult) {
        if let Ok(mut history) = self.history.lock() {
            let entry = history.entry(result.target).or_default();
            entry.results.push_back(result);
            while entry.results.len() > HISTORY_LIMIT {
                entry.results.pop_front();
            }
        }
    }
}

/// What a watch samples on each tick.
#[derive(Clone)]
pub enum WatchTarget {
    Fixed(Color),
    /// Whichever color the state record says is live at tick time.
    Live(EnvironmentStateStore),
}

impl WatchTarget {
    async fn resolve(&self) -> Option<Color> {
        match self {
            WatchTarget::Fixed(color) => Some(*color),
            WatchTarget::Live(store) => match store.load().await.and_then(|r| r.live_color()) {
                Ok(Some(color)) => Some(color),
                Ok(None) => {
                    debug!("No live environment yet, skipping health sample");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Cannot resolve live environment for health watch");
                    None
                }
            },
        }
    }

    fn describe(&self) -> String {
        match self {
            WatchTarget::Fixed(color) => color.to_string(),
            WatchTarget::Live(_) => "live".to_string(),
        }
    }
}

#[async_trait]
pub trait HealthSubscriber: Send + Sync {
    async fn on_result(&self, result: HealthCheckResult);
}

#[async_trait]
impl HealthSubscriber for tokio::sync::mpsc::UnboundedSender<HealthCheckResult> {
    async fn on_result(&self, result: HealthCheckResult) {
        let _ = self.send(result);
    }
}

pub struct WatchHandle {
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl WatchHandle {
    /// Stops the watch and waits for the loop to exit.
    pub async fn cancel(self) {
        let _ = self.cancel_tx.send(true);
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::runtime::{HostStatus, MockEnvironmentRuntime};

    fn monitor(probe: Arc<MockHealthProbe>) -> HealthMonitor {
        HealthMonitor::new(probe, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_counter_resets_on_healthy() {
        let probe = Arc::new(MockHealthProbe::new());
        probe.push(
            Color::A,
            &[
                HealthOutcome::Unhealthy,
                HealthOutcome::Unhealthy,
                HealthOutcome::Healthy,
                HealthOutcome::Unhealthy,
            ],
        );
        let monitor = monitor(probe);

        assert_eq!(monitor.check(Color::A).await.consecutive_failures, 1);
        assert_eq!(monitor.check(Color::A).await.consecutive_failures, 2);
        assert_eq!(monitor.check(Color::A).await.consecutive_failures, 0);
        assert_eq!(monitor.check(Color::A).await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_unknown_leaves_counter_unchanged() {
        let probe = Arc::new(MockHealthProbe::new());
        probe.push(Color::B, &[HealthOutcome::Unhealthy, HealthOutcome::Unknown, HealthOutcome::Unhealthy]);
        let monitor = monitor(probe);

        monitor.check(Color::B).await;
        assert_eq!(monitor.check(Color::B).await.consecutive_failures, 1);
        assert_eq!(monitor.check(Color::B).await.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_probe_timeout_is_unhealthy() {
        let probe = Arc::new(MockHealthProbe::new().with_delay(Duration::from_millis(500)));
        let monitor = HealthMonitor::new(probe, Duration::from_millis(20));

        let result = monitor.check(Color::A).await;
        assert_eq!(result.outcome, HealthOutcome::Unhealthy);
        assert!(result.detail.contains("timed out"));
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_newest_first() {
        let probe = Arc::new(MockHealthProbe::new());
        let monitor = monitor(probe);
        for _ in 0..(HISTORY_LIMIT + 5) {
            monitor.check(Color::A).await;
        }
        let history = monitor.history(Color::A);
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert!(history[0].timestamp >= history[1].timestamp);
        assert!(monitor.history(Color::B).is_empty());
    }

    #[test]
    fn test_classify_response() {
        assert_eq!(classify_response(503, b"").outcome, HealthOutcome::Unhealthy);
        assert_eq!(classify_response(200, br#"{"status":"ok"}"#).outcome, HealthOutcome::Healthy);
        assert_eq!(classify_response(200, br#"{"status":"degraded"}"#).outcome, HealthOutcome::Unhealthy);
        assert_eq!(classify_response(200, br#"{"ready":false}"#).outcome, HealthOutcome::Unhealthy);
        assert_eq!(classify_response(204, b"").outcome, HealthOutcome::Healthy);
        assert_eq!(classify_response(200, b"pong").outcome, HealthOutcome::Healthy);
    }

    #[tokio::test]
    async fn test_composite_reports_worst_outcome() {
        let healthy = Arc::new(MockHealthProbe::new().always(Color::A, HealthOutcome::Healthy));
        let unknown = Arc::new(MockHealthProbe::new().always(Color::A, HealthOutcome::Unknown));
        let unhealthy = Arc::new(MockHealthProbe::new().always(Color::A, HealthOutcome::Unhealthy));

        let composite = CompositeProbe::new(vec![healthy.clone(), unknown.clone()]);
        assert_eq!(composite.probe(Color::A).await.outcome, HealthOutcome::Unknown);

        let composite = CompositeProbe::new(vec![healthy, unknown, unhealthy]);
        assert_eq!(composite.probe(Color::A).await.outcome, HealthOutcome::Unhealthy);
    }

    #[tokio::test]
    async fn test_host_count_probe() {
        let runtime = Arc::new(MockEnvironmentRuntime::new());
        runtime.set_host_status(Color::A, HostStatus { running: 1, failed_exits: 0 });
        runtime.set_host_status(Color::B, HostStatus { running: 2, failed_exits: 1 });
        let probe = HostCountProbe::new(runtime, 2);

        assert_eq!(probe.probe(Color::A).await.outcome, HealthOutcome::Unhealthy);
        assert_eq!(probe.probe(Color::B).await.outcome, HealthOutcome::Unhealthy);
    }

    #[tokio::test]
    async fn test_watch_delivers_until_cancelled() {
        let probe = Arc::new(MockHealthProbe::new());
        let monitor = Arc::new(monitor(probe.clone()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = monitor.watch(WatchTarget::Fixed(Color::A), Duration::from_millis(5), Arc::new(tx));
        for _ in 0..3 {
            let result = rx.recv().await.unwrap();
            assert_eq!(result.target, Color::A);
        }
        handle.cancel().await;

        let calls = probe.calls(Color::A);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(probe.calls(Color::A), calls);
    }
}
