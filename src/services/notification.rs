use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    /// Component that raised the alert (`deployment`, `backup`, `failover`, ...).
    pub source: String,
    pub title: String,
    pub message: String,
    /// Alerts sharing a key are delivered once.
    pub dedup_key: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub metadata: HashMap<String, String>,
}

impl Alert {
    pub fn new(
        severity: AlertSeverity,
        source: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            severity,
            source: source.into(),
            title: title.into(),
            message: message.into(),
            dedup_key: id.to_string(),
            timestamp: chrono::Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn info(source: &str, title: &str, message: impl Into<String>) -> Self {
        Self::new(AlertSeverity::Info, source, title, message)
    }

    pub fn warning(source: &str, title: &str, message: impl Into<String>) -> Self {
        Self::new(AlertSeverity::Warning, source, title, message)
    }

    pub fn critical(source: &str, title: &str, message: impl Into<String>) -> Self {
        Self::new(AlertSeverity::Critical, source, title, message)
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = key.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<()>;
    fn sink_id(&self) -> String;
}

/// Insertion-ordered key set that forgets its oldest keys beyond
/// `capacity`.
#[derive(Debug)]
pub struct RecentKeys {
    capacity: usize,
    order: VecDeque<String>,
    keys: HashSet<String>,
}

impl RecentKeys {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            keys: HashSet::new(),
        }
    }

    /// Returns `false` when `key` is already remembered.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        self.keys.insert(key.to_string());
        self.order.push_back(key.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Dedup keys remembered by an [`AlertChannel`].
pub const MAX_DEDUP_KEYS: usize = 10_000;

/// Fan-out alerting channel.
///
/// Every registered sink sees each alert once. A repeated `dedup_key` is
/// dropped, and a failing sink is logged without affecting the others.
pub struct AlertChannel {
    sinks: Vec<Arc<dyn AlertSink>>,
    delivered_keys: Mutex<RecentKeys>,
    history: RwLock<VecDeque<Alert>>,
    max_history_size: usize,
}

impl AlertChannel {
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            delivered_keys: Mutex::new(RecentKeys::new(MAX_DEDUP_KEYS)),
            history: RwLock::new(VecDeque::new()),
            max_history_size: 500,
        }
    }

    pub fn with_max_history_size(mut self, size: usize) -> Self {
        self.max_history_size = size;
        self
    }

    pub fn subscribe(&mut self, sink: Arc<dyn AlertSink>) {
        tracing::info!(sink = %sink.sink_id(), "Registering alert sink");
        self.sinks.push(sink);
    }

    /// Delivers the alert to every sink. Returns `false` when the alert was a
    /// duplicate and nothing was delivered.
    pub async fn raise(&self, alert: Alert) -> bool {
        let fresh = match self.delivered_keys.lock() {
            Ok(mut keys) => keys.insert(&alert.dedup_key),
            Err(_) => true,
        };

        if !fresh {
            tracing::debug!(dedup_key = %alert.dedup_key, "Dropping duplicate alert");
            return false;
        }

        self.store_in_history(alert.clone());

        for sink in &self.sinks {
            if let Err(e) = sink.deliver(&alert).await {
                tracing::error!(
                    sink = %sink.sink_id(),
                    alert_id = %alert.id,
                    error = %e,
                    "Alert sink failed to deliver alert"
                );
            }
        }

        true
    }

    pub fn history(&self, limit: Option<usize>) -> Vec<Alert> {
        if let Ok(history) = self.history.read() {
            let limit = limit.unwrap_or(history.len());
            history.iter().rev().take(limit).cloned().collect()
        } else {
            Vec::new()
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    fn store_in_history(&self, alert: Alert) {
        if let Ok(mut history) = self.history.write() {
            history.push_back(alert);
            while history.len() > self.max_history_size {
                history.pop_front();
            }
        }
    }
}

impl Default for AlertChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes alerts to the structured log at a level matching their severity.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Info => tracing::info!(
                source = %alert.source,
                dedup_key = %alert.dedup_key,
                "{}: {}", alert.title, alert.message
            ),
            AlertSeverity::Warning => tracing::warn!(
                source = %alert.source,
                dedup_key = %alert.dedup_key,
                "{}: {}", alert.title, alert.message
            ),
            AlertSeverity::Critical => tracing::error!(
                source = %alert.source,
                dedup_key = %alert.dedup_key,
                "{}: {}", alert.title, alert.message
            ),
        }
        Ok(())
    }

    fn sink_id(&self) -> String {
        "log".to_string()
    }
}

/// POSTs the alert as JSON to an HTTP endpoint.
pub struct WebhookAlertSink {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl WebhookAlertSink {
    pub fn new(endpoint: url::Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigurationError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(alert)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ExternalServiceError(format!(
                "Alert webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn sink_id(&self) -> String {
        format!("webhook:{}", self.endpoint.host_str().unwrap_or("unknown"))
    }
}

/// Records alerts in memory.
#[derive(Default)]
pub struct MockAlertSink {
    alerts: Mutex<Vec<Alert>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MockAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn count_by_severity(&self, severity: AlertSeverity) -> usize {
        self.alerts().iter().filter(|a| a.severity == severity).count()
    }
}

#[async_trait]
impl AlertSink for MockAlertSink {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert.clone());
        }
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AppError::ExternalServiceError("mock sink failure".to_string()));
        }
        Ok(())
    }

    fn sink_id(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_keys_are_delivered_once() {
        let sink = Arc::new(MockAlertSink::new());
        let mut channel = AlertChannel::new();
        channel.subscribe(sink.clone());

        let first = Alert::critical("deployment", "Deployment failed", "boom").with_dedup_key("attempt-1");
        let second = Alert::critical("deployment", "Deployment failed", "boom again").with_dedup_key("attempt-1");

        assert!(channel.raise(first).await);
        assert!(!channel.raise(second).await);
        assert_eq!(sink.alerts().len(), 1);
    }

    #[test]
    fn test_recent_keys_forget_oldest_beyond_capacity() {
        let mut keys = RecentKeys::new(2);
        assert!(keys.insert("a"));
        assert!(keys.insert("b"));
        assert!(!keys.insert("a"));
        assert!(keys.insert("c"));

        assert_eq!(keys.len(), 2);
        assert!(keys.insert("a"));
        assert!(!keys.insert("c"));
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let broken = Arc::new(MockAlertSink::new());
        broken.set_failing(true);
        let healthy = Arc::new(MockAlertSink::new());

        let mut channel = AlertChannel::new();
        channel.subscribe(broken.clone());
        channel.subscribe(healthy.clone());

        assert!(channel.raise(Alert::warning("backup", "Replication degraded", "primary only")).await);
        assert_eq!(healthy.alerts().len(), 1);
        assert_eq!(channel.history(None).len(), 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let channel = AlertChannel::new().with_max_history_size(2);
        for i in 0..5 {
            channel.raise(Alert::info("test", "tick", format!("{}", i))).await;
        }
        let history = channel.history(None);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "4");
    }
}
