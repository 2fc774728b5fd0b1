use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backup::archive::{self, ArchiveContents, BackupManifest, ManifestEntry};
use crate::backup::components::StateComponent;
use crate::backup::retention::{RetentionClass, RetentionPolicy};
use crate::backup::storage::{BackupCatalog, CatalogEntry, ObjectStore};
use crate::backup::{object_key, BackupArtifact, ComponentKind, ReplicationRecord, ReplicationStatus};
use crate::deployment::environment::Color;
use crate::error::{AppError, Result, RetryPolicy};
use crate::services::encryption::ArchiveCipher;
use crate::services::notification::{Alert, AlertChannel};
use crate::state::{AdvisoryLock, EnvironmentStateStore};

const SOURCE: &str = "backup";

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub retention: RetentionPolicy,
    pub replication_timeout: Duration,
    /// How long to wait for a concurrent backup or restore on the same
    /// environment before giving up.
    pub lock_wait: Duration,
    pub storage_retry: RetryPolicy,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            replication_timeout: Duration::from_secs(300),
            lock_wait: Duration::from_secs(5),
            storage_retry: RetryPolicy::exponential(3, Duration::from_millis(500), Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub deleted: Vec<Uuid>,
    pub retained: usize,
    /// Expired artifacts kept because they are the newest.
    pub protected: Vec<Uuid>,
}

pub struct BackupManager {
    primary: Arc<dyn ObjectStore>,
    replica: Option<Arc<dyn ObjectStore>>,
    catalog: BackupCatalog,
    cipher: ArchiveCipher,
    components: BTreeMap<ComponentKind, Arc<dyn StateComponent>>,
    alerts: Arc<AlertChannel>,
    lock_dir: PathBuf,
    config: BackupConfig,
    replication_tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl BackupManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        primary: Arc<dyn ObjectStore>,
        replica: Option<Arc<dyn ObjectStore>>,
        catalog: BackupCatalog,
        cipher: ArchiveCipher,
        components: Vec<Arc<dyn StateComponent>>,
        alerts: Arc<AlertChannel>,
        lock_dir: PathBuf,
        config: BackupConfig,
    ) -> Self {
        let components = components.into_iter().map(|c| (c.kind(), c)).collect();
        Self {
            primary,
            replica,
            catalog,
            cipher,
            components,
            alerts,
            lock_dir,
            config,
            replication_tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn component(&self, kind: ComponentKind) -> Option<Arc<dyn StateComponent>> {
        self.components.get(&kind).cloned()
    }

    pub fn cipher(&self) -> &ArchiveCipher {
        &self.cipher
    }

    pub fn lock_dir(&self) -> &std::path::Path {
        &self.lock_dir
    }

    pub fn catalog(&self) -> &BackupCatalog {
        &self.catalog
    }

    /// Snapshots every component of `source` into one sealed archive.
    ///
    /// A component failure records a truncated manifest and fails the backup.
    /// Replication runs in the background and can only downgrade the
    /// artifact to primary-only.
    pub async fn create_backup(&self, source: Color, class: RetentionClass) -> Result<BackupArtifact> {
        let _lock = AdvisoryLock::acquire(&self.lock_dir, &env_lock_name(source), self.config.lock_wait).await?;

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let mut manifest = BackupManifest::new(id, source, created_at);
        let mut blobs = BTreeMap::new();

        info!(artifact_id = %id, source = %source, class = %class, "Starting backup");

        for kind in ComponentKind::SNAPSHOT_ORDER {
            match self.snapshot_component(kind, source).await {
                Ok(Some(bytes)) => {
                    manifest.entries.push(ManifestEntry::for_bytes(kind, &bytes));
                    blobs.insert(kind, bytes);
                }
                Ok(None) => {
                    warn!(artifact_id = %id, component = %kind, "Optional component absent, not included");
                }
                Err(e) => {
                    manifest.failed_component = Some(kind);
                    manifest.error = Some(e.to_string());
                    return Err(self.abort_backup(manifest, class, e).await);
                }
            }
        }
        manifest.complete = true;

        let contents = ArchiveContents { manifest: manifest.clone(), blobs };
        let cipher = self.cipher.clone();
        let sealed = tokio::task::spawn_blocking(move || archive::seal(&contents, &cipher)).await??;
        let size_bytes = sealed.len() as u64;
        let key = object_key(id);

        let primary = self.primary.clone();
        let primary_location = match self
            .config
            .storage_retry
            .execute("primary archive write", || {
                let primary = primary.clone();
                let key = key.clone();
                let bytes = sealed.clone();
                async move { primary.put(&key, bytes).await }
            })
            .await
        {
            Ok(location) => location,
            Err(e) => {
                manifest.complete = false;
                manifest.error = Some(format!("primary write failed: {}", e));
                return Err(self.abort_backup(manifest, class, e).await);
            }
        };

        let artifact = BackupArtifact {
            id,
            created_at,
            source,
            manifest,
            primary: Some(primary_location),
            key_ref: self.cipher.key_ref().to_string(),
            retention_class: class,
            expires_at: self.config.retention.expiry_for(class, created_at),
            size_bytes,
        };
        self.catalog.save(&artifact).await?;

        match &self.replica {
            Some(replica) => {
                self.catalog
                    .set_replication(id, &ReplicationRecord::new(ReplicationStatus::Pending))
                    .await?;
                self.spawn_replication(id, key, sealed, replica.clone());
            }
            None => {
                self.catalog
                    .set_replication(id, &ReplicationRecord::new(ReplicationStatus::PrimaryOnly))
                    .await?;
            }
        }

        info!(
            artifact_id = %id,
            source = %source,
            size_bytes,
            expires_at = %artifact.expires_at,
            "Backup written to primary storage"
        );
        self.alerts
            .raise(
                Alert::info(SOURCE, "Backup created", format!("{} backup {} of {}", class, id, source))
                    .with_dedup_key(format!("backup:{}:created", id)),
            )
            .await;

        Ok(artifact)
    }

    async fn snapshot_component(&self, kind: ComponentKind, source: Color) -> Result<Option<Vec<u8>>> {
        let Some(component) = self.components.get(&kind) else {
            if kind.is_optional() {
                return Ok(None);
            }
            return Err(AppError::ConfigurationError(format!("no {} component configured", kind)));
        };

        match component.snapshot(source).await? {
            Some(bytes) => Ok(Some(bytes)),
            None if kind.is_optional() => Ok(None),
            None => Err(AppError::BackupFailure(format!("{} produced no snapshot", kind))),
        }
    }

    /// Persists the truncated manifest so the failure is visible in the
    /// catalog, then alerts once.
    async fn abort_backup(&self, manifest: BackupManifest, class: RetentionClass, cause: AppError) -> AppError {
        let id = manifest.artifact_id;
        let failed = manifest
            .failed_component
            .map(|k| k.to_string())
            .unwrap_or_else(|| "storage".to_string());
        error!(artifact_id = %id, component = %failed, error = %cause, "Backup aborted");

        let record = BackupArtifact {
            id,
            created_at: manifest.created_at,
            source: manifest.source,
            primary: None,
            key_ref: self.cipher.key_ref().to_string(),
            retention_class: class,
            expires_at: self.config.retention.expiry_for(class, manifest.created_at),
            size_bytes: 0,
            manifest,
        };
        if let Err(e) = self.catalog.save(&record).await {
            warn!(artifact_id = %id, error = %e, "Could not record truncated manifest");
        }

        self.alerts
            .raise(
                Alert::critical(SOURCE, "Backup failed", format!("backup {} failed at {}: {}", id, failed, cause))
                    .with_dedup_key(format!("backup:{}:failed", id)),
            )
            .await;

        match cause {
            AppError::BackupFailure(_) | AppError::PreconditionError(_) | AppError::ConfigurationError(_) => cause,
            other => AppError::BackupFailure(format!("{} failed: {}", failed, other)),
        }
    }

    fn spawn_replication(&self, id: Uuid, key: String, sealed: Vec<u8>, replica: Arc<dyn ObjectStore>) {
        let catalog = self.catalog.clone();
        let alerts = self.alerts.clone();
        let timeout = self.config.replication_timeout;

        let handle = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, replica.put(&key, sealed)).await {
                Ok(Ok(location)) => Ok(location),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("replication exceeded {:?}", timeout)),
            };

            let mut record = ReplicationRecord::new(ReplicationStatus::Replicated);
            match outcome {
                Ok(location) => {
                    info!(artifact_id = %id, region = %location.region, "Backup replicated");
                    record.replica = Some(location);
                }
                Err(reason) => {
                    warn!(artifact_id = %id, region = %replica.region(), error = %reason, "Replication failed, artifact is primary-only");
                    record.status = ReplicationStatus::PrimaryOnly;
                    record.error = Some(reason.clone());
                    alerts
                        .raise(
                            Alert::warning(
                                SOURCE,
                                "Backup replication failed",
                                format!("backup {} is primary-only: {}", id, reason),
                            )
                            .with_dedup_key(format!("backup:{}:replication", id)),
                        )
                        .await;
                }
            }

            if let Err(e) = catalog.set_replication(id, &record).await {
                error!(artifact_id = %id, error = %e, "Failed to record replication status");
            }
        });

        if let Ok(mut tasks) = self.replication_tasks.lock() {
            tasks.retain(|_, h| !h.is_finished());
            tasks.insert(id, handle);
        }
    }

    /// Waits for the background replication of `id`, if one is running, and
    /// returns the recorded status.
    pub async fn await_replication(&self, id: Uuid) -> Result<ReplicationRecord> {
        let handle = self.replication_tasks.lock().ok().and_then(|mut t| t.remove(&id));
        if let Some(handle) = handle {
            handle.await?;
        }
        self.catalog.replication(id).await
    }

    /// Waits for every outstanding replication.
    pub async fn await_all_replication(&self) {
        let handles: Vec<_> = self
            .replication_tasks
            .lock()
            .map(|mut t| t.drain().map(|(_, h)| h).collect())
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub async fn prune(&self) -> Result<PruneReport> {
        self.prune_at(Utc::now()).await
    }

    /// Deletes artifacts whose expiry is at or before `now`. The newest
    /// artifact and the newest restorable artifact always survive.
    pub async fn prune_at(&self, now: DateTime<Utc>) -> Result<PruneReport> {
        let entries = self.catalog.list().await?;
        let newest = entries.first().map(|e| e.artifact.id);
        let newest_restorable = entries
            .iter()
            .find(|e| e.artifact.is_restorable())
            .map(|e| e.artifact.id);

        let mut report = PruneReport::default();
        for entry in &entries {
            let artifact = &entry.artifact;
            if artifact.expires_at > now {
                report.retained += 1;
                continue;
            }
            if Some(artifact.id) == newest || Some(artifact.id) == newest_restorable {
                debug!(artifact_id = %artifact.id, "Keeping expired artifact as the most recent restore point");
                report.protected.push(artifact.id);
                report.retained += 1;
                continue;
            }

            self.delete_artifact(entry).await?;
            info!(artifact_id = %artifact.id, expired_at = %artifact.expires_at, "Pruned expired backup");
            report.deleted.push(artifact.id);
        }

        Ok(report)
    }

    async fn delete_artifact(&self, entry: &CatalogEntry) -> Result<()> {
        let key = entry.artifact.object_key();
        if entry.artifact.primary.is_some() {
            self.primary.delete(&key).await?;
        }
        if entry.replication.status == ReplicationStatus::Replicated {
            if let Some(replica) = &self.replica {
                replica.delete(&key).await?;
            }
        }
        self.catalog.delete(entry.artifact.id).await
    }

    /// Newest first.
    pub async fn list(&self) -> Result<Vec<CatalogEntry>> {
        self.catalog.list().await
    }

    pub async fn get(&self, id: Uuid) -> Result<BackupArtifact> {
        self.catalog.load(id).await
    }

    /// The newest artifact that can be restored.
    pub async fn latest(&self) -> Result<Option<BackupArtifact>> {
        Ok(self
            .catalog
            .list()
            .await?
            .into_iter()
            .map(|e| e.artifact)
            .find(BackupArtifact::is_restorable))
    }

    /// Fetches the sealed archive, falling back to the replica when the
    /// primary copy cannot be read.
    pub async fn load_archive(&self, artifact: &BackupArtifact) -> Result<Vec<u8>> {
        let key = artifact.object_key();
        let primary = self.primary.clone();
        let primary_result = self
            .config
            .storage_retry
            .execute("primary archive read", || {
                let primary = primary.clone();
                let key = key.clone();
                async move { primary.get(&key).await }
            })
            .await;

        let primary_err = match primary_result {
            Ok(bytes) => return Ok(bytes),
            Err(e) => e,
        };

        let replication = self.catalog.replication(artifact.id).await?;
        match (&self.replica, replication.status) {
            (Some(replica), ReplicationStatus::Replicated) => {
                warn!(artifact_id = %artifact.id, error = %primary_err, "Primary archive unavailable, reading replica");
                replica.get(&key).await
            }
            _ => Err(primary_err),
        }
    }

    /// Daily backup loop. Every `weekly_every`-th run is `weekly`; each run
    /// is followed by a prune. Backs up the live color, or `A` before the
    /// first deploy.
    pub async fn run_schedule(
        &self,
        state: EnvironmentStateStore,
        interval: Duration,
        weekly_every: u32,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        let mut runs: u32 = 0;

        info!(interval_secs = interval.as_secs(), "Backup schedule started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    runs = runs.wrapping_add(1);
                    let class = if weekly_every > 0 && runs % weekly_every == 0 {
                        RetentionClass::Weekly
                    } else {
                        RetentionClass::Daily
                    };

                    let source = match state.load().await.and_then(|r| r.live_color()) {
                        Ok(color) => color.unwrap_or(Color::A),
                        Err(e) => {
                            error!(error = %e, "Scheduled backup skipped, environment state unreadable");
                            continue;
                        }
                    };

                    if let Err(e) = self.create_backup(source, class).await {
                        error!(error = %e, "Scheduled backup failed");
                    }
                    match self.prune().await {
                        Ok(report) => info!(deleted = report.deleted.len(), retained = report.retained, "Scheduled prune finished"),
                        Err(e) => error!(error = %e, "Scheduled prune failed"),
                    }
                }
            }
        }
        info!("Backup schedule stopped");
    }
}

pub(crate) fn env_lock_name(color: Color) -> String {
    format!("env-{}", color)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::components::MockComponent;
    use crate::backup::storage::MockObjectStore;
    use crate::services::notification::{AlertSeverity, MockAlertSink};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        manager: BackupManager,
        primary: Arc<MockObjectStore>,
        replica: Arc<MockObjectStore>,
        cache: Arc<MockComponent>,
        database: Arc<MockComponent>,
        sink: Arc<MockAlertSink>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let primary = Arc::new(MockObjectStore::new("primary"));
        let replica = Arc::new(MockObjectStore::new("secondary"));
        let database = Arc::new(MockComponent::new(ComponentKind::Database, Some(b"db".to_vec())));
        let cache = Arc::new(MockComponent::new(ComponentKind::Cache, Some(b"rdb".to_vec())));
        let files = Arc::new(MockComponent::new(ComponentKind::FileStore, Some(b"files".to_vec())));
        let config = Arc::new(MockComponent::new(ComponentKind::Configuration, Some(b"cfg".to_vec())));
        let sink = Arc::new(MockAlertSink::new());
        let mut channel = AlertChannel::new();
        channel.subscribe(sink.clone());

        let manager = BackupManager::new(
            primary.clone(),
            Some(replica.clone()),
            BackupCatalog::new(dir.path().join("catalog")),
            ArchiveCipher::new(&ArchiveCipher::generate_key()).unwrap(),
            vec![database.clone(), cache.clone(), files, config],
            Arc::new(channel),
            dir.path().join("locks"),
            BackupConfig {
                storage_retry: RetryPolicy::fixed(2, Duration::from_millis(1)),
                replication_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );

        Fixture { _dir: dir, manager, primary, replica, cache, database, sink }
    }

    #[tokio::test]
    async fn test_backup_is_stored_and_replicated() {
        let f = fixture();
        let artifact = f.manager.create_backup(Color::A, RetentionClass::Daily).await.unwrap();

        assert!(artifact.manifest.complete);
        assert_eq!(artifact.manifest.entries.len(), 4);
        assert!(f.primary.contains(&artifact.object_key()));

        let replication = f.manager.await_replication(artifact.id).await.unwrap();
        assert_eq!(replication.status, ReplicationStatus::Replicated);
        assert!(f.replica.contains(&artifact.object_key()));
    }

    #[tokio::test]
    async fn test_replication_failure_degrades_to_primary_only() {
        let f = fixture();
        f.replica.set_fail_puts(true);

        let artifact = f.manager.create_backup(Color::A, RetentionClass::Weekly).await.unwrap();
        let replication = f.manager.await_replication(artifact.id).await.unwrap();

        assert_eq!(replication.status, ReplicationStatus::PrimaryOnly);
        assert!(replication.error.is_some());
        assert_eq!(f.sink.count_by_severity(AlertSeverity::Warning), 1);
        assert_eq!(f.manager.get(artifact.id).await.unwrap(), artifact);
    }

    #[tokio::test]
    async fn test_slow_replication_times_out() {
        let f = fixture();
        f.replica.set_put_delay(Duration::from_secs(5));

        let artifact = f.manager.create_backup(Color::B, RetentionClass::Daily).await.unwrap();
        let replication = f.manager.await_replication(artifact.id).await.unwrap();
        assert_eq!(replication.status, ReplicationStatus::PrimaryOnly);
    }

    #[tokio::test]
    async fn test_component_failure_leaves_truncated_manifest() {
        let f = fixture();
        f.cache.set_fail_snapshot(true);

        let result = f.manager.create_backup(Color::A, RetentionClass::Daily).await;
        assert!(matches!(result, Err(AppError::BackupFailure(_))));
        assert!(f.primary.is_empty());

        let entries = f.manager.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        let manifest = &entries[0].artifact.manifest;
        assert!(!manifest.complete);
        assert_eq!(manifest.failed_component, Some(ComponentKind::Cache));
        assert_eq!(manifest.entries.len(), 1);
        assert!(f.manager.latest().await.unwrap().is_none());
        assert_eq!(f.sink.count_by_severity(AlertSeverity::Critical), 1);
    }

    #[tokio::test]
    async fn test_absent_cache_is_skipped() {
        let f = fixture();
        f.cache.set_data(None);

        let artifact = f.manager.create_backup(Color::A, RetentionClass::Daily).await.unwrap();
        assert!(artifact.manifest.complete);
        assert!(artifact.manifest.entry(ComponentKind::Cache).is_none());
    }

    #[tokio::test]
    async fn test_absent_database_fails_backup() {
        let f = fixture();
        f.database.set_data(None);

        let result = f.manager.create_backup(Color::A, RetentionClass::Daily).await;
        assert!(matches!(result, Err(AppError::BackupFailure(_))));
    }

    #[tokio::test]
    async fn test_primary_write_failure_fails_backup() {
        let f = fixture();
        f.primary.set_fail_puts(true);

        let result = f.manager.create_backup(Color::A, RetentionClass::Daily).await;
        assert!(matches!(result, Err(AppError::BackupFailure(_))));
        assert!(f.replica.is_empty());
    }

    #[tokio::test]
    async fn test_load_archive_falls_back_to_replica() {
        let f = fixture();
        let artifact = f.manager.create_backup(Color::A, RetentionClass::Daily).await.unwrap();
        f.manager.await_replication(artifact.id).await.unwrap();

        f.primary.set_fail_gets(true);
        let bytes = f.manager.load_archive(&artifact).await.unwrap();
        assert!(bytes.starts_with(archive::ARCHIVE_MAGIC));
    }

    #[tokio::test]
    async fn test_concurrent_backup_of_same_environment_is_rejected() {
        let f = fixture();
        let _held = AdvisoryLock::try_acquire(&f.manager.lock_dir, &env_lock_name(Color::A))
            .await
            .unwrap()
            .unwrap();

        let manager = BackupManager {
            config: BackupConfig {
                lock_wait: Duration::from_millis(20),
                ..f.manager.config.clone()
            },
            ..f.manager
        };
        let result = manager.create_backup(Color::A, RetentionClass::Daily).await;
        assert!(matches!(result, Err(AppError::PreconditionError(_))));
    }
}
