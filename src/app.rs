//! Builds the production object graph from an [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backup::{
    BackupCatalog, BackupConfig, BackupManager, ComponentKind, DirectoryComponent, LocalObjectStore, ObjectStore,
    PostgresComponent, RedisComponent, RestoreManager, RetentionPolicy, StateComponent,
};
use crate::config::AppConfig;
use crate::deployment::{
    CommandReplicaPromoter, CompositeProbe, DeploymentConfig, DeploymentController, DockerComposeRuntime,
    EnvironmentRuntime, FailoverConfig, FailoverController, FailoverEventLog, HAProxyAdapter, HealthMonitor,
    HealthProbe, HostCountProbe, HttpReadinessProbe, LoadBalancedTrafficRouter, LogOnlyRegionRouter, RegionRouter,
    ReplicaPromoter, SpoolAlarmFeed, TrafficRouter, WebhookRegionRouter,
};
use crate::error::{AppError, Result, RetryPolicy};
use crate::services::encryption::ArchiveCipher;
use crate::services::notification::{AlertChannel, LogAlertSink, WebhookAlertSink};
use crate::state::{AttemptLedger, EnvironmentStateStore};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const COMPONENT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const BACKUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const WEEKLY_EVERY: u32 = 7;

/// Long-lived collaborators shared by every command.
pub struct App {
    pub config: AppConfig,
    pub store: EnvironmentStateStore,
    pub alerts: Arc<AlertChannel>,
    pub runtime: Arc<dyn EnvironmentRuntime>,
    pub monitor: Arc<HealthMonitor>,
    pub backups: Arc<BackupManager>,
    pub restores: Arc<RestoreManager>,
    pub deployments: Arc<DeploymentController>,
    pub failover: Arc<FailoverController>,
}

impl App {
    pub async fn build(config: AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.state_dir).await?;
        let store = EnvironmentStateStore::open(&config.state_dir).await?;
        let ledger = Arc::new(AttemptLedger::new(&config.state_dir));

        let mut alerts = AlertChannel::new();
        alerts.subscribe(Arc::new(LogAlertSink));
        if let Some(url) = &config.alert_webhook {
            alerts.subscribe(Arc::new(WebhookAlertSink::new(url.clone(), Duration::from_secs(10))?));
        }
        let alerts = Arc::new(alerts);

        let runtime: Arc<dyn EnvironmentRuntime> = Arc::new(
            DockerComposeRuntime::new(config.runtime.compose_file.clone(), config.runtime.project_prefix.clone())
                .with_migrations(config.runtime.migrate_service.clone(), config.runtime.migrate_command.clone())
                .with_timeouts(config.deployment.provision_timeout, COMMAND_TIMEOUT),
        );

        let probe: Arc<dyn HealthProbe> = Arc::new(CompositeProbe::new(vec![
            Arc::new(HttpReadinessProbe::new(config.health.urls.clone(), config.health.timeout)?) as Arc<dyn HealthProbe>,
            Arc::new(HostCountProbe::new(runtime.clone(), config.health.min_hosts)) as Arc<dyn HealthProbe>,
        ]));
        let monitor = Arc::new(HealthMonitor::new(probe, config.health.timeout));

        let router: Arc<dyn TrafficRouter> = Arc::new(LoadBalancedTrafficRouter::new(
            Arc::new(HAProxyAdapter::new(
                config.runtime.haproxy_socket.clone(),
                config.runtime.haproxy_backend.clone(),
            )),
            config.runtime.haproxy_servers.clone(),
            config.deployment.routing_timeout,
        ));

        let backups = Arc::new(Self::build_backups(&config, alerts.clone()).await?);
        let restores = Arc::new(RestoreManager::new(backups.clone(), alerts.clone()));

        let deployments = Arc::new(DeploymentController::new(
            store.clone(),
            ledger,
            runtime.clone(),
            router,
            monitor.clone(),
            backups.clone(),
            restores.clone(),
            alerts.clone(),
            DeploymentConfig {
                health_attempts: config.health.attempts,
                health_interval: config.health.interval,
                healthy_threshold: config.health.healthy_threshold,
                drain_grace: config.deployment.drain_grace,
                drain_poll: Duration::from_secs(1),
                provision_timeout: config.deployment.provision_timeout,
            },
        ));

        let failover = Arc::new(Self::build_failover(&config, alerts.clone())?);

        Ok(Self {
            config,
            store,
            alerts,
            runtime,
            monitor,
            backups,
            restores,
            deployments,
            failover,
        })
    }

    async fn build_backups(config: &AppConfig, alerts: Arc<AlertChannel>) -> Result<BackupManager> {
        let settings = &config.backup;
        tokio::fs::create_dir_all(&settings.dir).await?;
        let primary: Arc<dyn ObjectStore> =
            Arc::new(LocalObjectStore::new(settings.dir.join("objects"), settings.region.clone()));
        let replica: Option<Arc<dyn ObjectStore>> = match &settings.replica {
            Some((dir, region)) => {
                tokio::fs::create_dir_all(dir).await?;
                Some(Arc::new(LocalObjectStore::new(dir.clone(), region.clone())))
            }
            None => None,
        };
        tokio::fs::create_dir_all(settings.dir.join("objects")).await?;

        let components = &config.components;
        let mut parts: Vec<Arc<dyn StateComponent>> = vec![
            Arc::new(PostgresComponent::new(
                components.database_url.clone(),
                components.pg_dump_bin.clone(),
                components.pg_restore_bin.clone(),
                COMPONENT_TIMEOUT,
            )) as Arc<dyn StateComponent>,
            Arc::new(DirectoryComponent::new(ComponentKind::FileStore, components.file_store_path.clone())),
            Arc::new(DirectoryComponent::new(ComponentKind::Configuration, components.config_path.clone())),
        ];
        if let Some(redis_url) = &components.redis_url {
            parts.push(Arc::new(RedisComponent::new(
                redis_url.clone(),
                components.redis_dump_path.clone(),
                COMPONENT_TIMEOUT,
            )));
        }

        let backup_config = BackupConfig {
            retention: RetentionPolicy::with_overrides(settings.daily_retention_days, settings.weekly_retention_days)?,
            replication_timeout: settings.replication_timeout,
            ..BackupConfig::default()
        };

        Ok(BackupManager::new(
            primary,
            replica,
            BackupCatalog::new(settings.dir.join("catalog")),
            ArchiveCipher::new(settings.encryption_key.expose())?,
            parts,
            alerts,
            config.state_dir.join("locks"),
            backup_config,
        ))
    }

    fn build_failover(config: &AppConfig, alerts: Arc<AlertChannel>) -> Result<FailoverController> {
        let settings = &config.failover;
        let promoter: Arc<dyn ReplicaPromoter> = match &settings.promote_command {
            Some(command) => Arc::new(CommandReplicaPromoter::new(command.clone())),
            None => {
                debug!("FAILOVER_PROMOTE_COMMAND not set; failover will fail fast");
                Arc::new(UnconfiguredPromoter)
            }
        };
        let router: Arc<dyn RegionRouter> = match &settings.dns_webhook {
            Some(url) => Arc::new(WebhookRegionRouter::new(url.clone(), Duration::from_secs(15))?),
            None => Arc::new(LogOnlyRegionRouter),
        };

        Ok(FailoverController::new(
            FailoverConfig {
                threshold: settings.threshold,
                window: settings.window,
                promotion_timeout: settings.promotion_timeout,
                secondary_region: settings.secondary_region.clone(),
                replica_id: settings.replica_id.clone(),
                router_retry: RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(10)),
            },
            promoter,
            router,
            FailoverEventLog::new(&config.state_dir),
            alerts,
        ))
    }

    pub fn alarm_feed(&self) -> SpoolAlarmFeed {
        SpoolAlarmFeed::new(self.config.state_dir.join("alarms"))
    }

    /// Starts the backup schedule and the failover loop. Both stop when
    /// `shutdown` flips to true.
    pub fn spawn_daemon(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let backups = self.backups.clone();
        let store = self.store.clone();
        let backup_shutdown = shutdown.clone();
        let schedule = tokio::spawn(async move {
            backups
                .run_schedule(store, BACKUP_INTERVAL, WEEKLY_EVERY, backup_shutdown)
                .await
        });

        let failover = self.failover.clone().run(
            self.monitor.clone(),
            self.store.clone(),
            self.config.failover.interval,
            Some(self.alarm_feed()),
            shutdown,
        );
        let watcher = tokio::spawn(failover);

        info!(state_dir = %self.config.state_dir.display(), "Daemon loops started");
        vec![schedule, watcher]
    }
}

/// Stands in when no promotion command is configured.
struct UnconfiguredPromoter;

#[async_trait::async_trait]
impl ReplicaPromoter for UnconfiguredPromoter {
    async fn promote(&self, _replica_id: &str) -> Result<()> {
        Err(AppError::ConfigurationError(
            "FAILOVER_PROMOTE_COMMAND is not set".to_string(),
        ))
    }
}
