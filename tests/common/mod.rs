#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use switchyard::backup::{
    BackupCatalog, BackupConfig, BackupManager, ComponentKind, MockComponent, MockObjectStore, ObjectStore,
    RestoreManager, StateComponent,
};
use switchyard::deployment::{
    Color, DeploymentConfig, DeploymentController, EnvironmentRole, HealthMonitor, LoadBalancedTrafficRouter,
    MockEnvironmentRuntime, MockHealthProbe, MockLoadBalancerAdapter,
};
use switchyard::error::RetryPolicy;
use switchyard::services::encryption::ArchiveCipher;
use switchyard::services::notification::{AlertChannel, MockAlertSink};
use switchyard::state::{AttemptLedger, EnvironmentStateStore};

pub mod fixtures;

pub use fixtures::*;

pub const SERVER_A: &str = "app-a";
pub const SERVER_B: &str = "app-b";

/// Every collaborator of the controller, wired to in-memory adapters.
pub struct Harness {
    pub dir: TempDir,
    pub store: EnvironmentStateStore,
    pub ledger: Arc<AttemptLedger>,
    pub runtime: Arc<MockEnvironmentRuntime>,
    pub probe: Arc<MockHealthProbe>,
    pub lb: Arc<MockLoadBalancerAdapter>,
    pub router: Arc<LoadBalancedTrafficRouter>,
    pub monitor: Arc<HealthMonitor>,
    pub primary: Arc<MockObjectStore>,
    pub replica: Arc<MockObjectStore>,
    pub database: Arc<MockComponent>,
    pub cache: Arc<MockComponent>,
    pub file_store: Arc<MockComponent>,
    pub configuration: Arc<MockComponent>,
    pub backups: Arc<BackupManager>,
    pub restores: Arc<RestoreManager>,
    pub alerts: Arc<AlertChannel>,
    pub sink: Arc<MockAlertSink>,
    pub controller: Arc<DeploymentController>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(fast_deployment_config()).await
    }

    pub async fn with_config(config: DeploymentConfig) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store = EnvironmentStateStore::open(dir.path()).await.expect("state store");
        let ledger = Arc::new(AttemptLedger::new(dir.path()));

        let sink = Arc::new(MockAlertSink::new());
        let mut alerts = AlertChannel::new();
        alerts.subscribe(sink.clone());
        let alerts = Arc::new(alerts);

        let runtime = Arc::new(MockEnvironmentRuntime::new());
        let probe = Arc::new(MockHealthProbe::new());
        let monitor = Arc::new(HealthMonitor::new(probe.clone(), Duration::from_millis(200)));

        let lb = Arc::new(MockLoadBalancerAdapter::new());
        let mut servers = HashMap::new();
        servers.insert(Color::A, SERVER_A.to_string());
        servers.insert(Color::B, SERVER_B.to_string());
        let router = Arc::new(LoadBalancedTrafficRouter::new(lb.clone(), servers, Duration::from_secs(1)));

        let primary = Arc::new(MockObjectStore::new("primary"));
        let replica = Arc::new(MockObjectStore::new("secondary"));
        let database = Arc::new(MockComponent::new(ComponentKind::Database, Some(b"pg-dump-v1".to_vec())));
        let cache = Arc::new(MockComponent::new(ComponentKind::Cache, Some(b"redis-rdb".to_vec())));
        let file_store = Arc::new(MockComponent::new(ComponentKind::FileStore, Some(b"uploads-tree".to_vec())));
        let configuration = Arc::new(MockComponent::new(ComponentKind::Configuration, Some(b"app.toml".to_vec())));

        let components: Vec<Arc<dyn StateComponent>> = vec![
            database.clone() as Arc<dyn StateComponent>,
            cache.clone() as Arc<dyn StateComponent>,
            file_store.clone() as Arc<dyn StateComponent>,
            configuration.clone() as Arc<dyn StateComponent>,
        ];
        let backups = Arc::new(BackupManager::new(
            primary.clone() as Arc<dyn ObjectStore>,
            Some(replica.clone() as Arc<dyn ObjectStore>),
            BackupCatalog::new(dir.path().join("catalog")),
            ArchiveCipher::new(&ArchiveCipher::generate_key()).expect("cipher"),
            components,
            alerts.clone(),
            dir.path().join("locks"),
            BackupConfig {
                replication_timeout: Duration::from_secs(2),
                lock_wait: Duration::from_millis(500),
                storage_retry: RetryPolicy::fixed(2, Duration::from_millis(5)),
                ..BackupConfig::default()
            },
        ));
        let restores = Arc::new(
            RestoreManager::new(backups.clone(), alerts.clone())
                .with_retry(RetryPolicy::fixed(3, Duration::from_millis(5)))
                .with_lock_wait(Duration::from_millis(500)),
        );

        let controller = Arc::new(DeploymentController::new(
            store.clone(),
            ledger.clone(),
            runtime.clone(),
            router.clone(),
            monitor.clone(),
            backups.clone(),
            restores.clone(),
            alerts.clone(),
            config,
        ));

        Self {
            dir,
            store,
            ledger,
            runtime,
            probe,
            lb,
            router,
            monitor,
            primary,
            replica,
            database,
            cache,
            file_store,
            configuration,
            backups,
            restores,
            alerts,
            sink,
            controller,
        }
    }

    /// Marks `color` live on `build_ref` and routes traffic to it, as a
    /// finished earlier deploy would have.
    pub async fn seed_live(&self, color: Color, build_ref: &str) {
        let build = build_ref.to_string();
        self.store
            .update(|record| {
                let env = record.env_mut(color);
                env.set_role(EnvironmentRole::Live);
                env.build_ref = Some(build.clone());
                Ok(())
            })
            .await
            .expect("seed state");
        use switchyard::deployment::TrafficRouter;
        self.router.route_to(color).await.expect("seed route");
    }

    pub async fn live_colors(&self) -> Vec<Color> {
        let record = self.store.load().await.expect("load state");
        Color::ALL.into_iter().filter(|c| record.env(*c).is_live()).collect()
    }
}
