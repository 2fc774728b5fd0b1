//! Blue/green rollout, health monitoring and cross-region failover.

pub mod blue_green;
pub mod environment;
pub mod failover;
pub mod health_checks;
pub mod rollback;
pub mod runtime;
pub mod traffic_router;

pub use blue_green::{
    DeploymentAttempt, DeploymentConfig, DeploymentController, DeploymentOutcome, DeploymentState,
    DeploymentStatus, StateTransition,
};
pub use environment::{Color, Environment, EnvironmentRole};
pub use failover::{
    CommandReplicaPromoter, ExternalAlarm, FailoverConfig, FailoverController, FailoverDecision, FailoverEvent,
    FailoverEventLog, FailoverOutcome, LogOnlyRegionRouter, MockRegionRouter, MockReplicaPromoter, RegionRouter,
    ReplicaPromoter, SpoolAlarmFeed, WebhookRegionRouter,
};
pub use health_checks::{
    CompositeProbe, HealthCheckResult, HealthMonitor, HealthOutcome, HealthProbe, HealthSubscriber, HostCountProbe,
    HttpReadinessProbe, MockHealthProbe, ProbeReport, WatchHandle, WatchTarget,
};
pub use rollback::RollbackAction;
pub use runtime::{DockerComposeRuntime, EnvironmentRuntime, HostStatus, MigrationReport, MockEnvironmentRuntime};
pub use traffic_router::{
    HAProxyAdapter, LoadBalancedTrafficRouter, LoadBalancerAdapter, MockLoadBalancerAdapter, ServerState, ServerStats,
    TrafficRouter,
};
