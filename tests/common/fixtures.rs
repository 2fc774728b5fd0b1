use std::time::Duration;

use switchyard::deployment::{DeploymentConfig, HealthOutcome};

/// Production shape with millisecond timings.
pub fn fast_deployment_config() -> DeploymentConfig {
    DeploymentConfig {
        health_attempts: 30,
        health_interval: Duration::from_millis(1),
        healthy_threshold: 1,
        drain_grace: Duration::from_millis(50),
        drain_poll: Duration::from_millis(5),
        provision_timeout: Duration::from_secs(1),
    }
}

pub fn unhealthy(n: usize) -> Vec<HealthOutcome> {
    vec![HealthOutcome::Unhealthy; n]
}

pub fn tampered(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.extend_from_slice(b"-tampered");
    out
}
