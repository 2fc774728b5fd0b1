use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::deployment::environment::Color;
use crate::error::{AppError, Result};
use crate::services::process::ExternalCommand;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatus {
    pub running: u32,
    /// Containers that exited with a non-zero code.
    pub failed_exits: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub applied: Vec<String>,
}

impl MigrationReport {
    pub fn is_data_affecting(&self) -> bool {
        !self.applied.is_empty()
    }
}

/// Starts, inspects and stops the processes behind one color.
#[async_trait]
pub trait EnvironmentRuntime: Send + Sync {
    async fn provision(&self, color: Color, build_ref: &str) -> Result<()>;
    async fn run_migrations(&self, color: Color) -> Result<MigrationReport>;
    async fn stop(&self, color: Color) -> Result<()>;
    async fn host_status(&self, color: Color) -> Result<HostStatus>;
    async fn logs(&self, color: Color, lines: usize) -> Result<String>;
}

/// One `docker compose` project per color.
pub struct DockerComposeRuntime {
    compose_file: PathBuf,
    project_prefix: String,
    migrate_service: String,
    migrate_command: Option<String>,
    provision_timeout: Duration,
    command_timeout: Duration,
}

impl DockerComposeRuntime {
    pub fn new(compose_file: PathBuf, project_prefix: impl Into<String>) -> Self {
        Self {
            compose_file,
            project_prefix: project_prefix.into(),
            migrate_service: "app".to_string(),
            migrate_command: None,
            provision_timeout: Duration::from_secs(600),
            command_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_migrations(mut self, service: impl Into<String>, command: Option<String>) -> Self {
        self.migrate_service = service.into();
        self.migrate_command = command;
        self
    }

    pub fn with_timeouts(mut self, provision: Duration, command: Duration) -> Self {
        self.provision_timeout = provision;
        self.command_timeout = command;
        self
    }

    pub fn project_name(&self, color: Color) -> String {
        format!("{}-{}", self.project_prefix, color.slug())
    }

    fn compose(&self, color: Color) -> ExternalCommand {
        ExternalCommand::new("docker")
            .arg("compose")
            .arg("-f")
            .arg(self.compose_file.to_string_lossy())
            .arg("-p")
            .arg(self.project_name(color))
            .timeout(self.command_timeout)
    }
}

#[async_trait]
impl EnvironmentRuntime for DockerComposeRuntime {
    async fn provision(&self, color: Color, build_ref: &str) -> Result<()> {
        info!(color = %color, build_ref, project = %self.project_name(color), "Starting compose project");
        self.compose(color)
            .args(["up", "-d", "--remove-orphans"])
            .env("BUILD_REF", build_ref)
            .timeout(self.provision_timeout)
            .run()
            .await?;
        Ok(())
    }

    async fn run_migrations(&self, color: Color) -> Result<MigrationReport> {
        let Some(command) = &self.migrate_command else {
            return Ok(MigrationReport::default());
        };

        let output = self
            .compose(color)
            .args(["exec", "-T", self.migrate_service.as_str(), "sh", "-c", command.as_str()])
            .timeout(self.provision_timeout)
            .run()
            .await?;

        let applied: Vec<String> = output
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        debug!(color = %color, count = applied.len(), "Migrations applied");
        Ok(MigrationReport { applied })
    }

    async fn stop(&self, color: Color) -> Result<()> {
        info!(color = %color, project = %self.project_name(color), "Stopping compose project");
        self.compose(color).args(["down", "--remove-orphans"]).run().await?;
        Ok(())
    }

    async fn host_status(&self, color: Color) -> Result<HostStatus> {
        let output = self
            .compose(color)
            .args(["ps", "--all", "--format", "json"])
            .run()
            .await?;
        parse_compose_ps(&output.stdout_lossy())
    }

    async fn logs(&self, color: Color, lines: usize) -> Result<String> {
        let output = self
            .compose(color)
            .args(["logs", "--no-color", "--tail"])
            .arg(lines.to_string())
            .run()
            .await?;
        Ok(output.stdout_lossy())
    }
}

#[derive(Debug, Deserialize)]
struct ComposeContainer {
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "ExitCode", default)]
    exit_code: i64,
}

/// Parses `docker compose ps --format json`. Newer compose prints one object
/// per line, older releases print a single array.
pub fn parse_compose_ps(raw: &str) -> Result<HostStatus> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(HostStatus::default());
    }

    let containers: Vec<ComposeContainer> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?
    };

    let mut status = HostStatus::default();
    for container in containers {
        match container.state.as_str() {
            "running" => status.running += 1,
            "exited" | "dead" if container.exit_code != 0 => status.failed_exits += 1,
            _ => {}
        }
    }
    Ok(status)
}

/// In-memory runtime that records every call.
pub struct MockEnvironmentRuntime {
    calls: Mutex<Vec<String>>,
    host_status: Mutex<HashMap<Color, HostStatus>>,
    failing_provision: Mutex<Option<Color>>,
    migration_outcome: Mutex<Option<std::result::Result<Vec<String>, String>>>,
    failing_stop: Mutex<bool>,
    provision_delay: Mutex<Option<Duration>>,
}

impl MockEnvironmentRuntime {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            host_status: Mutex::new(HashMap::new()),
            failing_provision: Mutex::new(None),
            migration_outcome: Mutex::new(None),
            failing_stop: Mutex::new(false),
            provision_delay: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn set_host_status(&self, color: Color, status: HostStatus) {
        if let Ok(mut map) = self.host_status.lock() {
            map.insert(color, status);
        }
    }

    pub fn fail_provision(&self, color: Option<Color>) {
        if let Ok(mut f) = self.failing_provision.lock() {
            *f = color;
        }
    }

    pub fn set_migrations(&self, applied: &[&str]) {
        if let Ok(mut m) = self.migration_outcome.lock() {
            *m = Some(Ok(applied.iter().map(|s| s.to_string()).collect()));
        }
    }

    pub fn fail_migrations(&self, message: &str) {
        if let Ok(mut m) = self.migration_outcome.lock() {
            *m = Some(Err(message.to_string()));
        }
    }

    pub fn fail_stop(&self, fail: bool) {
        if let Ok(mut f) = self.failing_stop.lock() {
            *f = fail;
        }
    }

    pub fn set_provision_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.provision_delay.lock() {
            *d = Some(delay);
        }
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl Default for MockEnvironmentRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EnvironmentRuntime for MockEnvironmentRuntime {
    async fn provision(&self, color: Color, build_ref: &str) -> Result<()> {
        self.record(format!("provision:{}:{}", color, build_ref));
        let delay = self.provision_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_provision.lock().map(|f| *f == Some(color)).unwrap_or(false) {
            return Err(AppError::ExternalServiceError(format!("mock provision failure for {}", color)));
        }
        Ok(())
    }

    async fn run_migrations(&self, color: Color) -> Result<MigrationReport> {
        self.record(format!("migrate:{}", color));
        let outcome = self.migration_outcome.lock().ok().and_then(|m| m.clone());
        match outcome {
            Some(Ok(applied)) => Ok(MigrationReport { applied }),
            Some(Err(message)) => Err(AppError::ExternalServiceError(message)),
            None => Ok(MigrationReport::default()),
        }
    }

    async fn stop(&self, color: Color) -> Result<()> {
        self.record(format!("stop:{}", color));
        if self.failing_stop.lock().map(|f| *f).unwrap_or(false) {
            return Err(AppError::ExternalServiceError(format!("mock stop failure for {}", color)));
        }
        Ok(())
    }

    async fn host_status(&self, color: Color) -> Result<HostStatus> {
        self.host_status
            .lock()
            .ok()
            .and_then(|m| m.get(&color).copied())
            .ok_or_else(|| AppError::NotFound(format!("no host status for {}", color)))
    }

    async fn logs(&self, color: Color, lines: usize) -> Result<String> {
        self.record(format!("logs:{}:{}", color, lines));
        Ok(format!("mock logs for {}\n", color))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compose_ps_json_lines() {
        let raw = r#"{"Name":"app-a-web-1","State":"running","ExitCode":0}
{"Name":"app-a-worker-1","State":"exited","ExitCode":137}
{"Name":"app-a-init-1","State":"exited","ExitCode":0}"#;
        let status = parse_compose_ps(raw).unwrap();
        assert_eq!(status, HostStatus { running: 1, failed_exits: 1 });
    }

    #[test]
    fn test_parse_compose_ps_array() {
        let raw = r#"[{"State":"running","ExitCode":0},{"State":"running","ExitCode":0}]"#;
        assert_eq!(parse_compose_ps(raw).unwrap().running, 2);
    }

    #[test]
    fn test_parse_compose_ps_empty() {
        assert_eq!(parse_compose_ps("  \n").unwrap(), HostStatus::default());
    }

    #[test]
    fn test_project_names_per_color() {
        let runtime = DockerComposeRuntime::new(PathBuf::from("docker-compose.yml"), "shop");
        assert_eq!(runtime.project_name(Color::A), "shop-a");
        assert_eq!(runtime.project_name(Color::B), "shop-b");
    }

    #[test]
    fn test_migration_report_data_affecting() {
        assert!(!MigrationReport::default().is_data_affecting());
        assert!(MigrationReport { applied: vec!["0001_init".into()] }.is_data_affecting());
    }
}
