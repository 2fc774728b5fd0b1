//! Process configuration.
//!
//! Every setting is read once at startup through [`AppConfig::from_env`] and
//! validated there; the rest of the crate only sees typed values.

use base64ct::Encoding;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::backup::RetentionPolicy;
use crate::deployment::environment::Color;
use crate::error::{AppError, Result};

/// A credential that must not end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub urls: HashMap<Color, Url>,
    pub attempts: u32,
    pub interval: Duration,
    pub timeout: Duration,
    pub healthy_threshold: u32,
    pub min_hosts: u32,
}

#[derive(Debug, Clone)]
pub struct DeploymentSettings {
    pub drain_grace: Duration,
    pub provision_timeout: Duration,
    pub routing_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub compose_file: PathBuf,
    pub project_prefix: String,
    pub migrate_service: String,
    pub migrate_command: Option<String>,
    pub haproxy_socket: PathBuf,
    pub haproxy_backend: String,
    pub haproxy_servers: HashMap<Color, String>,
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub dir: PathBuf,
    pub region: String,
    /// Directory and region of the cross-region copy.
    pub replica: Option<(PathBuf, String)>,
    pub encryption_key: Secret,
    pub daily_retention_days: Option<i64>,
    pub weekly_retention_days: Option<i64>,
    pub replication_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ComponentSettings {
    pub database_url: Secret,
    pub pg_dump_bin: String,
    pub pg_restore_bin: String,
    pub redis_url: Option<Secret>,
    pub redis_dump_path: PathBuf,
    pub file_store_path: PathBuf,
    pub config_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FailoverSettings {
    pub threshold: u32,
    pub window: usize,
    pub interval: Duration,
    pub promotion_timeout: Duration,
    pub secondary_region: String,
    pub replica_id: String,
    pub promote_command: Option<String>,
    pub dns_webhook: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub state_dir: PathBuf,
    pub min_free_disk_mb: u64,
    pub health: HealthSettings,
    pub deployment: DeploymentSettings,
    pub runtime: RuntimeSettings,
    pub backup: BackupSettings,
    pub components: ComponentSettings,
    pub failover: FailoverSettings,
    pub alert_webhook: Option<Url>,
}

impl AppConfig {
    /// Reads the process environment (after `.env` has been loaded).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup: &lookup };

        let app_name = vars.string_or("SWITCHYARD_APP_NAME", "app");
        let state_dir = vars.path_or("SWITCHYARD_STATE_DIR", "./.switchyard");

        let mut urls = HashMap::new();
        urls.insert(Color::A, vars.url("HEALTH_URL_A")?);
        urls.insert(Color::B, vars.url("HEALTH_URL_B")?);

        let health = HealthSettings {
            urls,
            attempts: vars.parse_or("HEALTH_ATTEMPTS", 30)?,
            interval: vars.secs_or("HEALTH_INTERVAL_SECS", 10)?,
            timeout: vars.secs_or("HEALTH_TIMEOUT_SECS", 5)?,
            healthy_threshold: vars.parse_or("HEALTHY_THRESHOLD", 1)?,
            min_hosts: vars.parse_or("MIN_HOSTS", 1)?,
        };

        let deployment = DeploymentSettings {
            drain_grace: vars.secs_or("DRAIN_GRACE_SECS", 30)?,
            provision_timeout: vars.secs_or("PROVISION_TIMEOUT_SECS", 600)?,
            routing_timeout: vars.secs_or("ROUTING_TIMEOUT_SECS", 30)?,
        };

        let project_prefix = vars.string_or("COMPOSE_PROJECT_PREFIX", &app_name);
        let mut haproxy_servers = HashMap::new();
        haproxy_servers.insert(Color::A, vars.string_or("HAPROXY_SERVER_A", &format!("{}-a", app_name)));
        haproxy_servers.insert(Color::B, vars.string_or("HAPROXY_SERVER_B", &format!("{}-b", app_name)));
        let runtime = RuntimeSettings {
            compose_file: vars.path_or("COMPOSE_FILE", "docker-compose.yml"),
            project_prefix,
            migrate_service: vars.string_or("MIGRATE_SERVICE", "app"),
            migrate_command: vars.optional("MIGRATE_COMMAND"),
            haproxy_socket: vars.path_or("HAPROXY_SOCKET", "/var/run/haproxy.sock"),
            haproxy_backend: vars.string_or("HAPROXY_BACKEND", "app"),
            haproxy_servers,
        };

        let replica = match (vars.optional("BACKUP_REPLICA_DIR"), vars.optional("BACKUP_REPLICA_REGION")) {
            (Some(dir), Some(region)) => Some((PathBuf::from(dir), region)),
            (None, None) => None,
            _ => {
                return Err(AppError::ConfigurationError(
                    "BACKUP_REPLICA_DIR and BACKUP_REPLICA_REGION must be set together".to_string(),
                ))
            }
        };
        let encryption_key = vars.required("BACKUP_ENCRYPTION_KEY")?;
        validate_key(&encryption_key)?;
        let backup = BackupSettings {
            dir: vars
                .optional("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| state_dir.join("backups")),
            region: vars.string_or("BACKUP_REGION", "primary"),
            replica,
            encryption_key: Secret::new(encryption_key),
            daily_retention_days: vars.parse_optional("BACKUP_DAILY_RETENTION_DAYS")?,
            weekly_retention_days: vars.parse_optional("BACKUP_WEEKLY_RETENTION_DAYS")?,
            replication_timeout: vars.secs_or("REPLICATION_TIMEOUT_SECS", 300)?,
        };

        let components = ComponentSettings {
            database_url: Secret::new(vars.required("DATABASE_URL")?),
            pg_dump_bin: vars.string_or("PG_DUMP_BIN", "pg_dump"),
            pg_restore_bin: vars.string_or("PG_RESTORE_BIN", "pg_restore"),
            redis_url: vars.optional("REDIS_URL").map(Secret::new),
            redis_dump_path: vars.path_or("REDIS_DUMP_PATH", "/data/dump.rdb"),
            file_store_path: PathBuf::from(vars.required("FILE_STORE_PATH")?),
            config_path: PathBuf::from(vars.required("CONFIG_PATH")?),
        };

        let failover = FailoverSettings {
            threshold: vars.parse_or("FAILOVER_THRESHOLD", 3)?,
            window: vars.parse_or("FAILOVER_WINDOW", 3)?,
            interval: vars.secs_or("FAILOVER_INTERVAL_SECS", 30)?,
            promotion_timeout: vars.secs_or("FAILOVER_PROMOTION_TIMEOUT_SECS", 300)?,
            secondary_region: vars.string_or("FAILOVER_SECONDARY_REGION", "secondary"),
            replica_id: vars.string_or("FAILOVER_REPLICA_ID", "standby"),
            promote_command: vars.optional("FAILOVER_PROMOTE_COMMAND"),
            dns_webhook: vars.optional_url("FAILOVER_DNS_WEBHOOK")?,
        };

        let config = AppConfig {
            app_name,
            state_dir,
            min_free_disk_mb: vars.parse_or("SWITCHYARD_MIN_FREE_DISK_MB", 1024)?,
            health,
            deployment,
            runtime,
            backup,
            components,
            failover,
            alert_webhook: vars.optional_url("ALERT_WEBHOOK_URL")?,
        };
        config.validate()?;
        debug!(app = %config.app_name, state_dir = %config.state_dir.display(), "Configuration loaded");
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.health.attempts == 0 {
            return Err(AppError::ConfigurationError("HEALTH_ATTEMPTS must be at least 1".to_string()));
        }
        if self.health.healthy_threshold == 0 || self.health.healthy_threshold > self.health.attempts {
            return Err(AppError::ConfigurationError(format!(
                "HEALTHY_THRESHOLD must be between 1 and HEALTH_ATTEMPTS ({})",
                self.health.attempts
            )));
        }
        if self.health.timeout.is_zero() {
            return Err(AppError::ConfigurationError("HEALTH_TIMEOUT_SECS must be positive".to_string()));
        }
        if self.failover.threshold == 0 || self.failover.window == 0 {
            return Err(AppError::ConfigurationError(
                "FAILOVER_THRESHOLD and FAILOVER_WINDOW must be at least 1".to_string(),
            ));
        }
        if self.failover.interval.is_zero() || self.health.interval.is_zero() {
            return Err(AppError::ConfigurationError("poll intervals must be positive".to_string()));
        }
        RetentionPolicy::with_overrides(self.backup.daily_retention_days, self.backup.weekly_retention_days)?;
        if self.runtime.haproxy_servers.get(&Color::A) == self.runtime.haproxy_servers.get(&Color::B) {
            return Err(AppError::ConfigurationError(
                "HAPROXY_SERVER_A and HAPROXY_SERVER_B must differ".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_key(encoded: &str) -> Result<()> {
    let bytes = base64ct::Base64::decode_vec(encoded.trim())
        .map_err(|e| AppError::ConfigurationError(format!("BACKUP_ENCRYPTION_KEY is not base64: {}", e)))?;
    if bytes.len() != 32 {
        return Err(AppError::ConfigurationError(format!(
            "BACKUP_ENCRYPTION_KEY must decode to 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

struct Vars<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.optional(key)
            .ok_or_else(|| AppError::ConfigurationError(format!("{} must be set", key)))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn path_or(&self, key: &str, default: &str) -> PathBuf {
        PathBuf::from(self.string_or(key, default))
    }

    fn parse_optional<T: FromStr>(&self, key: &str) -> Result<Option<T>>
    where
        T::Err: fmt::Display,
    {
        self.optional(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| AppError::ConfigurationError(format!("{} is invalid ({}): {}", key, raw, e)))
            })
            .transpose()
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T>
    where
        T::Err: fmt::Display,
    {
        Ok(self.parse_optional(key)?.unwrap_or(default))
    }

    fn secs_or(&self, key: &str, default: u64) -> Result<Duration> {
        self.parse_or(key, default).map(Duration::from_secs)
    }

    fn url(&self, key: &str) -> Result<Url> {
        let raw = self.required(key)?;
        parse_url(key, &raw)
    }

    fn optional_url(&self, key: &str) -> Result<Option<Url>> {
        self.optional(key).map(|raw| parse_url(key, &raw)).transpose()
    }
}

fn parse_url(key: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| AppError::ConfigurationError(format!("{} is not a valid URL: {}", key, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(AppError::ConfigurationError(format!(
            "{} must use http or https, got {}",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> HashMap<&'static str, String> {
        let mut vars = HashMap::new();
        vars.insert("HEALTH_URL_A", "http://127.0.0.1:8081/ready".to_string());
        vars.insert("HEALTH_URL_B", "http://127.0.0.1:8082/ready".to_string());
        vars.insert("BACKUP_ENCRYPTION_KEY", base64ct::Base64::encode_string(&[7u8; 32]));
        vars.insert("DATABASE_URL", "postgres://app:pw@db/app".to_string());
        vars.insert("FILE_STORE_PATH", "/srv/uploads".to_string());
        vars.insert("CONFIG_PATH", "/srv/config".to_string());
        vars
    }

    fn load(vars: &HashMap<&'static str, String>) -> Result<AppConfig> {
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_apply() {
        let config = load(&base()).unwrap();
        assert_eq!(config.health.attempts, 30);
        assert_eq!(config.health.interval, Duration::from_secs(10));
        assert_eq!(config.health.timeout, Duration::from_secs(5));
        assert_eq!(config.failover.threshold, 3);
        assert_eq!(config.deployment.drain_grace, Duration::from_secs(30));
        assert_eq!(config.backup.dir, PathBuf::from("./.switchyard").join("backups"));
        assert_eq!(config.runtime.haproxy_servers[&Color::B], "app-b");
        assert!(config.backup.replica.is_none());
    }

    #[test]
    fn test_missing_required_is_configuration_error() {
        let mut vars = base();
        vars.remove("DATABASE_URL");
        let err = load(&vars).unwrap_err();
        assert!(matches!(err, AppError::ConfigurationError(_)));
        assert_eq!(err.exit_code(), crate::error::EXIT_PRECONDITION);
    }

    #[test]
    fn test_bad_key_length_rejected() {
        let mut vars = base();
        vars.insert("BACKUP_ENCRYPTION_KEY", base64ct::Base64::encode_string(&[1u8; 16]));
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_replica_pair_must_be_complete() {
        let mut vars = base();
        vars.insert("BACKUP_REPLICA_DIR", "/mnt/replica".to_string());
        assert!(load(&vars).is_err());
        vars.insert("BACKUP_REPLICA_REGION", "eu-west-1".to_string());
        let config = load(&vars).unwrap();
        assert_eq!(config.backup.replica, Some((PathBuf::from("/mnt/replica"), "eu-west-1".to_string())));
    }

    #[test]
    fn test_retention_override_out_of_range_rejected() {
        let mut vars = base();
        vars.insert("BACKUP_DAILY_RETENTION_DAYS", "100000000".to_string());
        assert!(matches!(load(&vars), Err(AppError::ConfigurationError(_))));

        vars.insert("BACKUP_DAILY_RETENTION_DAYS", "3".to_string());
        assert!(matches!(load(&vars), Err(AppError::ConfigurationError(_))));

        vars.insert("BACKUP_DAILY_RETENTION_DAYS", "90".to_string());
        assert_eq!(load(&vars).unwrap().backup.daily_retention_days, Some(90));
    }

    #[test]
    fn test_non_http_url_rejected() {
        let mut vars = base();
        vars.insert("ALERT_WEBHOOK_URL", "ftp://alerts.example".to_string());
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let config = load(&base()).unwrap();
        let rendered = format!("{:?}", config.components);
        assert!(!rendered.contains("pw@db"));
    }
}
