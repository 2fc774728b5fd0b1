pub mod retry;

pub use retry::RetryPolicy;

/// Exit code for a successful command.
pub const EXIT_OK: i32 = 0;
/// Exit code for operational failures (health check failed, backup failed, ...).
pub const EXIT_OPERATIONAL: i32 = 1;
/// Exit code for usage and precondition errors.
pub const EXIT_PRECONDITION: i32 = 2;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Precondition failed: {0}")]
    PreconditionError(String),

    #[error("Conflicting environment state: {0}")]
    ConflictingStateError(String),

    #[error("Health check failed: {0}")]
    HealthCheckFailure(String),

    #[error("Backup failed: {0}")]
    BackupFailure(String),

    #[error("Replication failed: {0}")]
    ReplicationFailure(String),

    #[error("Restore integrity error: {0}")]
    RestoreIntegrityError(String),

    #[error("Restore failed: {0}")]
    RestoreFailure(String),

    #[error("Failover timed out: {0}")]
    FailoverTimeout(String),

    #[error("Failover failed: {0}")]
    FailoverFailure(String),

    #[error("Deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Encryption error: {0}")]
    EncryptionError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Stale state record: expected version {expected}, found {actual}")]
    StaleState { expected: u64, actual: u64 },

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl AppError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::PreconditionError(_)
            | AppError::ConflictingStateError(_)
            | AppError::ConfigurationError(_)
            | AppError::StaleState { .. } => EXIT_PRECONDITION,
            _ => EXIT_OPERATIONAL,
        }
    }

    /// Transient errors that a bounded local retry may clear.
    ///
    /// Integrity, state-corruption and failover-timeout errors are never in
    /// this set: they always surface to the operator.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Timeout(_)
                | AppError::NetworkError(_)
                | AppError::ExternalServiceError(_)
                | AppError::StorageError(_)
                | AppError::IoError(_)
        )
    }

    /// Short classification used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::PreconditionError(_) => "precondition",
            AppError::ConflictingStateError(_) => "conflicting_state",
            AppError::HealthCheckFailure(_) => "health_check_failure",
            AppError::BackupFailure(_) => "backup_failure",
            AppError::ReplicationFailure(_) => "replication_failure",
            AppError::RestoreIntegrityError(_) => "restore_integrity",
            AppError::RestoreFailure(_) => "restore_failure",
            AppError::FailoverTimeout(_) => "failover_timeout",
            AppError::FailoverFailure(_) => "failover_failure",
            AppError::DeploymentFailed(_) => "deployment_failed",
            AppError::RollbackFailed(_) => "rollback_failed",
            AppError::ConfigurationError(_) => "configuration",
            AppError::Timeout(_) => "timeout",
            AppError::NetworkError(_) => "network",
            AppError::ExternalServiceError(_) => "external_service",
            AppError::StorageError(_) => "storage",
            AppError::EncryptionError(_) => "encryption",
            AppError::NotFound(_) => "not_found",
            AppError::StaleState { .. } => "stale_state",
            AppError::IoError(_) => "io",
            AppError::SerializationError(_) => "serialization",
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::SerializationError(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Timeout(err.to_string())
        } else {
            AppError::NetworkError(err.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::IoError(format!("Background task failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_follow_cli_contract() {
        assert_eq!(AppError::PreconditionError("x".into()).exit_code(), EXIT_PRECONDITION);
        assert_eq!(AppError::ConfigurationError("x".into()).exit_code(), EXIT_PRECONDITION);
        assert_eq!(AppError::ConflictingStateError("x".into()).exit_code(), EXIT_PRECONDITION);
        assert_eq!(AppError::HealthCheckFailure("x".into()).exit_code(), EXIT_OPERATIONAL);
        assert_eq!(AppError::BackupFailure("x".into()).exit_code(), EXIT_OPERATIONAL);
    }

    #[test]
    fn test_integrity_errors_are_never_retryable() {
        assert!(!AppError::RestoreIntegrityError("x".into()).is_retryable());
        assert!(!AppError::ConflictingStateError("x".into()).is_retryable());
        assert!(!AppError::FailoverTimeout("x".into()).is_retryable());
        assert!(AppError::NetworkError("x".into()).is_retryable());
        assert!(AppError::Timeout("x".into()).is_retryable());
    }
}
