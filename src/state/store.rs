use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::deployment::environment::{Color, Environment, EnvironmentRole};
use crate::error::{AppError, Result};
use crate::state::{lock::AdvisoryLock, write_atomic};

const STATE_FILE: &str = "environments.json";
const LOCK_WAIT: Duration = Duration::from_secs(5);
const MAX_UPDATE_ATTEMPTS: u32 = 5;

/// The single source of truth for which color is live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Bumped by every successful write.
    pub version: u64,
    pub a: Environment,
    pub b: Environment,
    /// Attempt that currently owns the environments, if any.
    pub in_flight: Option<Uuid>,
    pub cancel_requested: bool,
    /// Build that was live before the most recent promotion.
    pub previous_build: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn initial() -> Self {
        Self {
            version: 0,
            a: Environment::new(Color::A),
            b: Environment::new(Color::B),
            in_flight: None,
            cancel_requested: false,
            previous_build: None,
            updated_at: Utc::now(),
        }
    }

    pub fn env(&self, color: Color) -> &Environment {
        match color {
            Color::A => &self.a,
            Color::B => &self.b,
        }
    }

    pub fn env_mut(&mut self, color: Color) -> &mut Environment {
        match color {
            Color::A => &mut self.a,
            Color::B => &mut self.b,
        }
    }

    /// The live color, `None` before the first promotion.
    ///
    /// Two live environments means the record is corrupt; the caller must
    /// stop rather than pick one.
    pub fn live_color(&self) -> Result<Option<Color>> {
        match (self.a.is_live(), self.b.is_live()) {
            (true, true) => Err(AppError::ConflictingStateError(
                "both environments are marked live".to_string(),
            )),
            (true, false) => Ok(Some(Color::A)),
            (false, true) => Ok(Some(Color::B)),
            (false, false) => Ok(None),
        }
    }

    pub fn live_count(&self) -> usize {
        [&self.a, &self.b].iter().filter(|e| e.role == EnvironmentRole::Live).count()
    }
}

/// File-backed environment record with compare-and-set writes.
#[derive(Debug, Clone)]
pub struct EnvironmentStateStore {
    path: PathBuf,
    lock_dir: PathBuf,
}

impl EnvironmentStateStore {
    pub async fn open(state_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(state_dir).await?;
        Ok(Self {
            path: state_dir.join(STATE_FILE),
            lock_dir: state_dir.join("locks"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot read. Never blocks on writers.
    pub async fn load(&self) -> Result<StateRecord> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                AppError::ConflictingStateError(format!(
                    "environment state record {} is unreadable: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateRecord::initial()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes `next` only if the stored version still equals `expected`.
    /// Returns the record as written, with its new version.
    pub async fn compare_and_set(&self, expected: u64, mut next: StateRecord) -> Result<StateRecord> {
        let _guard = AdvisoryLock::acquire(&self.lock_dir, "environment-state", LOCK_WAIT).await?;

        let current = self.load().await?;
        if current.version != expected {
            return Err(AppError::StaleState {
                expected,
                actual: current.version,
            });
        }

        next.version = expected + 1;
        next.updated_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(&next)?;
        write_atomic(&self.path, &bytes).await?;

        debug!(version = next.version, "Environment state record written");
        Ok(next)
    }

    /// Load, mutate and compare-and-set, retrying when another writer got in
    /// first. Errors returned by `mutate` abort without writing.
    pub async fn update<F>(&self, mut mutate: F) -> Result<StateRecord>
    where
        F: FnMut(&mut StateRecord) -> Result<()>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.load().await?;
            let mut next = current.clone();
            mutate(&mut next)?;

            match self.compare_and_set(current.version, next).await {
                Err(AppError::StaleState { expected, actual }) if attempt < MAX_UPDATE_ATTEMPTS => {
                    warn!(expected, actual, attempt, "State record changed underneath, retrying update");
                }
                other => return other,
            }
        }
    }
}
