use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, Result};

/// Default lifetime of a `daily` artifact.
pub const DAILY_RETENTION_DAYS: i64 = 365;
/// Default lifetime of a `weekly` artifact (7 years).
pub const WEEKLY_RETENTION_DAYS: i64 = 2555;
/// Overrides may shorten retention but never below these floors.
pub const MIN_DAILY_RETENTION_DAYS: i64 = 7;
pub const MIN_WEEKLY_RETENTION_DAYS: i64 = 28;
/// Upper bound for either class (100 years).
pub const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionClass {
    Daily,
    Weekly,
}

impl fmt::Display for RetentionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionClass::Daily => f.write_str("daily"),
            RetentionClass::Weekly => f.write_str("weekly"),
        }
    }
}

impl FromStr for RetentionClass {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(RetentionClass::Daily),
            "weekly" => Ok(RetentionClass::Weekly),
            other => Err(AppError::PreconditionError(format!(
                "unknown retention class '{}', expected daily or weekly",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    daily_days: i64,
    weekly_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily_days: DAILY_RETENTION_DAYS,
            weekly_days: WEEKLY_RETENTION_DAYS,
        }
    }
}

impl RetentionPolicy {
    pub fn with_overrides(daily_days: Option<i64>, weekly_days: Option<i64>) -> Result<Self> {
        let daily_days = daily_days.unwrap_or(DAILY_RETENTION_DAYS);
        let weekly_days = weekly_days.unwrap_or(WEEKLY_RETENTION_DAYS);

        if daily_days < MIN_DAILY_RETENTION_DAYS {
            return Err(AppError::ConfigurationError(format!(
                "daily retention of {} days is below the {} day minimum",
                daily_days, MIN_DAILY_RETENTION_DAYS
            )));
        }
        if weekly_days < MIN_WEEKLY_RETENTION_DAYS {
            return Err(AppError::ConfigurationError(format!(
                "weekly retention of {} days is below the {} day minimum",
                weekly_days, MIN_WEEKLY_RETENTION_DAYS
            )));
        }

        for (var, days) in [
            ("BACKUP_DAILY_RETENTION_DAYS", daily_days),
            ("BACKUP_WEEKLY_RETENTION_DAYS", weekly_days),
        ] {
            if days > MAX_RETENTION_DAYS {
                return Err(AppError::ConfigurationError(format!(
                    "{} of {} days exceeds the {} day maximum",
                    var, days, MAX_RETENTION_DAYS
                )));
            }
        }

        Ok(Self { daily_days, weekly_days })
    }

    pub fn days(&self, class: RetentionClass) -> i64 {
        match class {
            RetentionClass::Daily => self.daily_days,
            RetentionClass::Weekly => self.weekly_days,
        }
    }

    /// Saturates at the latest representable time.
    pub fn expiry_for(&self, class: RetentionClass, created_at: DateTime<Utc>) -> DateTime<Utc> {
        Duration::try_days(self.days(class))
            .and_then(|window| created_at.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
