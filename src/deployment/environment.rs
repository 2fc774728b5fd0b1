use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::deployment::health_checks::HealthOutcome;
use crate::error::AppError;

/// One of the two parallel environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Color {
    A,
    B,
}

impl Color {
    pub const ALL: [Color; 2] = [Color::A, Color::B];

    pub fn opposite(self) -> Color {
        match self {
            Color::A => Color::B,
            Color::B => Color::A,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Color::A => "A",
            Color::B => "B",
        }
    }

    /// Lowercase suffix used in project and server names.
    pub fn slug(self) -> &'static str {
        match self {
            Color::A => "a",
            Color::B => "b",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Color {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(Color::A),
            "B" | "b" => Ok(Color::B),
            other => Err(AppError::PreconditionError(format!(
                "unknown environment '{}', expected A or B",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentRole {
    Live,
    Standby,
    Deploying,
    Draining,
    Failed,
}

impl fmt::Display for EnvironmentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentRole::Live => "live",
            EnvironmentRole::Standby => "standby",
            EnvironmentRole::Deploying => "deploying",
            EnvironmentRole::Draining => "draining",
            EnvironmentRole::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub color: Color,
    pub role: EnvironmentRole,
    pub build_ref: Option<String>,
    pub health: HealthOutcome,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Environment {
    pub fn new(color: Color) -> Self {
        let now = Utc::now();
        Self {
            color,
            role: EnvironmentRole::Standby,
            build_ref: None,
            health: HealthOutcome::Unknown,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        self.role == EnvironmentRole::Live
    }

    pub fn set_role(&mut self, role: EnvironmentRole) {
        self.role = role;
        self.updated_at = Utc::now();
    }

    /// Marks the environment as freshly provisioned with `build_ref`.
    pub fn reprovision(&mut self, build_ref: &str) {
        let now = Utc::now();
        self.role = EnvironmentRole::Deploying;
        self.build_ref = Some(build_ref.to_string());
        self.health = HealthOutcome::Unknown;
        self.created_at = now;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite_color() {
        assert_eq!(Color::A.opposite(), Color::B);
        assert_eq!(Color::B.opposite(), Color::A);
    }

    #[test]
    fn test_parse_color() {
        assert_eq!("a".parse::<Color>().unwrap(), Color::A);
        assert_eq!(" B ".parse::<Color>().unwrap(), Color::B);
        assert!(matches!("green".parse::<Color>(), Err(AppError::PreconditionError(_))));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&EnvironmentRole::Draining).unwrap();
        assert_eq!(json, "\"draining\"");
    }
}
