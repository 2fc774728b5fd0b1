//! Switchyard - blue/green rollout and recovery for a hosted service
//!
//! This library provides the deployment state machine, encrypted
//! backup/restore, health monitoring and cross-region failover that the
//! `switchyard` binary drives.

pub mod app;
pub mod backup;
pub mod config;
pub mod deployment;
pub mod error;
pub mod preflight;
pub mod services;
pub mod state;

// Re-export commonly used types
pub use app::App;
pub use config::{AppConfig, Secret};
pub use deployment::{Color, DeploymentAttempt, DeploymentController, DeploymentOutcome, DeploymentState};
pub use error::{AppError, Result};
