//! `switchyard` command-line entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use dotenv::dotenv;
use std::str::FromStr;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use switchyard::backup::RetentionClass;
use switchyard::deployment::{
    Color, DeploymentOutcome, FailoverDecision, HealthOutcome, RollbackAction,
};
use switchyard::error::{AppError, EXIT_OPERATIONAL};
use switchyard::{preflight, App, AppConfig};

/// Blue/green rollout, backup/restore and failover for a hosted service
#[derive(Parser)]
#[command(name = "switchyard")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a build to the standby color and promote it when healthy
    Deploy {
        /// Build reference (image tag, commit, ...)
        build_ref: String,
    },

    /// Cancel the running deployment, or redeploy the previous build
    Rollback {
        /// Take over an attempt whose owner died, or resume a failed rollback
        #[arg(long)]
        force: bool,
    },

    /// Probe an environment once
    Health {
        /// A, B or live
        #[arg(default_value = "live")]
        environment: String,
    },

    /// Take a backup now
    Backup {
        #[arg(long, default_value = "daily")]
        class: String,

        /// Color to back up; defaults to the live one
        #[arg(long)]
        source: Option<String>,
    },

    /// Restore a backup artifact
    Restore {
        artifact_id: Uuid,

        /// Color to restore into; defaults to the live one
        #[arg(long)]
        target: Option<String>,
    },

    /// Show environment and deployment state
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Print recent logs of an environment
    Logs {
        #[arg(default_value = "live")]
        environment: String,

        #[arg(short = 'n', long, default_value = "100")]
        lines: usize,
    },

    /// List backup artifacts
    Backups,

    /// Delete expired backups
    Prune,

    /// Fail over to the secondary region now
    Failover {
        #[arg(long, default_value = "manual failover requested by operator")]
        reason: String,
    },

    /// Release the failover latch once the primary region is trusted again
    FailoverReset {
        #[arg(long)]
        reason: String,
    },

    /// Run the backup schedule and failover watcher until interrupted
    Daemon,
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(cli).await {
        let code = e
            .downcast_ref::<AppError>()
            .map(AppError::exit_code)
            .unwrap_or(EXIT_OPERATIONAL);
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::from_env()?;
    let app = App::build(config).await?;

    match cli.command {
        Commands::Deploy { build_ref } => deploy(&app, &build_ref).await,
        Commands::Rollback { force } => rollback(&app, force).await,
        Commands::Health { environment } => health(&app, &environment).await,
        Commands::Backup { class, source } => backup(&app, &class, source.as_deref()).await,
        Commands::Restore { artifact_id, target } => restore(&app, artifact_id, target.as_deref()).await,
        Commands::Status { json } => status(&app, json).await,
        Commands::Logs { environment, lines } => logs(&app, &environment, lines).await,
        Commands::Backups => list_backups(&app).await,
        Commands::Prune => prune(&app).await,
        Commands::Failover { reason } => failover(&app, &reason).await,
        Commands::FailoverReset { reason } => failover_reset(&app, &reason).await,
        Commands::Daemon => daemon(&app).await,
    }
}

/// Resolves `A`, `B` or `live`.
async fn resolve_color(app: &App, raw: &str) -> Result<Color> {
    if raw.eq_ignore_ascii_case("live") {
        let record = app.store.load().await?;
        return record
            .live_color()?
            .ok_or_else(|| AppError::PreconditionError("no environment is live yet".to_string()).into());
    }
    Ok(Color::from_str(raw)?)
}

async fn deploy(app: &App, build_ref: &str) -> Result<()> {
    preflight::check_disk_space(&app.config.state_dir, app.config.min_free_disk_mb)?;

    println!("{} {}", "Deploying".cyan().bold(), build_ref.yellow());
    let attempt = app.deployments.deploy(build_ref).await?;
    report_attempt(attempt)
}

fn report_attempt(attempt: switchyard::DeploymentAttempt) -> Result<()> {
    print_transitions(&attempt);
    match attempt.outcome {
        Some(DeploymentOutcome::Success) => {
            println!("{} {} is live on {}", "✅".green(), attempt.build_ref, attempt.target);
            Ok(())
        }
        Some(DeploymentOutcome::RolledBack) => {
            println!("{} rolled back: {}", "⚠️".yellow(), attempt.failure_reason.as_deref().unwrap_or("unknown"));
            Err(AppError::DeploymentFailed(format!("attempt {} rolled back", attempt.id)).into())
        }
        _ => {
            println!("{} rollback failed, run `switchyard rollback --force`", "❌".red());
            Err(AppError::RollbackFailed(attempt.failure_reason.unwrap_or_default()).into())
        }
    }
}

fn print_transitions(attempt: &switchyard::DeploymentAttempt) {
    for t in &attempt.transitions {
        let reason = t.reason.as_deref().map(|r| format!(" ({})", r)).unwrap_or_default();
        println!("  {} {} -> {}{}", t.at.format("%H:%M:%S"), t.from, t.to.to_string().bold(), reason);
    }
}

async fn rollback(app: &App, force: bool) -> Result<()> {
    match app.deployments.rollback(force).await? {
        RollbackAction::CancelRequested(attempt) => {
            println!(
                "{} cancellation requested for attempt {} ({})",
                "⏹".yellow(),
                attempt.id,
                attempt.state
            );
            Ok(())
        }
        RollbackAction::Redeployed(attempt) => report_attempt(attempt),
        RollbackAction::Reversed(attempt) => {
            print_transitions(&attempt);
            if attempt.outcome == Some(DeploymentOutcome::Failed) {
                return Err(AppError::RollbackFailed(attempt.failure_reason.unwrap_or_default()).into());
            }
            println!("{} attempt {} rolled back", "✅".green(), attempt.id);
            Ok(())
        }
    }
}

async fn health(app: &App, environment: &str) -> Result<()> {
    let color = resolve_color(app, environment).await?;
    let result = app.monitor.check(color).await;

    let outcome = match result.outcome {
        HealthOutcome::Healthy => result.outcome.to_string().green(),
        HealthOutcome::Unhealthy => result.outcome.to_string().red(),
        HealthOutcome::Unknown => result.outcome.to_string().yellow(),
    };
    println!("{}: {} ({} ms) {}", color, outcome, result.response_time_ms, result.detail);

    if result.outcome != HealthOutcome::Healthy {
        return Err(AppError::HealthCheckFailure(format!("{} is {}", color, result.outcome)).into());
    }
    Ok(())
}

async fn backup(app: &App, class: &str, source: Option<&str>) -> Result<()> {
    preflight::check_disk_space(&app.config.backup.dir, app.config.min_free_disk_mb)?;

    let class = RetentionClass::from_str(class)?;
    let source = match source {
        Some(raw) => resolve_color(app, raw).await?,
        None => app.store.load().await?.live_color()?.unwrap_or(Color::A),
    };

    let artifact = app.backups.create_backup(source, class).await?;
    println!(
        "{} backup {} of {} ({}, expires {})",
        "✅".green(),
        artifact.id.to_string().cyan(),
        source,
        class,
        artifact.expires_at.format("%Y-%m-%d")
    );

    let replication = app.backups.await_replication(artifact.id).await?;
    println!("  replication: {:?}", replication.status);
    Ok(())
}

async fn restore(app: &App, artifact_id: Uuid, target: Option<&str>) -> Result<()> {
    let target = match target {
        Some(raw) => resolve_color(app, raw).await?,
        None => resolve_color(app, "live").await?,
    };
    let report = app.restores.restore_by_id(artifact_id, target).await?;
    println!(
        "{} restored {:?} into {} in {} ms",
        "✅".green(),
        report.restored,
        target,
        report.duration_ms
    );
    if !report.skipped.is_empty() {
        println!("  {} skipped {:?}", "⚠️".yellow(), report.skipped);
    }
    Ok(())
}

async fn status(app: &App, json: bool) -> Result<()> {
    let status = app.deployments.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status).context("rendering status")?);
        return Ok(());
    }

    println!("{}", "Environments".cyan().bold());
    for color in Color::ALL {
        let env = status.environments.env(color);
        let marker = if env.is_live() { "●".green() } else { "○".normal() };
        println!(
            "  {} {}  role={} build={} health={}",
            marker,
            color,
            env.role,
            env.build_ref.as_deref().unwrap_or("-"),
            env.health
        );
    }

    match &status.attempt {
        Some(attempt) => {
            println!("{}", "Deployment".cyan().bold());
            println!("  id:     {}", attempt.id);
            println!("  build:  {}", attempt.build_ref);
            println!("  state:  {}", attempt.state.to_string().bold());
            if let Some(reason) = &attempt.failure_reason {
                println!("  reason: {}", reason);
            }
        }
        None => println!("No deployments yet"),
    }
    Ok(())
}

async fn logs(app: &App, environment: &str, lines: usize) -> Result<()> {
    let color = resolve_color(app, environment).await?;
    let output = app.runtime.logs(color, lines).await?;
    print!("{}", output);
    Ok(())
}

async fn list_backups(app: &App) -> Result<()> {
    let entries = app.backups.list().await?;
    if entries.is_empty() {
        println!("No backups");
        return Ok(());
    }
    for entry in entries {
        let a = &entry.artifact;
        let state = if a.is_restorable() { "complete".green() } else { "truncated".red() };
        println!(
            "{}  {}  {}  {:<6}  expires {}  {:>10} B  {}  {:?}",
            a.id,
            a.created_at.format("%Y-%m-%d %H:%M"),
            a.source,
            a.retention_class.to_string(),
            a.expires_at.format("%Y-%m-%d"),
            a.size_bytes,
            state,
            entry.replication.status
        );
    }
    Ok(())
}

async fn prune(app: &App) -> Result<()> {
    let report = app.backups.prune().await?;
    println!(
        "{} deleted {}, retained {}, kept {} expired as newest",
        "🧹".normal(),
        report.deleted.len(),
        report.retained,
        report.protected.len()
    );
    Ok(())
}

async fn failover(app: &App, reason: &str) -> Result<()> {
    match app.failover.failover(reason).await? {
        FailoverDecision::Executed(event) => {
            println!("{} failed over to {} in {} ms", "✅".green(), event.region, event.duration_ms);
        }
        other => println!("{} failover not started: {:?}", "⚠️".yellow(), other),
    }
    Ok(())
}

async fn failover_reset(app: &App, reason: &str) -> Result<()> {
    let event = app.failover.clear_latch(reason).await?;
    println!("{} failover latch cleared ({})", "🔓".normal(), event.id);
    Ok(())
}

async fn daemon(app: &App) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = app.spawn_daemon(shutdown_rx);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
