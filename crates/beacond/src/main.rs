//! beacond - Beacon alert correlation daemon
//!
//! Evaluates rules and alerts against time-series data on a schedule,
//! reconciles problem rows and maintains alert-to-resource joints.

use std::path::{Path, PathBuf};

use beacon_alerts::RuleKind;
use beacond::Daemon;
use beacond::config::DaemonConfig;
use beacond::scheduler::{self, SchedulerConfig};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "beacond")]
#[command(about = "Beacon alert correlation daemon")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "BEACOND_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/beacond/beacond.toml")]
        config: PathBuf,
    },

    /// Validate a config file
    Check {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/beacond/beacond.toml")]
        config: PathBuf,
    },

    /// Run every enabled rule and alert once and exit
    Once {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/beacond/beacond.toml")]
        config: PathBuf,

        /// Only run this rule type
        #[arg(long)]
        rule: Option<RuleKind>,

        /// Skip alert evaluation
        #[arg(long)]
        skip_alerts: bool,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "beacond.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let (plain, json) = if cli.log_json {
        (None, Some(fmt::layer().json()))
    } else {
        (Some(fmt::layer()), None)
    };
    tracing_subscriber::registry()
        .with(plain)
        .with(json)
        .with(
            EnvFilter::from_default_env()
                .add_directive("beacond=info".parse()?)
                .add_directive("beacon_alerts=info".parse()?),
        )
        .init();

    match cli.command {
        Commands::Run { config } => {
            run_daemon(config).await?;
        }

        Commands::Check { config } => {
            check_config(&config)?;
        }

        Commands::Once {
            config,
            rule,
            skip_alerts,
        } => {
            run_once(config, rule, skip_alerts).await?;
        }

        Commands::InitConfig { output } => {
            init_config(&output)?;
        }
    }

    Ok(())
}

async fn run_daemon(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting beacond");

    let config = DaemonConfig::from_file(&config_path)?;
    let daemon = Daemon::build(&config)?;

    let handle = scheduler::start(
        daemon.engine.clone(),
        Some(daemon.metrics.clone()),
        &SchedulerConfig {
            sweep_interval: config.engine.sweep_interval(),
        },
    );
    info!(tasks = handle.task_count(), "scheduler started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.stop();

    Ok(())
}

fn check_config(config_path: &Path) -> anyhow::Result<()> {
    let config = DaemonConfig::from_file(config_path)?;

    println!("Config OK: {}", config_path.display());
    println!("Rules:");
    for rule in &config.rules {
        println!(
            "  {} ({}) every {}, lookback {}, {} condition(s){}",
            rule.kind(),
            rule.name,
            rule.period,
            rule.time_from,
            rule.settings.conditions().len(),
            if rule.enabled { "" } else { " [disabled]" }
        );
    }
    println!("Alerts:");
    for alert in &config.alerts {
        println!(
            "  {} ({}) every {}, {} condition(s){}",
            alert.id,
            alert.name,
            alert.interval,
            alert.conditions.len(),
            if alert.enabled { "" } else { " [disabled]" }
        );
    }

    Ok(())
}

async fn run_once(
    config_path: PathBuf,
    only: Option<RuleKind>,
    skip_alerts: bool,
) -> anyhow::Result<()> {
    let config = DaemonConfig::from_file(&config_path)?;
    let daemon = Daemon::build(&config)?;
    let engine = daemon.engine.clone();

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        for rule in engine.list_rules() {
            if !rule.enabled || only.is_some_and(|kind| kind != rule.kind()) {
                continue;
            }
            let report = engine.run_cycle(rule.kind())?;
            println!(
                "{}: firing={} problems={} inserted={} updated={} deleted={}",
                rule.kind(),
                report.firing,
                report.problems,
                report.reconcile.inserted,
                report.reconcile.updated,
                report.reconcile.deleted
            );
        }

        if skip_alerts {
            return Ok(());
        }
        for alert in engine.list_alerts() {
            if !alert.enabled {
                continue;
            }
            let evaluation = engine.evaluate_alert(&alert.id)?;
            if !evaluation.joints.errors.is_empty() {
                warn!(alert = %alert.id, errors = evaluation.joints.errors.len(), "joint errors");
            }
            println!(
                "{}: state={} matches={} attached={} detached={}",
                alert.id,
                evaluation.record.state,
                evaluation.record.eval_data.len(),
                evaluation.joints.attached,
                evaluation.joints.detached
            );
        }
        Ok(())
    })
    .await??;

    Ok(())
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    let toml = DaemonConfig::default().to_toml()?;

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(output, toml)?;

    println!("Config written to: {}", output.display());
    println!("\nEdit the [data] section to point at your inventory and samples, then run:");
    println!("  beacond run --config {}", output.display());

    Ok(())
}
