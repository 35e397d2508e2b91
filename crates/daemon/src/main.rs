//! termdash Daemon
//!
//! Headless service owning the dashboard's terminal sessions.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use termdash_daemon::backend::SqliteStore;
use termdash_daemon::config::{default_config_path, Config};
use termdash_daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use termdash_daemon::session::{now_millis, PersistedSession, SessionEvent};

/// termdash Daemon - durable terminal sessions for the dashboard.
#[derive(Parser, Debug)]
#[command(name = "termdash-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon and recover surviving sessions
    Start,

    /// Inspect stored sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for session inspection.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List stored sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,

        /// Include terminated sessions
        #[arg(long, short)]
        all: bool,
    },
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration file if none exists
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Start => {
            config.validate()?;
            tracing::info!("termdash daemon starting...");
            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_headless(&mut orchestrator).await?;
        }
        Commands::Sessions(SessionsCommands::List { json, all }) => {
            let db_path = config.daemon.database_path();
            let store = SqliteStore::open(&db_path).with_context(|| {
                format!("Failed to open session database: {}", db_path.display())
            })?;
            let mut sessions = Vec::new();
            for row in store.list_all()? {
                match row {
                    Ok(session) => sessions.push(session),
                    Err(unreadable) => eprintln!("warning: {unreadable}"),
                }
            }
            if !all {
                sessions.retain(|s| !s.status.is_terminated());
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions_table(&sessions);
            }
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("Config file already exists: {}", config_path.display());
            } else {
                Config::default().save(&config_path)?;
                println!("Wrote default config to {}", config_path.display());
            }
        }
    }

    Ok(())
}

/// Run the daemon until SIGTERM or SIGINT.
async fn run_headless(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Recovered(report) => {
                    tracing::info!(
                        recovered = report.recovered.len(),
                        terminated = report.terminated.len(),
                        failed = report.failed.len(),
                        "Startup recovery finished"
                    );
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    let mut session_events = orchestrator.session_manager().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = session_events.recv().await {
            if !matches!(event, SessionEvent::Output { .. }) {
                tracing::debug!(
                    event = event.name(),
                    session_id = %event.session_id(),
                    "Session event"
                );
            }
        }
    });

    orchestrator.start().await?;

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[PersistedSession]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let id_width = sessions.iter().map(|s| s.id.len()).max().unwrap_or(8).max(8);
    let project_width = sessions
        .iter()
        .map(|s| s.project_id.len())
        .max()
        .unwrap_or(7)
        .max(7);

    println!(
        "{:<id_width$}  {:<project_width$}  {:<12}  {:>10}",
        "ID", "PROJECT", "STATUS", "ACTIVE",
    );
    println!("{}", "-".repeat(id_width + project_width + 28));

    let now = now_millis();
    for session in sessions {
        println!(
            "{:<id_width$}  {:<project_width$}  {:<12}  {:>10}",
            session.id,
            session.project_id,
            session.status.as_str(),
            format_relative_time(now, session.last_active_at),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix millisecond timestamp relative to `now` (e.g., "5m ago").
fn format_relative_time(now: i64, timestamp: i64) -> String {
    let elapsed = (now - timestamp).max(0) / 1000;

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}
