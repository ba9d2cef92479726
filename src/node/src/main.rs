//! Roster Authorization Node - Main Binary
//!
//! Operator-facing runner for the roster authorization subsystem:
//! - periodic roster sync into the role cache
//! - one-off authorization checks and manual syncs
//! - SIGHUP runs a manual sync, SIGUSR1 drops every cached role
//! - audit trail verification

use anyhow::Result;
use clap::{Parser, Subcommand};
use roster_authz::{Decision, SyncStatus};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};

use roster_authz_node::{verify_audit_file, AuthzNode, ControlCommand, NodeConfig};

/// Roster Authorization Node CLI
#[derive(Parser)]
#[command(name = "roster-authz-node")]
#[command(about = "Role resolution, roster sync and audit for the roster bot")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "roster-authz.toml", env = "ROSTER_AUTHZ_CONFIG")]
    config: PathBuf,

    /// Roster file (overrides config)
    #[arg(long, env = "ROSTER_PATH")]
    roster: Option<PathBuf>,

    /// Audit trail file (overrides config)
    #[arg(long, env = "ROSTER_AUDIT_PATH")]
    audit: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync scheduler until Ctrl+C (default)
    Serve,

    /// Resolve one action for one user
    Check {
        /// Telegram user id
        #[arg(long)]
        user: i64,

        /// Action name (search, view, edit, export, ...)
        #[arg(long)]
        action: String,
    },

    /// Run one manual roster sync
    Sync,

    /// Verify the hash chain of a JSON Lines audit trail
    VerifyAudit {
        /// Audit trail file
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Some(Command::VerifyAudit { file }) = &cli.command {
        init_logging(cli.verbose, cli.json, "warn");
        return verify(file).await;
    }

    // Load configuration
    let mut config = if cli.config.exists() {
        NodeConfig::load(&cli.config)?
    } else {
        NodeConfig::default()
    };

    init_logging(cli.verbose, cli.json || config.node.json_logs, &config.node.log_level);
    info!("Starting roster authorization node v{}", env!("CARGO_PKG_VERSION"));

    // Apply CLI overrides
    if let Some(roster) = cli.roster {
        config.roster.path = roster;
    }
    if let Some(audit) = cli.audit {
        config.audit.path = Some(audit);
    }

    // Validate configuration
    config.validate()?;

    let node = AuthzNode::new(config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            node.run(shutdown_signal(), control_signals()).await?;
            info!("Node stopped gracefully");
            Ok(ExitCode::SUCCESS)
        }
        Command::Check { user, action } => {
            let resolution = node.check(user, &action).await;
            println!(
                "{} (role: {}, cache: {})",
                match resolution.decision {
                    Decision::Granted => "allowed",
                    Decision::Denied | Decision::Error => "denied",
                },
                resolution.role,
                resolution.event.cache_state
            );
            node.close().await;
            Ok(if resolution.is_granted() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Command::Sync => {
            let event = node.sync_once().await;
            node.close().await;
            println!("{}", serde_json::to_string_pretty(&event)?);
            Ok(match event.status() {
                SyncStatus::Succeeded => ExitCode::SUCCESS,
                SyncStatus::Partial => ExitCode::from(2),
                SyncStatus::Failed => ExitCode::from(1),
            })
        }
        Command::VerifyAudit { .. } => Ok(ExitCode::SUCCESS),
    }
}

async fn verify(file: &std::path::Path) -> Result<ExitCode> {
    let verification = verify_audit_file(file).await?;
    if verification.valid {
        println!("ok: {} record(s) verified", verification.records_checked);
        Ok(ExitCode::SUCCESS)
    } else {
        println!(
            "broken at sequence {}: {}",
            verification
                .first_break_at
                .map(|s| s.to_string())
                .unwrap_or_default(),
            verification.reason.unwrap_or_default()
        );
        Ok(ExitCode::from(1))
    }
}

fn init_logging(verbose: bool, json: bool, level: &str) {
    let level = if verbose { "debug" } else { level };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{},roster_authz=debug", level).into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.with_line_number(true).init();
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal (Ctrl+C)");
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate() => {
            info!("Received shutdown signal (SIGTERM)");
        }
    }
}

/// Forwards SIGHUP and SIGUSR1 to the node as control commands
fn control_signals() -> mpsc::Receiver<ControlCommand> {
    let (tx, rx) = mpsc::channel(4);
    #[cfg(unix)]
    tokio::spawn(forward_control_signals(tx));
    #[cfg(not(unix))]
    drop(tx);
    rx
}

#[cfg(unix)]
async fn forward_control_signals(tx: mpsc::Sender<ControlCommand>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut hangup, mut user1) = match (
        signal(SignalKind::hangup()),
        signal(SignalKind::user_defined1()),
    ) {
        (Ok(hangup), Ok(user1)) => (hangup, user1),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to register control signal handlers: {}", e);
            return;
        }
    };

    loop {
        let command = tokio::select! {
            Some(()) = hangup.recv() => ControlCommand::Sync,
            Some(()) = user1.recv() => ControlCommand::InvalidateAll,
            else => break,
        };
        info!(?command, "Received control signal");
        if tx.send(command).await.is_err() {
            break;
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    // On non-Unix systems, only Ctrl+C is supported
    std::future::pending::<()>().await
}
