//! `ksid` — the KSI daemon binary.
//!
//! Runs attached either way; `--foreground` selects stderr logging,
//! otherwise logs go to `<log_dir>/daemon.log`. True daemonization is
//! left to process managers. Exit codes: 0 on clean shutdown, non-zero
//! on fatal init errors (bad config, socket bind failure).

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use ksi_completion::ClaudeCliProvider;
use ksi_core::KsiHome;
use ksi_daemon::KsiDaemon;
use ksi_telemetry::{LogConfig, LogFormat, LogTarget};

/// KSI daemon — routes namespaced events between plugins over a Unix
/// socket.
#[derive(Parser)]
#[command(name = "ksid")]
#[command(author, version, about = "KSI event daemon")]
struct Args {
    /// Log to stderr instead of the daemon log file.
    #[arg(long)]
    foreground: bool,

    /// Override the Unix socket path (also `KSI_DAEMON_SOCKET`).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let home = KsiHome::resolve()?;
    let mut config = ksi_config::load(&home)?;
    if let Some(socket) = args.socket {
        config.socket_path = Some(socket);
    }
    if args.verbose {
        config.log_level = "debug".to_string();
    }

    let format = match config.log_format.as_str() {
        "pretty" => LogFormat::Pretty,
        "json" => LogFormat::Json,
        _ => LogFormat::Compact,
    };
    let target = if args.foreground {
        LogTarget::Stderr
    } else {
        LogTarget::File(config.resolve_log_dir(&home).join("daemon.log"))
    };
    let log_config = LogConfig::new(&config.log_level)
        .with_format(format)
        .with_target(target);
    if let Err(e) = ksi_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let provider = Arc::new(ClaudeCliProvider::new(
        config.completion.provider_command.clone(),
    ));
    let daemon = KsiDaemon::start(&home, config, provider).await?;

    println!(
        "{}",
        format!("ksid listening on {}", daemon.socket_path().display())
            .cyan()
            .bold()
    );

    // Wait for ctrl-c or a system:shutdown event.
    let mut shutdown_rx = daemon.subscribe_shutdown();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = shutdown_rx.recv() => {},
    }

    println!("\n{}", "Shutting down daemon...".yellow());
    daemon.shutdown().await;
    println!("{}", "Daemon stopped".green().bold());
    Ok(())
}
