//! snapvisor CLI entry point.

use clap::{Parser, Subcommand};
use snapvisor::config::SnapvisorConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cli;

/// snapvisor - snapshot and clone dispatcher for virtual machines
#[derive(Parser, Debug)]
#[command(name = "snapvisor")]
#[command(about = "Snapshot and clone dispatcher for virtual machines")]
#[command(version)]
struct Cli {
    /// Configuration file (default: platform config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage VM snapshots.
    #[command(subcommand)]
    Snapshot(cli::snapshot::SnapshotCmd),

    /// Clone a VM.
    Clone(cli::clone::CloneCmd),

    /// Manage the VM catalogue.
    #[command(subcommand)]
    Vms(cli::vms::VmsCmd),

    /// Start the HTTP API server.
    Serve(cli::serve::ServeCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging(cli.json_logs);

    tracing::debug!(version = snapvisor::VERSION, "starting snapvisor");

    // Load configuration
    let config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, code = %e.code(), "invalid configuration");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Snapshot(cmd) => cmd.run(config),
        Commands::Clone(cmd) => cmd.run(config),
        Commands::Vms(cmd) => cmd.run(config),
        Commands::Serve(cmd) => cmd.run(config),
    };

    // Handle errors
    if let Err(e) = result {
        tracing::error!(error = %e, code = %e.code(), "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Load the explicit config file, or the default one falling back to defaults.
fn load_config(path: Option<&std::path::Path>) -> snapvisor::Result<SnapvisorConfig> {
    let config = match path {
        Some(path) => SnapvisorConfig::load_from(path)?,
        None => match SnapvisorConfig::load() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                SnapvisorConfig::default()
            }
        },
    };
    config.validate()?;
    Ok(config)
}

/// Initialize the tracing subscriber.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("snapvisor=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
