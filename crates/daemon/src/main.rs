//! WebShell Daemon
//!
//! Serves interactive shells to browser terminals over websockets.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use webshell_daemon::config::{default_config_path, Config};
use webshell_daemon::WebShellServer;

/// WebShell Daemon - browser terminals backed by real shells.
#[derive(Parser, Debug)]
#[command(name = "webshell")]
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
    /// Start serving terminal sessions
    Start {
        /// Address to listen on, overrides the configuration
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,

        /// Shell to run for each session, overrides the configuration
        #[arg(long, value_name = "PATH")]
        shell: Option<String>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Configuration subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    // Initialize tracing
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Start { listen, shell } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(shell) = shell {
                config.shell.command = shell;
            }

            config.validate()?;
            tracing::info!("WebShell daemon starting (config: {:?})", config_path);
            run(config).await?;
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {}, use --force to overwrite",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }

    Ok(())
}

/// Serves until a shutdown signal arrives, then drains within the deadline.
async fn run(config: Config) -> anyhow::Result<()> {
    let server = WebShellServer::new(config);
    server.start().await?;

    wait_for_shutdown_signal().await?;

    match server.shutdown().await {
        Ok(report) => tracing::info!(
            sessions = report.sessions_cancelled,
            listeners = report.listeners_stopped,
            "WebShell daemon stopped"
        ),
        // The process exits regardless
        Err(e) => tracing::warn!(error = %e, "Shutdown did not complete cleanly"),
    }

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM, SIGINT or SIGQUIT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("Failed to register SIGQUIT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
        _ = sigquit.recv() => {
            tracing::info!("Received SIGQUIT");
        }
    }

    Ok(())
}
