//! edged - EdgeLink control-plane daemon
//!
//! Owns the mesh topology for a set of virtual networks and keeps it
//! converged while devices come and go.

use clap::{Parser, Subcommand};
use edged::DaemonConfig;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "edged")]
#[command(about = "EdgeLink mesh control plane")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane
    Run {
        /// Path to config file
        #[arg(short, long, env = "EDGED_CONFIG", default_value = "/etc/edged/config.toml")]
        config: PathBuf,

        /// Emit logs as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/edged/config.toml")]
        output: PathBuf,
    },

    /// Validate a config file without starting
    CheckConfig {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/edged/config.toml")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("edged=info,edge_topology=info"))?;

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, json } => {
            init_tracing(json)?;
            run_daemon(config).await?;
        }

        Commands::InitConfig { output } => {
            init_config(&output)?;
        }

        Commands::CheckConfig { config } => {
            let loaded = DaemonConfig::from_file(&config)?;
            println!(
                "{}: ok ({} networks, {} relays)",
                config.display(),
                loaded.networks.len(),
                loaded.relays.len()
            );
        }
    }

    Ok(())
}

async fn run_daemon(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting edged");

    let config = DaemonConfig::from_file(&config_path)?;
    info!(
        networks = config.networks.len(),
        relays = config.relays.len(),
        "loaded config"
    );

    edged::run(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    })
    .await?;
    Ok(())
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    let content = DaemonConfig::sample().to_toml()?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, content)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the networks and relays, then run:");
    println!("  edged run --config {}", output.display());

    Ok(())
}
