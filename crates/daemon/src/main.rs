// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Keeper Contributors

// SSH Tunnel Keeper - Daemon
// Keeps one ssh tunnel per configured site alive until told to stop

mod config;
mod permissions;
mod process;
mod supervisor;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ssh_keeper_common::{env_defines_site, load_sites, site_from_env, SiteConfig, SiteLog};

use config::KeeperConfig;
use process::SshLauncher;
use supervisor::Supervisor;
use worker::WorkerSettings;

/// Keep ssh tunnels alive
#[derive(Parser, Debug)]
#[command(name = "ssh-keeper", version, about, long_about = None)]
struct Cli {
    /// Daemon configuration file (default: <config dir>/ssh-tunnel-keeper/keeper.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Site file, overrides `sites_path` from the configuration
    #[arg(short, long)]
    sites: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set restrictive umask before creating any files
    permissions::set_restrictive_umask();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ssh_keeper=info,ssh_keeper_daemon=info,ssh_keeper_common=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    info!("SSH Tunnel Keeper starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = match cli.config {
        Some(path) => path,
        None => KeeperConfig::default_path()?,
    };
    let (mut config, created) = KeeperConfig::load(&config_path)?;
    if let Some(sites) = cli.sites {
        config.sites_path = sites;
    }

    permissions::ensure_private_directory(&config.log_path)
        .context("Failed to prepare log directory")?;

    let main_log = SiteLog::new(config.log_path.join("main.log"), "main", config.echo);
    if created {
        main_log.info(format!(
            "Default configuration written to {}",
            config_path.display()
        ));
    }

    let sites = match read_sites(&config, &main_log) {
        Ok(sites) => sites,
        Err(e) => {
            main_log.error(format!("{:#}", e));
            return Err(e);
        }
    };

    permissions::ensure_private_directory(&config.ssh_dir())
        .context("Failed to prepare known_hosts directory")?;

    let mut supervisor = Supervisor::new(
        WorkerSettings::from_config(&config),
        Arc::new(SshLauncher),
        main_log,
    );
    let count = supervisor.add_sites(sites);
    info!("{} site(s) to keep alive", count);

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(shutdown.clone()));

    supervisor.run(shutdown).await;

    info!("SSH Tunnel Keeper stopped");
    Ok(())
}

/// Sites from the environment in container mode, from the site file otherwise
fn read_sites(config: &KeeperConfig, main_log: &SiteLog) -> Result<Vec<SiteConfig>> {
    let lookup = |key: &str| std::env::var(key).ok();

    if env_defines_site(lookup) {
        main_log.info("Using site configuration from environment variables");
        let site = site_from_env(lookup).context("Invalid site in environment")?;
        return Ok(vec![site]);
    }

    let sites = load_sites(&config.sites_path).context(format!(
        "Failed to load sites from {}",
        config.sites_path.display()
    ))?;
    Ok(sites)
}

/// Wait for Ctrl+C or SIGTERM, then cancel the root token
async fn wait_for_shutdown(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    shutdown.cancel();
                    return;
                }
            };

        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Received Ctrl+C, shutting down"),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        };
    }

    #[cfg(not(unix))]
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }

    shutdown.cancel();
}
