// SSH Tunnel Keeper - Daemon Config Module
// Handles daemon configuration (log and state locations, ssh program)
// Site records are loaded by ssh-keeper-common::site_loader

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use ssh_keeper_common::SSH_PROGRAM;

/// Directory name used under the platform config/state/data directories
const APP_DIR: &str = "ssh-tunnel-keeper";

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeeperConfig {
    /// Directory for main.log and one <site>.log per site
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    /// Site file (TOML, one table per site)
    #[serde(default = "default_sites_path")]
    pub sites_path: PathBuf,

    /// Directory holding the per-site pinned known_hosts files (under .ssh/)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Program started for every tunnel
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,

    /// Mirror site log entries to the console
    #[serde(default = "default_echo")]
    pub echo: bool,
}

fn default_log_path() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("logs")
}

fn default_sites_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("sites.toml")
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_ssh_program() -> String {
    SSH_PROGRAM.to_string()
}

fn default_echo() -> bool {
    true
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            log_path: default_log_path(),
            sites_path: default_sites_path(),
            state_dir: default_state_dir(),
            ssh_program: default_ssh_program(),
            echo: default_echo(),
        }
    }
}

impl KeeperConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if self.ssh_program.trim().is_empty() {
            anyhow::bail!("ssh_program cannot be empty");
        }
        Ok(())
    }

    /// Load the configuration, writing defaults when the file does not exist
    ///
    /// The returned flag is true when the defaults were just written.
    pub fn load(config_path: &Path) -> Result<(Self, bool)> {
        if !config_path.exists() {
            info!("No configuration found, using defaults");
            let config = Self::default();
            config.save(config_path)?;
            return Ok((config, true));
        }

        let contents = fs::read_to_string(config_path)
            .context(format!("Failed to read {}", config_path.display()))?;

        let config: Self = toml::from_str(&contents)
            .context(format!("Failed to parse {}", config_path.display()))?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded configuration from: {}", config_path.display());
        Ok((config, false))
    }

    /// Save the configuration to file
    pub fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(config_path, contents).context("Failed to write configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(config_path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved configuration to: {}", config_path.display());
        Ok(())
    }

    /// Default path of the configuration file
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join(APP_DIR).join("keeper.toml"))
    }

    /// Directory for the pinned known_hosts files
    pub fn ssh_dir(&self) -> PathBuf {
        self.state_dir.join(".ssh")
    }
}
