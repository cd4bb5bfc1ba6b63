// SSH Tunnel Keeper - Site Loader Module
// Reads site records from the site file or from the container environment

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::site::{OptionValue, Password, SiteConfig};

/// Name of the site built from environment variables
pub const ENV_SITE_NAME: &str = "default";

/// Load all sites from a TOML site file
pub fn load_sites(path: &Path) -> Result<Vec<SiteConfig>> {
    if !path.exists() {
        return Err(Error::SiteFileNotFound(path.display().to_string()));
    }

    let contents = fs::read_to_string(path)?;
    let sites = parse_sites(&contents)?;

    debug!("Loaded {} site(s) from {}", sites.len(), path.display());
    Ok(sites)
}

/// Parse the contents of a site file; each top-level table is one site
pub fn parse_sites(contents: &str) -> Result<Vec<SiteConfig>> {
    let tables: BTreeMap<String, SiteConfig> = toml::from_str(contents)?;

    Ok(tables
        .into_iter()
        .map(|(name, mut site)| {
            site.name = name;
            site
        })
        .collect())
}

/// Whether the environment describes the site (container deployment)
pub fn env_defines_site<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup("FQDN").is_some() && lookup("DOCKER_CONTAINER").is_some()
}

/// Build the single container site from environment variables
///
/// `lookup` is usually `|key| std::env::var(key).ok()`.
pub fn site_from_env<F>(lookup: F) -> Result<SiteConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let fqdn = lookup("FQDN").ok_or_else(|| Error::Config("FQDN is not set".to_string()))?;
    let user = lookup("USER").ok_or_else(|| Error::Config("USER is not set".to_string()))?;

    let mut site = SiteConfig::new(ENV_SITE_NAME, user, fqdn);

    if let Some(port) = lookup("SSH_PORT") {
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("Invalid SSH_PORT: {}", port)))?;
        site.ssh_port = Some(port);
    }

    site.password = lookup("PASSWORD").map(Password::new);
    site.identity_file = lookup("IDENTITY_FILE").map(PathBuf::from);
    site.hostkey = lookup("HOSTKEY");
    site.local_ports = lookup("LOCAL_PORTS").map(|v| split_list(&v)).unwrap_or_default();
    site.remote_ports = lookup("REMOTE_PORTS").map(|v| split_list(&v)).unwrap_or_default();

    if let Some(options) = lookup("OPTIONS") {
        for item in split_list(&options) {
            let item = item.replace(": ", ":");
            let (key, value) = item
                .split_once(':')
                .ok_or_else(|| Error::Config(format!("Invalid OPTIONS item: {}", item)))?;
            site.options
                .insert(key.trim().to_string(), OptionValue::Text(value.trim().to_string()));
        }
    }

    Ok(site)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
