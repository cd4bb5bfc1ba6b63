// SSH Tunnel Keeper - Command Builder
// Turns a site record into the ssh invocation that keeps its tunnel up

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::site::{Credential, SiteConfig, DEFAULT_SSH_PORT};

/// Default tunnel program
pub const SSH_PROGRAM: &str = "ssh";

/// No stdin, no remote command, no pseudo-tty
const BASE_FLAGS: &str = "-nNT";

/// Program and argument vector for one tunnel process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Build the invocation for a site
///
/// `known_hosts` is the pinned known_hosts file, when the site pins a host key.
/// Argument order: base flags, `-L` forwards, `-R` forwards, `-p`, `-i`,
/// `-o UserKnownHostsFile`, extra `-o` options, `user@host`.
pub fn build_invocation(program: &str, site: &SiteConfig, known_hosts: Option<&Path>) -> Invocation {
    let mut args = vec![BASE_FLAGS.to_string()];

    for spec in &site.local_ports {
        args.push("-L".to_string());
        args.push(spec.clone());
    }

    for spec in &site.remote_ports {
        args.push("-R".to_string());
        args.push(spec.clone());
    }

    if let Some(port) = site.ssh_port.filter(|port| *port != DEFAULT_SSH_PORT) {
        args.push("-p".to_string());
        args.push(port.to_string());
    }

    // Passwords never end up on the command line
    if let Ok(Credential::Identity(path)) = site.credential() {
        args.push("-i".to_string());
        args.push(path.display().to_string());
    }

    if let Some(path) = known_hosts {
        args.push("-o".to_string());
        args.push(format!("UserKnownHostsFile={}", path.display()));
    }

    for (key, value) in &site.options {
        args.push("-o".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(site.target());

    Invocation {
        program: program.to_string(),
        args,
    }
}

/// Write the pinned known_hosts file (if any) and build the invocation
///
/// The file lives at `<ssh_dir>/<site name>` and must exist before ssh starts.
pub fn prepare_invocation(program: &str, site: &SiteConfig, ssh_dir: &Path) -> Result<Invocation> {
    let known_hosts = match &site.hostkey {
        Some(hostkey) => Some(write_known_hosts(site, hostkey, ssh_dir)?),
        None => None,
    };

    Ok(build_invocation(program, site, known_hosts.as_deref()))
}

/// Write the single-entry known_hosts file for a site, returning its path
pub fn write_known_hosts(site: &SiteConfig, hostkey: &str, ssh_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(ssh_dir)?;

    let path = ssh_dir.join(&site.name);
    let entry = format!(
        "{} {}\n",
        format_host_pattern(&site.fqdn, site.port()),
        hostkey.trim()
    );
    fs::write(&path, entry)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }

    debug!("Wrote pinned host key for site '{}' to {}", site.name, path.display());
    Ok(path)
}

/// Format host pattern for known_hosts (e.g., "host" or "[host]:port")
fn format_host_pattern(host: &str, port: u16) -> String {
    if port == DEFAULT_SSH_PORT {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}
