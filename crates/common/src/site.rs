// Site configuration structures for SSH Tunnel Keeper

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Port ssh uses when none is configured
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Password for a site, wiped from memory on drop
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Value of an extra ssh option (`-o Key=Value`)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Flag(bool),
    Number(i64),
    Text(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // ssh_config spells booleans as yes/no
            OptionValue::Flag(true) => f.write_str("yes"),
            OptionValue::Flag(false) => f.write_str("no"),
            OptionValue::Number(n) => write!(f, "{}", n),
            OptionValue::Text(s) => f.write_str(s),
        }
    }
}

/// One tunnel site, as read from the site file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SiteConfig {
    /// Site name (the table key in the site file)
    #[serde(skip)]
    pub name: String,
    /// Inactive sites are never started
    #[serde(default = "default_active")]
    pub active: bool,
    /// SSH server hostname or IP
    pub fqdn: String,
    /// SSH server port, ssh's default when unset
    pub ssh_port: Option<u16>,
    /// SSH username
    pub user: String,
    pub password: Option<Password>,
    /// Path to the private key passed with `-i`
    pub identity_file: Option<PathBuf>,
    /// Pinned host key (`<type> <base64>`), written to a per-site known_hosts file
    pub hostkey: Option<String>,
    /// `-L` forward specs, in order
    #[serde(default)]
    pub local_ports: Vec<String>,
    /// `-R` forward specs, in order
    #[serde(default)]
    pub remote_ports: Vec<String>,
    /// Extra `-o` options
    #[serde(default)]
    pub options: BTreeMap<String, OptionValue>,
}

fn default_active() -> bool {
    true
}

/// The single credential a valid site carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential<'a> {
    Identity(&'a Path),
    Password,
}

impl SiteConfig {
    /// Create an active site with no credential and no forwards
    pub fn new(name: impl Into<String>, user: impl Into<String>, fqdn: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: true,
            fqdn: fqdn.into(),
            ssh_port: None,
            user: user.into(),
            password: None,
            identity_file: None,
            hostkey: None,
            local_ports: Vec::new(),
            remote_ports: Vec::new(),
            options: BTreeMap::new(),
        }
    }

    /// Resolve the credential; exactly one of password and identity-file must be set
    pub fn credential(&self) -> Result<Credential<'_>> {
        match (&self.identity_file, &self.password) {
            (Some(_), Some(_)) => Err(Error::ConflictingCredentials(self.name.clone())),
            (None, None) => Err(Error::MissingCredential(self.name.clone())),
            (Some(path), None) => Ok(Credential::Identity(path)),
            (None, Some(_)) => Ok(Credential::Password),
        }
    }

    /// Validate the site configuration
    pub fn validate(&self) -> Result<()> {
        self.credential()?;

        if self.fqdn.trim().is_empty() {
            return Err(Error::Config(format!(
                "Host (fqdn) cannot be empty for site '{}'",
                self.name
            )));
        }
        if self.user.trim().is_empty() {
            return Err(Error::Config(format!(
                "User cannot be empty for site '{}'",
                self.name
            )));
        }
        if self.ssh_port == Some(0) {
            return Err(Error::Config(format!(
                "Port must be greater than 0 for site '{}'",
                self.name
            )));
        }

        Ok(())
    }

    /// Effective SSH port
    pub fn port(&self) -> u16 {
        self.ssh_port.unwrap_or(DEFAULT_SSH_PORT)
    }

    /// `user@host` target for the ssh invocation
    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.fqdn)
    }
}
