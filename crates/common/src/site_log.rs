// SSH Tunnel Keeper - Site Log
// Append-only, human readable log file per site (plus one for the supervisor)

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Local;
use tracing::{error, info, warn};

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
    Warning,
    /// Problems with the logging call itself
    LogError,
    /// Output of the supervised tunnel process
    ExtCmd,
}

impl Severity {
    /// Numeric selector: 0 INFO, 1 ERROR, 2 WARNING, 3 LOG ERROR, 4 EXT CMD
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Severity::Info),
            1 => Some(Severity::Error),
            2 => Some(Severity::Warning),
            3 => Some(Severity::LogError),
            4 => Some(Severity::ExtCmd),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::LogError => "LOG ERROR",
            Severity::ExtCmd => "EXT CMD",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses a display name ("EXT CMD", "ext-cmd", ...) or a numeric selector
impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<u8>() {
            return Severity::from_code(code).ok_or_else(|| s.to_string());
        }

        match s.to_ascii_uppercase().replace(['-', '_'], " ").as_str() {
            "INFO" => Ok(Severity::Info),
            "ERROR" => Ok(Severity::Error),
            "WARNING" => Ok(Severity::Warning),
            "LOG ERROR" => Ok(Severity::LogError),
            "EXT CMD" => Ok(Severity::ExtCmd),
            _ => Err(s.to_string()),
        }
    }
}

/// Log sink writing `[YYYY-MM-DD HH:MM:SS] [SEVERITY] message` lines to one file
///
/// The file is opened in append mode for every entry, so independent
/// instances never share a handle. Failures are reported on the console and
/// never returned to the caller.
#[derive(Debug, Clone)]
pub struct SiteLog {
    path: PathBuf,
    site: String,
    echo: bool,
}

impl SiteLog {
    /// Create a sink for `path`; `echo` mirrors entries to the console
    pub fn new(path: impl Into<PathBuf>, site: impl Into<String>, echo: bool) -> Self {
        Self {
            path: path.into(),
            site: site.into(),
            echo,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(Severity::Info, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(Severity::Error, message.as_ref());
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.log(Severity::Warning, message.as_ref());
    }

    pub fn ext_cmd(&self, message: impl AsRef<str>) {
        self.log(Severity::ExtCmd, message.as_ref());
    }

    /// Log with a textual or numeric severity selector
    ///
    /// An unknown selector is itself recorded as a `LOG ERROR` entry.
    pub fn log_with(&self, selector: &str, message: &str) {
        match selector.parse::<Severity>() {
            Ok(severity) => self.log(severity, message),
            Err(bad) => self.log(
                Severity::LogError,
                &format!("Invalid severity '{}' has been defined", bad),
            ),
        }
    }

    pub fn log(&self, severity: Severity, message: &str) {
        let timestamp = Local::now().format("[%Y-%m-%d %H:%M:%S]").to_string();
        let entry = format!("{} [{}] {}", timestamp, severity, message);

        if let Err(e) = self.append(&entry) {
            error!(
                site = %self.site,
                "[FATAL LOG ERROR] {}: {} ({})",
                self.path.display(),
                e,
                entry
            );
            return;
        }

        if self.echo {
            match severity {
                Severity::Info | Severity::ExtCmd => info!(site = %self.site, "[{}] {}", severity, message),
                Severity::Warning => warn!(site = %self.site, "[{}] {}", severity, message),
                Severity::Error | Severity::LogError => {
                    error!(site = %self.site, "[{}] {}", severity, message)
                }
            }
        }
    }

    fn append(&self, entry: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", entry)
    }
}
