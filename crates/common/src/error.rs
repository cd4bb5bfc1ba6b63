// Error types for SSH Tunnel Keeper

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Password or identity-file has to be set for site '{0}'")]
    MissingCredential(String),

    #[error("Can't have both, password and identity-file for site '{0}'")]
    ConflictingCredentials(String),

    #[error("Site file not found: {0}")]
    SiteFileNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
