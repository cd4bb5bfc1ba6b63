// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Keeper Contributors

// SSH Tunnel Keeper - Common Library
// Site records, ssh invocation building, output classification and site logs

pub mod classifier;
pub mod command;
pub mod error;
pub mod site;
pub mod site_loader;
pub mod site_log;

pub use classifier::{requires_reset, RESET_SIGNATURES};
pub use command::{build_invocation, prepare_invocation, Invocation, SSH_PROGRAM};
pub use error::{Error, Result};
pub use site::{Credential, OptionValue, Password, SiteConfig};
pub use site_loader::{env_defines_site, load_sites, parse_sites, site_from_env};
pub use site_log::{Severity, SiteLog};
