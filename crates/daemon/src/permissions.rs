// Permissions hardening for log and state directories

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Set restrictive umask to prevent file permission leaks
/// Should be called early in main() before creating any files
pub fn set_restrictive_umask() {
    #[cfg(unix)]
    {
        // 0077: only the owner can access anything we create (logs, known_hosts)
        unsafe {
            libc::umask(0o077);
        }
        debug!("Set restrictive umask: 0077");
    }
}

/// Ensure a directory exists and is private to the owner (0700)
pub fn ensure_private_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .context(format!("Failed to create directory {}", path.display()))?;
        debug!("Created directory: {}", path.display());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))
            .context(format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}
