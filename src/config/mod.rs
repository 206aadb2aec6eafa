pub mod settings;

pub use settings::*;

use crate::error::AppResult;
use std::path::PathBuf;

/// Get the remote-shelf config directory
pub fn get_config_dir() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| crate::error::AppError::Config("Could not find config directory".into()))?
        .join("remote-shelf");

    Ok(config_dir)
}

/// Path of the known_hosts file used for host key verification
pub fn known_hosts_path(config_dir: &std::path::Path) -> PathBuf {
    config_dir.join("known_hosts")
}
