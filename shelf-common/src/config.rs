//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "SHELF_ROOT_FOLDER";

/// Environment variable naming an explicit configuration file
pub const CONFIG_FILE_ENV: &str = "SHELF_CONFIG";

/// Database file name inside the root folder
pub const DATABASE_FILE: &str = "shelf.db";

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. OS-dependent default
pub fn resolve_root_folder(cli_arg: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    default_root_folder()
}

/// OS-dependent default root folder
///
/// `~/.local/share/shelf` on Linux, the platform data dir elsewhere.
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("shelf"))
        .unwrap_or_else(|| PathBuf::from("./shelf_data"))
}

/// Create the root folder if missing and return the database path inside it
pub fn prepare_root_folder(root: &Path) -> Result<PathBuf> {
    if !root.exists() {
        std::fs::create_dir_all(root)?;
        info!("Created root folder: {}", root.display());
    }
    Ok(root.join(DATABASE_FILE))
}

/// Locate the configuration file for a service
///
/// Priority: explicit path → `SHELF_CONFIG` → `<root>/<service>.toml`.
/// Returns `None` when nothing exists; callers fall back to defaults.
pub fn locate_config_file(explicit: Option<&Path>, root: &Path, service: &str) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let candidate = root.join(format!("{}.toml", service));
    candidate.exists().then_some(candidate)
}

/// Load a TOML configuration file, or defaults when no file is given
///
/// A missing file is not fatal: a warning is logged and defaults are used.
/// A file that exists but fails to parse is a configuration error.
pub fn load_toml_config<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        debug!("No configuration file, using defaults");
        return Ok(T::default());
    };

    if !path.exists() {
        warn!("Configuration file not found: {} (using defaults)", path.display());
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Read an environment override, ignoring blank values
pub fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Standard user-agent for API clients
pub fn user_agent() -> String {
    format!(
        "shelf-genre/{} (https://github.com/shelf-genre/shelf)",
        env!("CARGO_PKG_VERSION")
    )
}
