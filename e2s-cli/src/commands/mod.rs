//! Subcommand implementations, one module per subcommand.

pub mod diff;
pub mod drivers;
pub mod run;
pub mod status;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use e2s_core::SyncConfig;

/// Per-user config file consulted when `--config` is not given.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("e2s").join("config.yaml"))
}

/// Loads `explicit`, else the per-user file if present, else defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<SyncConfig> {
    if let Some(path) = explicit {
        return SyncConfig::load_at(path)
            .with_context(|| format!("failed to load config {}", path.display()));
    }
    match default_config_path().filter(|p| p.is_file()) {
        Some(path) => {
            tracing::debug!("using config {}", path.display());
            SyncConfig::load_at(&path)
                .with_context(|| format!("failed to load config {}", path.display()))
        }
        None => Ok(SyncConfig::default()),
    }
}
