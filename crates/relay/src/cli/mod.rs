//! Command implementations.

pub mod config;
pub mod dedup;
pub mod dlq;
pub mod run;

use std::path::{Path, PathBuf};

use relay_core::Config;

/// Load the config from `path`, or from the default location when unset.
pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            let path = expand(path);
            Config::load_from(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config from {}: {e}", path.display())
            })
        }
        None => Ok(Config::load()?),
    }
}

/// Expand a leading `~` in a user-supplied path.
pub(crate) fn expand(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&path_str).into_owned())
}
