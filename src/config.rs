//! Pinner configuration.
//!
//! Loaded from `~/.pinner/config.toml`. Every key is optional and the file
//! itself may be absent; command-line flags override whatever it sets.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Pinner configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    /// Substrings that exclude a `uses` value from pinning (e.g. `"my-org/"`).
    pub skip_actions: Vec<String>,

    /// Resolution worker count. Host parallelism when unset.
    pub workers: Option<NonZeroUsize>,

    /// Mirror cache root.
    pub cache_dir: Option<PathBuf>,

    /// Patch every occurrence of a duplicated invocation, not just the first.
    pub replace_all_occurrences: bool,

    /// `GH_CONFIG_DIR` for every `gh` call.
    pub gh_config_dir: Option<PathBuf>,
}

impl Config {
    /// Load config from `~/.pinner/config.toml`, or defaults if it doesn't exist.
    pub fn load() -> Result<Self, String> {
        match Self::path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load config from a specific file, or defaults if it doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;

        toml::from_str(&contents).map_err(|e| format!("invalid config at {}: {e}", path.display()))
    }

    /// The config file path: `~/.pinner/config.toml`.
    pub fn path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".pinner").join("config.toml"))
    }
}
