//! Tool settings for quay.
//!
//! quay reads two settings files, separate from the build's `quay.toml`:
//! - Global: `~/.quay/config.toml` - User-wide defaults
//! - Project: `.quay/config.toml` - Project-specific overrides
//!
//! Project settings take precedence over global ones; command-line flags take
//! precedence over both.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default per-step timeout.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 900;
/// Default timeout for a plugin's load handshake.
pub const DEFAULT_IPC_LOAD_TIMEOUT_SECS: u64 = 60;
/// Default grace period for output pipes after a child exits.
pub const DEFAULT_LINGERING_GRACE_MS: u64 = 500;

/// quay tool settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Handler execution settings
    pub run: RunConfig,

    /// Feature flags
    pub features: FeaturesConfig,
}

/// Handler execution settings.
///
/// Unset values fall back to the defaults when read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Seconds a single step may run before it is killed
    pub step_timeout_secs: Option<u64>,

    /// Seconds a plugin may take to answer the load handshake
    pub ipc_load_timeout_secs: Option<u64>,

    /// Milliseconds output pipes may stay open after the child exited
    pub lingering_grace_ms: Option<u64>,
}

/// Feature flag settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Flags in `name` or `name=false` form
    pub flags: Vec<String>,
}

impl RunConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS))
    }

    pub fn ipc_load_timeout(&self) -> Duration {
        Duration::from_secs(
            self.ipc_load_timeout_secs
                .unwrap_or(DEFAULT_IPC_LOAD_TIMEOUT_SECS),
        )
    }

    pub fn lingering_grace(&self) -> Duration {
        Duration::from_millis(self.lingering_grace_ms.unwrap_or(DEFAULT_LINGERING_GRACE_MS))
    }
}

impl Config {
    /// Load settings from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Load settings with fallback to defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            Self::load(path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {}: {}", path.display(), e);
                Self::default()
            })
        } else {
            Self::default()
        }
    }

    /// Merge another config into this one (other takes precedence).
    pub fn merge(&mut self, other: Config) {
        if other.run.step_timeout_secs.is_some() {
            self.run.step_timeout_secs = other.run.step_timeout_secs;
        }
        if other.run.ipc_load_timeout_secs.is_some() {
            self.run.ipc_load_timeout_secs = other.run.ipc_load_timeout_secs;
        }
        if other.run.lingering_grace_ms.is_some() {
            self.run.lingering_grace_ms = other.run.lingering_grace_ms;
        }

        // Flags accumulate; a later `name=false` wins when parsed.
        self.features.flags.extend(other.features.flags);
    }
}

/// Feature flags after parsing, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureFlags(BTreeMap<String, bool>);

impl FeatureFlags {
    /// Parse `name`, `name=true` and `name=false` items; items may also be
    /// comma-separated lists. Later items win.
    pub fn parse<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut flags = BTreeMap::new();
        for item in items {
            for flag in item.as_ref().split(',').map(str::trim).filter(|f| !f.is_empty()) {
                match flag.split_once('=') {
                    Some((name, value)) => {
                        flags.insert(name.trim().to_string(), value.trim() != "false");
                    }
                    None => {
                        flags.insert(flag.to_string(), true);
                    }
                }
            }
        }
        FeatureFlags(flags)
    }

    pub fn enabled(&self, name: &str) -> bool {
        self.0.get(name).copied().unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Load merged settings from global and project locations.
///
/// Order of precedence (highest to lowest):
/// 1. Project config (.quay/config.toml)
/// 2. Global config (~/.quay/config.toml)
/// 3. Defaults
pub fn load_config(global_path: Option<&Path>, project_path: &Path) -> Config {
    let mut config = Config::default();

    if let Some(global_path) = global_path.filter(|p| p.exists()) {
        config.merge(Config::load_or_default(global_path));
    }

    if project_path.exists() {
        config.merge(Config::load_or_default(project_path));
    }

    config
}

/// Get the global quay config directory (~/.quay).
pub fn global_config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".quay"))
}

/// Get the project settings path (.quay/config.toml).
pub fn project_config_path(build_dir: &Path) -> PathBuf {
    build_dir.join(".quay").join("config.toml")
}
