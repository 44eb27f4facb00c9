//! Process-wide context for quay operations.
//!
//! Holds the build directory and the location of quay's global settings, and
//! merges tool settings from both levels on request.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::constants::INTERNAL_DIR;
use crate::util::config::{self, Config};

/// Where a build runs and where its settings come from.
#[derive(Debug, Clone)]
pub struct GlobalContext {
    /// Build directory. `quay.toml` and `.quay/` are looked up here.
    cwd: PathBuf,
    /// Global settings directory (`~/.quay/`), absent without a home directory.
    home: Option<PathBuf>,
}

impl GlobalContext {
    /// Context rooted at the process working directory.
    pub fn new() -> Result<Self> {
        let cwd = std::env::current_dir().context("failed to get current directory")?;
        Ok(Self::with_cwd(cwd))
    }

    pub fn with_cwd(cwd: PathBuf) -> Self {
        GlobalContext {
            cwd,
            home: config::global_config_dir(),
        }
    }

    /// Use another global settings directory (tests and sandboxed runs).
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Global settings file, `~/.quay/config.toml`.
    pub fn config_path(&self) -> Option<PathBuf> {
        self.home.as_ref().map(|home| home.join("config.toml"))
    }

    /// The build directory's `.quay/`.
    pub fn project_quay_dir(&self) -> PathBuf {
        self.cwd.join(INTERNAL_DIR)
    }

    /// Merged tool settings: project over global over defaults.
    pub fn settings(&self) -> Config {
        let global = self.config_path();
        config::load_config(global.as_deref(), &config::project_config_path(&self.cwd))
    }
}
