//! Constants derived from the live configuration.
//!
//! Constants are recomputed from [`MutableConfig`] every time a step is about
//! to run, so a mutation of `build.publish` or `functions.*.directory` is
//! visible to the very next step.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::mutable::MutableConfig;

/// Directory holding everything quay generates inside the build directory.
pub const INTERNAL_DIR: &str = ".quay";
/// Conventional functions directory used when none is configured.
pub const DEFAULT_FUNCTIONS_SRC: &str = "quay/functions";
/// Conventional edge functions directory used when none is configured.
pub const DEFAULT_EDGE_FUNCTIONS_SRC: &str = "quay/edge-functions";
/// Default platform API host.
pub const DEFAULT_API_HOST: &str = "api.quay.dev";

/// Inputs to constant derivation that do not live in the configuration.
#[derive(Debug, Clone)]
pub struct ConstantsContext {
    pub build_dir: PathBuf,
    pub config_path: Option<PathBuf>,
    pub is_local: bool,
    pub site_id: Option<String>,
    pub api_host: String,
}

impl ConstantsContext {
    /// Context for a local build in `build_dir`.
    pub fn local(build_dir: impl Into<PathBuf>) -> Self {
        ConstantsContext {
            build_dir: build_dir.into(),
            config_path: None,
            is_local: true,
            site_id: None,
            api_host: DEFAULT_API_HOST.to_string(),
        }
    }
}

/// Values plugins and core steps receive as `constants`.
///
/// Paths are relative to the build directory when they live inside it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Constants {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    pub publish_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub functions_src: Option<String>,
    pub functions_dist: String,
    pub internal_functions_src: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_functions_src: Option<String>,
    pub edge_functions_dist: String,
    pub internal_edge_functions_src: String,
    pub cache_dir: String,
    pub is_local: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    pub build_version: String,
    pub api_host: String,
}

impl Constants {
    /// Derive constants from the current configuration.
    pub fn compute(config: &MutableConfig, ctx: &ConstantsContext) -> Self {
        let build_dir = &ctx.build_dir;
        let base = config.get_str("build.base").unwrap_or("");
        let publish = config.get_str("build.publish").unwrap_or(base);

        let functions_src = non_empty(config.get_str("functions.*.directory"))
            .map(String::from)
            .or_else(|| existing(build_dir, DEFAULT_FUNCTIONS_SRC));
        let edge_functions_src = non_empty(config.get_str("build.edge_functions"))
            .map(String::from)
            .or_else(|| existing(build_dir, DEFAULT_EDGE_FUNCTIONS_SRC));

        Constants {
            config_path: ctx
                .config_path
                .as_deref()
                .map(|p| relative_to(build_dir, p)),
            publish_dir: relative_to(build_dir, &build_dir.join(publish)),
            functions_src,
            functions_dist: internal("functions"),
            internal_functions_src: internal("functions-internal"),
            edge_functions_src,
            edge_functions_dist: internal("edge-functions-dist"),
            internal_edge_functions_src: internal("edge-functions"),
            cache_dir: internal("cache"),
            is_local: ctx.is_local,
            site_id: ctx.site_id.clone(),
            build_version: env!("CARGO_PKG_VERSION").to_string(),
            api_host: ctx.api_host.clone(),
        }
    }

    /// Resolve a constant path against the build directory.
    pub fn resolve(build_dir: &Path, value: &str) -> PathBuf {
        build_dir.join(value)
    }

    /// Serialize for the plugin request.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn internal(name: &str) -> String {
    format!("{}/{}", INTERNAL_DIR, name)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

fn existing(build_dir: &Path, rel: &str) -> Option<String> {
    build_dir.join(rel).is_dir().then(|| rel.to_string())
}

fn relative_to(build_dir: &Path, path: &Path) -> String {
    let rel = if path.is_absolute() {
        pathdiff::diff_paths(path, build_dir)
            .filter(|p| !p.starts_with(".."))
            .unwrap_or_else(|| path.to_path_buf())
    } else {
        path.to_path_buf()
    };
    let s = rel.to_string_lossy().trim_end_matches('/').to_string();
    if s.is_empty() {
        ".".to_string()
    } else {
        s
    }
}
