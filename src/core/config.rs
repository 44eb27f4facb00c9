//! Build configuration loading.
//!
//! `quay.toml` is parsed into a `serde_json::Value` tree, the selected
//! `[context.<name>]` section is merged over the top level, and the result is
//! normalized so that every later component can rely on its shape.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;
use toml_edit::{DocumentMut, Item, TableLike};

use crate::core::mutable::{self, Mutation};
use crate::core::plugin::PluginDeclaration;
use crate::util::diagnostic::{suggestions, Diagnostic};

/// Name of the build configuration file.
pub const CONFIG_FILE: &str = "quay.toml";

/// Errors while loading or normalizing the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid cached configuration {}: {message}", path.display())]
    CachedConfig { path: PathBuf, message: String },

    #[error("Configuration property {key} {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    /// Convert to a user-friendly diagnostic.
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            ConfigError::NotFound { path } => Diagnostic::error(self.to_string())
                .with_location(path)
                .with_suggestion(suggestions::NO_CONFIG),
            ConfigError::Read { path, .. } => Diagnostic::error(self.to_string()).with_location(path),
            ConfigError::Parse { path, message } => Diagnostic::error("could not parse the configuration file")
                .with_location(path)
                .with_context(message.trim().to_string())
                .with_suggestion(suggestions::CHECK_CONFIG),
            ConfigError::CachedConfig { path, message } => Diagnostic::error("could not use the cached configuration")
                .with_location(path)
                .with_context(message.clone()),
            ConfigError::Invalid { key, message } => {
                Diagnostic::error(format!("Configuration property {} {}", key, message))
                    .with_suggestion(suggestions::CHECK_CONFIG)
            }
        }
    }
}

/// How to find and resolve the configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    /// Repository root; `quay.toml` is looked up here.
    pub build_dir: PathBuf,
    /// Explicit configuration file (`--config`).
    pub config_path: Option<PathBuf>,
    /// Deploy context whose overrides apply (`--context`).
    pub context: Option<String>,
    /// Already-resolved configuration (`--cached-config`).
    pub cached_config: Option<PathBuf>,
}

/// A loaded and normalized configuration.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: Value,
    /// File the configuration came from, if any.
    pub config_path: Option<PathBuf>,
    pub build_dir: PathBuf,
    pub plugins: Vec<PluginDeclaration>,
}

/// Load, merge and normalize the configuration.
pub fn load(opts: &ConfigOptions) -> Result<ResolvedConfig, ConfigError> {
    let (raw, config_path) = if let Some(cached) = &opts.cached_config {
        (read_cached(cached)?, None)
    } else {
        let path = match &opts.config_path {
            Some(path) => {
                let path = opts.build_dir.join(path);
                if !path.exists() {
                    return Err(ConfigError::NotFound { path });
                }
                Some(path)
            }
            None => Some(opts.build_dir.join(CONFIG_FILE)).filter(|p| p.exists()),
        };
        let raw = match &path {
            Some(path) => parse_file(path)?,
            None => {
                tracing::debug!("no {} found in {}", CONFIG_FILE, opts.build_dir.display());
                Value::Object(Map::new())
            }
        };
        (raw, path)
    };

    let merged = apply_context(raw, opts.context.as_deref());
    let config = normalize(merged)?;
    let plugins = plugin_declarations(&config)?;

    Ok(ResolvedConfig {
        config,
        config_path,
        build_dir: opts.build_dir.clone(),
        plugins,
    })
}

/// Parse a TOML configuration file into a JSON tree.
pub fn parse_file(path: &Path) -> Result<Value, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&contents).map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

/// Parse TOML text into a JSON tree.
pub fn parse_str(contents: &str) -> Result<Value, String> {
    toml::from_str::<Value>(contents).map_err(|e| e.to_string())
}

fn read_cached(path: &Path) -> Result<Value, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&contents).map_err(|e| ConfigError::CachedConfig {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    // A cached payload may wrap the tree as `{"config": {...}}`, optionally
    // with the `configMutations` a previous build made to it.
    let mut map = match value {
        Value::Object(map) if map.get("config").is_some_and(Value::is_object) => map,
        other => return Ok(other),
    };
    let config = map.remove("config").unwrap_or(Value::Null);
    let log: Vec<Mutation> = match map.remove("configMutations") {
        Some(entries) => serde_json::from_value(entries).map_err(|e| ConfigError::CachedConfig {
            path: path.to_path_buf(),
            message: format!("invalid configMutations: {}", e),
        })?,
        None => Vec::new(),
    };
    if !log.is_empty() {
        tracing::debug!(mutations = log.len(), "replaying cached configuration mutations");
    }
    Ok(mutable::replay(&config, &log))
}

/// Merge `[context.<name>]` over the top level, then drop all contexts.
pub fn apply_context(mut config: Value, context: Option<&str>) -> Value {
    let contexts = config
        .as_object_mut()
        .and_then(|map| map.remove("context"));

    if let (Some(name), Some(Value::Object(mut contexts))) = (context, contexts) {
        if let Some(overrides) = contexts.remove(name) {
            tracing::debug!("applying context overrides for `{}`", name);
            deep_merge(&mut config, overrides);
        }
    }
    config
}

fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Normalize the configuration tree.
pub fn normalize(config: Value) -> Result<Value, ConfigError> {
    let mut root = match config {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => return Err(invalid("(root)", "must be a table")),
    };

    let build = root
        .entry("build")
        .or_insert_with(|| Value::Object(Map::new()));
    let build = build
        .as_object_mut()
        .ok_or_else(|| invalid("build", "must be a table"))?;

    let base = match build.get("base") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(invalid("build.base", "must be a string")),
    };
    build.insert("base".to_string(), Value::String(base.clone()));

    match build.get("publish") {
        None | Some(Value::Null) => {
            build.insert("publish".to_string(), Value::String(base));
        }
        Some(Value::String(_)) => {}
        Some(_) => return Err(invalid("build.publish", "must be a string")),
    }

    if let Some(command) = build.get("command") {
        if !command.is_string() {
            return Err(invalid("build.command", "must be a string"));
        }
    }

    let legacy_build_functions = build.remove("functions");

    let functions = root
        .entry("functions")
        .or_insert_with(|| Value::Object(Map::new()));
    let functions = functions
        .as_object_mut()
        .ok_or_else(|| invalid("functions", "must be a table"))?;
    let legacy_directory = functions.remove("directory");

    let directory = legacy_directory.or(legacy_build_functions);
    if let Some(directory) = directory {
        if !directory.is_string() {
            return Err(invalid("functions.directory", "must be a string"));
        }
        let all = functions
            .entry("*")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(all) = all.as_object_mut() {
            all.entry("directory").or_insert(directory);
        }
    }

    let plugins = root
        .entry("plugins")
        .or_insert_with(|| Value::Array(Vec::new()));
    let plugins = plugins
        .as_array_mut()
        .ok_or_else(|| invalid("plugins", "must be an array"))?;
    for (index, plugin) in plugins.iter_mut().enumerate() {
        let entry = plugin
            .as_object_mut()
            .ok_or_else(|| invalid(&format!("plugins[{}]", index), "must be a table"))?;
        if !entry.get("package").is_some_and(Value::is_string) {
            return Err(invalid(&format!("plugins[{}].package", index), "must be a string"));
        }
        entry
            .entry("inputs")
            .or_insert_with(|| Value::Object(Map::new()));
        entry
            .entry("origin")
            .or_insert_with(|| Value::String("config".to_string()));
    }

    Ok(Value::Object(root))
}

/// Extract the declared plugins from a normalized configuration.
pub fn plugin_declarations(config: &Value) -> Result<Vec<PluginDeclaration>, ConfigError> {
    let plugins = config.get("plugins").cloned().unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(plugins).map_err(|e| invalid("plugins", &format!("is invalid: {}", e)))
}

// =============================================================================
// Saving
// =============================================================================

/// Write accepted mutations back into a TOML file, keeping untouched
/// formatting and comments.
pub fn save_mutations(path: &Path, mutations: &[Mutation]) -> anyhow::Result<()> {
    use anyhow::Context;

    let contents = if path.exists() {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?
    } else {
        String::new()
    };
    let mut doc: DocumentMut = contents
        .parse()
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    for mutation in mutations {
        set_item(doc.as_table_mut(), &mutation.keys, json_to_item(&mutation.value))
            .with_context(|| format!("failed to save `{}`", mutation.keys_string))?;
    }

    std::fs::write(path, doc.to_string())
        .with_context(|| format!("failed to write config file: {}", path.display()))?;
    Ok(())
}

fn set_item(table: &mut dyn TableLike, keys: &[String], item: Option<Item>) -> anyhow::Result<()> {
    let Some((last, parents)) = keys.split_last() else {
        anyhow::bail!("empty key path");
    };

    let mut current = table;
    for key in parents {
        if current.get(key).and_then(Item::as_table_like).is_none() {
            current.insert(key, Item::Table(toml_edit::Table::new()));
        }
        current = current
            .get_mut(key)
            .and_then(Item::as_table_like_mut)
            .ok_or_else(|| anyhow::anyhow!("`{}` is not a table", key))?;
    }

    match item {
        Some(item) => {
            current.insert(last, item);
        }
        None => {
            current.remove(last);
        }
    }
    Ok(())
}

fn json_to_item(value: &Value) -> Option<Item> {
    match value {
        Value::Object(map) => {
            let mut table = toml_edit::Table::new();
            for (key, value) in map {
                if let Some(item) = json_to_item(value) {
                    table.insert(key, item);
                }
            }
            Some(Item::Table(table))
        }
        Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_object) => {
            let mut tables = toml_edit::ArrayOfTables::new();
            for item in items {
                if let Some(Item::Table(table)) = json_to_item(item) {
                    tables.push(table);
                }
            }
            Some(Item::ArrayOfTables(tables))
        }
        other => json_to_toml_value(other).map(Item::Value),
    }
}

fn json_to_toml_value(value: &Value) -> Option<toml_edit::Value> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some((*b).into()),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(i.into()),
            None => n.as_f64().map(Into::into),
        },
        Value::String(s) => Some(s.as_str().into()),
        Value::Array(items) => {
            let mut array = toml_edit::Array::new();
            for item in items.iter().filter_map(json_to_toml_value) {
                array.push(item);
            }
            Some(toml_edit::Value::Array(array))
        }
        Value::Object(map) => {
            let mut table = toml_edit::InlineTable::new();
            for (key, item) in map {
                if let Some(item) = json_to_toml_value(item) {
                    table.insert(key.as_str(), item);
                }
            }
            Some(toml_edit::Value::InlineTable(table))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::LifecycleEvent;
    use crate::core::mutable::{parse_keys, MutableConfig};
    use serde_json::json;
    use tempfile::TempDir;

    fn write_config(dir: &Path, contents: &str) {
        std::fs::write(dir.join(CONFIG_FILE), contents).unwrap();
    }

    #[test]
    fn test_missing_config_is_empty() {
        let tmp = TempDir::new().unwrap();
        let resolved = load(&ConfigOptions {
            build_dir: tmp.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        assert!(resolved.config_path.is_none());
        assert!(resolved.plugins.is_empty());
        assert_eq!(resolved.config["build"]["base"], "");
        assert_eq!(resolved.config["build"]["publish"], "");
    }

    #[test]
    fn test_explicit_missing_config_errors() {
        let tmp = TempDir::new().unwrap();
        let err = load(&ConfigOptions {
            build_dir: tmp.path().to_path_buf(),
            config_path: Some(PathBuf::from("nope.toml")),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_load_and_normalize() {
        let tmp = TempDir::new().unwrap();
        write_config(
            tmp.path(),
            r#"
[build]
base = "site"
command = "make"
functions = "lambda"

[[plugins]]
package = "./plugins/hello"
[plugins.inputs]
greeting = "hi"
"#,
        );

        let resolved = load(&ConfigOptions {
            build_dir: tmp.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(resolved.config["build"]["publish"], "site");
        assert!(resolved.config["build"].get("functions").is_none());
        assert_eq!(resolved.config["functions"]["*"]["directory"], "lambda");
        assert_eq!(resolved.plugins.len(), 1);
        assert_eq!(resolved.plugins[0].package, "./plugins/hello");
        assert_eq!(resolved.plugins[0].inputs["greeting"], "hi");
    }

    #[test]
    fn test_context_overrides() {
        let config = json!({
            "build": {"command": "make", "publish": "dist"},
            "context": {"staging": {"build": {"command": "make staging"}}}
        });
        let merged = apply_context(config, Some("staging"));
        assert_eq!(merged["build"]["command"], "make staging");
        assert_eq!(merged["build"]["publish"], "dist");
        assert!(merged.get("context").is_none());
    }

    #[test]
    fn test_invalid_plugin_entry() {
        let err = normalize(json!({"plugins": [{"inputs": {}}]})).unwrap_err();
        assert_eq!(err.to_string(), "Configuration property plugins[0].package must be a string");
    }

    #[test]
    fn test_cached_config() {
        let tmp = TempDir::new().unwrap();
        let cached = tmp.path().join("cached.json");
        std::fs::write(&cached, r#"{"config": {"build": {"command": "cached"}}}"#).unwrap();
        write_config(tmp.path(), "[build]\ncommand = \"from file\"\n");

        let resolved = load(&ConfigOptions {
            build_dir: tmp.path().to_path_buf(),
            cached_config: Some(cached),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(resolved.config["build"]["command"], "cached");
    }

    #[test]
    fn test_cached_config_replays_mutations() {
        let tmp = TempDir::new().unwrap();
        let cached = tmp.path().join("cached.json");
        std::fs::write(
            &cached,
            r#"{
                "config": {"build": {"command": "make", "publish": "dist", "environment": {"A": "1"}}},
                "configMutations": [
                    {"keys": ["build", "publish"], "keysString": "build.publish", "value": "out", "event": "onPreBuild"},
                    {"keys": ["build", "environment", "A"], "keysString": "build.environment.A", "value": null, "event": "onBuild"}
                ]
            }"#,
        )
        .unwrap();

        let resolved = load(&ConfigOptions {
            build_dir: tmp.path().to_path_buf(),
            cached_config: Some(cached),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(resolved.config["build"]["publish"], "out");
        assert!(resolved.config["build"]["environment"].get("A").is_none());
    }

    #[test]
    fn test_cached_config_rejects_bad_mutations() {
        let tmp = TempDir::new().unwrap();
        let cached = tmp.path().join("cached.json");
        std::fs::write(&cached, r#"{"config": {}, "configMutations": [{"keys": 1}]}"#).unwrap();

        let err = load(&ConfigOptions {
            build_dir: tmp.path().to_path_buf(),
            cached_config: Some(cached),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::CachedConfig { .. }));
    }

    #[test]
    fn test_save_mutations_preserves_comments() {
        let tmp = TempDir::new().unwrap();
        write_config(
            tmp.path(),
            "# site settings\n[build]\ncommand = \"make\" # original\npublish = \"dist\"\n",
        );

        let mut cfg = MutableConfig::new(parse_file(&tmp.path().join(CONFIG_FILE)).unwrap());
        cfg.set(&parse_keys("build.command"), json!("make all"), LifecycleEvent::PreBuild)
            .unwrap();
        cfg.set(&parse_keys("build.environment.MODE"), json!("prod"), LifecycleEvent::Build)
            .unwrap();

        let path = tmp.path().join(CONFIG_FILE);
        save_mutations(&path, cfg.log().entries()).unwrap();

        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("# site settings"));
        assert!(saved.contains("publish = \"dist\""));
        let reparsed = parse_file(&path).unwrap();
        assert_eq!(reparsed["build"]["command"], "make all");
        assert_eq!(reparsed["build"]["environment"]["MODE"], "prod");
    }
}
