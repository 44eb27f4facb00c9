//! Plugin declarations and manifests.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::event::LifecycleEvent;

/// File name of the plugin manifest inside a plugin directory.
pub const MANIFEST_FILE: &str = "manifest.yml";

/// Where a plugin declaration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PluginOrigin {
    /// Declared in `quay.toml`.
    #[default]
    #[serde(rename = "config")]
    Config,
    /// Installed through the UI.
    #[serde(rename = "ui")]
    Ui,
    /// Listed as a dependency of the site's package manifest.
    #[serde(rename = "package.json")]
    PackageJson,
}

impl fmt::Display for PluginOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginOrigin::Config => write!(f, "quay.toml"),
            PluginOrigin::Ui => write!(f, "the UI"),
            PluginOrigin::PackageJson => write!(f, "package.json"),
        }
    }
}

/// A plugin as declared in the build configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDeclaration {
    /// Local path (starting with `.` or `/`) or package name.
    pub package: String,
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_version: Option<String>,
    #[serde(default)]
    pub origin: PluginOrigin,
}

impl PluginDeclaration {
    /// Create a declaration with no inputs.
    pub fn new(package: impl Into<String>) -> Self {
        PluginDeclaration {
            package: package.into(),
            inputs: serde_json::Map::new(),
            pinned_version: None,
            origin: PluginOrigin::Config,
        }
    }

    /// Whether the package refers to a path on disk.
    pub fn is_local(&self) -> bool {
        self.package.starts_with('.') || self.package.starts_with('/')
    }
}

/// One declared input of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Parsed `manifest.yml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Command prefix used to start the plugin, relative to its directory.
    pub run: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
}

/// Input validation failure.
#[derive(Debug, Error, PartialEq)]
pub enum InputError {
    #[error("Invalid input \"{name}\" in plugin \"{plugin}\".\nCheck your plugin configuration to be sure that:\n  - the input name is spelled correctly\n  - the input is included in the plugin's available configuration options\n\nAvailable inputs: {available}")]
    Unknown {
        plugin: String,
        name: String,
        available: String,
    },

    #[error("Required input \"{name}\" is missing in plugin \"{plugin}\".")]
    MissingRequired { plugin: String, name: String },
}

impl PluginManifest {
    /// Load `manifest.yml` from a plugin directory.
    pub fn load(plugin_dir: &Path) -> Result<Self> {
        let path = plugin_dir.join(MANIFEST_FILE);
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read plugin manifest: {}", path.display()))?;
        Self::parse(&contents)
            .with_context(|| format!("failed to parse plugin manifest: {}", path.display()))
    }

    /// Parse manifest YAML.
    pub fn parse(contents: &str) -> Result<Self> {
        let manifest: PluginManifest = serde_yaml::from_str(contents)?;
        if manifest.run.is_empty() {
            anyhow::bail!("`run` must list at least the program to execute");
        }
        Ok(manifest)
    }

    /// Check user inputs against the declared ones and fill in defaults.
    pub fn validate_inputs(
        &self,
        plugin: &str,
        inputs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, InputError> {
        for name in inputs.keys() {
            if !self.inputs.iter().any(|spec| &spec.name == name) {
                let available: Vec<&str> = self.inputs.iter().map(|s| s.name.as_str()).collect();
                return Err(InputError::Unknown {
                    plugin: plugin.to_string(),
                    name: name.clone(),
                    available: if available.is_empty() {
                        "(none)".to_string()
                    } else {
                        available.join(", ")
                    },
                });
            }
        }

        let mut resolved = inputs.clone();
        for spec in &self.inputs {
            if resolved.contains_key(&spec.name) {
                continue;
            }
            match &spec.default {
                Some(default) => {
                    resolved.insert(spec.name.clone(), default.clone());
                }
                None if spec.required => {
                    return Err(InputError::MissingRequired {
                        plugin: plugin.to_string(),
                        name: spec.name.clone(),
                    });
                }
                None => {}
            }
        }
        Ok(resolved)
    }
}

/// A plugin that has been located, validated and asked for its handlers.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    /// Package as declared, used as the plugin's identity.
    pub package: String,
    pub origin: PluginOrigin,
    pub pinned_version: Option<String>,
    /// Inputs after validation and default filling.
    pub inputs: serde_json::Map<String, serde_json::Value>,
    /// Directory containing the manifest.
    pub dir: PathBuf,
    pub manifest: PluginManifest,
    /// Events the plugin exported, in lifecycle order.
    pub events: Vec<LifecycleEvent>,
}

impl LoadedPlugin {
    /// Installed version, if the manifest declares one.
    pub fn version(&self) -> Option<&Version> {
        self.manifest.version.as_ref()
    }

    /// Whether the plugin exports a handler for `event`.
    pub fn handles(&self, event: LifecycleEvent) -> bool {
        self.events.contains(&event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest() -> PluginManifest {
        PluginManifest::parse(
            r#"
name: greeter
version: 1.2.0
run: ["./plugin.sh"]
inputs:
  - name: greeting
    default: hello
  - name: target
    required: true
    description: who to greet
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_manifest_parse() {
        let m = manifest();
        assert_eq!(m.name, "greeter");
        assert_eq!(m.version, Some(Version::new(1, 2, 0)));
        assert_eq!(m.run, vec!["./plugin.sh"]);
        assert_eq!(m.inputs.len(), 2);
        assert!(m.inputs[1].required);
    }

    #[test]
    fn test_manifest_requires_run() {
        assert!(PluginManifest::parse("name: x\nrun: []\n").is_err());
    }

    #[test]
    fn test_inputs_defaults_filled() {
        let inputs = json!({"target": "world"});
        let resolved = manifest()
            .validate_inputs("greeter", inputs.as_object().unwrap())
            .unwrap();
        assert_eq!(resolved["greeting"], "hello");
        assert_eq!(resolved["target"], "world");
    }

    #[test]
    fn test_inputs_unknown_rejected() {
        let inputs = json!({"target": "world", "colour": "red"});
        let err = manifest()
            .validate_inputs("greeter", inputs.as_object().unwrap())
            .unwrap_err();
        assert!(matches!(err, InputError::Unknown { ref name, .. } if name == "colour"));
        assert!(err.to_string().contains("greeting, target"));
    }

    #[test]
    fn test_inputs_missing_required() {
        let err = manifest()
            .validate_inputs("greeter", &serde_json::Map::new())
            .unwrap_err();
        assert_eq!(
            err,
            InputError::MissingRequired {
                plugin: "greeter".to_string(),
                name: "target".to_string()
            }
        );
    }

    #[test]
    fn test_declaration_is_local() {
        assert!(PluginDeclaration::new("./plugins/a").is_local());
        assert!(PluginDeclaration::new("/abs/plugin").is_local());
        assert!(!PluginDeclaration::new("quay-plugin-sitemap").is_local());
    }

    #[test]
    fn test_origin_serde() {
        let origin: PluginOrigin = serde_json::from_value(json!("package.json")).unwrap();
        assert_eq!(origin, PluginOrigin::PackageJson);
    }
}
