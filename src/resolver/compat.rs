//! Plugin version compatibility.
//!
//! A plugins list (`--plugins-list`) maps package names to the versions that
//! are known to work under given conditions. Entries are ordered from newest
//! to oldest; the first entry is the latest version.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use semver::{Version, VersionReq};
use serde::Deserialize;

use crate::resolver::errors::ResolveError;
use crate::util::config::FeatureFlags;

/// One package of the plugins list.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginsListEntry {
    pub package: String,
    /// Latest version, used when `compatibility` is absent.
    #[serde(default)]
    pub version: Option<Version>,
    #[serde(default)]
    pub compatibility: Vec<CompatEntry>,
}

/// A version and the conditions under which it should be used.
#[derive(Debug, Clone, Deserialize)]
pub struct CompatEntry {
    pub version: Version,
    #[serde(default)]
    pub migration_guide: Option<String>,
    /// The entry only exists while this feature flag is on.
    #[serde(default)]
    pub feature_flag: Option<String>,
    /// Required versions of the site's dependencies.
    #[serde(default)]
    pub site_dependencies: BTreeMap<String, VersionReq>,
    /// Required version of quay itself.
    #[serde(default)]
    pub quay_version: Option<VersionReq>,
}

impl CompatEntry {
    fn has_conditions(&self) -> bool {
        !self.site_dependencies.is_empty() || self.quay_version.is_some()
    }
}

/// Facts the conditions are checked against.
#[derive(Debug, Clone)]
pub struct CompatContext<'a> {
    pub feature_flags: &'a FeatureFlags,
    /// Installed versions of the site's dependencies.
    pub site_dependencies: BTreeMap<String, Version>,
    pub quay_version: Version,
}

impl<'a> CompatContext<'a> {
    /// Read installed dependency versions from `<build_dir>/node_modules`.
    pub fn for_site(build_dir: &Path, feature_flags: &'a FeatureFlags) -> Self {
        CompatContext {
            feature_flags,
            site_dependencies: installed_dependencies(build_dir),
            quay_version: Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| Version::new(0, 0, 0)),
        }
    }

    fn holds(&self, entry: &CompatEntry) -> bool {
        let quay_ok = entry
            .quay_version
            .as_ref()
            .is_none_or(|req| req.matches(&self.quay_version));
        quay_ok
            && entry.site_dependencies.iter().all(|(name, req)| {
                self.site_dependencies
                    .get(name)
                    .is_some_and(|installed| req.matches(installed))
            })
    }
}

/// The version a plugin is expected to run at.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedVersion {
    pub version: Version,
    /// Newest version, which may differ from `version`.
    pub latest: Version,
    pub migration_guide: Option<String>,
}

/// Parsed plugins list.
#[derive(Debug, Clone, Default)]
pub struct PluginsList {
    entries: BTreeMap<String, PluginsListEntry>,
}

impl PluginsList {
    pub fn load(path: &Path) -> Result<Self, ResolveError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ResolveError::PluginsList {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&contents).map_err(|message| ResolveError::PluginsList {
            path: PathBuf::from(path),
            message,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, String> {
        let entries: Vec<PluginsListEntry> = serde_json::from_str(contents).map_err(|e| e.to_string())?;
        Ok(PluginsList {
            entries: entries.into_iter().map(|e| (e.package.clone(), e)).collect(),
        })
    }

    pub fn get(&self, package: &str) -> Option<&PluginsListEntry> {
        self.entries.get(package)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PluginsListEntry {
    fn versions(&self) -> Vec<CompatEntry> {
        if !self.compatibility.is_empty() {
            return self.compatibility.clone();
        }
        self.version
            .iter()
            .map(|version| CompatEntry {
                version: version.clone(),
                migration_guide: None,
                feature_flag: None,
                site_dependencies: BTreeMap::new(),
                quay_version: None,
            })
            .collect()
    }
}

/// Pick the version of `entry` that should run.
///
/// A pin wins over every condition. Otherwise entries behind a disabled
/// feature flag are dropped, and the first remaining entry that carries
/// conditions which all hold is chosen. Without such an entry the latest
/// remaining version is used.
pub fn select_version(
    entry: &PluginsListEntry,
    pinned: Option<&str>,
    ctx: &CompatContext<'_>,
) -> Option<ExpectedVersion> {
    let versions = entry.versions();
    let latest = versions.first()?.version.clone();

    if let Some(pin) = pinned.and_then(|p| VersionReq::parse(p).ok()) {
        return versions.iter().find(|v| pin.matches(&v.version)).map(|v| ExpectedVersion {
            version: v.version.clone(),
            latest: latest.clone(),
            migration_guide: v.migration_guide.clone(),
        });
    }

    let enabled: Vec<&CompatEntry> = versions
        .iter()
        .filter(|v| {
            v.feature_flag
                .as_deref()
                .is_none_or(|flag| ctx.feature_flags.enabled(flag))
        })
        .collect();
    let newest = enabled.first()?;
    let chosen = enabled
        .iter()
        .find(|v| v.has_conditions() && ctx.holds(v))
        .unwrap_or(newest);

    Some(ExpectedVersion {
        version: chosen.version.clone(),
        latest: newest.version.clone(),
        migration_guide: newest.migration_guide.clone(),
    })
}

/// Warning for an installed version that is not the expected one.
pub fn version_warning(package: &str, installed: Option<&Version>, expected: &ExpectedVersion) -> Option<String> {
    let installed = installed?;
    if *installed == expected.version {
        return None;
    }
    let mut message = format!(
        "Plugin \"{}\" is installed at version {} but version {} is expected",
        package, installed, expected.version
    );
    if let Some(guide) = &expected.migration_guide {
        if expected.version != expected.latest || *installed < expected.version {
            message.push_str(&format!("\nMigration guide: {}", guide));
        }
    }
    Some(message)
}

#[derive(Deserialize)]
struct PackageVersion {
    version: Version,
}

fn installed_dependencies(build_dir: &Path) -> BTreeMap<String, Version> {
    let modules = build_dir.join("node_modules");
    let Ok(entries) = std::fs::read_dir(&modules) else {
        return BTreeMap::new();
    };

    let mut dirs = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('@') {
            if let Ok(scoped) = std::fs::read_dir(entry.path()) {
                for inner in scoped.flatten() {
                    let inner_name = inner.file_name().to_string_lossy().into_owned();
                    dirs.push((format!("{}/{}", name, inner_name), inner.path()));
                }
            }
        } else {
            dirs.push((name, entry.path()));
        }
    }

    dirs.into_iter()
        .filter_map(|(name, dir)| {
            let contents = std::fs::read_to_string(dir.join("package.json")).ok()?;
            let package: PackageVersion = serde_json::from_str(&contents).ok()?;
            Some((name, package.version))
        })
        .collect()
}
