//! Plugin loading.
//!
//! Each declared plugin is located on disk, its manifest parsed, its inputs
//! checked, and finally the plugin itself is started once to report which
//! event handlers it exports.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::builder::env::Environment;
use crate::builder::runner::HandlerRunner;
use crate::core::constants::INTERNAL_DIR;
use crate::core::event::LifecycleEvent;
use crate::core::plugin::{LoadedPlugin, PluginDeclaration, PluginManifest, PluginOrigin};
use crate::resolver::compat::{self, CompatContext, PluginsList};
use crate::resolver::errors::ResolveError;
use crate::util::config::FeatureFlags;

/// Inputs shared by every plugin load.
pub struct LoadOptions<'a> {
    pub build_dir: &'a Path,
    pub env: &'a Environment,
    pub feature_flags: &'a FeatureFlags,
    pub plugins_list: Option<&'a PluginsList>,
    pub runner: &'a HandlerRunner,
}

/// Plugins ready to be planned, plus anything worth telling the user.
#[derive(Debug, Default)]
pub struct LoadedPlugins {
    pub plugins: Vec<LoadedPlugin>,
    pub warnings: Vec<String>,
}

/// Directory a declared plugin is expected in.
pub fn locate(decl: &PluginDeclaration, build_dir: &Path) -> PathBuf {
    if decl.is_local() {
        build_dir.join(&decl.package)
    } else {
        build_dir.join(INTERNAL_DIR).join("plugins").join(&decl.package)
    }
}

/// Drop repeated declarations.
///
/// The same package with the same pin declared twice by one origin is an
/// error. Across origins the first declaration wins.
pub fn dedupe(decls: &[PluginDeclaration]) -> Result<Vec<PluginDeclaration>, ResolveError> {
    let mut kept: Vec<PluginDeclaration> = Vec::with_capacity(decls.len());
    for decl in decls {
        let existing = kept
            .iter()
            .find(|k| k.package == decl.package && k.pinned_version == decl.pinned_version);
        match existing {
            Some(existing) if existing.origin == decl.origin => {
                return Err(ResolveError::DuplicatePlugin {
                    package: decl.package.clone(),
                    origin: decl.origin,
                });
            }
            Some(existing) => {
                tracing::debug!(
                    package = %decl.package,
                    "ignoring declaration from {}, already declared in {}",
                    decl.origin,
                    existing.origin
                );
            }
            None => kept.push(decl.clone()),
        }
    }
    Ok(kept)
}

/// Load every declared plugin, in declaration order.
pub fn load_plugins(decls: &[PluginDeclaration], opts: &LoadOptions<'_>) -> Result<LoadedPlugins, ResolveError> {
    let decls = dedupe(decls)?;
    let compat_ctx = opts
        .plugins_list
        .map(|_| CompatContext::for_site(opts.build_dir, opts.feature_flags));

    let mut loaded = LoadedPlugins::default();
    for decl in &decls {
        let plugin = load_plugin(decl, opts)?;

        if let (Some(list), Some(ctx)) = (opts.plugins_list, compat_ctx.as_ref()) {
            if let Some(entry) = list.get(&decl.package) {
                match compat::select_version(entry, decl.pinned_version.as_deref(), ctx) {
                    Some(expected) => {
                        if let Some(warning) = compat::version_warning(&decl.package, plugin.version(), &expected) {
                            loaded.warnings.push(warning);
                        }
                    }
                    None => loaded.warnings.push(format!(
                        "Plugin \"{}\" has no version matching \"{}\"",
                        decl.package,
                        decl.pinned_version.as_deref().unwrap_or("*")
                    )),
                }
            }
        }

        tracing::debug!(
            package = %plugin.package,
            version = ?plugin.version().map(|v| v.to_string()),
            events = ?plugin.events.iter().map(|e| e.as_str()).collect::<Vec<_>>(),
            "loaded plugin"
        );
        loaded.plugins.push(plugin);
    }
    Ok(loaded)
}

/// Locate, validate and handshake with one plugin.
pub fn load_plugin(decl: &PluginDeclaration, opts: &LoadOptions<'_>) -> Result<LoadedPlugin, ResolveError> {
    let dir = locate(decl, opts.build_dir);
    if !dir.is_dir() {
        return Err(ResolveError::MissingPlugin {
            package: decl.package.clone(),
            origin: decl.origin,
            searched: vec![dir],
        });
    }

    let manifest = PluginManifest::load(&dir).map_err(|e| ResolveError::InvalidManifest {
        package: decl.package.clone(),
        origin: decl.origin,
        message: format!("{:#}", e),
    })?;

    let inputs = manifest
        .validate_inputs(&decl.package, &decl.inputs)
        .map_err(|source| ResolveError::PluginInput {
            package: decl.package.clone(),
            origin: decl.origin,
            source,
        })?;

    let mut plugin = LoadedPlugin {
        package: decl.package.clone(),
        origin: decl.origin,
        pinned_version: decl.pinned_version.clone(),
        inputs,
        dir,
        manifest,
        events: Vec::new(),
    };

    let exported = opts
        .runner
        .handshake(&plugin, opts.build_dir, opts.env, opts.feature_flags)
        .map_err(|e| ResolveError::Load(Box::new(e)))?;
    plugin.events = parse_events(&decl.package, decl.origin, &exported)?;
    Ok(plugin)
}

/// Validate exported handler names and sort them into lifecycle order.
fn parse_events(
    package: &str,
    origin: PluginOrigin,
    exported: &[String],
) -> Result<Vec<LifecycleEvent>, ResolveError> {
    let mut events = Vec::with_capacity(exported.len());
    for name in exported {
        let event = LifecycleEvent::from_str(name).map_err(|_| ResolveError::UnknownEvent {
            package: package.to_string(),
            origin,
            event: name.clone(),
        })?;
        if !events.contains(&event) {
            events.push(event);
        }
    }
    events.sort();
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn test_locate() {
        let build = Path::new("/site");
        assert_eq!(locate(&PluginDeclaration::new("./plugins/a"), build), Path::new("/site/./plugins/a"));
        assert_eq!(
            locate(&PluginDeclaration::new("quay-plugin-x"), build),
            Path::new("/site/.quay/plugins/quay-plugin-x")
        );
    }

    #[test]
    fn test_dedupe() {
        let a = PluginDeclaration::new("a");
        let mut a_ui = a.clone();
        a_ui.origin = PluginOrigin::Ui;
        let mut a_pinned = a.clone();
        a_pinned.pinned_version = Some("1".into());

        let kept = dedupe(&[a.clone(), a_ui, a_pinned]).unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].origin, PluginOrigin::Config);

        let err = dedupe(&[a.clone(), a]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResolveConfig);
    }

    #[test]
    fn test_parse_events_sorts_and_rejects_unknown() {
        let exported = vec!["onEnd".to_string(), "onPreBuild".to_string(), "onEnd".to_string()];
        let events = parse_events("p", PluginOrigin::Config, &exported).unwrap();
        assert_eq!(events, vec![LifecycleEvent::PreBuild, LifecycleEvent::End]);

        let err = parse_events("p", PluginOrigin::Config, &["onDeploy".to_string()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PluginValidation);
        assert!(err.to_string().contains("onDeploy"));
    }
}
