//! Plan resolution errors and diagnostics.

use std::path::{Path, PathBuf};

use miette::NamedSource;
use thiserror::Error;

use crate::builder::classify::ErrorOrigin;
use crate::builder::runner::HandlerRunner;
use crate::core::error::{ClassifiedError, ErrorKind, RawError};
use crate::core::plugin::{InputError, PluginOrigin};
use crate::util::diagnostic::{
    find_span, render_miette, suggestions, Diagnostic, DuplicatePluginError, MissingPluginError,
};

/// Error while turning a configuration into an execution plan.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Plugin \"{package}\" must not be specified twice in {origin}")]
    DuplicatePlugin { package: String, origin: PluginOrigin },

    #[error("Plugin \"{package}\" could not be found")]
    MissingPlugin {
        package: String,
        origin: PluginOrigin,
        searched: Vec<PathBuf>,
    },

    #[error("Plugin \"{package}\" has an invalid manifest: {message}")]
    InvalidManifest {
        package: String,
        origin: PluginOrigin,
        message: String,
    },

    #[error("{source}")]
    PluginInput {
        package: String,
        origin: PluginOrigin,
        #[source]
        source: InputError,
    },

    #[error("Plugin \"{package}\" exports an unknown event handler \"{event}\"")]
    UnknownEvent {
        package: String,
        origin: PluginOrigin,
        event: String,
    },

    /// The plugin failed while reporting its handlers.
    #[error("{0}")]
    Load(Box<ClassifiedError>),

    #[error("failed to read plugins list {}: {message}", path.display())]
    PluginsList { path: PathBuf, message: String },
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::DuplicatePlugin { .. } | ResolveError::PluginsList { .. } => ErrorKind::ResolveConfig,
            ResolveError::MissingPlugin { .. } => ErrorKind::MissingPlugin,
            ResolveError::InvalidManifest { .. } | ResolveError::UnknownEvent { .. } => {
                ErrorKind::PluginValidation
            }
            ResolveError::PluginInput { .. } => ErrorKind::PluginInput,
            ResolveError::Load(error) => error.kind,
        }
    }

    /// Plugin the error is about, if any.
    pub fn package(&self) -> Option<&str> {
        match self {
            ResolveError::DuplicatePlugin { package, .. }
            | ResolveError::MissingPlugin { package, .. }
            | ResolveError::InvalidManifest { package, .. }
            | ResolveError::PluginInput { package, .. }
            | ResolveError::UnknownEvent { package, .. } => Some(package),
            ResolveError::Load(_) | ResolveError::PluginsList { .. } => None,
        }
    }

    fn origin(&self) -> ErrorOrigin {
        match self {
            ResolveError::MissingPlugin { package, origin, .. }
            | ResolveError::InvalidManifest { package, origin, .. }
            | ResolveError::PluginInput { package, origin, .. }
            | ResolveError::UnknownEvent { package, origin, .. } => ErrorOrigin::PluginLoad {
                package: package.clone(),
                origin: *origin,
            },
            ResolveError::PluginsList { path, .. } => ErrorOrigin::Config {
                path: Some(path.display().to_string()),
            },
            ResolveError::DuplicatePlugin { .. } | ResolveError::Load(_) => ErrorOrigin::Config { path: None },
        }
    }

    /// Classify the error for the build report.
    pub fn classify(self, runner: &HandlerRunner, config_path: Option<&Path>) -> ClassifiedError {
        if let ResolveError::Load(error) = self {
            return *error;
        }
        let origin = match self.origin() {
            ErrorOrigin::Config { path: None } => ErrorOrigin::Config {
                path: config_path.map(|p| p.display().to_string()),
            },
            origin => origin,
        };
        let raw = RawError::new(self.to_string()).tagged(self.kind(), Some(origin.location()));
        runner.classify(raw, &origin)
    }

    /// Convert to a user-friendly diagnostic.
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            ResolveError::DuplicatePlugin { .. } => {
                Diagnostic::error(self.to_string()).with_suggestion(suggestions::DUPLICATE_PLUGIN)
            }
            ResolveError::MissingPlugin { searched, .. } => {
                let mut diag = Diagnostic::error(self.to_string());
                for path in searched {
                    diag = diag.with_context(format!("looked in {}", path.display()));
                }
                diag.with_suggestion(suggestions::PLUGIN_NOT_FOUND)
            }
            ResolveError::InvalidManifest { .. } | ResolveError::UnknownEvent { .. } => {
                Diagnostic::error(self.to_string())
                    .with_suggestion("Check the plugin's `manifest.yml` and the events it exports")
            }
            ResolveError::PluginInput { .. } => {
                Diagnostic::error(self.to_string()).with_suggestion(suggestions::PLUGIN_INPUTS)
            }
            ResolveError::Load(error) => Diagnostic::error(error.title()).with_context(error.message.clone()),
            ResolveError::PluginsList { path, .. } => Diagnostic::error(self.to_string()).with_location(path),
        }
    }

    /// Source-annotated rendering, for the errors that point into `quay.toml`.
    pub fn render_annotated(&self, config_path: Option<&Path>) -> Option<String> {
        match self {
            ResolveError::DuplicatePlugin {
                package,
                origin: PluginOrigin::Config,
            } => {
                let (src, span) = match config_path.and_then(|p| Some((p, std::fs::read_to_string(p).ok()?))) {
                    Some((path, source)) => {
                        let span = find_span(&source, &format!("\"{}\"", package), 1);
                        (Some(NamedSource::new(path.display().to_string(), source)), span)
                    }
                    None => (None, None),
                };
                Some(render_miette(&DuplicatePluginError {
                    package: package.clone(),
                    src,
                    span,
                }))
            }
            ResolveError::MissingPlugin { package, searched, .. } => {
                let looked = searched
                    .iter()
                    .map(|p| format!("looked in {}", p.display()))
                    .collect::<Vec<_>>()
                    .join("\n");
                Some(render_miette(&MissingPluginError {
                    package: package.clone(),
                    searched: searched.clone(),
                    help: Some(format!("{}\n{}", looked, suggestions::PLUGIN_NOT_FOUND.trim_start_matches("help: "))),
                }))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::runner::RunnerOptions;
    use crate::core::error::Severity;
    use crate::util::secrets::Redactor;

    fn runner() -> HandlerRunner {
        HandlerRunner::new(RunnerOptions::default(), Redactor::new())
    }

    #[test]
    fn test_kinds_map_to_severity() {
        let missing = ResolveError::MissingPlugin {
            package: "quay-plugin-x".into(),
            origin: PluginOrigin::Config,
            searched: vec![],
        };
        assert_eq!(missing.kind(), ErrorKind::MissingPlugin);

        let classified = missing.classify(&runner(), None);
        assert_eq!(classified.kind, ErrorKind::MissingPlugin);
        assert_eq!(classified.severity, Severity::PluginError);
    }

    #[test]
    fn test_input_error_keeps_message() {
        let error = ResolveError::PluginInput {
            package: "./plugins/a".into(),
            origin: PluginOrigin::Config,
            source: InputError::MissingRequired {
                plugin: "./plugins/a".into(),
                name: "token".into(),
            },
        };
        assert_eq!(error.kind(), ErrorKind::PluginInput);
        assert!(error.to_string().contains("Required input \"token\""));
    }

    #[test]
    fn test_duplicate_points_at_second_declaration() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("quay.toml");
        std::fs::write(
            &path,
            "[[plugins]]\npackage = \"./p\"\n\n[[plugins]]\npackage = \"./p\"\n",
        )
        .unwrap();

        let error = ResolveError::DuplicatePlugin {
            package: "./p".into(),
            origin: PluginOrigin::Config,
        };
        let rendered = error.render_annotated(Some(&path)).unwrap();
        assert!(rendered.contains("must not be specified twice"));
        assert!(rendered.contains("declared again here"));

        let classified = error.classify(&runner(), Some(&path));
        assert_eq!(classified.kind, ErrorKind::ResolveConfig);
    }

    #[test]
    fn test_missing_plugin_lists_searched_paths() {
        let error = ResolveError::MissingPlugin {
            package: "quay-plugin-x".into(),
            origin: PluginOrigin::Config,
            searched: vec![PathBuf::from("/site/.quay/plugins/quay-plugin-x")],
        };
        let diag = error.to_diagnostic();
        assert!(diag.context[0].contains(".quay/plugins/quay-plugin-x"));
        assert!(error.render_annotated(None).unwrap().contains("could not be found"));
    }
}
