//! Error renderings for failures that stop a build before it starts.
//!
//! Configuration and resolution errors carry the file they came from and a
//! hint on how to fix them. The structured ones (duplicate or missing
//! plugins) are miette diagnostics so they can point into `quay.toml`.

use std::fmt;
use std::path::PathBuf;

use miette::{Diagnostic as MietteDiagnostic, NamedSource, SourceSpan};
use thiserror::Error;

/// Fix-it hints shared by configuration and resolution errors.
pub mod suggestions {
    pub const NO_CONFIG: &str = "help: Create a `quay.toml` or pass `--config <path>`";
    pub const CHECK_CONFIG: &str = "help: Check the syntax and types in `quay.toml`";
    pub const PLUGIN_NOT_FOUND: &str =
        "help: Check the `package` path, or install the plugin into `.quay/plugins/`";
    pub const DUPLICATE_PLUGIN: &str = "help: Remove one of the `[[plugins]]` entries";
    pub const PLUGIN_INPUTS: &str = "help: Compare `[plugins.inputs]` with the plugin's `manifest.yml`";
}

/// An error message with the file it concerns and suggested fixes.
#[derive(Debug, Clone, Default)]
pub struct Diagnostic {
    pub message: String,
    /// Detail lines, printed under the message.
    pub context: Vec<String>,
    pub suggestions: Vec<String>,
    pub location: Option<PathBuf>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            message: message.into(),
            ..Diagnostic::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context.push(context.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.location = Some(path.into());
        self
    }

    /// Render for the terminal.
    ///
    /// Multi-line context (plugin stacks, parser output) is indented under
    /// a single `=` marker.
    pub fn format(&self, color: bool) -> String {
        let paint = |code: &str, text: &str| {
            if color {
                format!("\x1b[{}m{}\x1b[0m", code, text)
            } else {
                text.to_string()
            }
        };

        let mut output = format!("{}: {}\n", paint("1;31", "error"), self.message);
        if let Some(path) = &self.location {
            output.push_str(&format!("  --> {}\n", path.display()));
        }
        for ctx in &self.context {
            let mut lines = ctx.lines();
            if let Some(first) = lines.next() {
                output.push_str(&format!("  = {}\n", first));
            }
            for line in lines {
                output.push_str(&format!("    {}\n", line));
            }
        }

        if !self.suggestions.is_empty() {
            output.push('\n');
            for suggestion in &self.suggestions {
                match suggestion.strip_prefix("help: ") {
                    Some(text) => output.push_str(&format!("{}: {}\n", paint("1;32", "help"), text)),
                    None => output.push_str(&format!("{}\n", suggestion)),
                }
            }
        }
        output
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(false))
    }
}

/// The same plugin declared more than once.
#[derive(Debug, Error, MietteDiagnostic)]
#[error("Plugin \"{package}\" must not be specified twice")]
#[diagnostic(
    code(quay::resolve::duplicate_plugin),
    help("Remove the duplicate `[[plugins]]` entry from quay.toml")
)]
pub struct DuplicatePluginError {
    pub package: String,
    #[source_code]
    pub src: Option<NamedSource<String>>,
    #[label("declared again here")]
    pub span: Option<SourceSpan>,
}

/// A declared plugin that cannot be located.
#[derive(Debug, Error, MietteDiagnostic)]
#[error("Plugin \"{package}\" could not be found")]
#[diagnostic(code(quay::resolve::missing_plugin))]
pub struct MissingPluginError {
    pub package: String,
    /// Locations that were searched.
    pub searched: Vec<PathBuf>,
    #[help]
    pub help: Option<String>,
}

/// Locate `needle` in `source` as a labelled span.
pub fn find_span(source: &str, needle: &str, occurrence: usize) -> Option<SourceSpan> {
    source
        .match_indices(needle)
        .nth(occurrence)
        .map(|(offset, m)| SourceSpan::from((offset, m.len())))
}

/// Render a miette diagnostic as plain text.
pub fn render_miette(diagnostic: &dyn MietteDiagnostic) -> String {
    let mut out = String::new();
    let handler = miette::GraphicalReportHandler::new_themed(miette::GraphicalTheme::unicode_nocolor());
    if handler.render_report(&mut out, diagnostic).is_err() {
        out = diagnostic.to_string();
    }
    out
}
