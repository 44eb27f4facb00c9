//! Failure taxonomy.
//!
//! Every failure observed during a build ends up as a [`ClassifiedError`]:
//! a closed [`ErrorKind`], the [`Severity`] that kind implies, and where it
//! happened. Severity alone drives pipeline control flow and exit codes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::event::LifecycleEvent;
use crate::core::plugin::PluginOrigin;

/// Severity of a failure, ordered from harmless to fatal-for-the-host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    /// Logged only.
    None,
    /// Logged, does not alter success.
    Warning,
    /// Build stopped on purpose; not a failure.
    Cancellation,
    /// The user's configuration, command or explicit `fail_build`.
    UserError,
    /// A plugin misbehaved; only that plugin is affected.
    PluginError,
    /// The orchestrator or the IPC boundary failed.
    SystemError,
}

impl Severity {
    /// Externally visible severity code, also used as the process exit code.
    pub fn code(&self) -> u8 {
        match self {
            Severity::None | Severity::Warning => 0,
            Severity::Cancellation => 1,
            Severity::UserError => 2,
            Severity::PluginError => 3,
            Severity::SystemError => 4,
        }
    }

    /// Whether this severity aborts the remaining plan-defined events.
    pub fn aborts_pipeline(&self) -> bool {
        matches!(self, Severity::UserError | Severity::SystemError)
    }

    /// Whether this severity marks the build as unsuccessful.
    pub fn is_failure(&self) -> bool {
        self.code() != 0
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::None => "none",
            Severity::Warning => "warning",
            Severity::Cancellation => "cancellation",
            Severity::UserError => "user-error",
            Severity::PluginError => "plugin-error",
            Severity::SystemError => "system-error",
        };
        f.write_str(s)
    }
}

/// Closed set of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid or inconsistent configuration, detected before the pipeline starts.
    ResolveConfig,
    /// A handler attempted a forbidden configuration mutation.
    ConfigMutation,
    /// The user's build (or dev) command exited unsuccessfully.
    BuildCommand,
    /// Explicit `fail_build` from a plugin.
    FailBuild,
    /// Explicit `fail_plugin` from a plugin.
    FailPlugin,
    /// Explicit `cancel_build` from a plugin.
    CancelBuild,
    /// Plugin inputs do not match its manifest.
    PluginInput,
    /// The plugin's exported shape is invalid (unknown events, bad manifest).
    PluginValidation,
    /// The plugin path or package cannot be found.
    MissingPlugin,
    /// The plugin failed while being loaded.
    PluginLoad,
    /// Uncaught exception inside a plugin handler.
    PluginInternal,
    /// The plugin process exited before answering.
    PluginExit,
    /// Malformed or missing IPC traffic.
    Ipc,
    /// A step exceeded its deadline.
    StepTimeout,
    /// A built-in core step failed.
    CoreStep,
    /// A non-blocking platform API call failed.
    Api,
    /// A blocking deploy API call failed.
    Deploy,
    /// Bug in the orchestrator itself.
    CoreInternal,
}

impl ErrorKind {
    /// Severity implied by this kind.
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::ResolveConfig
            | ErrorKind::ConfigMutation
            | ErrorKind::BuildCommand
            | ErrorKind::FailBuild
            | ErrorKind::PluginInput
            | ErrorKind::Deploy => Severity::UserError,
            ErrorKind::FailPlugin
            | ErrorKind::PluginValidation
            | ErrorKind::MissingPlugin
            | ErrorKind::PluginLoad
            | ErrorKind::PluginInternal
            | ErrorKind::PluginExit => Severity::PluginError,
            ErrorKind::CancelBuild => Severity::Cancellation,
            ErrorKind::Api => Severity::Warning,
            ErrorKind::Ipc
            | ErrorKind::StepTimeout
            | ErrorKind::CoreStep
            | ErrorKind::CoreInternal => Severity::SystemError,
        }
    }

    /// Short title shown above the error message.
    pub fn title(&self) -> &'static str {
        match self {
            ErrorKind::ResolveConfig => "Configuration error",
            ErrorKind::ConfigMutation => "Configuration mutation error",
            ErrorKind::BuildCommand => "Build command failed",
            ErrorKind::FailBuild => "Plugin failed the build",
            ErrorKind::FailPlugin => "Plugin failed",
            ErrorKind::CancelBuild => "Build canceled",
            ErrorKind::PluginInput => "Plugin invalid inputs",
            ErrorKind::PluginValidation => "Plugin invalid",
            ErrorKind::MissingPlugin => "Plugin could not be found",
            ErrorKind::PluginLoad => "Plugin could not be loaded",
            ErrorKind::PluginInternal => "Plugin internal error",
            ErrorKind::PluginExit => "Plugin exited unexpectedly",
            ErrorKind::Ipc => "Internal error",
            ErrorKind::StepTimeout => "Internal error",
            ErrorKind::CoreStep => "Core step failed",
            ErrorKind::Api => "API error",
            ErrorKind::Deploy => "Deploy failed",
            ErrorKind::CoreInternal => "Core internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorLocation {
    /// The user's build or dev command.
    BuildCommand { command: String, event: LifecycleEvent },
    /// A plugin, optionally inside one of its event handlers.
    Plugin {
        package: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<LifecycleEvent>,
        #[serde(skip_serializing_if = "Option::is_none")]
        origin: Option<PluginOrigin>,
    },
    /// A built-in core step.
    CoreStep {
        id: String,
        name: String,
        event: LifecycleEvent,
    },
    /// A call to the platform API.
    Api { endpoint: String },
    /// Configuration loading or validation.
    Config {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Somewhere inside the orchestrator.
    Core,
}

impl fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorLocation::BuildCommand { command, event } => {
                write!(f, "In {} command from \"{}\"", event, command)
            }
            ErrorLocation::Plugin {
                package,
                event,
                origin,
            } => {
                match event {
                    Some(event) => write!(f, "In \"{}\" event in \"{}\" plugin", event, package)?,
                    None => write!(f, "In \"{}\" plugin", package)?,
                }
                if let Some(origin) = origin {
                    write!(f, " from {}", origin)?;
                }
                Ok(())
            }
            ErrorLocation::CoreStep { name, event, .. } => {
                write!(f, "During {} ({} event)", name, event)
            }
            ErrorLocation::Api { endpoint } => write!(f, "While calling the API endpoint '{}'", endpoint),
            ErrorLocation::Config { path: Some(path) } => write!(f, "In configuration file {}", path),
            ErrorLocation::Config { path: None } => write!(f, "In configuration"),
            ErrorLocation::Core => write!(f, "In the build orchestrator"),
        }
    }
}

/// A classification attached to an error by the layer that produced it.
///
/// When present it is trusted over location-based inference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTag {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<ErrorLocation>,
}

/// A failure before classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawError {
    /// Human-readable message.
    pub message: String,
    /// Stack trace or backtrace text, if the producer had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Overrides the default grouping key when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_message: Option<String>,
    /// Classification attached by a prior layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<ErrorTag>,
    /// Arbitrary structured details sent along with the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RawError {
    /// Create a raw error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        RawError {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Attach a stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attach a grouping key override.
    pub fn with_normalized_message(mut self, normalized: impl Into<String>) -> Self {
        self.normalized_message = Some(normalized.into());
        self
    }

    /// Attach a classification.
    pub fn tagged(mut self, kind: ErrorKind, location: Option<ErrorLocation>) -> Self {
        self.tag = Some(ErrorTag { kind, location });
        self
    }
}

impl From<anyhow::Error> for RawError {
    fn from(err: anyhow::Error) -> Self {
        RawError::new(format!("{:#}", err))
    }
}

/// A failure with its place in the taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub location: ErrorLocation,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Key used to group identical failures.
    pub grouping_key: String,
    #[serde(skip)]
    pub raw: RawError,
}

impl ClassifiedError {
    /// Title derived from the kind and location.
    pub fn title(&self) -> String {
        match (&self.kind, &self.location) {
            (ErrorKind::BuildCommand, ErrorLocation::BuildCommand { event, .. }) => {
                if *event == LifecycleEvent::Dev {
                    "\"dev.command\" failed".to_string()
                } else {
                    "\"build.command\" failed".to_string()
                }
            }
            (kind, ErrorLocation::Plugin { package, .. }) => match kind {
                ErrorKind::FailBuild | ErrorKind::FailPlugin => format!("Plugin \"{}\" failed", package),
                ErrorKind::PluginInternal => format!("Plugin \"{}\" internal error", package),
                ErrorKind::PluginInput => format!("Plugin \"{}\" invalid input", package),
                ErrorKind::PluginValidation => format!("Plugin \"{}\" invalid", package),
                _ => kind.title().to_string(),
            },
            (kind, _) => kind.title().to_string(),
        }
    }

    /// Whether this failure should make the build unsuccessful.
    pub fn is_failure(&self) -> bool {
        self.severity.is_failure()
    }

    /// Render for terminal output; the stack is only included in debug mode.
    pub fn render(&self, debug: bool) -> String {
        let mut out = format!("{}\n{}\n{}", self.title(), self.location, self.message);
        if debug {
            if let Some(stack) = &self.stack {
                out.push('\n');
                out.push_str(stack);
            }
        }
        out
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title(), self.message)
    }
}
