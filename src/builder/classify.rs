//! Error classification.
//!
//! [`classify`] maps any raw failure to its place in the taxonomy. A tag
//! attached by the layer that produced the error is trusted; otherwise the
//! kind is inferred from where the failure happened. Messages and stacks are
//! redacted before the classified error leaves this module.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::error::{ClassifiedError, ErrorKind, ErrorLocation, RawError, Severity};
use crate::core::event::LifecycleEvent;
use crate::core::plugin::PluginOrigin;
use crate::util::secrets::Redactor;

/// Markers of orchestrator-internal stack frames.
const INTERNAL_FRAME_MARKERS: &[&str] = &["quay::", "/quay/src/", "<quay-internal>"];

static ABSOLUTE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?P<pre>^|[\s(=:'"])(?:/|[A-Za-z]:\\)[^\s"'():,]+"#).unwrap());
static QUOTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""[^"]*"|'[^']*'"#).unwrap());
static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Where a failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// Locating, validating or handshaking with a plugin.
    PluginLoad {
        package: String,
        origin: PluginOrigin,
    },
    /// Inside a plugin's event handler.
    PluginHandler {
        package: String,
        event: LifecycleEvent,
        origin: PluginOrigin,
    },
    /// The protocol with a plugin child broke down.
    Ipc {
        package: String,
        event: Option<LifecycleEvent>,
    },
    CoreStep {
        id: String,
        name: String,
        event: LifecycleEvent,
    },
    BuildCommand {
        command: String,
        event: LifecycleEvent,
    },
    /// A platform API call; `blocking` calls fail the build.
    Api { endpoint: String, blocking: bool },
    Config { path: Option<String> },
    Core,
}

impl ErrorOrigin {
    /// Kind inferred when the error carries no tag.
    fn default_kind(&self) -> ErrorKind {
        match self {
            ErrorOrigin::PluginLoad { .. } => ErrorKind::PluginLoad,
            ErrorOrigin::PluginHandler { .. } => ErrorKind::PluginInternal,
            ErrorOrigin::Ipc { .. } => ErrorKind::Ipc,
            ErrorOrigin::CoreStep { .. } => ErrorKind::CoreStep,
            ErrorOrigin::BuildCommand { .. } => ErrorKind::BuildCommand,
            ErrorOrigin::Api { blocking: false, .. } => ErrorKind::Api,
            ErrorOrigin::Api { blocking: true, .. } => ErrorKind::Deploy,
            ErrorOrigin::Config { .. } => ErrorKind::ResolveConfig,
            ErrorOrigin::Core => ErrorKind::CoreInternal,
        }
    }

    /// Location derived from the origin.
    pub fn location(&self) -> ErrorLocation {
        match self {
            ErrorOrigin::PluginLoad { package, origin } => ErrorLocation::Plugin {
                package: package.clone(),
                event: None,
                origin: Some(*origin),
            },
            ErrorOrigin::PluginHandler {
                package,
                event,
                origin,
            } => ErrorLocation::Plugin {
                package: package.clone(),
                event: Some(*event),
                origin: Some(*origin),
            },
            ErrorOrigin::Ipc { package, event } => ErrorLocation::Plugin {
                package: package.clone(),
                event: *event,
                origin: None,
            },
            ErrorOrigin::CoreStep { id, name, event } => ErrorLocation::CoreStep {
                id: id.clone(),
                name: name.clone(),
                event: *event,
            },
            ErrorOrigin::BuildCommand { command, event } => ErrorLocation::BuildCommand {
                command: command.clone(),
                event: *event,
            },
            ErrorOrigin::Api { endpoint, .. } => ErrorLocation::Api {
                endpoint: endpoint.clone(),
            },
            ErrorOrigin::Config { path } => ErrorLocation::Config { path: path.clone() },
            ErrorOrigin::Core => ErrorLocation::Core,
        }
    }
}

/// Ambient context of a classification.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyContext<'a> {
    pub origin: &'a ErrorOrigin,
    pub debug: bool,
    pub redactor: &'a Redactor,
}

/// Classify a raw failure.
pub fn classify(raw: RawError, ctx: ClassifyContext<'_>) -> ClassifiedError {
    let (kind, location) = match &raw.tag {
        Some(tag) => {
            let location = match &tag.location {
                Some(location) => enrich(location.clone(), ctx.origin),
                None => ctx.origin.location(),
            };
            (tag.kind, location)
        }
        None => (ctx.origin.default_kind(), ctx.origin.location()),
    };

    let message = ctx.redactor.redact(&raw.message);
    let stack = raw
        .stack
        .as_deref()
        .map(|stack| ctx.redactor.redact(&clean_stack(stack, ctx.debug)));
    let grouping_key = match raw.normalized_message.as_deref() {
        Some(normalized) => normalized.to_string(),
        None => grouping_key(&message),
    };

    ClassifiedError {
        kind,
        severity: kind.severity(),
        location,
        message,
        stack,
        grouping_key,
        raw,
    }
}

/// Fill in the plugin identity and event a tagged location left out.
fn enrich(location: ErrorLocation, origin: &ErrorOrigin) -> ErrorLocation {
    match (location, origin) {
        (
            ErrorLocation::Plugin {
                package,
                event,
                origin: plugin_origin,
            },
            ErrorOrigin::PluginHandler {
                event: ambient_event,
                origin: ambient_origin,
                ..
            },
        ) => ErrorLocation::Plugin {
            package,
            event: event.or(Some(*ambient_event)),
            origin: plugin_origin.or(Some(*ambient_origin)),
        },
        (location, _) => location,
    }
}

/// Default grouping key: the message with volatile parts replaced.
pub fn grouping_key(message: &str) -> String {
    let key = ABSOLUTE_PATH.replace_all(message, "${pre}<path>");
    let key = QUOTED.replace_all(&key, "\"...\"");
    DIGITS.replace_all(&key, "N").into_owned()
}

/// Drop orchestrator-internal frames unless debugging.
///
/// The first line carries the message and is always kept.
pub fn clean_stack(stack: &str, debug: bool) -> String {
    if debug {
        return stack.to_string();
    }
    let mut lines = stack.lines();
    let mut kept: Vec<&str> = lines.next().into_iter().collect();
    kept.extend(lines.filter(|line| {
        !line.trim().is_empty() && !INTERNAL_FRAME_MARKERS.iter().any(|m| line.contains(m))
    }));
    kept.join("\n")
}

/// Severity used when a failure happens in a terminal event.
///
/// Cleanup handlers never abort the build: any failure counts as a plugin
/// error there. A cancellation stays a cancellation.
pub fn terminal_severity(severity: Severity) -> Severity {
    match severity {
        Severity::None | Severity::Warning | Severity::Cancellation => severity,
        _ => Severity::PluginError,
    }
}
