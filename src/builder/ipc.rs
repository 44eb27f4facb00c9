//! Message protocol between the orchestrator and a plugin child process.
//!
//! The parent writes one JSON [`HandlerRequest`] line to the child's stdin and
//! closes it. The child answers with lines on stdout prefixed by
//! [`IPC_PREFIX`]; every other line is ordinary build output.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::builder::env::EnvDiff;
use crate::core::error::{ClassifiedError, ErrorKind, ErrorLocation, RawError};
use crate::core::mutable::{parse_keys, KeyPath};
use crate::core::report::StatusReport;

/// Prefix marking a protocol line on the child's stdout.
pub const IPC_PREFIX: &str = "::quay::";

/// Pseudo-event asking a plugin which handlers it exports.
pub const LOAD_EVENT: &str = "load";

/// Request sent on the child's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerRequest {
    /// Event name, or [`LOAD_EVENT`].
    pub event: String,
    pub plugin_id: String,
    pub package: String,
    pub inputs: Map<String, Value>,
    pub constants: Value,
    pub config: Value,
    /// The failure that triggered `onError`/`onEnd`, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ClassifiedError>,
    pub feature_flags: BTreeMap<String, bool>,
}

impl HandlerRequest {
    /// Serialize as a single newline-terminated line.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self).context("failed to serialize handler request")?;
        line.push('\n');
        Ok(line)
    }
}

/// Operation of a `config` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOp {
    Set,
    Delete,
    Push,
}

/// Key path given either dotted (`"build.command"`) or as an array.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum KeyArg {
    Dotted(String),
    Keys(Vec<String>),
}

impl KeyArg {
    pub fn into_keys(self) -> KeyPath {
        match self {
            KeyArg::Dotted(keys) => parse_keys(&keys),
            KeyArg::Keys(keys) => keys,
        }
    }
}

/// Underlying error attached to a termination primitive.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
}

/// A message from the child.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginMessage {
    /// Answer to the load handshake.
    Loaded { events: Vec<String> },
    /// The handler completed.
    Done {
        #[serde(default)]
        value: Option<Value>,
    },
    /// An uncaught exception.
    Error {
        message: String,
        #[serde(default)]
        stack: Option<String>,
        #[serde(default)]
        normalized_message: Option<String>,
        #[serde(default)]
        kind: Option<ErrorKind>,
        #[serde(default)]
        location: Option<ErrorLocation>,
    },
    FailBuild {
        message: String,
        #[serde(default)]
        error: Option<ErrorPayload>,
    },
    FailPlugin {
        message: String,
        #[serde(default)]
        error: Option<ErrorPayload>,
    },
    CancelBuild {
        message: String,
        #[serde(default)]
        error: Option<ErrorPayload>,
    },
    Status(StatusReport),
    Config {
        op: ConfigOp,
        path: KeyArg,
        #[serde(default)]
        value: Option<Value>,
    },
    Env(EnvDiff),
    Function { name: String, path: String },
    SystemLog { message: String },
}

impl PluginMessage {
    /// Whether the message ends the handler.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PluginMessage::Loaded { .. }
                | PluginMessage::Done { .. }
                | PluginMessage::Error { .. }
                | PluginMessage::FailBuild { .. }
                | PluginMessage::FailPlugin { .. }
                | PluginMessage::CancelBuild { .. }
        )
    }

    /// The raw error carried by a failing terminal message.
    ///
    /// Termination primitives are tagged with their kind so the classifier
    /// keeps it; uncaught errors keep whatever tag the child attached.
    pub fn to_raw_error(&self) -> Option<RawError> {
        let (kind, message, error) = match self {
            PluginMessage::Error {
                message,
                stack,
                normalized_message,
                kind,
                location,
            } => {
                let mut raw = RawError::new(message.clone());
                raw.stack = stack.clone();
                raw.normalized_message = normalized_message.clone();
                if let Some(kind) = kind {
                    raw = raw.tagged(*kind, location.clone());
                }
                return Some(raw);
            }
            PluginMessage::FailBuild { message, error } => (ErrorKind::FailBuild, message, error),
            PluginMessage::FailPlugin { message, error } => (ErrorKind::FailPlugin, message, error),
            PluginMessage::CancelBuild { message, error } => (ErrorKind::CancelBuild, message, error),
            _ => return None,
        };

        let mut text = message.clone();
        let mut stack = None;
        if let Some(payload) = error {
            if let Some(inner) = payload.message.as_deref().filter(|m| !m.is_empty()) {
                text = format!("{}\n{}", text, inner);
            }
            stack = payload.stack.clone();
        }
        let mut raw = RawError::new(text).tagged(kind, None);
        raw.stack = stack;
        Some(raw)
    }
}

/// One line of child stdout after protocol parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Message(PluginMessage),
    /// A protocol line that could not be decoded.
    Malformed { line: String, error: String },
    /// Ordinary output.
    Output(String),
}

/// Split protocol messages from ordinary output.
pub fn parse_line(line: &str) -> ParsedLine {
    let Some(payload) = line.strip_prefix(IPC_PREFIX) else {
        return ParsedLine::Output(line.to_string());
    };
    match serde_json::from_str::<PluginMessage>(payload.trim()) {
        Ok(message) => ParsedLine::Message(message),
        Err(e) => ParsedLine::Malformed {
            line: line.to_string(),
            error: e.to_string(),
        },
    }
}
