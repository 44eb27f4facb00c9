//! Build event types for JSON output.
//!
//! This module defines the stable JSON schema for machine-readable build output.
//! These events are emitted when using `--message-format=json`.
//!
//! # Event Types
//!
//! - `build-started`: The plan was resolved and execution begins
//! - `step-started` / `step-finished`: One step ran
//! - `log`: A line of output produced by a handler
//! - `config-mutation`: A handler changed the configuration
//! - `diagnostic`: A classified failure or warning
//! - `build-finished`: Build completed (success or failure)
//!
//! # Stability
//!
//! New fields may be added, but existing fields should not be removed or renamed.

use serde::Serialize;

use crate::core::event::{LifecycleEvent, Timeline};
use crate::core::step::{Step, StepKind};

/// How a step ended, as reported in `step-finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepResult {
    Success,
    Failure,
    Skipped,
}

/// A build event emitted during the build process.
///
/// Each event is serialized as a single JSON object per line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reason")]
pub enum BuildEvent {
    /// Execution begins.
    #[serde(rename = "build-started")]
    BuildStarted {
        timeline: Timeline,
        /// Number of steps in the plan
        step_count: usize,
    },

    #[serde(rename = "step-started")]
    StepStarted {
        event: LifecycleEvent,
        step_id: String,
        kind: StepKind,
    },

    #[serde(rename = "step-finished")]
    StepFinished {
        event: LifecycleEvent,
        step_id: String,
        result: StepResult,
        duration_ms: u64,
        /// Why the step was skipped, for skipped steps
        #[serde(skip_serializing_if = "Option::is_none")]
        skip_reason: Option<String>,
    },

    /// One line of handler output.
    #[serde(rename = "log")]
    Log {
        step_id: String,
        /// "stdout" or "stderr"
        stream: &'static str,
        line: String,
    },

    /// A configuration mutation was accepted. Values are not included.
    #[serde(rename = "config-mutation")]
    ConfigMutation {
        keys: String,
        event: LifecycleEvent,
    },

    /// A generic diagnostic message.
    #[serde(rename = "diagnostic")]
    Diagnostic {
        /// Severity level ("error", "warning", "note")
        level: String,
        /// Message text
        message: String,
    },

    /// Build completed (success or failure).
    #[serde(rename = "build-finished")]
    BuildFinished {
        /// Whether the build succeeded
        success: bool,
        severity_code: u8,
        /// Total build duration in milliseconds
        duration_ms: u64,
    },
}

impl BuildEvent {
    /// Create a build started event.
    pub fn started(timeline: Timeline, step_count: usize) -> Self {
        BuildEvent::BuildStarted {
            timeline,
            step_count,
        }
    }

    /// Create a step started event.
    pub fn step_started(step: &Step) -> Self {
        BuildEvent::StepStarted {
            event: step.event(),
            step_id: step.id().to_string(),
            kind: step.kind(),
        }
    }

    /// Create a step finished event.
    pub fn step_finished(step: &Step, result: StepResult, duration_ms: u64) -> Self {
        BuildEvent::StepFinished {
            event: step.event(),
            step_id: step.id().to_string(),
            result,
            duration_ms,
            skip_reason: None,
        }
    }

    /// Create a step finished event for a skipped step.
    pub fn step_skipped(step: &Step, reason: impl Into<String>) -> Self {
        BuildEvent::StepFinished {
            event: step.event(),
            step_id: step.id().to_string(),
            result: StepResult::Skipped,
            duration_ms: 0,
            skip_reason: Some(reason.into()),
        }
    }

    /// Create a log line event.
    pub fn log(step_id: impl Into<String>, stderr: bool, line: impl Into<String>) -> Self {
        BuildEvent::Log {
            step_id: step_id.into(),
            stream: if stderr { "stderr" } else { "stdout" },
            line: line.into(),
        }
    }

    /// Create a diagnostic event.
    pub fn diagnostic(level: impl Into<String>, message: impl Into<String>) -> Self {
        BuildEvent::Diagnostic {
            level: level.into(),
            message: message.into(),
        }
    }

    /// Create a build finished event.
    pub fn finished(success: bool, severity_code: u8, duration_ms: u64) -> Self {
        BuildEvent::BuildFinished {
            success,
            severity_code,
            duration_ms,
        }
    }

    /// Serialize this event to a JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Serialize this event to a JSON value.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
