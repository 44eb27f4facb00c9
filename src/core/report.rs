//! The terminal build report and the records it aggregates.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::error::ClassifiedError;
use crate::core::event::LifecycleEvent;
use crate::core::mutable::Mutation;

/// A function registered by a plugin for the bundling step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedFunction {
    pub name: String,
    pub path: String,
    /// Package of the plugin that generated it.
    pub generator: String,
}

/// Explicit status payload sent by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(default)]
    pub title: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, alias = "extra_data")]
    pub extra_data: Option<serde_json::Value>,
}

/// Final state of one plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Success,
    CanceledBuild,
    FailedPlugin,
    FailedBuild,
}

/// One entry of `statuses` in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginStatus {
    pub package: String,
    pub state: StatusState,
    pub title: Option<String>,
    pub summary: String,
    pub text: Option<String>,
    pub extra_data: Option<serde_json::Value>,
}

/// Captured user-visible output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildLogs {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Duration of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTiming {
    pub event: LifecycleEvent,
    pub step_id: String,
    pub duration_ms: u64,
}

/// Kind of a telemetry metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Increment,
    Timing,
    Gauge,
}

/// A metric returned by a core step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(rename = "type")]
    pub kind: MetricType,
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Metric {
    /// Create a counter increment.
    pub fn increment(name: impl Into<String>) -> Self {
        Metric {
            kind: MetricType::Increment,
            name: name.into(),
            value: 1.0,
            tags: BTreeMap::new(),
        }
    }

    /// Create a timing in milliseconds.
    pub fn timing(name: impl Into<String>, millis: f64) -> Self {
        Metric {
            kind: MetricType::Timing,
            name: name.into(),
            value: millis,
            tags: BTreeMap::new(),
        }
    }

    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Metric {
            kind: MetricType::Gauge,
            name: name.into(),
            value,
            tags: BTreeMap::new(),
        }
    }

    /// Add a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Terminal aggregate of a build. Created once, immutable afterwards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub success: bool,
    pub severity_code: u8,
    pub config_mutations: Vec<Mutation>,
    pub generated_functions: Vec<GeneratedFunction>,
    pub statuses: Vec<PluginStatus>,
    pub logs: BuildLogs,
    pub errors: Vec<ClassifiedError>,
    pub timings: Vec<StepTiming>,
    pub metrics: Vec<Metric>,
}

impl BuildReport {
    /// Report of a build that ran nothing.
    pub fn empty() -> Self {
        BuildReport {
            success: true,
            severity_code: 0,
            config_mutations: Vec::new(),
            generated_functions: Vec::new(),
            statuses: Vec::new(),
            logs: BuildLogs::default(),
            errors: Vec::new(),
            timings: Vec::new(),
            metrics: Vec::new(),
        }
    }

    /// Process exit code for this report.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.severity_code)
    }

    /// Serialize to pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize build report")
    }

    /// Write the report as JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(path, self.to_json_pretty()?)
            .with_context(|| format!("failed to write build report: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_report_shape() {
        let json = serde_json::to_value(BuildReport::empty()).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["severityCode"], 0);
        assert!(json["configMutations"].as_array().unwrap().is_empty());
        assert!(json["logs"]["stdout"].as_array().unwrap().is_empty());
        assert!(json["generatedFunctions"].is_array());
    }

    #[test]
    fn test_metric_serialization() {
        let metric = Metric::timing("functions_bundling", 12.0).with_tag("runtime", "js");
        let json = serde_json::to_value(&metric).unwrap();
        assert_eq!(json["type"], "timing");
        assert_eq!(json["tags"]["runtime"], "js");
    }

    #[test]
    fn test_status_state_precedence_order() {
        assert!(StatusState::FailedBuild > StatusState::FailedPlugin);
        assert!(StatusState::FailedPlugin > StatusState::CanceledBuild);
        assert!(StatusState::CanceledBuild > StatusState::Success);
    }
}
