//! Per-plugin status reconciliation.
//!
//! Status events are appended to an ordered log as the build runs and folded
//! with [`merge`] when the build finishes. Explicit reports beat implicit ones
//! and failure states only ever escalate.

use crate::core::error::{ClassifiedError, ErrorKind};
use crate::core::event::LifecycleEvent;
use crate::core::report::{PluginStatus, StatusReport, StatusState};

/// Summary of a status synthesized for a plugin that reported nothing.
const IMPLICIT_SUMMARY: &str = "Completed";

/// One entry of the status log.
#[derive(Debug, Clone, PartialEq)]
enum StatusEvent {
    /// The plugin called the status primitive.
    Explicit { package: String, report: StatusReport },
    /// The plugin completed a handler without reporting anything.
    Implicit { package: String },
    /// One of the plugin's handlers failed.
    Failed {
        package: String,
        state: StatusState,
        report: StatusReport,
    },
}

impl StatusEvent {
    fn package(&self) -> &str {
        match self {
            StatusEvent::Explicit { package, .. }
            | StatusEvent::Implicit { package }
            | StatusEvent::Failed { package, .. } => package,
        }
    }
}

/// Status as folded so far.
#[derive(Debug, Clone, PartialEq)]
struct Current {
    state: StatusState,
    report: StatusReport,
}

/// Collects status events during the build.
#[derive(Debug, Clone, Default)]
pub struct StatusAggregator {
    log: Vec<StatusEvent>,
}

impl StatusAggregator {
    pub fn new() -> Self {
        StatusAggregator::default()
    }

    /// Record an explicit status report.
    pub fn submit(&mut self, package: impl Into<String>, report: StatusReport) {
        self.log.push(StatusEvent::Explicit {
            package: package.into(),
            report,
        });
    }

    /// Record that a plugin completed a handler for `event` without failing.
    ///
    /// `onError` handlers never produce an implicit status.
    pub fn completed(&mut self, package: impl Into<String>, event: LifecycleEvent) {
        if event == LifecycleEvent::Error {
            return;
        }
        self.log.push(StatusEvent::Implicit {
            package: package.into(),
        });
    }

    /// Record a failure of one of a plugin's handlers.
    pub fn failed(&mut self, package: impl Into<String>, error: &ClassifiedError) {
        let state = match error.kind {
            ErrorKind::CancelBuild => StatusState::CanceledBuild,
            ErrorKind::FailBuild | ErrorKind::PluginInput | ErrorKind::ConfigMutation => {
                StatusState::FailedBuild
            }
            _ => StatusState::FailedPlugin,
        };
        self.log.push(StatusEvent::Failed {
            package: package.into(),
            state,
            report: StatusReport {
                title: Some(error.title()),
                summary: error.message.clone(),
                text: error.stack.clone(),
                extra_data: None,
            },
        });
    }

    /// Fold the log into one status per plugin, in first-seen order.
    pub fn finalize(&self) -> Vec<PluginStatus> {
        let mut packages: Vec<&str> = Vec::new();
        for event in &self.log {
            if !packages.contains(&event.package()) {
                packages.push(event.package());
            }
        }

        packages
            .into_iter()
            .filter_map(|package| {
                let current = self
                    .log
                    .iter()
                    .filter(|e| e.package() == package)
                    .fold(None, merge)?;
                Some(PluginStatus {
                    package: package.to_string(),
                    state: current.state,
                    title: current.report.title,
                    summary: current.report.summary,
                    text: current.report.text,
                    extra_data: current.report.extra_data,
                })
            })
            .collect()
    }
}

/// Priority merge of one status event into the folded status.
fn merge(current: Option<Current>, event: &StatusEvent) -> Option<Current> {
    match (current, event) {
        (None, StatusEvent::Implicit { .. }) => Some(Current {
            state: StatusState::Success,
            report: StatusReport {
                summary: IMPLICIT_SUMMARY.to_string(),
                ..Default::default()
            },
        }),
        (Some(current), StatusEvent::Implicit { .. }) => Some(current),

        // Explicit beats implicit and replaces an earlier explicit success,
        // but never masks a failure.
        (Some(current), StatusEvent::Explicit { .. }) if current.state != StatusState::Success => {
            Some(current)
        }
        (_, StatusEvent::Explicit { report, .. }) => Some(Current {
            state: StatusState::Success,
            report: report.clone(),
        }),

        (Some(current), StatusEvent::Failed { state, .. }) if current.state >= *state => Some(current),
        (_, StatusEvent::Failed { state, report, .. }) => Some(Current {
            state: *state,
            report: report.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{ErrorLocation, Severity};

    fn report(summary: &str) -> StatusReport {
        StatusReport {
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    fn error(kind: ErrorKind) -> ClassifiedError {
        ClassifiedError {
            kind,
            severity: kind.severity(),
            location: ErrorLocation::Core,
            message: format!("{:?}", kind),
            stack: None,
            grouping_key: String::new(),
            raw: Default::default(),
        }
    }

    #[test]
    fn test_explicit_beats_implicit() {
        let mut agg = StatusAggregator::new();
        agg.completed("a", LifecycleEvent::PreBuild);
        agg.submit("a", report("deployed 3 files"));
        agg.completed("a", LifecycleEvent::Build);

        let statuses = agg.finalize();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, StatusState::Success);
        assert_eq!(statuses[0].summary, "deployed 3 files");
    }

    #[test]
    fn test_implicit_status() {
        let mut agg = StatusAggregator::new();
        agg.completed("a", LifecycleEvent::Build);
        let statuses = agg.finalize();
        assert_eq!(statuses[0].summary, IMPLICIT_SUMMARY);
    }

    #[test]
    fn test_on_error_only_has_no_implicit_status() {
        let mut agg = StatusAggregator::new();
        agg.completed("a", LifecycleEvent::Error);
        assert!(agg.finalize().is_empty());
        assert!(agg.log.is_empty());
    }

    #[test]
    fn test_errors_never_downgrade() {
        let mut agg = StatusAggregator::new();
        agg.failed("a", &error(ErrorKind::FailBuild));
        agg.submit("a", report("all good"));
        agg.failed("a", &error(ErrorKind::FailPlugin));

        let statuses = agg.finalize();
        assert_eq!(statuses[0].state, StatusState::FailedBuild);
        assert_eq!(statuses[0].summary, "FailBuild");
    }

    #[test]
    fn test_failure_escalates() {
        let mut agg = StatusAggregator::new();
        agg.failed("a", &error(ErrorKind::CancelBuild));
        agg.failed("a", &error(ErrorKind::PluginInternal));
        let statuses = agg.finalize();
        assert_eq!(statuses[0].state, StatusState::FailedPlugin);
        assert_eq!(error(ErrorKind::PluginInternal).severity, Severity::PluginError);
    }

    #[test]
    fn test_order_is_first_seen() {
        let mut agg = StatusAggregator::new();
        agg.completed("b", LifecycleEvent::PreBuild);
        agg.completed("a", LifecycleEvent::PreBuild);
        agg.submit("b", report("b done"));

        let packages: Vec<_> = agg.finalize().into_iter().map(|s| s.package).collect();
        assert_eq!(packages, vec!["b", "a"]);
    }
}
