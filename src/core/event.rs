//! Lifecycle events and timelines.
//!
//! The pipeline visits events in a single fixed order per timeline. The build
//! timeline ends with three terminal events (`onSuccess`, `onError`, `onEnd`)
//! which are the cleanup pass that still runs after an abort.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A named phase of the build during which a fixed set of steps run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LifecycleEvent {
    #[serde(rename = "onPreBuild")]
    PreBuild,
    #[serde(rename = "onBuild")]
    Build,
    #[serde(rename = "onPostBuild")]
    PostBuild,
    #[serde(rename = "onSuccess")]
    Success,
    #[serde(rename = "onError")]
    Error,
    #[serde(rename = "onEnd")]
    End,
    #[serde(rename = "onPreDev")]
    PreDev,
    #[serde(rename = "onDev")]
    Dev,
}

impl LifecycleEvent {
    /// Every event, in declaration order.
    pub const ALL: [LifecycleEvent; 8] = [
        LifecycleEvent::PreBuild,
        LifecycleEvent::Build,
        LifecycleEvent::PostBuild,
        LifecycleEvent::Success,
        LifecycleEvent::Error,
        LifecycleEvent::End,
        LifecycleEvent::PreDev,
        LifecycleEvent::Dev,
    ];

    /// The handler name plugins use for this event.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::PreBuild => "onPreBuild",
            LifecycleEvent::Build => "onBuild",
            LifecycleEvent::PostBuild => "onPostBuild",
            LifecycleEvent::Success => "onSuccess",
            LifecycleEvent::Error => "onError",
            LifecycleEvent::End => "onEnd",
            LifecycleEvent::PreDev => "onPreDev",
            LifecycleEvent::Dev => "onDev",
        }
    }

    /// Whether this event belongs to the cleanup pass of the build timeline.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::Success | LifecycleEvent::Error | LifecycleEvent::End
        )
    }

    /// The timeline this event is part of.
    pub fn timeline(&self) -> Timeline {
        match self {
            LifecycleEvent::PreDev | LifecycleEvent::Dev => Timeline::Dev,
            _ => Timeline::Build,
        }
    }

    /// Human description used in log headers.
    pub fn description(&self) -> &'static str {
        match self {
            LifecycleEvent::PreBuild => "before build commands are executed",
            LifecycleEvent::Build => "build commands are executing",
            LifecycleEvent::PostBuild => "after build commands are executed",
            LifecycleEvent::Success => "after the build has succeeded",
            LifecycleEvent::Error => "when the build has failed",
            LifecycleEvent::End => "after the build has completed",
            LifecycleEvent::PreDev => "before the dev command is executed",
            LifecycleEvent::Dev => "the dev command is executing",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LifecycleEvent::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<_> = LifecycleEvent::ALL.iter().map(|e| e.as_str()).collect();
                format!(
                    "invalid event '{}'; expected one of: {}",
                    s,
                    valid.join(", ")
                )
            })
    }
}

/// The sequence of events a single invocation walks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeline {
    /// `quay build`
    #[default]
    Build,
    /// `quay dev`
    Dev,
}

impl Timeline {
    /// Events of this timeline, in execution order.
    pub fn events(&self) -> &'static [LifecycleEvent] {
        match self {
            Timeline::Build => &[
                LifecycleEvent::PreBuild,
                LifecycleEvent::Build,
                LifecycleEvent::PostBuild,
                LifecycleEvent::Success,
                LifecycleEvent::Error,
                LifecycleEvent::End,
            ],
            Timeline::Dev => &[LifecycleEvent::PreDev, LifecycleEvent::Dev],
        }
    }

    /// The event the user's command (build or dev command) is bound to.
    pub fn command_event(&self) -> LifecycleEvent {
        match self {
            Timeline::Build => LifecycleEvent::Build,
            Timeline::Dev => LifecycleEvent::Dev,
        }
    }

    /// Config key holding the command for this timeline.
    pub fn command_key(&self) -> &'static str {
        match self {
            Timeline::Build => "build.command",
            Timeline::Dev => "dev.command",
        }
    }

    /// Position of an event in this timeline, if it belongs to it.
    pub fn position(&self, event: LifecycleEvent) -> Option<usize> {
        self.events().iter().position(|e| *e == event)
    }
}

impl fmt::Display for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeline::Build => write!(f, "build"),
            Timeline::Dev => write!(f, "dev"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_round_trip_names() {
        for event in LifecycleEvent::ALL {
            assert_eq!(event.as_str().parse::<LifecycleEvent>().unwrap(), event);
        }
        assert!("onDeploy".parse::<LifecycleEvent>().is_err());
    }

    #[test]
    fn test_build_timeline_order() {
        let events = Timeline::Build.events();
        assert_eq!(events.first(), Some(&LifecycleEvent::PreBuild));
        assert_eq!(events.last(), Some(&LifecycleEvent::End));
        assert!(Timeline::Build.position(LifecycleEvent::Build) < Timeline::Build.position(LifecycleEvent::PostBuild));
    }

    #[test]
    fn test_dev_events_not_on_build_timeline() {
        assert!(Timeline::Build.position(LifecycleEvent::Dev).is_none());
        assert!(Timeline::Dev.position(LifecycleEvent::Build).is_none());
        assert_eq!(LifecycleEvent::PreDev.timeline(), Timeline::Dev);
    }

    #[test]
    fn test_terminal_events() {
        assert!(LifecycleEvent::Error.is_terminal());
        assert!(LifecycleEvent::End.is_terminal());
        assert!(!LifecycleEvent::PostBuild.is_terminal());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&LifecycleEvent::PreBuild).unwrap();
        assert_eq!(json, "\"onPreBuild\"");
    }
}
