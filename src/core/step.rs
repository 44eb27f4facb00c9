//! Steps and the execution plan.
//!
//! A [`Step`] is one unit of work bound to exactly one lifecycle event. The
//! [`ExecutionPlan`] is built once before the pipeline starts and is read-only
//! afterwards: within an event, steps keep the order in which they were pushed.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::core::event::{LifecycleEvent, Timeline};
use crate::core::plugin::{LoadedPlugin, PluginOrigin};

/// Discriminant of a [`Step`], used in logs, timings and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    CoreStep,
    UserPlugin,
    BuildCommand,
}

/// Where the user's command was configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOrigin {
    Config,
    Ui,
}

/// One unit of work.
#[derive(Debug, Clone)]
pub enum Step {
    /// A built-in step, looked up by id in the core step registry.
    Core {
        id: &'static str,
        name: &'static str,
        event: LifecycleEvent,
    },
    /// One exported handler of a user plugin.
    Plugin {
        event: LifecycleEvent,
        plugin: Arc<LoadedPlugin>,
    },
    /// The user's build (or dev) command.
    BuildCommand {
        event: LifecycleEvent,
        command: String,
        origin: CommandOrigin,
    },
}

impl Step {
    /// Event this step is bound to.
    pub fn event(&self) -> LifecycleEvent {
        match self {
            Step::Core { event, .. }
            | Step::Plugin { event, .. }
            | Step::BuildCommand { event, .. } => *event,
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Step::Core { .. } => StepKind::CoreStep,
            Step::Plugin { .. } => StepKind::UserPlugin,
            Step::BuildCommand { .. } => StepKind::BuildCommand,
        }
    }

    /// Stable identifier: the core step id, the plugin package, or the command key.
    pub fn id(&self) -> &str {
        match self {
            Step::Core { id, .. } => id,
            Step::Plugin { plugin, .. } => &plugin.package,
            Step::BuildCommand { event, .. } => event.timeline().command_key(),
        }
    }

    /// The plugin package, for plugin steps.
    pub fn package(&self) -> Option<&str> {
        match self {
            Step::Plugin { plugin, .. } => Some(&plugin.package),
            _ => None,
        }
    }

    /// Origin of a plugin step.
    pub fn plugin_origin(&self) -> Option<PluginOrigin> {
        match self {
            Step::Plugin { plugin, .. } => Some(plugin.origin),
            _ => None,
        }
    }

    /// Whether the step's code runs in a child process.
    pub fn is_isolated(&self) -> bool {
        !matches!(self, Step::Core { .. })
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Core { name, event, .. } => write!(f, "{} ({})", name, event),
            Step::Plugin { plugin, event } => write!(f, "{} from {}", event, plugin.package),
            Step::BuildCommand { command, event, origin } => {
                let source = match origin {
                    CommandOrigin::Config => "quay.toml",
                    CommandOrigin::Ui => "the UI",
                };
                write!(f, "{} command from {}: {}", event, source, command)
            }
        }
    }
}

/// Ordered steps per lifecycle event of one timeline.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    timeline: Timeline,
    /// Indexed by the event's position in the timeline.
    steps: Vec<Vec<Step>>,
}

impl ExecutionPlan {
    /// Create an empty plan for a timeline.
    pub fn new(timeline: Timeline) -> Self {
        ExecutionPlan {
            timeline,
            steps: vec![Vec::new(); timeline.events().len()],
        }
    }

    pub fn timeline(&self) -> Timeline {
        self.timeline
    }

    /// Append a step to its event. Steps bound to another timeline are ignored.
    pub fn push(&mut self, step: Step) -> bool {
        match self.timeline.position(step.event()) {
            Some(index) => {
                self.steps[index].push(step);
                true
            }
            None => false,
        }
    }

    /// Steps of one event, in execution order.
    pub fn steps_for(&self, event: LifecycleEvent) -> &[Step] {
        self.timeline
            .position(event)
            .map(|index| self.steps[index].as_slice())
            .unwrap_or(&[])
    }

    /// Events with their steps, in timeline order (including empty events).
    pub fn iter(&self) -> impl Iterator<Item = (LifecycleEvent, &[Step])> {
        self.timeline
            .events()
            .iter()
            .copied()
            .zip(self.steps.iter().map(|s| s.as_slice()))
    }

    /// All steps in execution order.
    pub fn all_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.steps.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of build/dev command steps.
    pub fn command_count(&self) -> usize {
        self.all_steps()
            .filter(|s| s.kind() == StepKind::BuildCommand)
            .count()
    }
}
