//! Plan resolution.
//!
//! Resolution happens once before the pipeline starts: plugins are loaded
//! and every event of the selected timeline gets its ordered steps. Within
//! an event the user's command comes first, then plugin handlers in
//! declaration order, then core steps in registry order. Core step
//! conditions are not evaluated here; they are checked right before each
//! step runs so that they observe earlier mutations.

pub mod compat;
pub mod errors;
pub mod plugins;

pub use compat::{select_version, PluginsList};
pub use errors::ResolveError;
pub use plugins::{load_plugins, LoadOptions, LoadedPlugins};

use std::sync::Arc;

use serde_json::Value;

use crate::builder::core_steps::CoreStepRegistry;
use crate::core::event::Timeline;
use crate::core::plugin::LoadedPlugin;
use crate::core::step::{CommandOrigin, ExecutionPlan, Step};

/// A resolved plan and what went into it.
#[derive(Debug)]
pub struct Resolution {
    pub plan: ExecutionPlan,
    pub plugins: Vec<Arc<LoadedPlugin>>,
    /// Non-fatal findings, such as unexpected plugin versions.
    pub warnings: Vec<String>,
}

/// Build the execution plan for `timeline`.
pub fn resolve_plan(
    timeline: Timeline,
    config: &Value,
    loaded: LoadedPlugins,
    registry: &CoreStepRegistry,
) -> Resolution {
    let plugins: Vec<Arc<LoadedPlugin>> = loaded.plugins.into_iter().map(Arc::new).collect();
    let command = user_command(timeline, config);
    let mut plan = ExecutionPlan::new(timeline);

    for &event in timeline.events() {
        if event == timeline.command_event() {
            if let Some((command, origin)) = &command {
                plan.push(Step::BuildCommand {
                    event,
                    command: command.clone(),
                    origin: *origin,
                });
            }
        }

        for plugin in plugins.iter().filter(|p| p.handles(event)) {
            plan.push(Step::Plugin {
                event,
                plugin: Arc::clone(plugin),
            });
        }

        for step in registry.iter().filter(|s| s.event() == event) {
            plan.push(Step::Core {
                id: step.id(),
                name: step.name(),
                event,
            });
        }
    }

    for plugin in &plugins {
        let ignored: Vec<&str> = plugin
            .events
            .iter()
            .filter(|e| e.timeline() != timeline)
            .map(|e| e.as_str())
            .collect();
        if !ignored.is_empty() {
            tracing::debug!(package = %plugin.package, "not running {} on the {} timeline", ignored.join(", "), timeline);
        }
    }

    tracing::debug!(timeline = %timeline, steps = plan.len(), plugins = plugins.len(), "resolved plan");
    Resolution {
        plan,
        plugins,
        warnings: loaded.warnings,
    }
}

/// The configured command for `timeline`, if it is non-empty.
fn user_command(timeline: Timeline, config: &Value) -> Option<(String, CommandOrigin)> {
    let section = timeline.command_key().split('.').next()?;
    let table = config.get(section)?;
    let command = table.get("command")?.as_str()?.trim();
    if command.is_empty() {
        return None;
    }
    let origin = match table.get("command_origin").and_then(Value::as_str) {
        Some("ui") => CommandOrigin::Ui,
        _ => CommandOrigin::Config,
    };
    Some((command.to_string(), origin))
}
