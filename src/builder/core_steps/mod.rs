//! Built-in core steps.
//!
//! Core steps run in-process, after the user's command and the plugins of
//! their event. Their conditions are evaluated right before they would run,
//! against the live configuration, so a plugin that generates functions or
//! moves the functions directory changes what happens next.

mod bundler;
mod edge_functions;
mod functions;
mod save_config;

use std::path::Path;
use std::sync::Arc;

use crate::builder::runner::OutputSink;
use crate::core::constants::Constants;
use crate::core::error::RawError;
use crate::core::event::LifecycleEvent;
use crate::core::mutable::MutableConfig;
use crate::core::report::{GeneratedFunction, Metric};
use crate::util::config::FeatureFlags;
use crate::util::shell::Shell;

pub use bundler::{BundleRequest, BundledFunction, Bundler, DefaultBundler, FunctionKind, MANIFEST_NAME};
pub use edge_functions::EdgeFunctionsBundling;
pub use functions::FunctionsBundling;
pub use save_config::SaveConfig;

/// What a core step can see and change.
pub struct CoreStepContext<'a> {
    pub build_dir: &'a Path,
    /// Constants computed from the configuration right before the step.
    pub constants: Constants,
    pub config: &'a mut MutableConfig,
    /// The configuration file the build was loaded from, if any.
    pub config_path: Option<&'a Path>,
    pub debug: bool,
    /// Whether `--save-config` was given.
    pub save_config: bool,
    pub feature_flags: &'a FeatureFlags,
    /// Functions plugins registered so far.
    pub generated_functions: &'a [GeneratedFunction],
    pub shell: &'a Arc<Shell>,
    pub sink: &'a mut dyn OutputSink,
}

impl CoreStepContext<'_> {
    /// Resolve a constant path against the build directory.
    pub fn resolve(&self, value: &str) -> std::path::PathBuf {
        Constants::resolve(self.build_dir, value)
    }

    /// Write to the system log channel.
    pub fn system_log(&mut self, step_id: &str, message: &str) {
        self.sink.system_log(step_id, message);
    }
}

/// Result of a successful core step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoreStepOutput {
    pub metrics: Vec<Metric>,
}

/// A built-in step.
pub trait CoreStep: Send + Sync {
    /// Stable identifier, used in timings and reports.
    fn id(&self) -> &'static str;

    /// Human-readable name.
    fn name(&self) -> &'static str;

    fn event(&self) -> LifecycleEvent;

    /// Whether the step should run. Evaluated fresh for every build.
    fn condition(&self, _ctx: &CoreStepContext<'_>) -> bool {
        true
    }

    /// Short description of the condition, for plan listings.
    fn condition_summary(&self) -> &'static str {
        "always"
    }

    fn run(&self, ctx: &mut CoreStepContext<'_>) -> Result<CoreStepOutput, RawError>;
}

/// Registered core steps in precedence order.
#[derive(Clone)]
pub struct CoreStepRegistry {
    steps: Vec<Arc<dyn CoreStep>>,
}

impl CoreStepRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        CoreStepRegistry { steps: Vec::new() }
    }

    /// The built-in steps, bundling through `bundler`.
    pub fn with_bundler(bundler: Arc<dyn Bundler>) -> Self {
        let mut registry = CoreStepRegistry::new();
        registry.register(Arc::new(FunctionsBundling::new(Arc::clone(&bundler))));
        registry.register(Arc::new(EdgeFunctionsBundling::new(bundler)));
        registry.register(Arc::new(SaveConfig));
        registry
    }

    /// Register a step after the existing ones.
    pub fn register(&mut self, step: Arc<dyn CoreStep>) {
        self.steps.push(step);
    }

    /// Get a step by id.
    pub fn get(&self, id: &str) -> Option<&dyn CoreStep> {
        self.steps.iter().find(|s| s.id() == id).map(|s| s.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn CoreStep> + '_ {
        self.steps.iter().map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for CoreStepRegistry {
    fn default() -> Self {
        CoreStepRegistry::with_bundler(Arc::new(DefaultBundler))
    }
}

impl std::fmt::Debug for CoreStepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.steps.iter().map(|s| s.id())).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_order() {
        let registry = CoreStepRegistry::default();
        let ids: Vec<&str> = registry.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["functions_bundling", "edge_functions_bundling", "save_config"]);
        assert_eq!(registry.get("save_config").unwrap().event(), LifecycleEvent::PostBuild);
        assert!(registry.get("missing").is_none());
    }
}
