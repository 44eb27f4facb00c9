use super::{CoreStep, CoreStepContext, CoreStepOutput};
use crate::core::config;
use crate::core::error::RawError;
use crate::core::event::LifecycleEvent;
use crate::core::report::Metric;
use crate::util::shell::Status;

/// Persists configuration changes made by plugins back into `quay.toml`.
///
/// Only runs with `--save-config`, and only when the build was loaded from a
/// file and something was actually changed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveConfig;

impl CoreStep for SaveConfig {
    fn id(&self) -> &'static str {
        "save_config"
    }

    fn name(&self) -> &'static str {
        "Save updated config"
    }

    fn event(&self) -> LifecycleEvent {
        LifecycleEvent::PostBuild
    }

    fn condition(&self, ctx: &CoreStepContext<'_>) -> bool {
        ctx.save_config && ctx.config_path.is_some() && !ctx.config.log().is_empty()
    }

    fn condition_summary(&self) -> &'static str {
        "--save-config and the configuration was changed"
    }

    fn run(&self, ctx: &mut CoreStepContext<'_>) -> Result<CoreStepOutput, RawError> {
        let Some(path) = ctx.config_path else {
            return Ok(CoreStepOutput::default());
        };
        let mutations = ctx.config.log().entries();
        config::save_mutations(path, mutations)?;

        let count = mutations.len();
        ctx.shell
            .status(Status::Saved, format!("{} configuration change(s) to {}", count, path.display()));
        ctx.system_log(self.id(), &format!("Saved {} configuration changes", count));

        Ok(CoreStepOutput {
            metrics: vec![Metric::gauge("config.mutations.saved", count as f64)],
        })
    }
}
