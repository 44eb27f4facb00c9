use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use super::{BundleRequest, Bundler, CoreStep, CoreStepContext, CoreStepOutput, FunctionKind};
use crate::core::error::RawError;
use crate::core::event::LifecycleEvent;
use crate::core::report::Metric;
use crate::util::shell::Status;

/// Bundles serverless functions during `onBuild`.
///
/// Runs when the functions directory or the internal functions directory
/// exists, or when a plugin registered a function.
pub struct FunctionsBundling {
    bundler: Arc<dyn Bundler>,
}

impl FunctionsBundling {
    pub fn new(bundler: Arc<dyn Bundler>) -> Self {
        FunctionsBundling { bundler }
    }

    fn source_dirs(ctx: &CoreStepContext<'_>) -> Vec<PathBuf> {
        let mut candidates = Vec::with_capacity(2);
        if let Some(src) = &ctx.constants.functions_src {
            candidates.push(ctx.resolve(src));
        }
        candidates.push(ctx.resolve(&ctx.constants.internal_functions_src));

        // Directory probes may hit a network filesystem.
        let present: Vec<bool> = candidates.par_iter().map(|p| p.is_dir()).collect();
        candidates
            .into_iter()
            .zip(present)
            .filter_map(|(path, present)| present.then_some(path))
            .collect()
    }
}

impl CoreStep for FunctionsBundling {
    fn id(&self) -> &'static str {
        "functions_bundling"
    }

    fn name(&self) -> &'static str {
        "Functions bundling"
    }

    fn event(&self) -> LifecycleEvent {
        LifecycleEvent::Build
    }

    fn condition(&self, ctx: &CoreStepContext<'_>) -> bool {
        !ctx.generated_functions.is_empty() || !Self::source_dirs(ctx).is_empty()
    }

    fn condition_summary(&self) -> &'static str {
        "functions directory exists or a plugin generated functions"
    }

    fn run(&self, ctx: &mut CoreStepContext<'_>) -> Result<CoreStepOutput, RawError> {
        let start = Instant::now();
        let sources = Self::source_dirs(ctx);
        let request = BundleRequest {
            kind: FunctionKind::Serverless,
            sources,
            generated: ctx.generated_functions.to_vec(),
            build_dir: ctx.build_dir.to_path_buf(),
            dist: ctx.resolve(&ctx.constants.functions_dist),
            build_version: ctx.constants.build_version.clone(),
        };

        for source in &request.sources {
            ctx.shell.status(
                Status::Bundling,
                format!("functions from {}", source.display()),
            );
        }

        let mut progress = ctx.shell.progress(0, "Bundling functions");
        let bundled = self.bundler.bundle(&request, &mut progress)?;

        let message = match bundled.len() {
            0 => "No functions to bundle".to_string(),
            1 => "Bundled 1 function".to_string(),
            n => format!("Bundled {} functions", n),
        };
        ctx.system_log(self.id(), &message);
        ctx.shell.status(Status::Finished, &message);

        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        Ok(CoreStepOutput {
            metrics: vec![
                Metric::increment("functions.bundling.runs"),
                Metric::gauge("functions.bundled", bundled.len() as f64),
                Metric::timing("functions.bundling", elapsed)
                    .with_tag("generated", ctx.generated_functions.len().to_string()),
            ],
        })
    }
}
