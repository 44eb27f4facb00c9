use std::sync::Arc;
use std::time::Instant;

use super::{BundleRequest, Bundler, CoreStep, CoreStepContext, CoreStepOutput, FunctionKind};
use crate::core::error::{ErrorKind, ErrorLocation, RawError};
use crate::core::event::LifecycleEvent;
use crate::core::report::Metric;
use crate::util::shell::Status;

/// Bundles edge functions during `onBuild`.
pub struct EdgeFunctionsBundling {
    bundler: Arc<dyn Bundler>,
}

impl EdgeFunctionsBundling {
    pub fn new(bundler: Arc<dyn Bundler>) -> Self {
        EdgeFunctionsBundling { bundler }
    }
}

impl CoreStep for EdgeFunctionsBundling {
    fn id(&self) -> &'static str {
        "edge_functions_bundling"
    }

    fn name(&self) -> &'static str {
        "Edge functions bundling"
    }

    fn event(&self) -> LifecycleEvent {
        LifecycleEvent::Build
    }

    fn condition(&self, ctx: &CoreStepContext<'_>) -> bool {
        ctx.constants.edge_functions_src.is_some()
            || ctx.resolve(&ctx.constants.internal_edge_functions_src).is_dir()
    }

    fn condition_summary(&self) -> &'static str {
        "edge functions directory configured or internal edge functions exist"
    }

    fn run(&self, ctx: &mut CoreStepContext<'_>) -> Result<CoreStepOutput, RawError> {
        let start = Instant::now();
        let mut sources = Vec::new();

        // A configured directory that is missing is the user's mistake.
        if let Some(src) = &ctx.constants.edge_functions_src {
            let dir = ctx.resolve(src);
            if !dir.is_dir() {
                return Err(RawError::new(format!(
                    "Edge functions directory \"{}\" does not exist",
                    src
                ))
                .tagged(
                    ErrorKind::ResolveConfig,
                    Some(ErrorLocation::Config {
                        path: ctx.constants.config_path.clone(),
                    }),
                ));
            }
            sources.push(dir);
        }
        let internal = ctx.resolve(&ctx.constants.internal_edge_functions_src);
        if internal.is_dir() {
            sources.push(internal);
        }

        let request = BundleRequest {
            kind: FunctionKind::Edge,
            sources,
            generated: Vec::new(),
            build_dir: ctx.build_dir.to_path_buf(),
            dist: ctx.resolve(&ctx.constants.edge_functions_dist),
            build_version: ctx.constants.build_version.clone(),
        };

        ctx.shell.status(Status::Bundling, "edge functions");
        let mut progress = ctx.shell.progress(0, "Bundling edge functions");
        let bundled = self.bundler.bundle(&request, &mut progress)?;
        ctx.system_log(self.id(), &format!("Bundled {} edge functions", bundled.len()));

        Ok(CoreStepOutput {
            metrics: vec![
                Metric::gauge("edge_functions.bundled", bundled.len() as f64),
                Metric::timing("edge_functions.bundling", start.elapsed().as_secs_f64() * 1000.0),
            ],
        })
    }
}
