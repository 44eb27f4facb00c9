//! Implementation of `quay build`, `quay dev` and `quay plan`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::builder::classify::ErrorOrigin;
use crate::builder::core_steps::CoreStepRegistry;
use crate::builder::env::Environment;
use crate::builder::pipeline::{PipelineController, PipelineOptions};
use crate::builder::runner::{HandlerRunner, RunnerOptions};
use crate::core::config::{self, ConfigError, ConfigOptions};
use crate::core::constants::ConstantsContext;
use crate::core::error::{ClassifiedError, ErrorKind, RawError, Severity};
use crate::core::event::Timeline;
use crate::core::mutable::MutableConfig;
use crate::core::report::BuildReport;
use crate::core::step::ExecutionPlan;
use crate::resolver::{self, LoadOptions, PluginsList, ResolveError};
use crate::util::config::FeatureFlags;
use crate::util::context::GlobalContext;
use crate::util::process::CancellationToken;
use crate::util::secrets::Redactor;
use crate::util::shell::{Shell, Status};

/// Environment variable holding the site id.
pub const SITE_ID_ENV: &str = "QUAY_SITE_ID";
/// Environment variable overriding the platform API host.
pub const API_HOST_ENV: &str = "QUAY_API_HOST";
/// Environment variable holding the platform API token.
pub const AUTH_TOKEN_ENV: &str = "QUAY_AUTH_TOKEN";

/// Options for a build.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Explicit configuration file, relative to the build directory
    pub config_path: Option<PathBuf>,

    /// Deploy context whose overrides apply
    pub context: Option<String>,

    /// Already-resolved configuration to use instead of `quay.toml`
    pub cached_config: Option<PathBuf>,

    /// Persist accepted configuration mutations
    pub save_config: bool,

    /// Resolve and print the plan without running it
    pub dry: bool,

    /// Keep internal stack frames and print every mutation
    pub debug: bool,

    /// Per-step timeout overriding the settings
    pub timeout: Option<Duration>,

    /// Raw `--feature-flags` values
    pub feature_flags: Vec<String>,

    /// Plugin compatibility list
    pub plugins_list: Option<PathBuf>,

    /// Where handler system logs are appended
    pub system_log_file: Option<PathBuf>,

    /// Where the JSON build report is written
    pub output_report: Option<PathBuf>,

    /// Externally owned cancellation (e.g. a signal handler)
    pub cancel: Option<CancellationToken>,
}

/// Run the build timeline.
pub fn build(gctx: &GlobalContext, shell: Arc<Shell>, opts: &BuildOptions) -> BuildReport {
    run_timeline(gctx, shell, opts, Timeline::Build, CoreStepRegistry::default())
}

/// Run the dev timeline.
pub fn dev(gctx: &GlobalContext, shell: Arc<Shell>, opts: &BuildOptions) -> BuildReport {
    run_timeline(gctx, shell, opts, Timeline::Dev, CoreStepRegistry::default())
}

/// Resolve the plan of `timeline` and print it.
pub fn plan(gctx: &GlobalContext, shell: Arc<Shell>, opts: &BuildOptions, timeline: Timeline) -> BuildReport {
    let opts = BuildOptions {
        dry: true,
        ..opts.clone()
    };
    run_timeline(gctx, shell, &opts, timeline, CoreStepRegistry::default())
}

/// Load, resolve and run one timeline with the given core steps.
pub fn run_timeline(
    gctx: &GlobalContext,
    shell: Arc<Shell>,
    opts: &BuildOptions,
    timeline: Timeline,
    registry: CoreStepRegistry,
) -> BuildReport {
    let settings = gctx.settings();
    let feature_flags = FeatureFlags::parse(settings.features.flags.iter().chain(opts.feature_flags.iter()));

    let mut env = Environment::from_process();
    let mut redactor = Redactor::from_env(env.vars());
    if let Some(token) = env.get(AUTH_TOKEN_ENV) {
        redactor.add_value(token);
    }

    let mut runner = HandlerRunner::new(RunnerOptions::from_settings(&settings.run, opts.timeout), redactor)
        .debug(opts.debug);
    if let Some(cancel) = &opts.cancel {
        runner = runner.with_cancellation(cancel.clone());
    }

    let mut controller = PipelineController::new(
        runner,
        registry,
        Arc::clone(&shell),
        PipelineOptions {
            debug: opts.debug,
            save_config: opts.save_config,
            feature_flags: feature_flags.clone(),
            system_log_file: opts.system_log_file.as_ref().map(|p| gctx.cwd().join(p)),
        },
    );
    controller.begin_resolution();

    let build_dir = gctx.cwd().to_path_buf();
    tracing::debug!(timeline = %timeline, build_dir = %build_dir.display(), "resolving");

    let resolved = match config::load(&ConfigOptions {
        build_dir: build_dir.clone(),
        config_path: opts.config_path.clone(),
        context: opts.context.clone(),
        cached_config: opts.cached_config.as_ref().map(|p| build_dir.join(p)),
    }) {
        Ok(resolved) => resolved,
        Err(e) => {
            let error = classify_config_error(controller.runner(), &e);
            let rendered = e.to_diagnostic().format(shell.use_color());
            let report = controller.fail_resolution(error, Some(rendered));
            return finish(&shell, report, opts, gctx.cwd());
        }
    };
    let config_path = resolved.config_path.clone();
    if let Some(environment) = resolved.config.pointer("/build/environment") {
        env.apply_config(environment);
    }

    let plugins_list = match opts.plugins_list.as_ref().map(|p| PluginsList::load(&build_dir.join(p))) {
        Some(Ok(list)) => Some(list),
        Some(Err(e)) => return fail(&mut controller, &shell, e, config_path.as_deref(), opts, gctx.cwd()),
        None => None,
    };

    let loaded = resolver::load_plugins(
        &resolved.plugins,
        &LoadOptions {
            build_dir: &build_dir,
            env: &env,
            feature_flags: &feature_flags,
            plugins_list: plugins_list.as_ref(),
            runner: controller.runner(),
        },
    );
    let loaded = match loaded {
        Ok(loaded) => loaded,
        Err(e) => return fail(&mut controller, &shell, e, config_path.as_deref(), opts, gctx.cwd()),
    };
    for plugin in &loaded.plugins {
        let version = plugin.version().map(|v| format!(" v{}", v)).unwrap_or_default();
        shell.status(Status::Loaded, format!("{}{} from {}", plugin.package, version, plugin.origin));
    }

    let resolution = resolver::resolve_plan(timeline, &resolved.config, loaded, controller.registry());
    for warning in &resolution.warnings {
        shell.warn(warning);
    }

    if opts.dry {
        print_plan(&shell, &resolution.plan);
        return finish(&shell, BuildReport::empty(), opts, gctx.cwd());
    }

    let constants = ConstantsContext {
        config_path,
        site_id: env.get(SITE_ID_ENV).map(str::to_string),
        api_host: env
            .get(API_HOST_ENV)
            .map(str::to_string)
            .unwrap_or_else(|| crate::core::constants::DEFAULT_API_HOST.to_string()),
        ..ConstantsContext::local(&build_dir)
    };
    let report = controller.run(&resolution.plan, MutableConfig::new(resolved.config), constants, env);
    finish(&shell, report, opts, gctx.cwd())
}

fn classify_config_error(runner: &HandlerRunner, error: &ConfigError) -> ClassifiedError {
    let path = match error {
        ConfigError::NotFound { path }
        | ConfigError::Read { path, .. }
        | ConfigError::Parse { path, .. }
        | ConfigError::CachedConfig { path, .. } => Some(path.display().to_string()),
        ConfigError::Invalid { .. } => None,
    };
    let origin = ErrorOrigin::Config { path };
    let raw = RawError::new(error.to_string()).tagged(ErrorKind::ResolveConfig, Some(origin.location()));
    runner.classify(raw, &origin)
}

fn fail(
    controller: &mut PipelineController,
    shell: &Arc<Shell>,
    error: ResolveError,
    config_path: Option<&Path>,
    opts: &BuildOptions,
    cwd: &Path,
) -> BuildReport {
    let rendered = error
        .render_annotated(config_path)
        .unwrap_or_else(|| error.to_diagnostic().format(shell.use_color()));
    let classified = error.classify(controller.runner(), config_path);
    let report = controller.fail_resolution(classified, Some(rendered));
    finish(shell, report, opts, cwd)
}

/// Write the report if requested.
///
/// A report that cannot be written turns into an internal error of the build.
fn finish(shell: &Shell, mut report: BuildReport, opts: &BuildOptions, cwd: &Path) -> BuildReport {
    let Some(path) = &opts.output_report else {
        return report;
    };
    if let Err(e) = report.write(&cwd.join(path)) {
        let raw = RawError::from(e).tagged(ErrorKind::CoreInternal, None);
        let error = HandlerRunner::new(RunnerOptions::default(), Redactor::new()).classify(raw, &ErrorOrigin::Core);
        shell.error(&error.message);
        report.severity_code = report.severity_code.max(Severity::SystemError.code());
        report.success = false;
        report.errors.push(error);
    }
    report
}

/// Print the plan, grouped by event.
pub fn print_plan(shell: &Shell, plan: &ExecutionPlan) {
    if shell.is_json() {
        shell.json_event(&plan_to_json(plan));
        return;
    }

    if plan.is_empty() {
        shell.status(Status::Plan, format!("nothing to run on the {} timeline", plan.timeline()));
        return;
    }
    for (event, steps) in plan.iter().filter(|(_, steps)| !steps.is_empty()) {
        shell.status(Status::Plan, format!("{} ({})", event, event.description()));
        for (index, step) in steps.iter().enumerate() {
            shell.block(format!("{:>14}. {}", index + 1, step));
        }
    }
}

/// Machine-readable plan.
pub fn plan_to_json(plan: &ExecutionPlan) -> Value {
    let events: Vec<Value> = plan
        .iter()
        .map(|(event, steps)| {
            let steps: Vec<Value> = steps
                .iter()
                .map(|step| {
                    json!({
                        "id": step.id(),
                        "kind": step.kind(),
                        "package": step.package(),
                        "origin": step.plugin_origin(),
                    })
                })
                .collect();
            json!({"event": event, "steps": steps})
        })
        .collect();
    json!({"reason": "plan", "timeline": plan.timeline(), "events": events})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::LifecycleEvent;
    use crate::test_support::fixtures::quiet_shell;
    use tempfile::TempDir;

    fn context(dir: &Path) -> GlobalContext {
        GlobalContext::with_cwd(dir.to_path_buf()).with_home(dir.join("home"))
    }

    #[test]
    fn test_empty_site_succeeds() {
        let tmp = TempDir::new().unwrap();
        let report = build(&context(tmp.path()), quiet_shell(), &BuildOptions::default());
        assert!(report.success);
        assert_eq!(report.severity_code, 0);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_invalid_config_is_resolve_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("quay.toml"), "[build\ncommand = 1").unwrap();

        let report = build(&context(tmp.path()), quiet_shell(), &BuildOptions::default());
        assert!(!report.success);
        assert_eq!(report.severity_code, 2);
        assert_eq!(report.errors[0].kind, ErrorKind::ResolveConfig);
    }

    #[test]
    fn test_missing_plugin_aborts_before_any_step() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("quay.toml"),
            "[build]\ncommand = \"touch ran\"\n\n[[plugins]]\npackage = \"quay-plugin-missing\"\n",
        )
        .unwrap();

        let report = build(&context(tmp.path()), quiet_shell(), &BuildOptions::default());
        assert_eq!(report.severity_code, 3);
        assert_eq!(report.errors[0].kind, ErrorKind::MissingPlugin);
        assert!(report.timings.is_empty());
        assert!(!tmp.path().join("ran").exists());
    }

    #[test]
    fn test_dry_run_writes_report() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("quay.toml"), "[build]\ncommand = \"touch ran\"\n").unwrap();

        let opts = BuildOptions {
            dry: true,
            output_report: Some(PathBuf::from("out/report.json")),
            ..BuildOptions::default()
        };
        let report = build(&context(tmp.path()), quiet_shell(), &opts);
        assert!(report.success);
        assert!(!tmp.path().join("ran").exists());

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(tmp.path().join("out/report.json")).unwrap()).unwrap();
        assert_eq!(written["severityCode"], 0);
    }

    #[test]
    fn test_plan_json_shape() {
        let mut plan = ExecutionPlan::new(Timeline::Build);
        plan.push(crate::core::step::Step::Core {
            id: "functions_bundling",
            name: "Functions bundling",
            event: LifecycleEvent::Build,
        });

        let json = plan_to_json(&plan);
        assert_eq!(json["reason"], "plan");
        assert_eq!(json["timeline"], "build");
        assert_eq!(json["events"][1]["event"], "onBuild");
        assert_eq!(json["events"][1]["steps"][0]["id"], "functions_bundling");
        assert_eq!(json["events"][1]["steps"][0]["kind"], "core_step");
    }
}
