//! Event-by-event execution of a resolved plan.
//!
//! [`PipelineController`] walks the events of the plan's timeline in order
//! and runs every step through the [`HandlerRunner`]. After each failure it
//! decides, from the severity alone, whether the build continues, whether
//! only the failing plugin is excluded, or whether the remaining
//! plan-defined events are abandoned. Terminal events get a final pass either
//! way, and everything observed is folded into one [`BuildReport`].

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::builder::classify::{terminal_severity, ErrorOrigin};
use crate::builder::core_steps::{CoreStepContext, CoreStepRegistry};
use crate::builder::env::Environment;
use crate::builder::events::{BuildEvent, StepResult};
use crate::builder::runner::{HandlerContext, HandlerOutcome, HandlerRunner, OutputSink, StepRun};
use crate::builder::status::StatusAggregator;
use crate::core::constants::{Constants, ConstantsContext};
use crate::core::error::{ClassifiedError, ErrorKind, RawError, Severity};
use crate::core::event::LifecycleEvent;
use crate::core::mutable::{MutableConfig, Mutation};
use crate::core::report::{BuildLogs, BuildReport, GeneratedFunction, Metric, StepTiming};
use crate::core::step::{ExecutionPlan, Step};
use crate::util::config::FeatureFlags;
use crate::util::process::{CancellationToken, Stream};
use crate::util::shell::{format_duration, Shell, Span, Status};

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    ResolvingPlan,
    RunningEvent(LifecycleEvent),
    /// A user or system error stopped the plan-defined events.
    Aborted,
    Completed,
}

/// Build-wide switches.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub debug: bool,
    pub save_config: bool,
    pub feature_flags: FeatureFlags,
    /// Where handler system logs are appended.
    pub system_log_file: Option<PathBuf>,
}

/// Drives one build through its lifecycle events.
pub struct PipelineController {
    runner: HandlerRunner,
    registry: CoreStepRegistry,
    shell: Arc<Shell>,
    options: PipelineOptions,
    state: PipelineState,
}

impl PipelineController {
    pub fn new(
        runner: HandlerRunner,
        registry: CoreStepRegistry,
        shell: Arc<Shell>,
        options: PipelineOptions,
    ) -> Self {
        PipelineController {
            runner,
            registry,
            shell,
            options,
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn runner(&self) -> &HandlerRunner {
        &self.runner
    }

    pub fn registry(&self) -> &CoreStepRegistry {
        &self.registry
    }

    /// Mark the start of plan resolution.
    pub fn begin_resolution(&mut self) {
        self.state = PipelineState::ResolvingPlan;
    }

    /// Finish a build whose plan could not be resolved.
    ///
    /// No step ran, so the report only carries the error. `rendered`
    /// replaces the default human rendering of the error.
    pub fn fail_resolution(&mut self, error: ClassifiedError, rendered: Option<String>) -> BuildReport {
        self.state = PipelineState::Aborted;
        match rendered {
            Some(text) if !self.shell.is_json() => {
                tracing::debug!(kind = %error.kind, "plan resolution failed");
                self.shell.block(format!("\n{}", text.trim_end()));
            }
            _ => self.report_error(&error),
        }

        let code = error.severity.code();
        self.emit(BuildEvent::finished(code == 0, code, 0));
        BuildReport {
            success: code == 0,
            severity_code: code,
            errors: vec![error],
            ..BuildReport::empty()
        }
    }

    /// Run every event of `plan` and build the report.
    pub fn run(
        &mut self,
        plan: &ExecutionPlan,
        config: MutableConfig,
        constants: ConstantsContext,
        env: Environment,
    ) -> BuildReport {
        let start = Instant::now();
        self.emit(BuildEvent::started(plan.timeline(), plan.len()));
        tracing::debug!(timeline = %plan.timeline(), steps = plan.len(), "running plan");

        let mut run = RunState {
            config,
            constants,
            env,
            recorder: Recorder::new(Arc::clone(&self.shell), self.options.debug, self.options.system_log_file.as_ref()),
            statuses: StatusAggregator::new(),
            timings: Vec::new(),
            metrics: Vec::new(),
            functions: Vec::new(),
            errors: Vec::new(),
            max_severity: Severity::None,
            failed_plugins: HashSet::new(),
            crashed_plugins: HashSet::new(),
            trigger: None,
            aborted: false,
            canceled: false,
        };

        // Terminal events run after an external cancellation too.
        let cleanup = self.runner.clone().with_cancellation(CancellationToken::new());

        for (event, steps) in plan.iter() {
            if steps.is_empty() {
                continue;
            }
            let terminal = event.is_terminal();
            if terminal || !run.stopped() {
                self.state = PipelineState::RunningEvent(event);
            }
            tracing::debug!(event = %event, steps = steps.len(), "event");

            for step in steps {
                if !terminal {
                    self.check_cancellation(&mut run);
                }
                let skip = if terminal {
                    terminal_skip_reason(event, &run)
                } else {
                    run.stop_reason()
                }
                .or_else(|| {
                    step.package()
                        .filter(|p| run.excludes(p, terminal))
                        .map(|_| "plugin failed")
                });

                match skip {
                    Some(reason) => self.skip(step, reason),
                    None if terminal => self.run_step(&cleanup, &mut run, step, true),
                    None => self.run_step(&self.runner, &mut run, step, false),
                }
            }
        }

        self.state = if run.aborted {
            PipelineState::Aborted
        } else {
            PipelineState::Completed
        };
        self.finish(run, start)
    }

    fn check_cancellation(&self, run: &mut RunState) {
        if run.canceled || !self.runner.cancellation().is_cancelled() {
            return;
        }
        let raw = RawError::new("Build was canceled").tagged(ErrorKind::CancelBuild, None);
        let error = self.runner.classify(raw, &ErrorOrigin::Core);
        self.record_error(run, error, None, false);
    }

    fn run_step(&self, runner: &HandlerRunner, run: &mut RunState, step: &Step, terminal: bool) {
        let Some((step_run, span)) = self.execute(runner, run, step) else {
            return;
        };
        self.finish_step(run, step, step_run, span, terminal);
    }

    /// Run one step. `None` means the step was omitted.
    fn execute(&self, runner: &HandlerRunner, run: &mut RunState, step: &Step) -> Option<(StepRun, Span)> {
        let event = step.event();
        match step {
            Step::BuildCommand { command, .. } => {
                // A plugin may have replaced the command before it runs.
                let key = event.timeline().command_key();
                let command = match run.config.get_str(key) {
                    Some(live) if !live.trim().is_empty() => live.to_string(),
                    Some(_) => {
                        tracing::debug!("{} was emptied, not running it", key);
                        return None;
                    }
                    None => command.clone(),
                };
                let span = self.start_step(step);
                let mut ctx = HandlerContext {
                    config: &mut run.config,
                    constants: &run.constants,
                    env: &mut run.env,
                    feature_flags: &self.options.feature_flags,
                    error: run.trigger.as_ref(),
                };
                let step_run = runner.run_command(event, &command, &mut ctx, &mut run.recorder);
                Some((step_run, span))
            }
            Step::Plugin { plugin, .. } => {
                let span = self.start_step(step);
                let mut ctx = HandlerContext {
                    config: &mut run.config,
                    constants: &run.constants,
                    env: &mut run.env,
                    feature_flags: &self.options.feature_flags,
                    error: run.trigger.as_ref(),
                };
                let step_run = runner.run_plugin(event, plugin, &mut ctx, &mut run.recorder);
                Some((step_run, span))
            }
            Step::Core { id, name, .. } => {
                let Some(core) = self.registry.get(id) else {
                    let raw = RawError::new(format!("Unknown core step \"{}\"", id));
                    let origin = ErrorOrigin::CoreStep {
                        id: id.to_string(),
                        name: name.to_string(),
                        event,
                    };
                    let error = runner.classify(raw.tagged(ErrorKind::CoreInternal, None), &origin);
                    return Some((
                        StepRun {
                            outcome: HandlerOutcome::Failure(error),
                            status: None,
                            functions: Vec::new(),
                            metrics: Vec::new(),
                        },
                        self.start_step(step),
                    ));
                };

                let constants = Constants::compute(&run.config, &run.constants);
                let mut ctx = CoreStepContext {
                    build_dir: &run.constants.build_dir,
                    constants,
                    config: &mut run.config,
                    config_path: run.constants.config_path.as_deref(),
                    debug: self.options.debug,
                    save_config: self.options.save_config,
                    feature_flags: &self.options.feature_flags,
                    generated_functions: &run.functions,
                    shell: &self.shell,
                    sink: &mut run.recorder,
                };
                if !core.condition(&ctx) {
                    tracing::debug!(step = %id, "condition not met: {}", core.condition_summary());
                    return None;
                }
                let span = self.start_step(step);
                let step_run = runner.run_core(core, &mut ctx);
                Some((step_run, span))
            }
        }
    }

    fn start_step(&self, step: &Step) -> Span {
        self.emit(BuildEvent::step_started(step));
        self.shell.span(Status::Running, step)
    }

    fn finish_step(&self, run: &mut RunState, step: &Step, step_run: StepRun, mut span: Span, terminal: bool) {
        let event = step.event();
        let duration_ms = span.elapsed().as_millis() as u64;
        run.timings.push(StepTiming {
            event,
            step_id: step.id().to_string(),
            duration_ms,
        });
        run.metrics.extend(step_run.metrics);
        run.functions.extend(step_run.functions);

        let package = step.package();
        if let (Some(package), Some(report)) = (package, step_run.status) {
            run.statuses.submit(package, report);
        }

        match step_run.outcome {
            HandlerOutcome::Success(value) => {
                if let Some(value) = value {
                    tracing::debug!(step = %step.id(), "handler returned {}", value);
                }
                if let Some(package) = package {
                    run.statuses.completed(package, event);
                }
                self.emit(BuildEvent::step_finished(step, StepResult::Success, duration_ms));
                drop(span);
            }
            HandlerOutcome::Skipped(reason) => {
                span.finish_with_status(Status::Skipped, format!("{} ({})", step, reason));
                self.emit(BuildEvent::step_skipped(step, reason));
            }
            HandlerOutcome::Failure(mut error) => {
                if terminal {
                    error.severity = terminal_severity(error.severity);
                }
                span.finish_with_status(Status::Failed, step);
                self.emit(BuildEvent::step_finished(step, StepResult::Failure, duration_ms));
                if let Some(package) = package {
                    run.statuses.failed(package, &error);
                }
                self.record_error(run, error, package, terminal);
            }
        }
    }

    /// Fold a failure into the build state.
    fn record_error(&self, run: &mut RunState, error: ClassifiedError, package: Option<&str>, terminal: bool) {
        self.report_error(&error);
        run.max_severity = run.max_severity.max(error.severity);

        match error.severity {
            severity if severity.aborts_pipeline() => {
                run.aborted = true;
                run.trigger.get_or_insert_with(|| error.clone());
            }
            Severity::Cancellation => {
                run.canceled = true;
                run.trigger.get_or_insert_with(|| error.clone());
            }
            Severity::PluginError => match package {
                Some(package) if error.kind == ErrorKind::FailPlugin => {
                    tracing::debug!(plugin = %package, "excluding plugin from the rest of the build");
                    run.failed_plugins.insert(package.to_string());
                }
                Some(package) if !terminal => {
                    // Uncaught failure: the plugin still gets its onError and onEnd.
                    tracing::debug!(plugin = %package, "skipping remaining handlers of crashed plugin");
                    run.crashed_plugins.insert(package.to_string());
                    run.trigger.get_or_insert_with(|| error.clone());
                }
                _ => {}
            },
            _ => {}
        }
        run.errors.push(error);
    }

    fn report_error(&self, error: &ClassifiedError) {
        tracing::debug!(
            kind = %error.kind,
            severity = %error.severity,
            grouping_key = %error.grouping_key,
            "classified failure"
        );
        if self.shell.is_json() {
            let level = if error.is_failure() { "error" } else { "warning" };
            self.emit(BuildEvent::diagnostic(level, error.to_string()));
        } else if error.is_failure() {
            self.shell.block(format!("\n{}\n", error.render(self.options.debug)));
        } else {
            self.shell.warn(error);
        }
    }

    fn skip(&self, step: &Step, reason: &str) {
        tracing::debug!(step = %step.id(), event = %step.event(), "skipped: {}", reason);
        if self.shell.is_verbose() {
            self.shell.status(Status::Skipped, format!("{} ({})", step, reason));
        }
        self.emit(BuildEvent::step_skipped(step, reason));
    }

    fn emit(&self, event: BuildEvent) {
        if self.shell.is_json() {
            self.shell.json_event(&event.to_value());
        }
    }

    fn finish(&self, run: RunState, start: Instant) -> BuildReport {
        let RunState {
            config,
            recorder,
            statuses,
            timings,
            metrics,
            functions,
            errors,
            max_severity,
            canceled,
            ..
        } = run;
        let (_, log) = config.into_parts();
        let code = max_severity.code();
        let success = code == 0;
        let elapsed = start.elapsed();

        self.emit(BuildEvent::finished(success, code, elapsed.as_millis() as u64));
        let summary = format!("build in {}", format_duration(elapsed));
        if success {
            self.shell.status(Status::Finished, summary);
        } else if canceled && max_severity == Severity::Cancellation {
            self.shell.status(Status::Canceled, summary);
        } else {
            self.shell.status(Status::Failed, format!("{} ({})", summary, max_severity));
        }

        BuildReport {
            success,
            severity_code: code,
            config_mutations: log.entries().to_vec(),
            generated_functions: functions,
            statuses: statuses.finalize(),
            logs: recorder.into_logs(),
            errors,
            timings,
            metrics,
        }
    }
}

/// Mutable state of one build.
struct RunState {
    config: MutableConfig,
    constants: ConstantsContext,
    env: Environment,
    recorder: Recorder,
    statuses: StatusAggregator,
    timings: Vec<StepTiming>,
    metrics: Vec<Metric>,
    functions: Vec<GeneratedFunction>,
    errors: Vec<ClassifiedError>,
    max_severity: Severity,
    /// Plugins that called `fail_plugin`; none of their handlers run again.
    failed_plugins: HashSet<String>,
    /// Plugins whose handler crashed; only their terminal handlers still run.
    crashed_plugins: HashSet<String>,
    /// The failure `onError` and `onEnd` receive.
    trigger: Option<ClassifiedError>,
    aborted: bool,
    canceled: bool,
}

impl RunState {
    fn stopped(&self) -> bool {
        self.aborted || self.canceled
    }

    /// Whether the build has failed or was canceled, as seen by terminal events.
    fn failed(&self) -> bool {
        self.trigger.is_some()
    }

    fn excludes(&self, package: &str, terminal: bool) -> bool {
        self.failed_plugins.contains(package) || (!terminal && self.crashed_plugins.contains(package))
    }

    fn stop_reason(&self) -> Option<&'static str> {
        if self.aborted {
            Some("build aborted")
        } else if self.canceled {
            Some("build canceled")
        } else {
            None
        }
    }
}

fn terminal_skip_reason(event: LifecycleEvent, run: &RunState) -> Option<&'static str> {
    match event {
        LifecycleEvent::Success if run.failed() => Some("build did not succeed"),
        LifecycleEvent::Error if !run.failed() => Some("build did not fail"),
        _ => None,
    }
}

/// Collects what steps print and forwards it to the shell.
struct Recorder {
    shell: Arc<Shell>,
    debug: bool,
    logs: BuildLogs,
    system_log: Option<BufWriter<File>>,
}

impl Recorder {
    fn new(shell: Arc<Shell>, debug: bool, system_log_file: Option<&PathBuf>) -> Self {
        let system_log = system_log_file.and_then(|path| {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Some(BufWriter::new(file)),
                Err(e) => {
                    tracing::warn!("cannot open system log file {}: {}", path.display(), e);
                    None
                }
            }
        });
        Recorder {
            shell,
            debug,
            logs: BuildLogs::default(),
            system_log,
        }
    }

    fn into_logs(mut self) -> BuildLogs {
        if let Some(file) = &mut self.system_log {
            if let Err(e) = file.flush() {
                tracing::warn!("failed to flush system log: {}", e);
            }
        }
        std::mem::take(&mut self.logs)
    }
}

impl OutputSink for Recorder {
    fn line(&mut self, step_id: &str, stream: Stream, text: &str) {
        let stderr = stream == Stream::Stderr;
        if stderr {
            self.logs.stderr.push(text.to_string());
        } else {
            self.logs.stdout.push(text.to_string());
        }

        if self.shell.is_json() {
            self.shell.json_event(&BuildEvent::log(step_id, stderr, text).to_value());
        } else {
            self.shell.output_line(stderr, text);
        }
    }

    fn system_log(&mut self, step_id: &str, message: &str) {
        tracing::debug!(target: "quay::system_log", step = %step_id, "{}", message);
        if let Some(file) = &mut self.system_log {
            if let Err(e) = writeln!(file, "[{}] {}", step_id, message) {
                tracing::warn!("failed to write system log: {}", e);
                self.system_log = None;
            }
        }
    }

    fn mutation(&mut self, mutation: &Mutation) {
        if self.shell.is_json() {
            let event = BuildEvent::ConfigMutation {
                keys: mutation.keys_string.clone(),
                event: mutation.event,
            };
            self.shell.json_event(&event.to_value());
        } else if let Some(text) = mutation.describe(self.debug) {
            self.shell.note(text);
        }
    }

    fn warn(&mut self, message: &str) {
        if self.shell.is_json() {
            self.shell
                .json_event(&BuildEvent::diagnostic("warning", message).to_value());
        } else {
            self.shell.warn(message);
        }
    }
}
