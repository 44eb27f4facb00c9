//! Execution of a single step.
//!
//! [`HandlerRunner`] turns one step into a [`HandlerOutcome`]. Plugin handlers
//! and the user's command run in a child process: the runner streams the
//! child's output, decodes protocol lines, applies configuration and
//! environment changes as they arrive and enforces the step deadline. Core
//! steps run in-process; a panic inside one is caught and classified.
//!
//! Nothing leaves the runner as an `Err` or a panic. Every failure is
//! classified before it is returned.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use thiserror::Error;

use crate::builder::classify::{self, ClassifyContext, ErrorOrigin};
use crate::builder::core_steps::{CoreStep, CoreStepContext};
use crate::builder::env::Environment;
use crate::builder::ipc::{self, ConfigOp, HandlerRequest, ParsedLine, PluginMessage, LOAD_EVENT};
use crate::core::constants::{Constants, ConstantsContext};
use crate::core::error::{ClassifiedError, ErrorKind, RawError};
use crate::core::event::LifecycleEvent;
use crate::core::mutable::{KeyPath, MutableConfig, Mutation};
use crate::core::plugin::LoadedPlugin;
use crate::core::report::{GeneratedFunction, Metric, StatusReport};
use crate::util::config::{FeatureFlags, RunConfig};
use crate::util::process::{
    shell_command, CancellationToken, OutputLine, Poll, ProcessBuilder, Stream, StreamingChild,
};
use crate::util::secrets::Redactor;

/// Environment variable pointing a plugin child at its own directory.
pub const PLUGIN_DIR_VAR: &str = "QUAY_PLUGIN_DIR";

/// How long a single channel wait may block before deadlines are rechecked.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Deadlines applied to child processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Limit for one event handler or the user's command.
    pub step_timeout: Duration,
    /// Limit for a plugin's load handshake.
    pub load_timeout: Duration,
    /// How long output pipes may stay open after the child is done.
    pub lingering_grace: Duration,
}

impl RunnerOptions {
    /// Options from tool settings; `step_timeout` overrides the configured one.
    pub fn from_settings(run: &RunConfig, step_timeout: Option<Duration>) -> Self {
        RunnerOptions {
            step_timeout: step_timeout.unwrap_or_else(|| run.step_timeout()),
            load_timeout: run.ipc_load_timeout(),
            lingering_grace: run.lingering_grace(),
        }
    }
}

impl Default for RunnerOptions {
    fn default() -> Self {
        RunnerOptions::from_settings(&RunConfig::default(), None)
    }
}

/// Result of running one step.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The handler completed; plugins may return a value.
    Success(Option<Value>),
    Failure(ClassifiedError),
    Skipped(String),
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Success(_))
    }
}

/// Everything a step produced besides its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRun {
    pub outcome: HandlerOutcome,
    /// Latest explicit status the plugin reported during this step.
    pub status: Option<StatusReport>,
    pub functions: Vec<GeneratedFunction>,
    pub metrics: Vec<Metric>,
}

impl StepRun {
    fn new(outcome: HandlerOutcome) -> Self {
        StepRun {
            outcome,
            status: None,
            functions: Vec::new(),
            metrics: Vec::new(),
        }
    }

    fn failed(error: ClassifiedError) -> Self {
        StepRun::new(HandlerOutcome::Failure(error))
    }
}

/// Where the runner sends what a step prints.
pub trait OutputSink {
    /// One line of user-visible output, already redacted.
    fn line(&mut self, step_id: &str, stream: Stream, text: &str);

    /// A message on the system log channel.
    fn system_log(&mut self, step_id: &str, message: &str);

    /// A configuration mutation was accepted.
    fn mutation(&mut self, mutation: &Mutation);

    /// A non-fatal problem with the step's process.
    fn warn(&mut self, message: &str);
}

/// State a child-process step reads and changes.
pub struct HandlerContext<'a> {
    pub config: &'a mut MutableConfig,
    pub constants: &'a ConstantsContext,
    pub env: &'a mut Environment,
    pub feature_flags: &'a FeatureFlags,
    /// The failure that triggered `onError`/`onEnd`.
    pub error: Option<&'a ClassifiedError>,
}

impl HandlerContext<'_> {
    fn build_dir(&self) -> &Path {
        &self.constants.build_dir
    }
}

/// Failures of the process supervision itself.
#[derive(Debug, Error, PartialEq)]
pub enum RunnerError {
    #[error("Could not start {what}: {message}")]
    Spawn { what: String, message: String },

    #[error("{what} did not complete within {}s", timeout.as_secs())]
    Timeout { what: String, timeout: Duration },

    #[error("{what} was canceled")]
    Canceled { what: String },

    #[error("Lost contact with {what}: {message}")]
    Io { what: String, message: String },
}

impl RunnerError {
    /// Kind to tag the error with; `None` leaves it to the origin.
    fn kind(&self) -> Option<ErrorKind> {
        match self {
            RunnerError::Spawn { .. } => None,
            RunnerError::Timeout { .. } => Some(ErrorKind::StepTimeout),
            RunnerError::Canceled { .. } => Some(ErrorKind::CancelBuild),
            RunnerError::Io { .. } => Some(ErrorKind::Ipc),
        }
    }

    fn into_raw(self) -> RawError {
        let raw = RawError::new(self.to_string());
        match self.kind() {
            Some(kind) => raw.tagged(kind, None),
            None => raw,
        }
    }
}

/// What the line callback wants the supervisor to do next.
enum Flow {
    Continue,
    /// The handler reported its end; drain remaining output within the grace.
    Finish,
    /// Give up on the child now.
    Stop,
}

/// How a supervised child ended.
struct Supervised {
    status: Option<ExitStatus>,
    /// The child exited but something kept its output pipes open.
    lingering: bool,
}

/// Runs steps and normalizes their results.
#[derive(Debug, Clone)]
pub struct HandlerRunner {
    options: RunnerOptions,
    redactor: Redactor,
    cancel: CancellationToken,
    debug: bool,
}

impl HandlerRunner {
    pub fn new(options: RunnerOptions, redactor: Redactor) -> Self {
        HandlerRunner {
            options,
            redactor,
            cancel: CancellationToken::new(),
            debug: false,
        }
    }

    /// Keep internal stack frames in classified errors.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Share a cancellation token with the caller.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Classify a raw failure with this runner's settings.
    pub fn classify(&self, raw: RawError, origin: &ErrorOrigin) -> ClassifiedError {
        classify::classify(
            raw,
            ClassifyContext {
                origin,
                debug: self.debug,
                redactor: &self.redactor,
            },
        )
    }

    /// Ask a plugin which event handlers it exports.
    ///
    /// Returns the raw event names; validating them is up to the caller.
    pub fn handshake(
        &self,
        plugin: &LoadedPlugin,
        build_dir: &Path,
        env: &Environment,
        feature_flags: &FeatureFlags,
    ) -> Result<Vec<String>, ClassifiedError> {
        let origin = ErrorOrigin::PluginLoad {
            package: plugin.package.clone(),
            origin: plugin.origin,
        };
        let what = format!("plugin \"{}\"", plugin.package);
        let request = HandlerRequest {
            event: LOAD_EVENT.to_string(),
            plugin_id: plugin.package.clone(),
            package: plugin.package.clone(),
            inputs: plugin.inputs.clone(),
            constants: json!({}),
            config: json!({}),
            error: None,
            feature_flags: flag_map(feature_flags),
        };

        let mut child = self
            .spawn_plugin(plugin, LOAD_EVENT, build_dir, env, &request, &what)
            .map_err(|e| self.classify(e.into_raw(), &origin))?;

        let mut events = None;
        let mut failure = None;
        let supervised = self.supervise(&mut child, &what, self.options.load_timeout, |line| {
            if line.stream == Stream::Stderr {
                tracing::debug!(plugin = %plugin.package, "load: {}", line.text);
                return Flow::Continue;
            }
            match ipc::parse_line(&line.text) {
                ParsedLine::Output(text) => {
                    tracing::debug!(plugin = %plugin.package, "load: {}", text);
                    Flow::Continue
                }
                ParsedLine::Malformed { line, error } => {
                    failure = Some(malformed(&line, &error));
                    Flow::Stop
                }
                ParsedLine::Message(PluginMessage::Loaded { events: exported }) => {
                    events = Some(exported);
                    Flow::Finish
                }
                ParsedLine::Message(message) if message.is_terminal() => {
                    failure = message.to_raw_error();
                    Flow::Finish
                }
                ParsedLine::Message(message) => {
                    tracing::debug!(plugin = %plugin.package, "ignoring {:?} while loading", message);
                    Flow::Continue
                }
            }
        });

        let supervised = supervised.map_err(|e| self.classify(e.into_raw(), &origin))?;
        if let Some(raw) = failure {
            return Err(self.classify(raw, &origin));
        }
        match events {
            Some(events) => Ok(events),
            None => Err(self.classify(
                RawError::new(format!(
                    "Plugin exited before reporting its event handlers ({})",
                    describe_exit(supervised.status)
                )),
                &origin,
            )),
        }
    }

    /// Run one event handler of a plugin.
    pub fn run_plugin(
        &self,
        event: LifecycleEvent,
        plugin: &LoadedPlugin,
        ctx: &mut HandlerContext<'_>,
        sink: &mut dyn OutputSink,
    ) -> StepRun {
        let origin = ErrorOrigin::PluginHandler {
            package: plugin.package.clone(),
            event,
            origin: plugin.origin,
        };
        let what = format!("plugin \"{}\"", plugin.package);
        let request = HandlerRequest {
            event: event.as_str().to_string(),
            plugin_id: plugin.package.clone(),
            package: plugin.package.clone(),
            inputs: plugin.inputs.clone(),
            constants: Constants::compute(ctx.config, ctx.constants).to_json(),
            config: ctx.config.value().clone(),
            error: ctx.error.cloned(),
            feature_flags: flag_map(ctx.feature_flags),
        };

        let spawned = self.spawn_plugin(plugin, event.as_str(), ctx.build_dir(), ctx.env, &request, &what);
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let raw = e.into_raw().tagged(ErrorKind::PluginLoad, None);
                return StepRun::failed(self.classify(raw, &origin));
            }
        };

        let mut session = PluginSession {
            redactor: &self.redactor,
            package: &plugin.package,
            event,
            ctx,
            sink,
            terminal: None,
            failure: None,
            status: None,
            functions: Vec::new(),
        };
        let supervised = self.supervise(&mut child, &what, self.options.step_timeout, |line| {
            session.on_line(line)
        });

        let outcome = match supervised {
            Err(e) => HandlerOutcome::Failure(self.classify(e.into_raw(), &origin)),
            Ok(supervised) => {
                if supervised.lingering {
                    session.sink.warn(&lingering_message(&what));
                }
                match (session.failure.take(), session.terminal.take()) {
                    (Some(raw), _) => HandlerOutcome::Failure(self.classify(raw, &origin)),
                    (None, Some(PluginMessage::Done { value })) => HandlerOutcome::Success(value),
                    (None, Some(message)) => {
                        let raw = message
                            .to_raw_error()
                            .unwrap_or_else(|| RawError::new("Plugin ended with an unexpected message"));
                        HandlerOutcome::Failure(self.classify(raw, &origin))
                    }
                    (None, None) => {
                        let raw = RawError::new(format!(
                            "Plugin exited before completing \"{}\" event with {}",
                            event,
                            describe_exit(supervised.status)
                        ))
                        .tagged(ErrorKind::PluginExit, None);
                        HandlerOutcome::Failure(self.classify(raw, &origin))
                    }
                }
            }
        };

        StepRun {
            outcome,
            status: session.status,
            functions: session.functions,
            metrics: Vec::new(),
        }
    }

    /// Run the user's build or dev command through the shell.
    pub fn run_command(
        &self,
        event: LifecycleEvent,
        command: &str,
        ctx: &mut HandlerContext<'_>,
        sink: &mut dyn OutputSink,
    ) -> StepRun {
        let origin = ErrorOrigin::BuildCommand {
            command: command.to_string(),
            event,
        };
        let key = event.timeline().command_key();
        let what = format!("\"{}\"", key);

        let process = shell_command(command)
            .env_clear()
            .envs(ctx.env.vars())
            .cwd(ctx.build_dir());
        let mut child = match process.spawn_streaming() {
            Ok(child) => child,
            Err(e) => {
                let raw = RawError::from(e).tagged(ErrorKind::CoreInternal, None);
                return StepRun::failed(self.classify(raw, &origin));
            }
        };

        let redactor = &self.redactor;
        let supervised = self.supervise(&mut child, &what, self.options.step_timeout, |line| {
            sink.line(key, line.stream, &redactor.redact(&line.text));
            Flow::Continue
        });

        let outcome = match supervised {
            Err(e) => HandlerOutcome::Failure(self.classify(e.into_raw(), &origin)),
            Ok(supervised) => {
                if supervised.lingering {
                    sink.warn(&lingering_message(&what));
                }
                match supervised.status {
                    Some(status) if status.success() => HandlerOutcome::Success(None),
                    status => {
                        let raw = RawError::new(format!(
                            "Command failed with {}: {}",
                            describe_exit(status),
                            command
                        ));
                        HandlerOutcome::Failure(self.classify(raw, &origin))
                    }
                }
            }
        };
        StepRun::new(outcome)
    }

    /// Run a core step in-process.
    ///
    /// Core steps cannot be interrupted, so the step deadline is checked once
    /// the step returns: an overrun is reported as a timeout.
    pub fn run_core(&self, step: &dyn CoreStep, ctx: &mut CoreStepContext<'_>) -> StepRun {
        let origin = ErrorOrigin::CoreStep {
            id: step.id().to_string(),
            name: step.name().to_string(),
            event: step.event(),
        };
        let start = Instant::now();
        match panic::catch_unwind(AssertUnwindSafe(|| step.run(ctx))) {
            Ok(Ok(_)) if start.elapsed() > self.options.step_timeout => {
                let err = RunnerError::Timeout {
                    what: format!("core step \"{}\"", step.name()),
                    timeout: self.options.step_timeout,
                };
                StepRun::failed(self.classify(err.into_raw(), &origin))
            }
            Ok(Ok(output)) => StepRun {
                metrics: output.metrics,
                ..StepRun::new(HandlerOutcome::Success(None))
            },
            Ok(Err(raw)) => StepRun::failed(self.classify(raw, &origin)),
            Err(payload) => {
                let raw = RawError::new(format!("{} panicked: {}", step.name(), panic_message(&payload)));
                StepRun::failed(self.classify(raw, &origin))
            }
        }
    }

    fn spawn_plugin(
        &self,
        plugin: &LoadedPlugin,
        event: &str,
        build_dir: &Path,
        env: &Environment,
        request: &HandlerRequest,
        what: &str,
    ) -> Result<StreamingChild, RunnerError> {
        let spawn_error = |e: anyhow::Error| RunnerError::Spawn {
            what: what.to_string(),
            message: format!("{:#}", e),
        };
        let line = request.to_line().map_err(spawn_error)?;
        plugin_process(plugin, event, build_dir, env)
            .stdin(line)
            .spawn_streaming()
            .map_err(spawn_error)
    }

    /// Pump a child's output through `on_line` until it is done.
    ///
    /// The step deadline stops applying once the child exited or reported its
    /// end; from then on only the lingering grace period is waited for.
    fn supervise<F>(
        &self,
        child: &mut StreamingChild,
        what: &str,
        timeout: Duration,
        mut on_line: F,
    ) -> Result<Supervised, RunnerError>
    where
        F: FnMut(OutputLine) -> Flow,
    {
        let deadline = Instant::now() + timeout;
        let mut grace: Option<Instant> = None;
        let mut exited: Option<ExitStatus> = None;
        let mut closed = false;

        loop {
            if self.cancel.is_cancelled() {
                child.kill();
                return Err(RunnerError::Canceled {
                    what: what.to_string(),
                });
            }

            let now = Instant::now();
            match grace {
                Some(limit) if now >= limit => {
                    let lingering = exited.is_some() && !closed;
                    if exited.is_none() {
                        tracing::debug!(pid = child.id(), "{} is still running after it finished", what);
                    }
                    child.kill();
                    return Ok(Supervised {
                        status: exited,
                        lingering,
                    });
                }
                None if now >= deadline => {
                    child.kill();
                    return Err(RunnerError::Timeout {
                        what: what.to_string(),
                        timeout,
                    });
                }
                _ => {}
            }

            if closed {
                std::thread::sleep(POLL_INTERVAL);
            } else {
                match child.poll(POLL_INTERVAL) {
                    Poll::Line(line) => match on_line(line) {
                        Flow::Continue => {}
                        Flow::Finish => {
                            grace.get_or_insert_with(|| Instant::now() + self.options.lingering_grace);
                        }
                        Flow::Stop => {
                            child.kill();
                            return Ok(Supervised {
                                status: None,
                                lingering: false,
                            });
                        }
                    },
                    Poll::Closed => closed = true,
                    Poll::Idle => {}
                }
            }

            if exited.is_none() {
                exited = child.try_exit().map_err(|e| RunnerError::Io {
                    what: what.to_string(),
                    message: format!("{:#}", e),
                })?;
                if exited.is_some() {
                    grace.get_or_insert_with(|| Instant::now() + self.options.lingering_grace);
                }
            }

            if closed && exited.is_some() {
                return Ok(Supervised {
                    status: exited,
                    lingering: false,
                });
            }
        }
    }
}

/// Protocol state of one running plugin handler.
struct PluginSession<'s, 'c> {
    redactor: &'s Redactor,
    package: &'s str,
    event: LifecycleEvent,
    ctx: &'s mut HandlerContext<'c>,
    sink: &'s mut dyn OutputSink,
    terminal: Option<PluginMessage>,
    failure: Option<RawError>,
    status: Option<StatusReport>,
    functions: Vec<GeneratedFunction>,
}

impl PluginSession<'_, '_> {
    fn on_line(&mut self, line: OutputLine) -> Flow {
        if line.stream == Stream::Stderr {
            self.output(Stream::Stderr, &line.text);
            return Flow::Continue;
        }
        match ipc::parse_line(&line.text) {
            ParsedLine::Output(text) => {
                self.output(Stream::Stdout, &text);
                Flow::Continue
            }
            ParsedLine::Malformed { line, error } => {
                self.failure = Some(malformed(&line, &error));
                Flow::Stop
            }
            ParsedLine::Message(message) => self.on_message(message),
        }
    }

    fn output(&mut self, stream: Stream, text: &str) {
        self.sink.line(self.package, stream, &self.redactor.redact(text));
    }

    fn on_message(&mut self, message: PluginMessage) -> Flow {
        match message {
            PluginMessage::Status(mut report) => {
                report.summary = self.redactor.redact(&report.summary);
                report.text = self.redactor.redact_opt(report.text.as_deref());
                self.status = Some(report);
                Flow::Continue
            }
            PluginMessage::Config { op, path, value } => self.mutate(op, path.into_keys(), value),
            PluginMessage::Env(diff) => {
                if !diff.is_empty() {
                    tracing::debug!(plugin = %self.package, set = diff.set.len(), unset = diff.unset.len(), "environment changed");
                    self.ctx.env.apply(&diff);
                }
                Flow::Continue
            }
            PluginMessage::Function { name, path } => {
                self.functions.push(GeneratedFunction {
                    name,
                    path,
                    generator: self.package.to_string(),
                });
                Flow::Continue
            }
            PluginMessage::SystemLog { message } => {
                self.sink.system_log(self.package, &self.redactor.redact(&message));
                Flow::Continue
            }
            PluginMessage::Loaded { .. } => {
                self.failure = Some(
                    RawError::new(format!("Unexpected \"loaded\" message during \"{}\"", self.event))
                        .tagged(ErrorKind::Ipc, None),
                );
                Flow::Stop
            }
            terminal => {
                self.terminal = Some(terminal);
                Flow::Finish
            }
        }
    }

    fn mutate(&mut self, op: ConfigOp, keys: KeyPath, value: Option<Value>) -> Flow {
        let config = &mut *self.ctx.config;
        let previous_env = match keys.as_slice() {
            [build, environment] if build == "build" && environment == "environment" => {
                config.get("build.environment").cloned()
            }
            _ => None,
        };
        let result = match op {
            ConfigOp::Set => config.set(&keys, value.unwrap_or(Value::Null), self.event),
            ConfigOp::Delete => config.delete(&keys, self.event),
            ConfigOp::Push => config.push(&keys, value.unwrap_or(Value::Null), self.event),
        }
        .cloned();

        match result {
            Ok(mutation) => {
                self.ctx.env.apply_mutation(&mutation, previous_env.as_ref());
                self.sink.mutation(&mutation);
                Flow::Continue
            }
            Err(err) => {
                self.failure = Some(RawError::new(err.to_string()).tagged(ErrorKind::ConfigMutation, None));
                Flow::Stop
            }
        }
    }
}

/// Command line of a plugin: its manifest `run` entries, then the event.
///
/// Entries naming a file inside the plugin directory are made absolute;
/// anything else is looked up on `PATH`.
fn plugin_process(plugin: &LoadedPlugin, event: &str, build_dir: &Path, env: &Environment) -> ProcessBuilder {
    let mut run = plugin.manifest.run.iter().map(|entry| {
        let local = plugin.dir.join(entry);
        if local.exists() {
            local.to_string_lossy().into_owned()
        } else {
            entry.clone()
        }
    });
    let program = run.next().unwrap_or_default();

    ProcessBuilder::new(program)
        .args(run)
        .arg(event)
        .env_clear()
        .envs(env.vars())
        .env(PLUGIN_DIR_VAR, plugin.dir.to_string_lossy())
        .cwd(build_dir)
}

fn flag_map(flags: &FeatureFlags) -> std::collections::BTreeMap<String, bool> {
    flags.iter().map(|(name, on)| (name.to_string(), on)).collect()
}

fn malformed(line: &str, error: &str) -> RawError {
    RawError::new(format!("Invalid message from plugin: {}\n{}", error, line)).tagged(ErrorKind::Ipc, None)
}

fn describe_exit(status: Option<ExitStatus>) -> String {
    match status.and_then(|s| s.code()) {
        Some(code) => format!("exit code {}", code),
        None => "no exit code".to_string(),
    }
}

fn lingering_message(what: &str) -> String {
    format!(
        "{} exited but a process it started is still holding its output open",
        what
    )
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
