//! Test fixtures for common test scenarios.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use crate::builder::core_steps::{CoreStep, CoreStepContext, CoreStepOutput};
use crate::builder::runner::OutputSink;
use crate::core::constants::{Constants, ConstantsContext};
use crate::core::error::{ErrorKind, RawError};
use crate::core::event::LifecycleEvent;
use crate::core::mutable::{MutableConfig, Mutation};
use crate::core::plugin::{LoadedPlugin, PluginManifest, PluginOrigin, MANIFEST_FILE};
use crate::core::report::{GeneratedFunction, Metric};
use crate::util::config::FeatureFlags;
use crate::util::process::Stream;
use crate::util::shell::{ColorChoice, Shell, ShellMode, Verbosity};

/// Name of the script every fixture plugin runs.
const SCRIPT: &str = "plugin.sh";

/// A shell that prints nothing.
pub fn quiet_shell() -> Arc<Shell> {
    Arc::new(Shell::new(ShellMode::Human {
        verbosity: Verbosity::Quiet,
        color: ColorChoice::Never,
    }))
}

/// Builder for a plugin directory backed by a shell script.
///
/// Handler bodies run with `quay_msg '<json>'` available to send protocol
/// messages. The request line has already been read from stdin into
/// `$QUAY_REQUEST`.
#[derive(Debug, Clone)]
pub struct PluginFixture {
    name: String,
    handlers: Vec<(String, String)>,
    load: Option<String>,
    inputs_yaml: Option<String>,
}

impl PluginFixture {
    pub fn new(name: impl Into<String>) -> Self {
        PluginFixture {
            name: name.into(),
            handlers: Vec::new(),
            load: None,
            inputs_yaml: None,
        }
    }

    /// Add a handler that reports `done` after `body`.
    pub fn handler(mut self, event: &str, body: &str) -> Self {
        let body = format!("{}\nquay_msg '{{\"type\":\"done\"}}'", body);
        self.handlers.push((event.to_string(), body));
        self
    }

    /// Add a handler that sends nothing on its own.
    pub fn raw_handler(mut self, event: &str, body: &str) -> Self {
        self.handlers.push((event.to_string(), body.to_string()));
        self
    }

    /// Replace the answer to the load handshake.
    pub fn raw_load(mut self, body: &str) -> Self {
        self.load = Some(body.to_string());
        self
    }

    /// Declare inputs, as the YAML list under `inputs:`.
    pub fn inputs(mut self, yaml: &str) -> Self {
        self.inputs_yaml = Some(yaml.to_string());
        self
    }

    /// Package name the fixture is installed under, relative to the build dir.
    pub fn package(&self) -> String {
        format!("./plugins/{}", self.name)
    }

    /// Write the plugin into `<root>/plugins/<name>` and return it loaded.
    pub fn install(&self, root: &Path) -> LoadedPlugin {
        let dir = self.write(root);
        let manifest = PluginManifest::load(&dir).unwrap();
        let events = self
            .handlers
            .iter()
            .filter_map(|(event, _)| LifecycleEvent::from_str(event).ok())
            .collect();

        LoadedPlugin {
            package: self.package(),
            origin: PluginOrigin::Config,
            pinned_version: None,
            inputs: serde_json::Map::new(),
            dir,
            manifest,
            events,
        }
    }

    /// Write the plugin files without loading them.
    pub fn write(&self, root: &Path) -> PathBuf {
        let dir = root.join("plugins").join(&self.name);
        std::fs::create_dir_all(&dir).unwrap();

        let mut manifest = format!("name: {}\nversion: 1.0.0\nrun: [\"sh\", \"{}\"]\n", self.name, SCRIPT);
        if let Some(inputs) = &self.inputs_yaml {
            manifest.push_str("inputs:\n");
            manifest.push_str(inputs);
        }
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
        std::fs::write(dir.join(SCRIPT), self.script()).unwrap();
        dir
    }

    fn script(&self) -> String {
        let events: Vec<Value> = self.handlers.iter().map(|(e, _)| json!(e)).collect();
        let load = self.load.clone().unwrap_or_else(|| {
            format!(
                "quay_msg '{}'",
                json!({"type": "loaded", "events": events})
            )
        });

        let mut script = String::from(
            "#!/bin/sh\nquay_msg() { printf '::quay::%s\\n' \"$1\"; }\nread -r QUAY_REQUEST\ncase \"$1\" in\n",
        );
        script.push_str(&format!("load)\n{}\n;;\n", load));
        for (event, body) in &self.handlers {
            script.push_str(&format!("{})\n{}\n;;\n", event, body));
        }
        script.push_str("esac\n");
        script
    }
}

/// Output sink that keeps everything it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub lines: Vec<(Stream, String)>,
    pub system_logs: Vec<String>,
    pub mutations: Vec<Mutation>,
    pub warnings: Vec<String>,
}

impl RecordingSink {
    pub fn stdout(&self) -> Vec<String> {
        self.stream(Stream::Stdout)
    }

    pub fn stderr(&self) -> Vec<String> {
        self.stream(Stream::Stderr)
    }

    fn stream(&self, stream: Stream) -> Vec<String> {
        self.lines
            .iter()
            .filter(|(s, _)| *s == stream)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

impl OutputSink for RecordingSink {
    fn line(&mut self, _step_id: &str, stream: Stream, text: &str) {
        self.lines.push((stream, text.to_string()));
    }

    fn system_log(&mut self, _step_id: &str, message: &str) {
        self.system_logs.push(message.to_string());
    }

    fn mutation(&mut self, mutation: &Mutation) {
        self.mutations.push(mutation.clone());
    }

    fn warn(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }
}

/// Core step mock that counts its runs.
#[derive(Clone)]
pub struct RecordingCoreStep {
    id: &'static str,
    event: LifecycleEvent,
    enabled: bool,
    failure: Option<RawError>,
    panics: bool,
    delay: Option<Duration>,
    mutation: Option<(Vec<String>, Value)>,
    runs: Arc<AtomicUsize>,
    publish_dirs: Arc<Mutex<Vec<String>>>,
}

impl RecordingCoreStep {
    pub fn new(id: &'static str, event: LifecycleEvent) -> Self {
        RecordingCoreStep {
            id,
            event,
            enabled: true,
            failure: None,
            panics: false,
            delay: None,
            mutation: None,
            runs: Arc::new(AtomicUsize::new(0)),
            publish_dirs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make the condition false.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Fail every run with `error`.
    pub fn failing(mut self, error: RawError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    /// Block for `delay` before returning.
    pub fn sleeping(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set a configuration key on every run.
    pub fn setting(mut self, keys: &[&str], value: Value) -> Self {
        self.mutation = Some((keys.iter().map(|k| k.to_string()).collect(), value));
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// `PUBLISH_DIR` as seen by each run.
    pub fn seen_publish_dirs(&self) -> Vec<String> {
        self.publish_dirs.lock().unwrap().clone()
    }
}

impl CoreStep for RecordingCoreStep {
    fn id(&self) -> &'static str {
        self.id
    }

    fn name(&self) -> &'static str {
        self.id
    }

    fn event(&self) -> LifecycleEvent {
        self.event
    }

    fn condition(&self, _ctx: &CoreStepContext<'_>) -> bool {
        self.enabled
    }

    fn run(&self, ctx: &mut CoreStepContext<'_>) -> Result<CoreStepOutput, RawError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.publish_dirs
            .lock()
            .unwrap()
            .push(ctx.constants.publish_dir.clone());

        if self.panics {
            panic!("{} exploded", self.id);
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some((keys, value)) = &self.mutation {
            ctx.config
                .set(keys, value.clone(), self.event)
                .map_err(|e| RawError::new(e.to_string()).tagged(ErrorKind::ConfigMutation, None))?;
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(CoreStepOutput {
            metrics: vec![Metric::increment(self.id)],
        })
    }
}

/// Owns everything a [`CoreStepContext`] borrows.
pub struct CoreHarness {
    dir: TempDir,
    pub config: MutableConfig,
    pub config_path: Option<PathBuf>,
    pub flags: FeatureFlags,
    pub generated: Vec<GeneratedFunction>,
    pub save_config: bool,
    pub sink: RecordingSink,
    shell: Arc<Shell>,
}

impl CoreHarness {
    pub fn new() -> Self {
        CoreHarness {
            dir: TempDir::new().unwrap(),
            config: MutableConfig::new(json!({
                "build": {"base": "", "publish": "", "environment": {}}
            })),
            config_path: None,
            flags: FeatureFlags::default(),
            generated: Vec::new(),
            save_config: false,
            sink: RecordingSink::default(),
            shell: quiet_shell(),
        }
    }

    /// Write `quay.toml` and use it as the configuration file.
    pub fn with_config_file(mut self, contents: &str) -> Self {
        let path = self.dir.path().join(crate::core::config::CONFIG_FILE);
        std::fs::write(&path, contents).unwrap();
        self.config_path = Some(path);
        self
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn context(&mut self) -> CoreStepContext<'_> {
        let constants = Constants::compute(
            &self.config,
            &ConstantsContext {
                config_path: self.config_path.clone(),
                ..ConstantsContext::local(self.dir.path())
            },
        );
        CoreStepContext {
            build_dir: self.dir.path(),
            constants,
            config: &mut self.config,
            config_path: self.config_path.as_deref(),
            debug: false,
            save_config: self.save_config,
            feature_flags: &self.flags,
            generated_functions: &self.generated,
            shell: &self.shell,
            sink: &mut self.sink,
        }
    }
}

impl Default for CoreHarness {
    fn default() -> Self {
        CoreHarness::new()
    }
}
