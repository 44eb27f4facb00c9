//! End-to-end pipeline tests.
//!
//! Each test writes a site with shell-script plugins into a temporary
//! directory and runs it through `ops::quay_build`, then inspects the
//! returned report and the files the handlers left behind.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use quay::ops::quay_build::{build, dev, BuildOptions};
use quay::util::shell::{ColorChoice, Shell, ShellMode, Verbosity};
use quay::{BuildReport, ErrorKind, GlobalContext};

struct Site {
    dir: TempDir,
}

impl Site {
    fn new(config: &str) -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("quay.toml"), config).unwrap();
        Site { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Add a plugin under `plugins/<name>`. `arms` are `case` arms keyed by
    /// event name; `emit` sends one protocol message.
    fn plugin(&self, name: &str, events: &[&str], arms: &str) -> &Self {
        let dir = self.path().join("plugins").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("manifest.yml"),
            format!("name: {}\nversion: 1.0.0\nrun: [\"sh\", \"plugin.sh\"]\ninputs:\n  - name: label\n    default: unset\n", name),
        )
        .unwrap();

        let events: Vec<String> = events.iter().map(|e| format!("\"{}\"", e)).collect();
        let script = format!(
            "#!/bin/sh\nemit() {{ printf '::quay::%s\\n' \"$1\"; }}\nread -r REQUEST\ncase \"$1\" in\nload)\nemit '{{\"type\":\"loaded\",\"events\":[{}]}}'\n;;\n{}\nesac\n",
            events.join(","),
            arms
        );
        fs::write(dir.join("plugin.sh"), script).unwrap();
        self
    }

    fn build(&self, opts: BuildOptions) -> BuildReport {
        build(&self.context(), quiet(), &opts)
    }

    fn context(&self) -> GlobalContext {
        GlobalContext::with_cwd(self.path().to_path_buf()).with_home(self.path().join(".home"))
    }

    fn read(&self, file: &str) -> String {
        fs::read_to_string(self.path().join(file)).unwrap_or_default()
    }
}

fn quiet() -> Arc<Shell> {
    Arc::new(Shell::new(ShellMode::Human {
        verbosity: Verbosity::Quiet,
        color: ColorChoice::Never,
    }))
}

const DONE: &str = "emit '{\"type\":\"done\"}'";

fn arm(event: &str, body: &str) -> String {
    format!("{})\n{}\n;;\n", event, body)
}

// ============================================================================
// Failure semantics
// ============================================================================

#[test]
fn test_fail_plugin_does_not_stop_other_plugins() {
    let site = Site::new(
        "[[plugins]]\npackage = \"./plugins/first\"\n\n[[plugins]]\npackage = \"./plugins/second\"\n",
    );
    site.plugin(
        "first",
        &["onBuild", "onEnd"],
        &format!(
            "{}{}",
            arm("onBuild", "emit '{\"type\":\"fail_plugin\",\"message\":\"first gave up\"}'"),
            arm("onEnd", &format!("touch first-end\n{}", DONE))
        ),
    );
    site.plugin("second", &["onBuild"], &arm("onBuild", &format!("touch second-ran\n{}", DONE)));

    let report = site.build(BuildOptions::default());
    assert!(!report.success);
    assert_eq!(report.severity_code, 3);
    assert_eq!(report.errors[0].kind, ErrorKind::FailPlugin);
    assert!(site.path().join("second-ran").exists());
    assert!(!site.path().join("first-end").exists());
}

#[test]
fn test_uncaught_plugin_error_runs_error_and_end_handlers() {
    let site = Site::new(
        "[build]\ncommand = \"touch built\"\n\n[[plugins]]\npackage = \"./plugins/thrower\"\n\n[[plugins]]\npackage = \"./plugins/other\"\n",
    );
    site.plugin(
        "thrower",
        &["onPreBuild", "onSuccess", "onError", "onEnd"],
        &format!(
            "{}{}{}{}",
            arm("onPreBuild", "emit '{\"type\":\"error\",\"message\":\"boom\"}'"),
            arm("onSuccess", &format!("touch thrower-success\n{}", DONE)),
            arm("onError", &format!("printf '%s' \"$REQUEST\" > thrower-error.json\n{}", DONE)),
            arm("onEnd", &format!("touch thrower-end\n{}", DONE))
        ),
    );
    site.plugin(
        "other",
        &["onError", "onEnd"],
        &format!(
            "{}{}",
            arm("onError", &format!("touch other-error\n{}", DONE)),
            arm("onEnd", &format!("touch other-end\n{}", DONE))
        ),
    );

    let report = site.build(BuildOptions::default());
    assert_eq!(report.severity_code, 3);
    assert_eq!(report.errors[0].kind, ErrorKind::PluginInternal);
    assert!(site.path().join("built").exists());
    assert!(site.path().join("other-error").exists());
    assert!(site.path().join("other-end").exists());
    assert!(site.path().join("thrower-end").exists());
    assert!(!site.path().join("thrower-success").exists());

    let request: Value = serde_json::from_str(&site.read("thrower-error.json")).unwrap();
    assert!(request["error"]["message"].as_str().unwrap().contains("boom"));
}

#[test]
fn test_build_command_failure_runs_cleanup_events() {
    let site = Site::new("[build]\ncommand = \"exit 1\"\n\n[[plugins]]\npackage = \"./plugins/watch\"\n");
    site.plugin(
        "watch",
        &["onPostBuild", "onSuccess", "onError", "onEnd"],
        &format!(
            "{}{}{}{}",
            arm("onPostBuild", &format!("touch post\n{}", DONE)),
            arm("onSuccess", &format!("touch success\n{}", DONE)),
            arm("onError", &format!("printf '%s' \"$REQUEST\" > error-request.json\n{}", DONE)),
            arm("onEnd", &format!("touch end\n{}", DONE))
        ),
    );

    let report = site.build(BuildOptions::default());
    assert_eq!(report.severity_code, 2);
    assert_eq!(report.errors[0].kind, ErrorKind::BuildCommand);
    assert!(!site.path().join("post").exists());
    assert!(!site.path().join("success").exists());
    assert!(site.path().join("end").exists());

    let request: Value = serde_json::from_str(&site.read("error-request.json")).unwrap();
    assert_eq!(request["event"], "onError");
    assert!(request["error"]["message"].as_str().unwrap().contains("exit 1"));
}

#[test]
fn test_cancel_build_is_not_a_failure_code() {
    let site = Site::new("[build]\ncommand = \"touch built\"\n\n[[plugins]]\npackage = \"./plugins/stop\"\n");
    site.plugin(
        "stop",
        &["onPreBuild", "onError", "onEnd"],
        &format!(
            "{}{}{}",
            arm("onPreBuild", "emit '{\"type\":\"cancel_build\",\"message\":\"not today\"}'"),
            arm("onError", &format!("touch error\n{}", DONE)),
            arm("onEnd", &format!("touch end\n{}", DONE))
        ),
    );

    let report = site.build(BuildOptions::default());
    assert_eq!(report.severity_code, 1);
    assert!(!report.success);
    assert!(!site.path().join("built").exists());
    assert!(site.path().join("error").exists());
    assert!(site.path().join("end").exists());
}

#[test]
fn test_step_timeout_is_system_error() {
    let site = Site::new("[[plugins]]\npackage = \"./plugins/slow\"\n");
    site.plugin(
        "slow",
        &["onPreBuild", "onEnd"],
        &format!(
            "{}{}",
            arm("onPreBuild", &format!("sleep 5\n{}", DONE)),
            arm("onEnd", &format!("touch end\n{}", DONE))
        ),
    );

    let report = site.build(BuildOptions {
        timeout: Some(Duration::from_secs(1)),
        ..BuildOptions::default()
    });
    assert_eq!(report.severity_code, 4);
    assert_eq!(report.errors[0].kind, ErrorKind::StepTimeout);
    assert!(site.path().join("end").exists());
}

#[test]
fn test_exit_without_answer_is_plugin_error() {
    let site = Site::new("[[plugins]]\npackage = \"./plugins/quitter\"\n");
    site.plugin("quitter", &["onBuild"], &arm("onBuild", "exit 7"));

    let report = site.build(BuildOptions::default());
    assert_eq!(report.severity_code, 3);
    assert_eq!(report.errors[0].kind, ErrorKind::PluginExit);
    assert!(report.errors[0].message.contains('7'));
}

#[test]
fn test_unknown_input_is_rejected_before_running() {
    let site = Site::new(
        "[build]\ncommand = \"touch built\"\n\n[[plugins]]\npackage = \"./plugins/p\"\n[plugins.inputs]\nlable = \"typo\"\n",
    );
    site.plugin("p", &["onBuild"], &arm("onBuild", DONE));

    let report = site.build(BuildOptions::default());
    assert_eq!(report.severity_code, 2);
    assert_eq!(report.errors[0].kind, ErrorKind::PluginInput);
    assert!(report.errors[0].message.contains("lable"));
    assert!(!site.path().join("built").exists());
}

// ============================================================================
// Configuration mutations and environment
// ============================================================================

#[test]
fn test_mutations_reach_later_steps() {
    let site = Site::new(
        "[build]\ncommand = \"echo $GREETING > greeting.txt\"\n\n[[plugins]]\npackage = \"./plugins/writer\"\n\n[[plugins]]\npackage = \"./plugins/reader\"\n",
    );
    site.plugin(
        "writer",
        &["onPreBuild"],
        &arm(
            "onPreBuild",
            &format!(
                "emit '{{\"type\":\"config\",\"op\":\"set\",\"path\":\"build.publish\",\"value\":\"dist\"}}'\nemit '{{\"type\":\"env\",\"set\":{{\"GREETING\":\"hello\"}}}}'\n{}",
                DONE
            ),
        ),
    );
    site.plugin(
        "reader",
        &["onBuild"],
        &arm("onBuild", &format!("printf '%s' \"$REQUEST\" > reader.json\n{}", DONE)),
    );

    let report = site.build(BuildOptions::default());
    assert!(report.success, "{:?}", report.errors);
    assert_eq!(site.read("greeting.txt").trim(), "hello");

    let request: Value = serde_json::from_str(&site.read("reader.json")).unwrap();
    assert_eq!(request["constants"]["PUBLISH_DIR"], "dist");
    assert_eq!(request["config"]["build"]["publish"], "dist");
    assert_eq!(request["inputs"]["label"], "unset");

    assert_eq!(report.config_mutations.len(), 1);
    assert_eq!(report.config_mutations[0].keys_string, "build.publish");
}

#[test]
fn test_read_only_mutation_aborts() {
    let site = Site::new("[build]\ncommand = \"touch built\"\n\n[[plugins]]\npackage = \"./plugins/bad\"\n");
    site.plugin(
        "bad",
        &["onPreBuild"],
        &arm(
            "onPreBuild",
            &format!("emit '{{\"type\":\"config\",\"op\":\"set\",\"path\":\"build.base\",\"value\":\"x\"}}'\n{}", DONE),
        ),
    );

    let report = site.build(BuildOptions::default());
    assert_eq!(report.severity_code, 2);
    assert_eq!(report.errors[0].kind, ErrorKind::ConfigMutation);
    assert!(report.errors[0].message.contains("\"config.build.base\" is read-only."));
    assert!(report.config_mutations.is_empty());
    assert!(!site.path().join("built").exists());
}

#[test]
fn test_late_mutation_is_rejected() {
    let site = Site::new("[[plugins]]\npackage = \"./plugins/late\"\n");
    site.plugin(
        "late",
        &["onPostBuild"],
        &arm(
            "onPostBuild",
            &format!("emit '{{\"type\":\"config\",\"op\":\"set\",\"path\":\"build.command\",\"value\":\"make\"}}'\n{}", DONE),
        ),
    );

    let report = site.build(BuildOptions::default());
    assert_eq!(report.errors[0].kind, ErrorKind::ConfigMutation);
    assert!(report.errors[0]
        .message
        .contains("cannot be modified after \"onPreBuild\""));
}

// ============================================================================
// Core steps, reports and the dev timeline
// ============================================================================

#[test]
fn test_functions_are_bundled() {
    let site = Site::new("[build]\ncommand = \"true\"\n\n[[plugins]]\npackage = \"./plugins/gen\"\n");
    fs::create_dir_all(site.path().join("quay/functions")).unwrap();
    fs::write(site.path().join("quay/functions/hello.js"), "export default () => {}").unwrap();
    site.plugin(
        "gen",
        &["onPreBuild"],
        &arm(
            "onPreBuild",
            &format!("emit '{{\"type\":\"function\",\"name\":\"generated\",\"path\":\"gen/generated.js\"}}'\n{}", DONE),
        ),
    );

    let report = site.build(BuildOptions::default());
    assert!(report.success, "{:?}", report.errors);
    assert_eq!(report.generated_functions.len(), 1);
    assert_eq!(report.generated_functions[0].generator, "./plugins/gen");

    let manifest: Value = serde_json::from_str(&site.read(".quay/functions/manifest.json")).unwrap();
    let names: Vec<&str> = manifest["functions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"hello"));
    assert!(names.contains(&"generated"));
    assert!(report.metrics.iter().any(|m| m.name == "functions.bundled"));
}

#[test]
fn test_report_and_system_log_files() {
    let site = Site::new("[[plugins]]\npackage = \"./plugins/talk\"\n");
    site.plugin(
        "talk",
        &["onPreBuild"],
        &arm(
            "onPreBuild",
            &format!(
                "echo visible\nemit '{{\"type\":\"system_log\",\"message\":\"internal detail\"}}'\nemit '{{\"type\":\"status\",\"summary\":\"all good\"}}'\n{}",
                DONE
            ),
        ),
    );

    let report = site.build(BuildOptions {
        output_report: Some("report.json".into()),
        system_log_file: Some("system.log".into()),
        ..BuildOptions::default()
    });
    assert!(report.success);
    assert!(report.logs.stdout.iter().any(|l| l == "visible"));
    assert!(!report.logs.stdout.iter().any(|l| l.contains("internal detail")));
    assert!(site.read("system.log").contains("internal detail"));

    let written: Value = serde_json::from_str(&site.read("report.json")).unwrap();
    assert_eq!(written["statuses"][0]["summary"], "all good");
    assert_eq!(written["statuses"][0]["state"], "success");
}

#[test]
fn test_dev_timeline_skips_build_events() {
    let site = Site::new(
        "[build]\ncommand = \"touch built\"\n\n[dev]\ncommand = \"touch served\"\n\n[[plugins]]\npackage = \"./plugins/both\"\n",
    );
    site.plugin(
        "both",
        &["onPreBuild", "onPreDev"],
        &format!(
            "{}{}",
            arm("onPreBuild", &format!("touch pre-build\n{}", DONE)),
            arm("onPreDev", &format!("touch pre-dev\n{}", DONE))
        ),
    );

    let report = dev(&site.context(), quiet(), &BuildOptions::default());
    assert!(report.success, "{:?}", report.errors);
    assert!(site.path().join("served").exists());
    assert!(site.path().join("pre-dev").exists());
    assert!(!site.path().join("built").exists());
    assert!(!site.path().join("pre-build").exists());
}
