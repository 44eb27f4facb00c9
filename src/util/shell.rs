//! Terminal and machine-readable output.
//!
//! All user-facing output of a build goes through [`Shell`]. In human mode
//! it prints status lines with the status word right-aligned to a 12 column
//! gutter, handler output on the stream it was written to, per-step spans
//! and indicatif progress bars. In JSON mode stdout carries one event per
//! line and nothing else is printed.

use std::fmt::Display;
use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};

/// How the shell presents output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellMode {
    Human {
        verbosity: Verbosity,
        color: ColorChoice,
    },
    /// One JSON object per line on stdout.
    Json,
}

impl Default for ShellMode {
    fn default() -> Self {
        ShellMode::Human {
            verbosity: Verbosity::default(),
            color: ColorChoice::default(),
        }
    }
}

/// Human mode verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Failures only. Handler output is still recorded in the report.
    Quiet,
    #[default]
    Normal,
    /// Status lines for every step and raw progress lines instead of bars.
    Verbose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorChoice {
    /// Colour when stderr is a terminal.
    #[default]
    Auto,
    Always,
    Never,
}

/// Semantic status word printed in the gutter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Finished,
    Loaded,
    Saved,
    Running,
    Bundling,
    Info,
    Plan,
    Skipped,
    Canceled,
    Warning,
    Failed,
    Error,
}

/// Colour family of a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    Good,
    Busy,
    Neutral,
    Caution,
    Bad,
}

impl Tone {
    fn ansi(self) -> &'static str {
        match self {
            Tone::Good => "\x1b[1;32m",
            Tone::Busy => "\x1b[1;36m",
            Tone::Neutral => "\x1b[1;34m",
            Tone::Caution => "\x1b[1;33m",
            Tone::Bad => "\x1b[1;31m",
        }
    }
}

impl Status {
    fn word(self) -> &'static str {
        match self {
            Status::Finished => "Finished",
            Status::Loaded => "Loaded",
            Status::Saved => "Saved",
            Status::Running => "Running",
            Status::Bundling => "Bundling",
            Status::Info => "Info",
            Status::Plan => "Plan",
            Status::Skipped => "Skipped",
            Status::Canceled => "Canceled",
            Status::Warning => "Warning",
            Status::Failed => "Failed",
            Status::Error => "error",
        }
    }

    fn tone(self) -> Tone {
        match self {
            Status::Finished | Status::Loaded | Status::Saved => Tone::Good,
            Status::Running | Status::Bundling => Tone::Busy,
            Status::Info | Status::Plan => Tone::Neutral,
            Status::Skipped | Status::Canceled | Status::Warning => Tone::Caution,
            Status::Failed | Status::Error => Tone::Bad,
        }
    }
}

const STATUS_WIDTH: usize = 12;

/// Output sink shared by the pipeline, the runner's reader threads and core
/// steps.
#[derive(Debug)]
pub struct Shell {
    mode: ShellMode,
    color: bool,
    /// Held while writing a JSON line so lines from different threads do not
    /// interleave.
    stdout_lock: Mutex<()>,
}

impl Shell {
    pub fn new(mode: ShellMode) -> Self {
        let color = match &mode {
            ShellMode::Human { color: ColorChoice::Auto, .. } => io::stderr().is_terminal(),
            ShellMode::Human { color: ColorChoice::Always, .. } => true,
            ShellMode::Human { color: ColorChoice::Never, .. } | ShellMode::Json => false,
        };
        Shell {
            mode,
            color,
            stdout_lock: Mutex::new(()),
        }
    }

    /// Build the shell from global CLI flags. `--message-format json` wins
    /// over `--quiet` and `--verbose`.
    pub fn from_flags(quiet: bool, verbose: bool, color: ColorChoice, json: bool) -> Self {
        if json {
            return Shell::new(ShellMode::Json);
        }
        let verbosity = match (quiet, verbose) {
            (true, _) => Verbosity::Quiet,
            (false, true) => Verbosity::Verbose,
            (false, false) => Verbosity::Normal,
        };
        Shell::new(ShellMode::Human { verbosity, color })
    }

    /// Human verbosity, or `None` in JSON mode.
    fn verbosity(&self) -> Option<Verbosity> {
        match self.mode {
            ShellMode::Human { verbosity, .. } => Some(verbosity),
            ShellMode::Json => None,
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.verbosity() == Some(Verbosity::Quiet)
    }

    pub fn is_verbose(&self) -> bool {
        self.verbosity() == Some(Verbosity::Verbose)
    }

    pub fn is_json(&self) -> bool {
        self.verbosity().is_none()
    }

    pub fn use_color(&self) -> bool {
        self.color
    }

    /// Print `{status:>12} {msg}` to stderr.
    ///
    /// Quiet mode keeps failures only; JSON mode prints nothing.
    pub fn status(&self, status: Status, msg: impl Display) {
        match self.verbosity() {
            None => return,
            Some(Verbosity::Quiet) if status.tone() != Tone::Bad => return,
            Some(_) => {}
        }
        eprintln!("{} {}", self.gutter(status), msg);
    }

    /// Print one line of handler output on the stream it was written to.
    pub fn output_line(&self, stderr: bool, line: &str) {
        if !matches!(self.verbosity(), Some(Verbosity::Normal | Verbosity::Verbose)) {
            return;
        }
        if stderr {
            eprintln!("{}", line);
        } else {
            println!("{}", line);
        }
    }

    /// Print pre-formatted text (error renderings, plan listings) to stderr.
    pub fn block(&self, text: impl Display) {
        if !self.is_json() {
            eprintln!("{}", text);
        }
    }

    pub fn note(&self, msg: impl Display) {
        self.status(Status::Info, msg);
    }

    pub fn warn(&self, msg: impl Display) {
        self.status(Status::Warning, msg);
    }

    /// Report an error; in JSON mode as an `error` event.
    pub fn error(&self, msg: impl Display) {
        if self.is_json() {
            self.json_event(&serde_json::json!({
                "reason": "error",
                "message": msg.to_string(),
            }));
        } else {
            self.status(Status::Error, msg);
        }
    }

    /// Write one JSON event line to stdout. No-op in human mode.
    pub fn json_event(&self, event: &serde_json::Value) {
        if !self.is_json() {
            return;
        }
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("dropping unserializable event: {}", e);
                return;
            }
        };
        let _guard = self.stdout_lock.lock();
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", line);
        let _ = stdout.flush();
    }

    fn gutter(&self, status: Status) -> String {
        let word = format!("{:>width$}", status.word(), width = STATUS_WIDTH);
        if self.color {
            format!("{}{}\x1b[0m", status.tone().ansi(), word)
        } else {
            word
        }
    }

    /// Start a timed span for one step.
    ///
    /// The header is printed right away so that output streamed by the step
    /// appears under it.
    pub fn span(self: &Arc<Self>, status: Status, msg: impl Display) -> Span {
        let message = msg.to_string();
        let announced = matches!(self.verbosity(), Some(Verbosity::Normal | Verbosity::Verbose));
        if announced {
            self.status(status, &message);
        }
        Span {
            shell: Arc::clone(self),
            message,
            start: Instant::now(),
            announced,
            closed: false,
        }
    }

    /// Progress reporting for a core step. The length may be set later with
    /// [`Progress::set_length`].
    pub fn progress(self: &Arc<Self>, total: u64, msg: impl Display) -> Progress {
        let mut progress = Progress {
            shell: Arc::clone(self),
            bar: None,
            total: 0,
            current: 0,
            message: msg.to_string(),
        };
        progress.set_length(total);
        progress
    }
}

impl Default for Shell {
    fn default() -> Self {
        Shell::new(ShellMode::default())
    }
}

/// A running step.
///
/// Dropping an unclosed span prints `Finished <step> in <duration>`.
pub struct Span {
    shell: Arc<Shell>,
    message: String,
    start: Instant,
    announced: bool,
    closed: bool,
}

impl Span {
    /// Close the span with a status other than `Finished`.
    pub fn finish_with_status(&mut self, status: Status, msg: impl Display) {
        self.closed = true;
        let took = format_duration(self.elapsed());
        self.shell.status(status, format!("{} in {}", msg, took));
    }

    /// Time since the step started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if self.announced && !self.closed {
            let took = format_duration(self.elapsed());
            self.shell.status(Status::Finished, format!("{} in {}", self.message, took));
        }
    }
}

/// Progress of a core step's sub-tasks.
///
/// Normal human mode draws an indicatif bar once there is more than one
/// task. Verbose mode prints a line per increment and JSON mode emits
/// `progress` events.
pub struct Progress {
    shell: Arc<Shell>,
    bar: Option<ProgressBar>,
    total: u64,
    current: u64,
    message: String,
}

impl Progress {
    /// Set the number of sub-tasks.
    pub fn set_length(&mut self, total: u64) {
        self.total = total;
        if let Some(bar) = &self.bar {
            bar.set_length(total);
            return;
        }
        if total > 1 && self.shell.verbosity() == Some(Verbosity::Normal) {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            bar.set_message(self.message.clone());
            bar.set_position(self.current);
            self.bar = Some(bar);
        }
    }

    pub fn inc(&mut self, delta: u64) {
        self.current += delta;
        if let Some(bar) = &self.bar {
            bar.inc(delta);
        }

        match self.shell.verbosity() {
            None => self.shell.json_event(&serde_json::json!({
                "reason": "progress",
                "current": self.current,
                "total": self.total,
                "message": self.message,
            })),
            Some(Verbosity::Verbose) => {
                eprintln!("  {} [{}/{}]", self.message, self.current, self.total)
            }
            Some(_) => {}
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

/// `0.50s` below a minute, `1.5m` above.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 60.0 {
        format!("{:.2}s", secs)
    } else {
        format!("{:.1}m", secs / 60.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn human(verbosity: Verbosity) -> Shell {
        Shell::new(ShellMode::Human {
            verbosity,
            color: ColorChoice::Never,
        })
    }

    #[test]
    fn test_from_flags_precedence() {
        assert_eq!(
            Shell::from_flags(false, false, ColorChoice::Never, false).verbosity(),
            Some(Verbosity::Normal)
        );
        assert!(Shell::from_flags(true, true, ColorChoice::Never, false).is_quiet());
        assert!(Shell::from_flags(false, true, ColorChoice::Never, false).is_verbose());

        let json = Shell::from_flags(true, true, ColorChoice::Always, true);
        assert!(json.is_json());
        assert!(!json.is_quiet());
        assert!(!json.use_color());
    }

    #[test]
    fn test_gutter_alignment() {
        let shell = human(Verbosity::Normal);
        assert_eq!(shell.gutter(Status::Plan), "        Plan");
        assert_eq!(shell.gutter(Status::Error).len(), STATUS_WIDTH);

        let colored = Shell::new(ShellMode::Human {
            verbosity: Verbosity::Normal,
            color: ColorChoice::Always,
        });
        assert!(colored.gutter(Status::Failed).starts_with("\x1b[1;31m"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "0.50s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1.5m");
    }

    #[test]
    fn test_progress_bar_only_in_normal_mode() {
        let normal = Arc::new(human(Verbosity::Normal));
        let mut progress = normal.progress(0, "bundling");
        assert!(progress.bar.is_none());
        progress.set_length(3);
        assert!(progress.bar.is_some());
        progress.finish();

        let quiet = Arc::new(human(Verbosity::Quiet));
        let mut progress = quiet.progress(10, "bundling");
        assert!(progress.bar.is_none());
        progress.inc(3);
        assert_eq!(progress.current, 3);
    }

    #[test]
    fn test_span_closed_explicitly() {
        let shell = Arc::new(human(Verbosity::Quiet));
        let mut span = shell.span(Status::Running, "onBuild ./plugins/a");
        assert!(!span.announced);
        span.finish_with_status(Status::Skipped, "onBuild ./plugins/a");
        assert!(span.closed);
    }
}
