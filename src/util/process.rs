//! Subprocess execution utilities.
//!
//! Handlers run in child processes whose output is streamed line by line:
//! one reader thread per pipe forwards lines over a channel, and the caller
//! polls that channel against its own deadline.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

/// Builder for subprocess execution.
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    env_clear: bool,
    cwd: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
}

impl ProcessBuilder {
    /// Create a new process builder for the given program.
    pub fn new(program: impl AsRef<Path>) -> Self {
        ProcessBuilder {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            env: BTreeMap::new(),
            env_clear: false,
            cwd: None,
            stdin: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(
            args.into_iter()
                .map(|s| s.as_ref().to_string_lossy().into_owned()),
        );
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.env
            .insert(key.as_ref().to_string(), value.as_ref().to_string());
        self
    }

    /// Set several environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            self.env
                .insert(key.as_ref().to_string(), value.as_ref().to_string());
        }
        self
    }

    /// Start from an empty environment instead of inheriting ours.
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    /// Set the working directory.
    pub fn cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    /// Set stdin data. Stdin is closed once the data is written.
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Build the Command.
    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if self.env_clear {
            cmd.env_clear();
        }
        cmd.envs(&self.env);

        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }

        cmd
    }

    /// Spawn the command with both output pipes streamed line by line.
    pub fn spawn_streaming(&self) -> Result<StreamingChild> {
        let mut cmd = self.build_command();
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.display_command()))?;
        self.feed_stdin(&mut child);

        let (tx, rx) = mpsc::channel();
        let mut open = 0;
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, Stream::Stdout, tx.clone());
            open += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, Stream::Stderr, tx);
            open += 1;
        }

        tracing::debug!(pid = child.id(), "spawned `{}`", self.display_command());
        Ok(StreamingChild { child, rx, open })
    }

    /// Write stdin on a separate thread so a child that never reads cannot
    /// block us, then close it.
    fn feed_stdin(&self, child: &mut Child) {
        if let (Some(data), Some(mut stdin)) = (self.stdin.clone(), child.stdin.take()) {
            std::thread::spawn(move || {
                if let Err(e) = stdin.write_all(&data) {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        tracing::debug!("failed to write child stdin: {}", e);
                    }
                }
            });
        }
    }

    /// Display the command for error messages.
    pub fn display_command(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One line of child output, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

enum StreamEvent {
    Line(OutputLine),
    Closed,
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, stream: Stream, tx: Sender<StreamEvent>) {
    std::thread::spawn(move || {
        let reader = BufReader::new(reader);
        for chunk in reader.split(b'\n') {
            let Ok(bytes) = chunk else { break };
            let text = String::from_utf8_lossy(&bytes)
                .trim_end_matches('\r')
                .to_string();
            if tx.send(StreamEvent::Line(OutputLine { stream, text })).is_err() {
                return;
            }
        }
        let _ = tx.send(StreamEvent::Closed);
    });
}

/// Result of polling a [`StreamingChild`].
#[derive(Debug, PartialEq, Eq)]
pub enum Poll {
    /// A line arrived.
    Line(OutputLine),
    /// Both pipes are closed.
    Closed,
    /// Nothing arrived within the wait.
    Idle,
}

/// A running child process with streamed output.
#[derive(Debug)]
pub struct StreamingChild {
    child: Child,
    rx: Receiver<StreamEvent>,
    open: usize,
}

impl StreamingChild {
    /// Process id of the child.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Wait up to `wait` for the next line.
    pub fn poll(&mut self, wait: Duration) -> Poll {
        while self.open > 0 {
            match self.rx.recv_timeout(wait) {
                Ok(StreamEvent::Line(line)) => return Poll::Line(line),
                Ok(StreamEvent::Closed) => self.open -= 1,
                Err(RecvTimeoutError::Timeout) => return Poll::Idle,
                Err(RecvTimeoutError::Disconnected) => self.open = 0,
            }
        }
        Poll::Closed
    }

    /// Exit status, if the child has exited.
    pub fn try_exit(&mut self) -> Result<Option<ExitStatus>> {
        self.child.try_wait().context("failed to query child status")
    }

    /// Block until the child exits.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().context("failed to wait for child")
    }

    /// Kill the child and reap it.
    pub fn kill(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                tracing::debug!("failed to kill child {}: {}", self.child.id(), e);
            }
        }
        let _ = self.child.wait();
    }
}

impl Drop for StreamingChild {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.kill();
        }
    }
}

/// Build-level cancellation flag shared between the pipeline and runners.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Find an executable in PATH.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

/// Process builder running `command` through the platform shell.
pub fn shell_command(command: &str) -> ProcessBuilder {
    if cfg!(windows) {
        ProcessBuilder::new("cmd").args(["/C", command])
    } else {
        let sh = find_executable("sh").unwrap_or_else(|| PathBuf::from("/bin/sh"));
        ProcessBuilder::new(sh).args(["-c", command])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_command() {
        let pb = ProcessBuilder::new("sh").args(["-c", "echo hi"]);
        assert_eq!(pb.display_command(), "sh -c echo hi");
    }

    #[test]
    fn test_cancellation_token_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[cfg(unix)]
    #[test]
    fn test_streaming_preserves_order() {
        let mut child = shell_command("echo one; echo two 1>&2; echo three")
            .spawn_streaming()
            .unwrap();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            match child.poll(Duration::from_secs(5)) {
                Poll::Line(line) => match line.stream {
                    Stream::Stdout => stdout.push(line.text),
                    Stream::Stderr => stderr.push(line.text),
                },
                Poll::Closed => break,
                Poll::Idle => panic!("child produced no output"),
            }
        }
        assert_eq!(stdout, vec!["one", "three"]);
        assert_eq!(stderr, vec!["two"]);
        assert!(child.wait().unwrap().success());
    }

    #[cfg(unix)]
    #[test]
    fn test_streaming_stdin_is_closed() {
        let mut child = shell_command("cat")
            .stdin("request\n")
            .spawn_streaming()
            .unwrap();
        assert_eq!(
            child.poll(Duration::from_secs(5)),
            Poll::Line(OutputLine {
                stream: Stream::Stdout,
                text: "request".to_string()
            })
        );
        assert_eq!(child.poll(Duration::from_secs(5)), Poll::Closed);
    }

    #[cfg(unix)]
    #[test]
    fn test_env_clear() {
        let mut child = shell_command("echo \"[$QUAY_TEST_VAR][$HOME]\"")
            .env_clear()
            .env("QUAY_TEST_VAR", "set")
            .spawn_streaming()
            .unwrap();
        match child.poll(Duration::from_secs(5)) {
            Poll::Line(line) => assert_eq!(line.text, "[set][]"),
            other => panic!("unexpected poll result {:?}", other),
        }
    }
}
