//! Subprocess runner
//!
//! All device information comes from shelling out to system utilities. The
//! [`CommandRunner`] trait is the seam between the parsers/monitor and the
//! operating system: [`SystemCommandRunner`] spawns real processes with
//! `tokio::process`, tests substitute scripted output.

use crate::{Error, Result};
use async_channel::{Receiver, Sender, TryRecvError, bounded};
use std::future::Future;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Lines buffered between a long-running process and its consumer
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Turn a non-zero exit into [`Error::Command`]
    pub fn check(self, program: &str) -> Result<Self> {
        if self.status_code == Some(0) {
            return Ok(self);
        }

        let status = match self.status_code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        let message = if stderr.is_empty() {
            status
        } else {
            format!("{}: {}", status, stderr)
        };
        Err(Error::command(program, message))
    }
}

/// One item produced by a long-running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessLine {
    Stdout(String),
    Stderr(String),
    /// The process ended; no further lines follow
    Exited(Option<i32>),
}

/// Line-by-line output of a long-running process
///
/// Dropping the stream kills the process.
pub struct LineStream {
    lines: Receiver<ProcessLine>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl LineStream {
    pub fn new(lines: Receiver<ProcessLine>, kill_tx: oneshot::Sender<()>) -> Self {
        Self {
            lines,
            kill_tx: Some(kill_tx),
        }
    }

    /// Wait for the next line; `None` once the producer is gone
    pub async fn next(&self) -> Option<ProcessLine> {
        self.lines.recv().await.ok()
    }

    /// Take an already-buffered line without waiting
    pub fn try_next(&self) -> Option<ProcessLine> {
        match self.lines.try_recv() {
            Ok(line) => Some(line),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Ask the process to terminate
    pub fn kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Runs external programs
pub trait CommandRunner: Send + Sync + 'static {
    /// Run `program` to completion and capture its output.
    ///
    /// Fails with [`Error::Command`] if the program cannot be spawned or
    /// exits unsuccessfully.
    fn run(
        &self,
        program: &str,
        args: &[&str],
    ) -> impl Future<Output = Result<CommandOutput>> + Send;

    /// Spawn a long-running `program` and stream its output line by line
    fn spawn_lines(
        &self,
        program: &str,
        args: &[&str],
    ) -> impl Future<Output = Result<LineStream>> + Send;
}

/// [`CommandRunner`] backed by real processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!("Running {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::command(program, e.to_string()))?;

        CommandOutput {
            status_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
        .check(program)
    }

    async fn spawn_lines(&self, program: &str, args: &[&str]) -> Result<LineStream> {
        debug!("Spawning {} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::command(program, e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::command(program, "stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::command(program, "stderr not captured"))?;

        let (line_tx, line_rx) = bounded(LINE_CHANNEL_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel();
        let program = program.to_string();

        tokio::spawn(async move {
            pump_child(program, child, stdout, stderr, line_tx, kill_rx).await;
        });

        Ok(LineStream::new(line_rx, kill_tx))
    }
}

/// Forward a child's output into `line_tx` until it exits or is killed
///
/// Output is split on `\n` and decoded lossily, so bytes that are not UTF-8
/// never end a stream. Partial lines survive a cancelled read in their buffer.
async fn pump_child(
    program: String,
    mut child: tokio::process::Child,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    line_tx: Sender<ProcessLine>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        let line = tokio::select! {
            _ = &mut kill_rx => {
                debug!("Killing {}", program);
                let _ = child.kill().await;
                return;
            }
            read = stdout.read_until(b'\n', &mut stdout_buf), if stdout_open => {
                match take_line(read, &mut stdout_buf, &program, "stdout") {
                    Some(line) => ProcessLine::Stdout(line),
                    None => {
                        stdout_open = false;
                        continue;
                    }
                }
            }
            read = stderr.read_until(b'\n', &mut stderr_buf), if stderr_open => {
                match take_line(read, &mut stderr_buf, &program, "stderr") {
                    Some(line) => ProcessLine::Stderr(line),
                    None => {
                        stderr_open = false;
                        continue;
                    }
                }
            }
        };

        if line_tx.send(line).await.is_err() {
            // Consumer went away
            let _ = child.kill().await;
            return;
        }
    }

    let status_code = tokio::select! {
        _ = &mut kill_rx => {
            let _ = child.kill().await;
            return;
        }
        status = child.wait() => status.ok().and_then(|s| s.code()),
    };

    debug!("{} exited with {:?}", program, status_code);
    let _ = line_tx.send(ProcessLine::Exited(status_code)).await;
}

/// Turn a completed `read_until` into a line; `None` once the pipe is done
fn take_line(
    read: std::io::Result<usize>,
    buf: &mut Vec<u8>,
    program: &str,
    pipe: &str,
) -> Option<String> {
    match read {
        Ok(0) if buf.is_empty() => None,
        Ok(_) => Some(decode_line(buf)),
        Err(e) => {
            warn!("Failed to read {} {}: {}", program, pipe, e);
            None
        }
    }
}

/// Decode and clear `buf`, dropping the line terminator
fn decode_line(buf: &mut Vec<u8>) -> String {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}
