//! Helpers for running child processes with timeouts.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::CommandResult;

/// How long to keep draining pipes after the child exits.
///
/// Background processes started by the command (`server &`) inherit the pipes and may
/// hold them open indefinitely; whatever arrived within this window is returned.
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Executes target and auxiliary shell commands.
pub trait CommandRunner {
    /// Run `command` through the shell in `workdir`. Never fails: faults and timeouts are
    /// reported inside the returned [`CommandResult`].
    fn run(&self, command: &str, workdir: &Path, timeout: Duration) -> CommandResult;
}

/// Runs commands through the platform shell with no output truncation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    #[instrument(skip_all, fields(command = %command, timeout_secs = timeout.as_secs()))]
    fn run(&self, command: &str, workdir: &Path, timeout: Duration) -> CommandResult {
        info!(workdir = %workdir.display(), "executing command");
        let mut cmd = shell_command(command);
        cmd.current_dir(workdir);

        let output = match run_command_with_timeout(cmd, None, timeout, usize::MAX) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "command could not be executed");
                return CommandResult::fault(command, workdir.to_path_buf(), format!("{err:#}"));
            }
        };

        if output.timed_out {
            warn!("command timed out");
            let mut result =
                CommandResult::timed_out(command, workdir.to_path_buf(), timeout.as_secs());
            result.stdout = output.stdout_lossy();
            return result;
        }

        let exit_code = output.status.code().unwrap_or(1);
        let succeeded = output.status.success();
        if succeeded {
            debug!("command succeeded");
        } else {
            info!(exit_code, "command failed");
        }
        CommandResult {
            command: command.to_string(),
            working_directory: workdir.to_path_buf(),
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            exit_code,
            succeeded,
        }
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// After the child exits, readers get [`DRAIN_GRACE`] to finish; output from processes that
/// outlive the child is returned as far as it was read.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (done_tx, done_rx) = mpsc::channel();
    let stdout_reader = StreamReader::spawn(stdout, output_limit_bytes, done_tx.clone());
    let stderr_reader = StreamReader::spawn(stderr, output_limit_bytes, done_tx);

    if let Some(input) = stdin {
        let child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        spawn_stdin_writer(child_stdin, input.to_vec());
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let deadline = Instant::now() + DRAIN_GRACE;
    let mut finished = 0;
    while finished < 2 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match done_rx.recv_timeout(remaining) {
            Ok(()) => finished += 1,
            Err(_) => {
                warn!("output pipes still open after exit, returning partial output");
                break;
            }
        }
    }

    let (stdout, stdout_truncated) = stdout_reader.take()?;
    let (stderr, stderr_truncated) = stderr_reader.take()?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Feed `input` to the child on a detached thread so a child that never reads cannot
/// block the caller past its timeout. The pipe closes when the thread finishes.
fn spawn_stdin_writer<W: Write + Send + 'static>(mut sink: W, input: Vec<u8>) {
    thread::spawn(move || {
        // A child that exits without reading its input closes the pipe early; its exit
        // status tells the real story.
        if let Err(err) = sink.write_all(&input) {
            debug!(err = %err, "stdin write stopped early");
        }
    });
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
    error: Option<String>,
}

/// Background reader that appends into a shared buffer so partial output survives
/// a reader that never reaches EOF.
struct StreamReader {
    captured: Arc<Mutex<Captured>>,
}

impl StreamReader {
    fn spawn<R: Read + Send + 'static>(reader: R, limit: usize, done: mpsc::Sender<()>) -> Self {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let sink = Arc::clone(&captured);
        thread::spawn(move || {
            read_stream_limited(reader, limit, &sink);
            // The receiver is gone once the caller stopped waiting.
            let _ = done.send(());
        });
        Self { captured }
    }

    fn take(self) -> Result<(Vec<u8>, usize)> {
        let mut captured = self
            .captured
            .lock()
            .map_err(|_| anyhow!("output reader thread panicked"))?;
        if let Some(err) = captured.error.take() {
            warn!(err = %err, "output stream read failed");
        }
        Ok((std::mem::take(&mut captured.bytes), captured.truncated))
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize, sink: &Mutex<Captured>) {
    let mut chunk = [0u8; 8192];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                if let Ok(mut captured) = sink.lock() {
                    captured.error = Some(err.to_string());
                }
                break;
            }
        };
        let Ok(mut captured) = sink.lock() else {
            break;
        };
        let remaining = limit.saturating_sub(captured.bytes.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            captured.bytes.extend_from_slice(&chunk[..keep]);
            captured.truncated += n.saturating_sub(keep);
        } else {
            captured.truncated += n;
        }
    }
}
