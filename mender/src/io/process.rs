//! Helpers for running child processes with timeouts and bounded output.
//!
//! Every external program the agent touches (the interpreter, the `docker`
//! control CLI, command-based completion and search backends) goes through
//! [`run_command_with_timeout`], so a runaway child can never stall the loop.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

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
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Stdout as trimmed text, with a truncation notice when bytes were dropped.
    pub fn stdout_text(&self) -> String {
        render_stream(&self.stdout, self.stdout_truncated, "stdout")
    }

    /// Stderr as trimmed text, with a truncation notice when bytes were dropped.
    pub fn stderr_text(&self) -> String {
        render_stream(&self.stderr, self.stderr_truncated, "stderr")
    }
}

fn render_stream(bytes: &[u8], truncated: usize, label: &str) -> String {
    let mut text = String::from_utf8_lossy(bytes).trim().to_string();
    if truncated > 0 {
        text.push_str(&format!("\n[{label} truncated {truncated} bytes]"));
    }
    text
}

/// How long reader threads may take to drain once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Stdin is fed and output is read on separate threads while the child runs, so neither a child
/// that ignores its input nor one that floods its output can hold up the deadline.
/// `output_limit_bytes` bounds the amount of stdout/stderr stored in memory (bytes beyond this are
/// discarded while still draining the pipe).
///
/// On unix the child leads its own process group. A child still running at the deadline is killed
/// together with everything it spawned and reported with `timed_out = true`. Group members left
/// behind by a child that exited on its own are killed too, and output that does not drain within
/// a short grace period afterwards is abandoned.
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
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
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

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // Detached: a child that never reads its input must not block the deadline.
        // Once the child exits the pipe closes and the write fails.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                warn!(err = %e, "failed to write child stdin");
            }
        });
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_process_group(child.id());
            if let Err(e) = child.kill() {
                debug!(err = %e, "child already gone after group kill");
            }
            child.wait().context("wait command after kill")?
        }
    };

    if !timed_out {
        // Descendants left behind would otherwise hold the output pipes open.
        kill_process_group(child.id());
    }

    let drain_deadline = Instant::now() + DRAIN_GRACE;
    let (stdout, stdout_truncated) =
        join_output(stdout_handle, drain_deadline).context("join stdout")?;
    let (stderr, stderr_truncated) =
        join_output(stderr_handle, drain_deadline).context("join stderr")?;

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

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(err = %e, pid, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

type ReaderHandle = thread::JoinHandle<Result<(Vec<u8>, usize)>>;

/// Join a reader thread. A reader still blocked at `deadline` on a pipe held
/// open by an escaped descendant is abandoned and reported as empty.
fn join_output(handle: ReaderHandle, deadline: Instant) -> Result<(Vec<u8>, usize)> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("output pipe still held open after the child exited; abandoning reader");
            return Ok((Vec::new(), 0));
        }
        thread::sleep(Duration::from_millis(10));
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
