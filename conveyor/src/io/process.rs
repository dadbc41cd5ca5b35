//! Process supervisor: spawn, stream stdout by line, enforce a wall-clock deadline.
//!
//! Every supervised child is registered with the shared [`ProcessRegistry`]
//! for as long as it runs, so tier-two shutdown can reach it.

use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use nix::sys::signal::Signal;
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::registry::{OsSignals, ProcessRegistry, SignalSender};

/// Default cap on buffered stdout/stderr bytes.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 16 * 1024 * 1024;

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    /// Terminated by a signal that the supervisor did not send.
    Signaled,
    TimedOut,
    /// The executable could not be started at all.
    SpawnFailed,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub state: ExitState,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.state == ExitState::Exited(0)
    }

    /// Stderr and stdout joined, for failure diagnostics.
    pub fn diagnostic(&self) -> String {
        match (self.stderr.trim().is_empty(), self.stdout.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stderr.trim_end(), self.stdout.trim_end()),
            (false, true) => self.stderr.trim_end().to_string(),
            (true, false) => self.stdout.trim_end().to_string(),
            (true, true) => format!("process ended with {:?} and no output", self.state),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRequest<'a> {
    pub argv: &'a [String],
    pub workdir: &'a Path,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl<'a> ProcessRequest<'a> {
    pub fn new(argv: &'a [String], workdir: &'a Path, timeout: Duration) -> Self {
        Self {
            argv,
            workdir,
            timeout,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

/// Shell invocation for a configured command string.
pub fn shell_argv(command: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.to_string()]
}

/// Run `req.argv`, calling `on_line` for every stdout line as it arrives.
///
/// A missing executable is reported as [`ExitState::SpawnFailed`], not as an
/// error. On timeout the whole process group is killed and stderr is replaced
/// by a message starting with "Timed out".
#[instrument(skip_all, fields(program = req.argv.first().map(String::as_str), timeout_secs = req.timeout.as_secs()))]
pub fn run_streaming(
    req: &ProcessRequest<'_>,
    registry: &ProcessRegistry,
    mut on_line: impl FnMut(&str),
) -> Result<ProcessOutput> {
    let Some((program, args)) = req.argv.split_first() else {
        bail!("empty argv");
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(req.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(err = %err, program = %program, "failed to spawn command");
            return Ok(ProcessOutput {
                stdout: String::new(),
                stderr: format!("failed to spawn {program}: {err}"),
                state: ExitState::SpawnFailed,
            });
        }
    };
    let registration = registry.track(child.id());
    let deadline = Instant::now() + req.timeout;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel::<String>();
    thread::spawn(move || forward_lines(stdout, &tx));
    let limit = req.output_limit_bytes;
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let mut collected = LimitedBuffer::new(limit);
    let mut timed_out = false;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            timed_out = true;
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok(line) => {
                on_line(&line);
                collected.push_line(&line);
            }
            Err(RecvTimeoutError::Timeout) => {
                timed_out = true;
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = if timed_out {
        None
    } else {
        let remaining = deadline.saturating_duration_since(Instant::now());
        child.wait_timeout(remaining).context("wait for command")?
    };

    let Some(status) = status else {
        warn!(pid = registration.pid(), "command timed out, killing process group");
        kill_group(registration.pid());
        child.wait().context("wait command after kill")?;
        // Readers may still be blocked on pipes held by orphaned grandchildren.
        return Ok(ProcessOutput {
            stdout: collected.into_string(),
            stderr: format!("Timed out after {}s", req.timeout.as_secs()),
            state: ExitState::TimedOut,
        });
    };

    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    if collected.truncated > 0 || stderr_truncated > 0 {
        warn!(
            stdout_truncated = collected.truncated,
            stderr_truncated, "output truncated"
        );
    }

    let state = match status.code() {
        Some(code) => ExitState::Exited(code),
        None => ExitState::Signaled,
    };
    debug!(?state, "command finished");
    Ok(ProcessOutput {
        stdout: collected.into_string(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        state,
    })
}

fn kill_group(pid: u32) {
    match OsSignals.send(pid, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(err) => warn!(pid, err = %err, "failed to kill timed-out process"),
    }
}

fn forward_lines<R: Read>(reader: R, tx: &mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(text).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(err = %err, "failed to read child stdout");
                break;
            }
        }
    }
}

struct LimitedBuffer {
    buf: String,
    limit: usize,
    truncated: usize,
}

impl LimitedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            truncated: 0,
        }
    }

    fn push_line(&mut self, line: &str) {
        let needed = line.len() + 1;
        if self.buf.len() + needed > self.limit {
            self.truncated += needed;
            return;
        }
        self.buf.push_str(line);
        self.buf.push('\n');
    }

    fn into_string(self) -> String {
        self.buf
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
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
