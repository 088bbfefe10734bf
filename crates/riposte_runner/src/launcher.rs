//! Subprocess launcher for automation scripts and CLI plugins.
//!
//! All I/O is synchronous and runs on the caller's (blocking) thread.
//! stdout and stderr are drained on dedicated threads so neither pipe
//! can deadlock the child; stderr is streamed line-by-line into
//! tracing rather than buffered whole.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Poll interval while waiting for the child to exit.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How much trailing stderr is retained for error messages.
const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// How the JSON payload reaches the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgStyle {
    /// Single trailing command-line argument (default).
    #[default]
    Argument,
    /// Written to the child's stdin, which is then closed.
    Stdin,
}

/// One subprocess invocation.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Interpreter to run the program through; `None` executes the
    /// program directly.
    pub interpreter: Option<PathBuf>,
    pub program: PathBuf,
    /// Extra arguments before the payload (e.g. a plugin command).
    pub args: Vec<String>,
    pub payload: Option<String>,
    pub arg_style: ArgStyle,
    pub timeout: Duration,
}

/// Captured result of a subprocess run.
#[derive(Debug)]
pub struct LaunchOutput {
    pub stdout: Vec<u8>,
    /// Trailing stderr bytes, for error messages only. Full stderr is
    /// streamed to the log as it arrives.
    pub stderr_tail: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Seam for spawning external processes, so evaluation paths can be
/// tested without real children.
pub trait ScriptLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<LaunchOutput>;
}

/// The production launcher: `std::process` with polling timeout.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl ScriptLauncher for ProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<LaunchOutput> {
        let mut command = match &spec.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&spec.program);
                cmd
            }
            None => Command::new(&spec.program),
        };
        command.args(&spec.args);

        if spec.arg_style == ArgStyle::Argument {
            if let Some(payload) = &spec.payload {
                command.arg(payload);
            }
        }

        command
            .stdin(if spec.arg_style == ArgStyle::Stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;
        let program = spec.program.display().to_string();
        debug!(program = %program, "spawned subprocess");

        if spec.arg_style == ArgStyle::Stdin {
            if let (Some(mut stdin), Some(payload)) = (child.stdin.take(), &spec.payload) {
                // A child that exits without reading produces EPIPE; not fatal
                if let Err(e) = stdin.write_all(payload.as_bytes()) {
                    warn!(program = %program, "failed to write payload to stdin: {}", e);
                }
            }
        }

        let stdout_handle = child.stdout.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        let stderr_handle = child.stderr.take().map(|pipe| {
            let name = program.clone();
            std::thread::spawn(move || stream_stderr(pipe, &name))
        });

        let (exit_code, timed_out) = wait_with_deadline(&mut child, spec.timeout);

        let stdout = stdout_handle
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let stderr_tail = stderr_handle
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        Ok(LaunchOutput {
            stdout,
            stderr_tail,
            exit_code,
            timed_out,
        })
    }
}

/// Stream stderr lines into the log, retaining only a bounded tail.
fn stream_stderr(pipe: impl Read, program: &str) -> String {
    let reader = BufReader::new(pipe);
    let mut tail = String::new();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        debug!(program = %program, "stderr: {}", line);
        tail.push_str(&line);
        tail.push('\n');
        if tail.len() > STDERR_TAIL_BYTES {
            let cut = tail.len() - STDERR_TAIL_BYTES;
            // Keep the suffix; find a char boundary
            let boundary = (cut..tail.len())
                .find(|i| tail.is_char_boundary(*i))
                .unwrap_or(cut);
            tail.drain(..boundary);
        }
    }
    tail
}

/// Poll for exit until the deadline, then kill.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> (Option<i32>, bool) {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return (status.code(), false),
            Ok(None) => {
                if Instant::now() >= deadline {
                    warn!("subprocess exceeded {}s, killing", timeout.as_secs());
                    let _ = child.kill();
                    let _ = child.wait();
                    return (None, true);
                }
                std::thread::sleep(WAIT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!("subprocess wait failed: {}", e);
                let _ = child.kill();
                return (None, false);
            }
        }
    }
}
