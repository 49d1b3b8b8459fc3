//! Helpers for running child processes with optional timeouts and bounded output.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// Captured child process output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or `None` when the child was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Render stdout and stderr as a single log body.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        buf
    }
}

/// Runs a shell command in a working directory.
pub trait CommandRunner {
    fn run_command(&self, path: &Path, command: &str) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellCommandRunner {
    timeout: Option<Duration>,
    output_limit_bytes: usize,
}

impl ShellCommandRunner {
    pub fn new(timeout: Option<Duration>, output_limit_bytes: usize) -> Self {
        Self {
            timeout,
            output_limit_bytes,
        }
    }
}

impl Default for ShellCommandRunner {
    fn default() -> Self {
        Self::new(None, DEFAULT_OUTPUT_LIMIT_BYTES)
    }
}

impl CommandRunner for ShellCommandRunner {
    #[instrument(skip_all, fields(path = %path.display()))]
    fn run_command(&self, path: &Path, command: &str) -> Result<CommandOutput> {
        debug!(command, "running shell command");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(path);
        run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run `{command}` in {}", path.display()))
    }
}

/// Run a command and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// With `timeout = None` the call blocks until the child exits.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs()), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

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

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match timeout {
        None => child.wait().context("wait for command")?,
        Some(limit) => match child.wait_timeout(limit).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(timeout_secs = limit.as_secs(), "command timed out, killing");
                timed_out = true;
                child.kill().context("kill command")?;
                child.wait().context("wait command after kill")?
            }
        },
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        exit_code: status.code(),
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Write a rendered command log to `path`, replacing the previous run's log
/// and creating parent directories.
pub fn write_command_log(path: &Path, header: &str, output: &CommandOutput) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let mut file =
        std::fs::File::create(path).with_context(|| format!("open log {}", path.display()))?;
    writeln!(file, "##### {header}").with_context(|| format!("write {}", path.display()))?;
    file.write_all(output.render_log("command").as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_runner_reports_success_and_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ShellCommandRunner::default();
        let output = runner
            .run_command(temp.path(), "touch marker && echo out && echo err >&2")
            .expect("run");
        assert!(output.success());
        assert!(temp.path().join("marker").exists());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "out");
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "err");
    }

    #[test]
    fn shell_runner_reports_non_zero_exit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = ShellCommandRunner::default()
            .run_command(temp.path(), "exit 3")
            .expect("run");
        assert!(!output.success());
        assert_eq!(output.exit_code, Some(3));
    }

    #[test]
    fn timeout_kills_the_child() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ShellCommandRunner::new(Some(Duration::from_millis(200)), 1000);
        let output = runner.run_command(temp.path(), "sleep 2").expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[test]
    fn output_beyond_limit_is_counted_not_kept() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ShellCommandRunner::new(None, 4);
        let output = runner.run_command(temp.path(), "printf 0123456789").expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.render_log("x").contains("[x stdout truncated 6 bytes]"));
    }
}
