//! Centralized command execution with consistent error handling.
//!
//! Every external program the pipeline touches (build steps, `chroot`,
//! `mksquashfs`, `ldd`, the program-header editor) goes through [`Cmd`], so
//! failures always carry the program name, exit code and captured stderr.

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Output, Stdio};
use std::time::Duration;
use tracing::warn;

use crate::interrupt;

/// How often a supervised child is checked against its deadline and the
/// interrupt flag.
const SUPERVISE_TICK: Duration = Duration::from_millis(100);

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string (empty when redirected to a log).
    pub stdout: String,
    /// Captured stderr as a string (empty when redirected to a log).
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    clear_env: bool,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    error_prefix: Option<String>,
    timeout: Option<Duration>,
    interruptible: bool,
    /// Send stdout and stderr to this file instead of capturing them.
    log_file: Option<PathBuf>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            current_dir: None,
            env: BTreeMap::new(),
            clear_env: false,
            allow_fail: false,
            error_prefix: None,
            timeout: None,
            interruptible: false,
            log_file: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.env
            .insert(key.as_ref().to_string(), value.as_ref().to_string());
        self
    }

    pub fn envs<'a, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in vars {
            self.env.insert(key.clone(), value.clone());
        }
        self
    }

    /// Start from an empty environment; only variables set with [`Cmd::env`] are passed.
    pub fn env_clear(mut self) -> Self {
        self.clear_env = true;
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Kill the process and fail if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Kill the process and fail once an operator interrupt is requested.
    pub fn interruptible(mut self) -> Self {
        self.interruptible = true;
        self
    }

    /// Append combined stdout/stderr to `path`.
    pub fn log_to(mut self, path: &Path) -> Self {
        self.log_file = Some(path.to_path_buf());
        self
    }

    fn command(&self) -> Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if self.clear_env {
            cmd.env_clear();
        }
        cmd.envs(&self.env);
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        if let Some(ref log) = self.log_file {
            if let Some(parent) = log.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log)
                .with_context(|| format!("Failed to open log file {}", log.display()))?;
            let err_file = file.try_clone()?;
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::from(file));
            cmd.stderr(Stdio::from(err_file));
        } else {
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }
        Ok(cmd)
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        let cmd = self.command()?;
        let output = wait_for_output(cmd, self.timeout, self.interruptible).with_context(|| {
            format!("Failed to execute '{}'. Is it installed?", self.program)
        })?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !self.allow_fail && !result.success() {
            let prefix = self
                .error_prefix
                .unwrap_or_else(|| format!("'{}' failed", self.program));

            let stderr = result.stderr_trimmed();
            if stderr.is_empty() {
                bail!("{} (exit code {})", prefix, result.code());
            } else {
                bail!("{} (exit code {}):\n{}", prefix, result.code(), stderr);
            }
        }

        Ok(result)
    }

    /// Run the command with inherited stdio (interactive/streaming).
    ///
    /// Output goes directly to the terminal. Use for long-running tools
    /// where the user should see progress (e.g., mksquashfs).
    pub fn run_interactive(self) -> Result<ExitStatus> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(&self.env);
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }

        let status = cmd.status().with_context(|| {
            format!("Failed to execute '{}'. Is it installed?", self.program)
        })?;

        if !self.allow_fail && !status.success() {
            let prefix = self
                .error_prefix
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            bail!("{} (exit code {})", prefix, status.code().unwrap_or(-1));
        }

        Ok(status)
    }
}

/// Block until the child exits, the deadline passes, or (when
/// `interruptible`) an interrupt is requested.
///
/// Supervised children run in their own process group. On timeout or
/// interrupt the whole group is killed, so nothing the child started keeps
/// writing after the failure is reported.
fn wait_for_output(cmd: Command, timeout: Option<Duration>, interruptible: bool) -> Result<Output> {
    let mut cmd = cmd;
    if timeout.is_none() && !interruptible {
        return Ok(cmd.output()?);
    }
    cmd.process_group(0);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start timeout runtime")?;

    rt.block_on(async move {
        let mut command = tokio::process::Command::from(cmd);
        command.kill_on_drop(true);
        let child = command.spawn()?;
        let pgid = child.id();
        let deadline = timeout.map(|limit| tokio::time::Instant::now() + limit);

        let mut output = Box::pin(child.wait_with_output());
        loop {
            if let Ok(result) = tokio::time::timeout(SUPERVISE_TICK, &mut output).await {
                return Ok(result?);
            }
            if interruptible && interrupt::is_interrupted() {
                kill_group(pgid);
                bail!("interrupted");
            }
            if let (Some(deadline), Some(limit)) = (deadline, timeout) {
                if tokio::time::Instant::now() >= deadline {
                    kill_group(pgid);
                    bail!("timed out after {:?}", limit);
                }
            }
        }
    })
}

fn kill_group(pgid: Option<u32>) {
    let Some(pgid) = pgid else {
        return;
    };
    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "failed to kill process group"),
    }
}

// =============================================================================
// Convenience functions
// =============================================================================

/// Check if a program exists in PATH, returning its full path.
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

pub fn exists(program: &str) -> bool {
    which(program).is_some()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    #[test]
    fn test_run_success() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn test_run_failure_includes_stderr() {
        let err = Cmd::new("ls")
            .arg("/nonexistent_path_12345")
            .run()
            .unwrap_err();
        let msg = err.to_string();

        assert!(msg.contains("No such file") || msg.contains("cannot access"));
    }

    #[test]
    fn test_shell_command() {
        let result = Cmd::new("sh")
            .args(["-c", "echo hello && echo world"])
            .dir(Path::new("/"))
            .run()
            .unwrap();
        assert!(result.stdout.contains("hello"));
        assert!(result.stdout.contains("world"));
    }

    #[test]
    fn test_which() {
        assert!(which("sh").is_some());
        assert!(!exists("nonexistent_program_12345"));
    }

    #[test]
    fn test_custom_error_message() {
        let err = Cmd::new("false")
            .error_msg("Custom build step failed")
            .run()
            .unwrap_err();

        assert!(err.to_string().contains("Custom build step failed"));
    }

    #[test]
    fn test_allow_fail() {
        let result = Cmd::new("false").allow_fail().run().unwrap();

        assert!(!result.success());
        assert_eq!(result.code(), 1);
    }

    #[test]
    fn test_env_is_passed() {
        let result = Cmd::new("sh")
            .args(["-c", "echo $ROOTFORGE_TEST_VAR"])
            .env("ROOTFORGE_TEST_VAR", "forty-two")
            .run()
            .unwrap();
        assert_eq!(result.stdout_trimmed(), "forty-two");
    }

    #[test]
    fn test_log_to_file_appends_both_streams() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("logs/step.log");

        Cmd::new("sh")
            .args(["-c", "echo out; echo err >&2"])
            .log_to(&log)
            .run()
            .unwrap();

        Cmd::new("echo").arg("second").log_to(&log).run().unwrap();

        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("out"));
        assert!(content.contains("err"));
        assert!(content.ends_with("second\n"));
    }

    #[test]
    fn test_timeout_kills_long_command() {
        let start = Instant::now();
        let err = Cmd::new("sleep")
            .arg("5")
            .timeout(Some(Duration::from_millis(200)))
            .run()
            .unwrap_err();

        assert!(format!("{:#}", err).contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_timeout_kills_whole_process_group() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("late");

        let err = Cmd::new("sh")
            .arg("-c")
            .arg("sh -c 'sleep 2; echo late > \"$1\"' inner \"$1\"")
            .arg("outer")
            .arg_path(&marker)
            .timeout(Some(Duration::from_millis(300)))
            .run()
            .unwrap_err();
        assert!(format!("{:#}", err).contains("timed out"));

        // The nested shell died with its parent and never wrote the marker.
        std::thread::sleep(Duration::from_secs(3));
        assert!(!marker.exists());
    }

    #[test]
    #[serial_test::serial]
    fn test_interruptible_command_is_killed() {
        interrupt::reset();
        let raiser = std::thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(200));
            interrupt::request();
        });

        let start = Instant::now();
        let err = Cmd::new("sleep").arg("5").interruptible().run().unwrap_err();
        raiser.join().unwrap();
        interrupt::reset();

        assert!(format!("{:#}", err).contains("interrupted"));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_timeout_not_reached() {
        let result = Cmd::new("echo")
            .arg("quick")
            .timeout(Some(Duration::from_secs(10)))
            .run()
            .unwrap();
        assert_eq!(result.stdout_trimmed(), "quick");
    }
}
