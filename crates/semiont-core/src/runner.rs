//! External command invocation.
//!
//! Every platform talks to the outside world (`aws`, `docker`/`podman`,
//! `npx cdk`, `npm`, `pg_*`, `lsof`) through a [`CommandRunner`]. The
//! production [`SystemRunner`] spawns real subprocesses on tokio; unit tests
//! swap in a scripted runner so handler logic can be exercised without any
//! of those binaries installed.

use crate::error::{Result, SemiontError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Shell-ish rendering for logs and dry-run output.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

// ---------------------------------------------------------------------------
// CommandOutput
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// Exit status; `-1` when the process was terminated by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.stdout)?)
    }

    /// Convert a non-zero exit into [`SemiontError::CommandFailed`].
    pub fn require_success(self, program: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(SemiontError::CommandFailed {
                program: program.to_string(),
                status: self.status,
                stderr: self.error_text(),
            })
        }
    }

    /// Trimmed stderr, or stdout if stderr is empty, capped for messages.
    pub fn error_text(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        text.chars().take(500).collect()
    }
}

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output. A non-zero exit is returned as
    /// an `Ok` output; only spawn failures and timeouts are errors.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Start a long-running process without waiting for it, appending its
    /// stdout and stderr to `log_path`. Returns the pid.
    async fn spawn_detached(&self, invocation: &Invocation, log_path: &Path) -> Result<u32>;
}

/// Runs real subprocesses.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        tracing::debug!(command = %invocation.display(), "running");

        let mut cmd = tokio::process::Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(&invocation.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn().map_err(|e| SemiontError::SpawnFailed {
            program: invocation.program.clone(),
            reason: e.to_string(),
        })?;

        if let Some(input) = &invocation.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
                // dropping stdin closes the pipe so the child sees EOF
            }
        }

        let wait = child.wait_with_output();
        let output = match invocation.timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                SemiontError::CommandTimeout {
                    program: invocation.program.clone(),
                    seconds: limit.as_secs(),
                }
            })??,
            None => wait.await?,
        };

        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        tracing::debug!(command = %invocation.program, status = result.status, "finished");
        Ok(result)
    }

    async fn spawn_detached(&self, invocation: &Invocation, log_path: &Path) -> Result<u32> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = std::process::Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| SemiontError::SpawnFailed {
            program: invocation.program.clone(),
            reason: e.to_string(),
        })?;
        tracing::info!(command = %invocation.display(), pid = child.id(), log = %log_path.display(), "spawned");
        Ok(child.id())
    }
}

// ---------------------------------------------------------------------------
// Scripted runner (tests)
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_display_joins_args() {
        let inv = Invocation::new("docker").args(["ps", "-a"]);
        assert_eq!(inv.display(), "docker ps -a");
        assert_eq!(Invocation::new("true").display(), "true");
    }

    #[test]
    fn require_success_maps_exit_status() {
        let err = CommandOutput::failed(2, "boom")
            .require_success("aws")
            .unwrap_err();
        assert!(matches!(err, SemiontError::CommandFailed { status: 2, .. }));
        assert!(CommandOutput::ok("{}").require_success("aws").is_ok());
    }

    #[tokio::test]
    async fn system_runner_captures_stdout_and_status() {
        let out = SystemRunner
            .run(&Invocation::new("sh").args(["-c", "echo hello; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.status, 3);
    }

    #[tokio::test]
    async fn system_runner_feeds_stdin() {
        let out = SystemRunner
            .run(&Invocation::new("cat").stdin("piped-input"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "piped-input");
    }

    #[tokio::test]
    async fn system_runner_times_out() {
        let err = SystemRunner
            .run(
                &Invocation::new("sleep")
                    .arg("5")
                    .timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SemiontError::CommandTimeout { .. }));
    }

    #[tokio::test]
    async fn spawn_failure_names_the_program() {
        let err = SystemRunner
            .run(&Invocation::new("__semiont_no_such_binary__"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("__semiont_no_such_binary__"));
    }

    #[tokio::test]
    async fn scripted_runner_replays_sequences() {
        let runner = testing::ScriptedRunner::new().on_sequence(
            "describe",
            vec![CommandOutput::ok("first"), CommandOutput::ok("second")],
        );
        let inv = Invocation::new("aws").arg("describe");
        assert_eq!(runner.run(&inv).await.unwrap().stdout, "first");
        assert_eq!(runner.run(&inv).await.unwrap().stdout, "second");
        assert_eq!(runner.run(&inv).await.unwrap().stdout, "second");
        assert_eq!(runner.calls().len(), 3);
    }
}
