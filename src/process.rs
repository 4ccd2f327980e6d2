//! Supervised child processes
//!
//! Every external component runs as a child of edgekube. Its stdout and stderr are
//! forwarded line by line to tracing, it receives SIGTERM when the shared scope is
//! cancelled, and an exit nobody asked for is reported as an error.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Time a component gets to exit after SIGTERM before it is killed
pub const TERMINATION_GRACE: Duration = Duration::from_secs(10);

/// What to run for one component
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Component name used in logs
    pub component: &'static str,
    /// Executable path
    pub program: PathBuf,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    /// Spec with no arguments
    pub fn new(component: &'static str, program: impl Into<PathBuf>) -> Self {
        Self {
            component,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

fn forward_lines<R>(component: &'static str, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(component, stream, "{}", line);
        }
    });
}

/// A running component
#[derive(Debug)]
pub struct SupervisedProcess {
    component: &'static str,
    pid: u32,
    child: Child,
}

impl SupervisedProcess {
    /// Spawn `spec` with output forwarded to tracing
    ///
    /// The child is killed if this handle is dropped while it still runs.
    pub fn spawn(spec: &ProcessSpec) -> Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::process(format!(
                "failed to start {} ({}): {}",
                spec.component,
                spec.program.display(),
                e
            ))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| Error::process(format!("{} exited immediately", spec.component)))?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(spec.component, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(spec.component, "stderr", stderr);
        }

        info!(component = spec.component, pid, "Started process");
        Ok(Self {
            component: spec.component,
            pid,
            child,
        })
    }

    /// OS process ID
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking check whether the process has already exited
    pub fn try_exited(&mut self) -> Result<Option<ExitStatus>> {
        self.child
            .try_wait()
            .map_err(|e| Error::process(format!("failed to poll {}: {}", self.component, e)))
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child
            .wait()
            .await
            .map_err(|e| Error::process(format!("failed to wait for {}: {}", self.component, e)))
    }

    /// Send SIGTERM, then SIGKILL if it is still running after `grace`
    pub async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.try_exited()?.is_some() {
            return Ok(());
        }

        match kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) => {}
            Err(nix::errno::Errno::ESRCH) => return Ok(()),
            Err(e) => {
                return Err(Error::process(format!(
                    "failed to send SIGTERM to {} ({}): {}",
                    self.component, self.pid, e
                )))
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => {
                info!(component = self.component, "Process stopped");
                Ok(())
            }
            Err(_) => {
                warn!(component = self.component, "Process ignored SIGTERM, killing");
                self.child.kill().await.map_err(|e| {
                    Error::process(format!("failed to kill {}: {}", self.component, e))
                })
            }
        }
    }

    /// Run until the process exits or `cancel` fires
    ///
    /// Cancellation terminates the process and returns `Ok`. An exit that was not
    /// requested is an error, whatever its status.
    pub async fn supervise(mut self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            status = self.child.wait() => {
                let status = status.map_err(|e| {
                    Error::process(format!("failed to wait for {}: {}", self.component, e))
                })?;
                Err(Error::process(format!("{} exited unexpectedly with {}", self.component, status)))
            }
            _ = cancel.cancelled() => {
                debug!(component = self.component, "Shutdown requested");
                self.terminate(TERMINATION_GRACE).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("test", "/bin/sh").args(["-c", script])
    }

    #[tokio::test]
    async fn unexpected_exit_is_an_error() {
        let process = SupervisedProcess::spawn(&sh("echo starting; exit 3")).unwrap();
        let err = process
            .supervise(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited unexpectedly"));
    }

    #[tokio::test]
    async fn clean_exit_is_still_unexpected() {
        let process = SupervisedProcess::spawn(&sh("exit 0")).unwrap();
        assert!(process.supervise(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn cancellation_terminates_the_child() {
        let process = SupervisedProcess::spawn(&sh("exec sleep 30")).unwrap();
        let pid = process.pid();
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { process.supervise(&cancel).await })
        };
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());
    }

    #[tokio::test]
    async fn stubborn_child_is_killed_after_grace() {
        let mut process =
            SupervisedProcess::spawn(&sh("trap '' TERM; while true; do sleep 1; done")).unwrap();
        // Give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        process.terminate(Duration::from_millis(200)).await.unwrap();
        assert!(process.try_exited().unwrap().is_some() || process.wait().await.is_ok());
    }

    #[tokio::test]
    async fn environment_is_passed_through() {
        let mut process =
            SupervisedProcess::spawn(&sh("test \"$EDGEKUBE_TEST\" = yes").env("EDGEKUBE_TEST", "yes"))
                .unwrap();
        assert!(process.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let err = SupervisedProcess::spawn(&ProcessSpec::new("ghost", "/nonexistent/ghost"))
            .unwrap_err();
        assert!(err.to_string().contains("failed to start ghost"));
    }
}
