//! Supervised external processes.
//!
//! Every program unisync drives (ssh, unison, nnn) goes through
//! [`ScopedProcess`]: spawn, wait with an optional bound, kill and reap on
//! timeout or cancellation. The child is also marked `kill_on_drop`, so an
//! early return can never leave it running.

use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, ChildStdout, Command};

/// Errors from supervising an external process.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not exit within {} seconds", .timeout.as_secs())]
    Timeout { program: String, timeout: Duration },

    #[error("{program} was interrupted")]
    Cancelled { program: String },
}

/// A running child process that is always terminated and reaped.
#[derive(Debug)]
pub struct ScopedProcess {
    program: String,
    child: Child,
}

impl ScopedProcess {
    /// Spawn `command`.
    pub fn spawn(command: &mut Command) -> Result<Self, ProcessError> {
        let program = command
            .as_std()
            .get_program()
            .to_string_lossy()
            .into_owned();
        let child = command
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            })?;
        tracing::debug!(program = %program, pid = ?child.id(), "spawned process");
        Ok(Self { program, child })
    }

    /// OS process id, `None` once the child has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Take the piped stdout, if the command was configured with one.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Wait for the process without any bound.
    pub async fn wait(mut self) -> Result<ExitStatus, ProcessError> {
        self.child.wait().await.map_err(|source| ProcessError::Wait {
            program: self.program.clone(),
            source,
        })
    }

    /// Wait at most `timeout`, killing and reaping the process on expiry.
    pub async fn wait_for(self, timeout: Duration) -> Result<ExitStatus, ProcessError> {
        self.wait_or_cancel(timeout, std::future::pending::<()>())
            .await
    }

    /// Wait at most `timeout`, or until `cancel` resolves.
    ///
    /// On expiry or cancellation the process is killed and reaped before the
    /// error is returned.
    pub async fn wait_or_cancel<F>(
        mut self,
        timeout: Duration,
        cancel: F,
    ) -> Result<ExitStatus, ProcessError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            status = self.child.wait() => status.map_err(|source| ProcessError::Wait {
                program: self.program.clone(),
                source,
            }),
            _ = tokio::time::sleep(timeout) => {
                self.terminate().await;
                Err(ProcessError::Timeout { program: self.program, timeout })
            }
            _ = cancel => {
                self.terminate().await;
                Err(ProcessError::Cancelled { program: self.program })
            }
        }
    }

    async fn terminate(&mut self) {
        let pid = self.child.id();
        // kill() sends SIGKILL and then waits, which reaps the child.
        if let Err(e) = self.child.kill().await {
            tracing::warn!(program = %self.program, pid = ?pid, error = %e, "failed to kill process");
        } else {
            tracing::debug!(program = %self.program, pid = ?pid, "killed process");
        }
    }
}

/// Resolves once the user presses Ctrl-C.
///
/// If the signal handler cannot be installed this never resolves.
pub async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
