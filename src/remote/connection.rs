//! Multiplexed SSH master connection.
//!
//! The user authenticates once: `ssh -fNT -M -S <control path>` detaches into
//! the background after authentication succeeds and every later ssh started by
//! unison can reuse that socket. The foreground ssh exiting with status 0 is
//! the success signal.
//!
//! A [`ConnectionManager`] goes `Ready -> Open -> Closed`. Opening twice is an
//! error, and reopening after close needs [`ConnectionManager::reset`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

use crate::config::{ServerConfig, expand_tilde};
use crate::process::{ProcessError, ScopedProcess, interrupted};

/// Bound on the `-O exit` management call.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from opening or closing the master connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Authentication to {host} timed out after {} seconds", .timeout.as_secs())]
    AuthTimeout { host: String, timeout: Duration },

    #[error("Login to {host} failed (ssh exit status {})", code_text(.code))]
    ConnectFailed { host: String, code: Option<i32> },

    #[error("Connection to {0} cancelled")]
    Cancelled(String),

    #[error("A master connection is already open")]
    AlreadyOpen,

    #[error("Connection manager was closed; reset it before opening again")]
    NotReady,

    #[error(transparent)]
    Process(#[from] ProcessError),
}

fn code_text(code: &Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

/// Proof of an open master connection.
///
/// Only [`ConnectionManager::open`] creates one and
/// [`ConnectionManager::close`] consumes it, so a sync can never run
/// against a closed connection.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectionHandle {
    control_path: PathBuf,
    user: String,
    host: String,
    uri_host: String,
    port: u16,
    ssh_options: Vec<String>,
}

impl ConnectionHandle {
    pub(crate) fn new(server: &ServerConfig, control_path: PathBuf) -> Self {
        Self {
            control_path,
            user: server.user().to_string(),
            host: server.target(),
            uri_host: server.uri_host(),
            port: server.port(),
            ssh_options: server.ssh_options().to_vec(),
        }
    }

    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ssh_options(&self) -> &[String] {
        &self.ssh_options
    }

    /// `user@host` for ssh command lines.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// `ssh://user@host` prefix for unison roots.
    pub fn root_uri(&self) -> String {
        format!("ssh://{}@{}", self.user, self.uri_host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionState {
    Ready,
    Open { control_path: PathBuf },
    Closed,
}

/// Owns the lifecycle of one master connection.
#[derive(Debug)]
pub struct ConnectionManager {
    program: PathBuf,
    close_timeout: Duration,
    state: ConnectionState,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("ssh"),
            close_timeout: CLOSE_TIMEOUT,
            state: ConnectionState::Ready,
        }
    }

    /// Use a specific ssh binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, ConnectionState::Open { .. })
    }

    /// Allow a closed manager to be opened again.
    pub fn reset(&mut self) {
        if self.state == ConnectionState::Closed {
            self.state = ConnectionState::Ready;
        }
    }

    /// Open the master connection, giving the user `connect_timeout` to authenticate.
    ///
    /// Ctrl-C while waiting cancels the attempt.
    pub async fn open(
        &mut self,
        server: &ServerConfig,
        control_path_template: &str,
        connect_timeout: Duration,
    ) -> Result<ConnectionHandle, ConnectionError> {
        self.open_until(server, control_path_template, connect_timeout, interrupted())
            .await
    }

    /// Like [`open`](Self::open), cancelled when `cancel` resolves instead of on Ctrl-C.
    pub async fn open_until<F>(
        &mut self,
        server: &ServerConfig,
        control_path_template: &str,
        connect_timeout: Duration,
        cancel: F,
    ) -> Result<ConnectionHandle, ConnectionError>
    where
        F: Future<Output = ()>,
    {
        match self.state {
            ConnectionState::Ready => {}
            ConnectionState::Open { .. } => return Err(ConnectionError::AlreadyOpen),
            ConnectionState::Closed => return Err(ConnectionError::NotReady),
        }

        let control_path = expand_tilde(control_path_template);
        let host = server.target();
        tracing::info!(
            host = %host,
            port = server.port(),
            control_path = %control_path.display(),
            "opening master connection"
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(master_args(server, &control_path));
        let process = ScopedProcess::spawn(&mut cmd)?;

        let status = match process.wait_or_cancel(connect_timeout, cancel).await {
            Ok(status) => status,
            Err(ProcessError::Timeout { timeout, .. }) => {
                tracing::warn!(host = %host, "time to login expired");
                return Err(ConnectionError::AuthTimeout { host, timeout });
            }
            Err(ProcessError::Cancelled { .. }) => return Err(ConnectionError::Cancelled(host)),
            Err(e) => return Err(e.into()),
        };

        if !status.success() {
            tracing::warn!(host = %host, code = ?status.code(), "login to remote failed");
            return Err(ConnectionError::ConnectFailed {
                host,
                code: status.code(),
            });
        }

        tracing::info!(host = %host, "master connection established");
        self.state = ConnectionState::Open {
            control_path: control_path.clone(),
        };
        Ok(ConnectionHandle::new(server, control_path))
    }

    /// Ask the master to exit and return ssh's status as is.
    ///
    /// The manager is closed afterwards whatever the status.
    pub async fn close(&mut self, handle: ConnectionHandle) -> Result<ExitStatus, ConnectionError> {
        if let ConnectionState::Open { control_path } = &self.state
            && control_path != handle.control_path()
        {
            tracing::warn!(
                expected = %control_path.display(),
                got = %handle.control_path().display(),
                "closing a handle from another manager"
            );
        }
        self.state = ConnectionState::Closed;

        let mut cmd = Command::new(&self.program);
        cmd.args(close_args(&handle));
        let status = ScopedProcess::spawn(&mut cmd)?
            .wait_for(self.close_timeout)
            .await?;

        tracing::info!(host = %handle.host(), code = ?status.code(), "master connection closed");
        Ok(status)
    }
}

/// Arguments for the detaching master: `-fNT -M -S <path> [opts] user@host -p <port>`.
pub fn master_args(server: &ServerConfig, control_path: &Path) -> Vec<String> {
    let mut args = vec![
        "-fNT".to_string(),
        "-M".to_string(),
        "-S".to_string(),
        control_path.display().to_string(),
    ];
    args.extend(server.ssh_options().iter().cloned());
    args.push(server.destination());
    args.push("-p".to_string());
    args.push(server.port().to_string());
    args
}

/// Arguments asking the master bound to the handle's socket to exit.
pub fn close_args(handle: &ConnectionHandle) -> Vec<String> {
    vec![
        "-S".to_string(),
        handle.control_path().display().to_string(),
        "-O".to_string(),
        "exit".to_string(),
        handle.destination(),
        "-p".to_string(),
        handle.port().to_string(),
    ]
}
