//! Sync engine driving unison over the master connection.
//!
//! Two remote subtrees are synchronised against the same local root:
//!
//! - `<remote>/.data` holds the real files; only the selected paths are synced.
//! - `<remote>/links` holds the links standing in for everything else. They
//!   must already exist remotely; syncing them only updates the pointers.
//!
//! Unison's exit status is returned untouched. [`UnisonStatus`] classifies it
//! for reporting, but deciding what a partial success means is left to the
//! caller.
//!
//! # Example
//!
//! ```rust,ignore
//! use unisync::remote::{ConnectionManager, SyncOrchestrator};
//!
//! let handle = manager.open(&config.server, &config.session.control_path, timeout).await?;
//! let engine = SyncOrchestrator::new().with_program(&config.programs.unison);
//! let status = engine.sync_data(&handle, &config.roots, &config.tools, &paths, false).await?;
//! manager.close(handle).await?;
//! ```

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

use super::connection::ConnectionHandle;
use crate::config::{RootsConfig, ToolOptions};
use crate::process::{ProcessError, ScopedProcess};

/// Remote subdirectory holding file content.
pub const DATA_DIR: &str = ".data";
/// Remote subdirectory holding the links.
pub const LINKS_DIR: &str = "links";

/// Errors that keep unison from reporting a status at all.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Could not run unison: {0}")]
    SpawnFailed(#[source] ProcessError),

    #[error("Sync timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),
}

impl From<ProcessError> for SyncError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Timeout { timeout, .. } => Self::Timeout(timeout),
            other => Self::SpawnFailed(other),
        }
    }
}

/// Meaning of a unison exit status (unison manual, section "Exit code").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnisonStatus {
    /// Everything is up to date.
    Success,
    /// Some items were skipped, all transfers succeeded.
    Skipped,
    /// Non-fatal failures during transfer.
    NonFatal,
    /// Fatal error, or the run was interrupted.
    Fatal,
    /// A code unison does not document.
    Unknown(i32),
    /// Killed by a signal before reporting.
    Terminated,
}

impl UnisonStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::Skipped,
            2 => Self::NonFatal,
            3 => Self::Fatal,
            other => Self::Unknown(other),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Exit code unisync reports for this status.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Skipped => 1,
            Self::NonFatal => 2,
            Self::Fatal | Self::Unknown(_) | Self::Terminated => 3,
        }
    }
}

impl From<ExitStatus> for UnisonStatus {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::from_code(code),
            None => Self::Terminated,
        }
    }
}

impl fmt::Display for UnisonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "up to date"),
            Self::Skipped => write!(f, "some items skipped"),
            Self::NonFatal => write!(f, "non-fatal failures"),
            Self::Fatal => write!(f, "fatal error"),
            Self::Unknown(code) => write!(f, "unknown status {code}"),
            Self::Terminated => write!(f, "terminated by signal"),
        }
    }
}

/// One unison run: roots, options and path filters.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    /// Full remote root (`ssh://user@host/dir`). Listed first, so it is the
    /// root `-force` refers to.
    pub remote_root: String,
    pub local_root: &'a Path,
    pub tools: &'a ToolOptions,
    /// Synchronise only these paths; empty means everything.
    pub paths: &'a [String],
    /// Exclude these paths and everything below them.
    pub ignore: &'a [String],
    /// Make the remote side win every conflict and run in batch mode.
    pub force: bool,
}

impl Invocation<'_> {
    /// Build unison's argument vector.
    ///
    /// Built fresh from borrowed inputs on every call, so identical
    /// invocations always produce identical commands.
    pub fn args(&self, handle: &ConnectionHandle) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-root".into(),
            self.remote_root.clone().into(),
            "-root".into(),
            self.local_root.as_os_str().to_owned(),
        ];

        for flag in self.tools.flags() {
            args.push(format!("-{flag}").into());
        }
        for (name, value) in self.tools.keyed() {
            args.push(format!("-{name}").into());
            args.push(value.into());
        }

        args.push("-sshargs".into());
        args.push(sshargs(handle).into());

        for path in self.paths {
            args.push("-path".into());
            args.push(path.into());
        }

        for path in self.ignore {
            args.push("-ignore".into());
            args.push(format!("BelowPath {path}").into());
        }

        if self.force {
            args.push("-force".into());
            args.push(self.remote_root.clone().into());
            args.push("-batch".into());
        }

        args
    }
}

/// The single `-sshargs` token: the port, then the configured ssh options,
/// each followed by a space.
pub fn sshargs(handle: &ConnectionHandle) -> String {
    let mut token = format!("-p {} ", handle.port());
    for option in handle.ssh_options() {
        token.push_str(option);
        token.push(' ');
    }
    token
}

/// Remote root for a subtree of the configured remote directory.
pub fn remote_root(handle: &ConnectionHandle, roots: &RootsConfig, subdir: &str) -> String {
    format!(
        "{}/{}/{}",
        handle.root_uri(),
        roots.remote().trim_end_matches('/'),
        subdir
    )
}

/// Sync engine running unison.
#[derive(Debug, Clone)]
pub struct SyncOrchestrator {
    program: PathBuf,
    /// `None` waits as long as unison runs.
    transfer_timeout: Option<Duration>,
}

impl Default for SyncOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncOrchestrator {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("unison"),
            transfer_timeout: None,
        }
    }

    /// Use a specific unison binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Bound every unison run.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = Some(timeout);
        self
    }

    /// Synchronise the selected paths of `<remote>/.data` with the local root.
    pub async fn sync_data(
        &self,
        handle: &ConnectionHandle,
        roots: &RootsConfig,
        tools: &ToolOptions,
        paths: &[String],
        force: bool,
    ) -> Result<ExitStatus, SyncError> {
        let invocation = Invocation {
            remote_root: remote_root(handle, roots, DATA_DIR),
            local_root: roots.local(),
            tools,
            paths,
            ignore: &[],
            force,
        };
        self.build_and_run(handle, &invocation).await
    }

    /// Synchronise `<remote>/links` with the local root, skipping `ignore`.
    pub async fn sync_links(
        &self,
        handle: &ConnectionHandle,
        roots: &RootsConfig,
        tools: &ToolOptions,
        ignore: &[String],
    ) -> Result<ExitStatus, SyncError> {
        let invocation = Invocation {
            remote_root: remote_root(handle, roots, LINKS_DIR),
            local_root: roots.local(),
            tools,
            paths: &[],
            ignore,
            force: false,
        };
        self.build_and_run(handle, &invocation).await
    }

    /// Run unison once and hand back its exit status.
    pub async fn build_and_run(
        &self,
        handle: &ConnectionHandle,
        invocation: &Invocation<'_>,
    ) -> Result<ExitStatus, SyncError> {
        let args = invocation.args(handle);
        tracing::debug!(
            program = %self.program.display(),
            args = ?args,
            "starting unison"
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&args);
        let process = ScopedProcess::spawn(&mut cmd)?;
        let status = match self.transfer_timeout {
            Some(timeout) => process.wait_for(timeout).await?,
            None => process.wait().await?,
        };

        let outcome = UnisonStatus::from(status);
        if outcome.is_success() {
            tracing::info!(root = %invocation.remote_root, "unison completed");
        } else {
            tracing::warn!(
                root = %invocation.remote_root,
                code = ?status.code(),
                status = %outcome,
                "unison reported problems"
            );
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, classify_tool_options};
    use std::collections::HashSet;

    fn handle() -> ConnectionHandle {
        let server = ServerConfig::validate("alice", Some("10.0.0.5"), None, None).unwrap();
        ConnectionHandle::new(&server, PathBuf::from("/tmp/control"))
    }

    fn roots() -> RootsConfig {
        RootsConfig::new("/home/a", "remoteproj").unwrap()
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_data_sync_scenario() {
        let handle = handle();
        let roots = roots();
        let tools = ToolOptions::default();
        let invocation = Invocation {
            remote_root: remote_root(&handle, &roots, DATA_DIR),
            local_root: roots.local(),
            tools: &tools,
            paths: &[],
            ignore: &[],
            force: false,
        };

        let args = strings(invocation.args(&handle));
        assert_eq!(
            args,
            vec![
                "-root",
                "ssh://alice@10.0.0.5/remoteproj/.data",
                "-root",
                "/home/a",
                "-sshargs",
                "-p 22 "
            ]
        );
        assert!(!args.iter().any(|a| a == "-path"));
    }

    #[test]
    fn test_options_follow_roots() {
        let handle = handle();
        let roots = roots();
        let tools = classify_tool_options(
            vec![
                ("auto", None),
                ("prefer", Some("newer".to_string())),
                ("times", Some(String::new())),
            ],
            &HashSet::new(),
        );
        let invocation = Invocation {
            remote_root: remote_root(&handle, &roots, LINKS_DIR),
            local_root: roots.local(),
            tools: &tools,
            paths: &[],
            ignore: &[],
            force: false,
        };

        let args = strings(invocation.args(&handle));
        assert_eq!(
            &args[4..],
            ["-auto", "-times", "-prefer", "newer", "-sshargs", "-p 22 "]
        );
    }

    #[test]
    fn test_paths_keep_order() {
        let handle = handle();
        let roots = roots();
        let tools = ToolOptions::default();
        let paths = vec!["a".to_string(), "b".to_string()];
        let invocation = Invocation {
            remote_root: remote_root(&handle, &roots, DATA_DIR),
            local_root: roots.local(),
            tools: &tools,
            paths: &paths,
            ignore: &[],
            force: false,
        };

        let args = strings(invocation.args(&handle));
        assert_eq!(&args[args.len() - 4..], ["-path", "a", "-path", "b"]);
        assert_eq!(args.iter().filter(|a| *a == "-path").count(), 2);
    }

    #[test]
    fn test_ignore_wraps_below_path() {
        let handle = handle();
        let roots = roots();
        let tools = ToolOptions::default();
        let ignore = vec!["photos/2024".to_string()];
        let invocation = Invocation {
            remote_root: remote_root(&handle, &roots, LINKS_DIR),
            local_root: roots.local(),
            tools: &tools,
            paths: &[],
            ignore: &ignore,
            force: false,
        };

        let args = strings(invocation.args(&handle));
        assert_eq!(&args[args.len() - 2..], ["-ignore", "BelowPath photos/2024"]);
    }

    #[test]
    fn test_force_comes_last() {
        let handle = handle();
        let roots = roots();
        let tools = ToolOptions::default();
        let paths = vec!["a".to_string()];
        let ignore = vec!["b".to_string()];
        let invocation = Invocation {
            remote_root: remote_root(&handle, &roots, DATA_DIR),
            local_root: roots.local(),
            tools: &tools,
            paths: &paths,
            ignore: &ignore,
            force: true,
        };

        let args = strings(invocation.args(&handle));
        let force_at = args.iter().position(|a| a == "-force").unwrap();
        let last_ignore = args.iter().rposition(|a| a == "-ignore").unwrap();
        let last_path = args.iter().rposition(|a| a == "-path").unwrap();
        assert!(force_at > last_ignore && force_at > last_path);
        assert_eq!(
            &args[force_at..],
            ["-force", "ssh://alice@10.0.0.5/remoteproj/.data", "-batch"]
        );
    }

    #[test]
    fn test_args_are_stable_between_calls() {
        let handle = handle();
        let roots = roots();
        let tools = ToolOptions::default();
        let paths = vec!["x".to_string()];
        let invocation = Invocation {
            remote_root: remote_root(&handle, &roots, DATA_DIR),
            local_root: roots.local(),
            tools: &tools,
            paths: &paths,
            ignore: &[],
            force: true,
        };
        assert_eq!(invocation.args(&handle), invocation.args(&handle));
    }

    #[test]
    fn test_sshargs_with_options() {
        let server = ServerConfig::validate("alice", None, Some("h"), Some(8443))
            .unwrap()
            .with_ssh_options(vec!["-i".into(), "/k".into()]);
        let handle = ConnectionHandle::new(&server, PathBuf::from("/tmp/c"));
        assert_eq!(sshargs(&handle), "-p 8443 -i /k ");
    }

    #[test]
    fn test_remote_root_trims_trailing_slash() {
        let roots = RootsConfig::new("/l", "files/").unwrap();
        assert_eq!(
            remote_root(&handle(), &roots, LINKS_DIR),
            "ssh://alice@10.0.0.5/files/links"
        );
    }

    #[test]
    fn test_unison_status_from_code() {
        assert_eq!(UnisonStatus::from_code(0), UnisonStatus::Success);
        assert_eq!(UnisonStatus::from_code(1), UnisonStatus::Skipped);
        assert_eq!(UnisonStatus::from_code(2), UnisonStatus::NonFatal);
        assert_eq!(UnisonStatus::from_code(3), UnisonStatus::Fatal);
        assert_eq!(UnisonStatus::from_code(42), UnisonStatus::Unknown(42));
        assert_eq!(UnisonStatus::Unknown(42).exit_code(), 3);
        assert!(UnisonStatus::Skipped < UnisonStatus::NonFatal);
    }

    #[test]
    fn test_unison_status_display() {
        assert_eq!(UnisonStatus::Success.to_string(), "up to date");
        assert_eq!(UnisonStatus::Skipped.to_string(), "some items skipped");
        assert_eq!(UnisonStatus::Unknown(9).to_string(), "unknown status 9");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_status_passed_through() {
        let engine = SyncOrchestrator::new().with_program("false");
        let status = engine
            .sync_links(&handle(), &roots(), &ToolOptions::default(), &[])
            .await
            .unwrap();
        assert_eq!(status.code(), Some(1));
    }

    #[test]
    fn test_process_timeout_becomes_sync_timeout() {
        let err = SyncError::from(ProcessError::Timeout {
            program: "unison".to_string(),
            timeout: Duration::from_secs(7),
        });
        assert!(matches!(err, SyncError::Timeout(t) if t == Duration::from_secs(7)));
        assert_eq!(err.to_string(), "Sync timed out after 7 seconds");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let engine = SyncOrchestrator::new().with_program("/nonexistent/unison");
        let err = engine
            .sync_data(&handle(), &roots(), &ToolOptions::default(), &[], false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SpawnFailed(_)));
    }
}
