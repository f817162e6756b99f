//! Choosing which paths take part in a sync.
//!
//! Paths come either from an interactive nnn session rooted at the local root
//! (`nnn -H -p - <root>` prints the picked absolute paths on stdout) or from the
//! `paths` cache file left by a previous run. Both keep their source order and
//! neither deduplicates; unison does not mind repeated `-path` arguments.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::process::{ProcessError, ScopedProcess};

/// Name of the selection cache inside the cache directory.
pub const CACHE_FILE_NAME: &str = "paths";

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("{}: {reason}", .path.display())]
    InvalidDirectory { path: PathBuf, reason: &'static str },

    #[error("Choice timeout expired after {} seconds", .0.as_secs())]
    SelectionTimeout(Duration),

    #[error("File selection failed: {0}")]
    SelectionFailed(String),

    #[error("Cannot read path cache {}: {source}", .path.display())]
    CacheUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write path cache {}: {source}", .path.display())]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Process(ProcessError),
}

/// Resolves the relative paths to synchronise.
#[derive(Debug, Clone)]
pub struct PathSelector {
    local_root: PathBuf,
    cache_file: PathBuf,
    program: PathBuf,
}

impl PathSelector {
    /// Check that both directories and the cache file exist.
    ///
    /// The local root is stored in canonical form, so relative and symlinked
    /// roots still match the absolute paths the browser prints.
    pub fn initialize(local_root: &Path, cache_dir: &Path) -> Result<Self, SelectionError> {
        if !local_root.is_dir() {
            return Err(SelectionError::InvalidDirectory {
                path: local_root.to_path_buf(),
                reason: "local root is not a directory",
            });
        }
        if !cache_dir.is_dir() {
            return Err(SelectionError::InvalidDirectory {
                path: cache_dir.to_path_buf(),
                reason: "cache directory is not a directory",
            });
        }
        let cache_file = cache_dir.join(CACHE_FILE_NAME);
        if !cache_file.is_file() {
            return Err(SelectionError::InvalidDirectory {
                path: cache_file,
                reason: "path cache file does not exist",
            });
        }

        let local_root = std::fs::canonicalize(local_root).map_err(|_| {
            SelectionError::InvalidDirectory {
                path: local_root.to_path_buf(),
                reason: "local root cannot be resolved",
            }
        })?;

        Ok(Self {
            local_root,
            cache_file,
            program: PathBuf::from("nnn"),
        })
    }

    /// Use a specific file browser binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn cache_file(&self) -> &Path {
        &self.cache_file
    }

    /// Let the user pick paths in nnn, giving up after `timeout`.
    pub async fn select_interactively(
        &self,
        timeout: Duration,
    ) -> Result<Vec<String>, SelectionError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-H")
            .args(["-p", "-"])
            .arg(&self.local_root)
            .stdout(Stdio::piped());

        let mut process = ScopedProcess::spawn(&mut cmd).map_err(SelectionError::Process)?;
        let mut stdout = process
            .take_stdout()
            .ok_or_else(|| SelectionError::SelectionFailed("no output stream".to_string()))?;

        // Drain stdout while waiting so a long selection cannot fill the pipe.
        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });

        let status = match process.wait_for(timeout).await {
            Ok(status) => status,
            Err(ProcessError::Timeout { timeout, .. }) => {
                reader.abort();
                return Err(SelectionError::SelectionTimeout(timeout));
            }
            Err(e) => {
                reader.abort();
                return Err(SelectionError::Process(e));
            }
        };

        if !status.success() {
            reader.abort();
            return Err(SelectionError::SelectionFailed(match status.code() {
                Some(code) => format!("browser exited with status {code}"),
                None => "browser was killed by a signal".to_string(),
            }));
        }

        let output = reader
            .await
            .map_err(|e| SelectionError::SelectionFailed(e.to_string()))?
            .map_err(|e| SelectionError::SelectionFailed(e.to_string()))?;
        let output = String::from_utf8_lossy(&output);

        let root = self.local_root.to_string_lossy();
        let paths: Vec<String> = output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| relative_to_root(&root, line))
            .collect();

        tracing::info!(count = paths.len(), "paths selected");
        Ok(paths)
    }

    /// Read the cached selection.
    ///
    /// The single empty entry after a final newline is dropped; an empty
    /// file gives an empty selection.
    pub fn load_cached(&self) -> Result<Vec<String>, SelectionError> {
        let content = std::fs::read_to_string(&self.cache_file).map_err(|source| {
            SelectionError::CacheUnreadable {
                path: self.cache_file.clone(),
                source,
            }
        })?;
        let paths = split_cache(&content);
        tracing::debug!(count = paths.len(), cache = %self.cache_file.display(), "loaded cached paths");
        Ok(paths)
    }

    /// Replace the cached selection, one path per line.
    pub fn store(&self, paths: &[String]) -> Result<(), SelectionError> {
        let mut content = paths.join("\n");
        if !paths.is_empty() {
            content.push('\n');
        }
        let tmp = self.cache_file.with_extension("tmp");
        std::fs::write(&tmp, content)
            .and_then(|()| std::fs::rename(&tmp, &self.cache_file))
            .map_err(|source| SelectionError::CacheWrite {
                path: self.cache_file.clone(),
                source,
            })
    }
}

/// Create the cache directory and an empty `paths` file when missing.
pub fn prepare_cache_dir(cache_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(cache_dir)?;
    let cache_file = cache_dir.join(CACHE_FILE_NAME);
    if !cache_file.exists() {
        std::fs::write(&cache_file, "")?;
        tracing::info!(cache = %cache_file.display(), "created empty path cache");
    }
    Ok(())
}

fn split_cache(content: &str) -> Vec<String> {
    let mut paths: Vec<String> = content.split('\n').map(str::to_string).collect();
    if paths.last().is_some_and(|p| p.is_empty()) {
        paths.pop();
    }
    paths
}

/// Strip the root prefix and any leading separator from an absolute path.
///
/// Paths outside the root are returned unchanged.
pub fn relative_to_root(root: &str, path: &str) -> String {
    match path.strip_prefix(root) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || root.ends_with('/') => {
            rest.trim_start_matches('/').to_string()
        }
        _ => {
            tracing::warn!(root = %root, path = %path, "selected path is outside the local root");
            path.to_string()
        }
    }
}
