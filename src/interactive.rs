//! Terminal prompts and the end-of-run summary.
//!
//! A forced sync lets the remote side overwrite local changes, so it asks for
//! confirmation first unless `--yes` was given. The summary printed at the end
//! of a run looks like:
//!
//! ```text
//! data   ✓ up to date
//! links  ! some items skipped
//! ssh    ✓ closed
//! ```

use std::fmt;
use std::process::ExitStatus;

use colored::Colorize;
use dialoguer::{Confirm, theme::ColorfulTheme};

use crate::remote::UnisonStatus;

// =============================================================================
// Confirmation Prompts
// =============================================================================

/// Ask a yes/no question.
pub fn confirm_action(message: &str, default: bool) -> Result<bool, InteractiveError> {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(message)
        .default(default)
        .interact_opt()
        .map_err(|e| InteractiveError::IoError(e.to_string()))?
        .ok_or(InteractiveError::Cancelled)
}

/// Ask for confirmation with a detailed explanation.
pub fn confirm_with_details(
    action: &str,
    details: &[String],
    default: bool,
) -> Result<bool, InteractiveError> {
    eprintln!();
    eprintln!("{}", action.bold());
    for detail in details {
        eprintln!("  • {}", detail);
    }
    eprintln!();

    confirm_action("Proceed?", default)
}

/// Confirm that `remote_root` may overwrite the given local paths.
pub fn confirm_force(remote_root: &str, paths: &[String]) -> Result<bool, InteractiveError> {
    confirm_with_details(
        &format!("Remote changes from {remote_root} will overwrite local changes in:"),
        paths,
        false,
    )
}

// =============================================================================
// Summary
// =============================================================================

/// What happened during one run.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// Status of the data sync, `None` when it did not run.
    pub data: Option<UnisonStatus>,
    /// Status of the links sync, `None` when it did not run.
    pub links: Option<UnisonStatus>,
    /// Status of the master close call, `None` when it was not attempted.
    pub close: Option<ExitStatus>,
    /// Number of paths in the selection.
    pub selected: usize,
}

impl SessionReport {
    /// Worst unison status of the run, mapped to a process exit code.
    pub fn exit_code(&self) -> u8 {
        [self.data, self.links]
            .into_iter()
            .flatten()
            .map(|s| s.exit_code())
            .max()
            .unwrap_or(0)
    }

    /// Render the summary lines.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "{:<6} {} selected",
            "paths",
            self.selected.to_string().bold()
        ));
        for (label, status) in [("data", self.data), ("links", self.links)] {
            let line = match status {
                None => format!("{:<6} {}", label, "- skipped".dimmed()),
                Some(s) if s.is_success() => format!("{:<6} {} {}", label, "✓".green(), s),
                Some(s @ UnisonStatus::Skipped) => format!("{:<6} {} {}", label, "!".yellow(), s),
                Some(s) => format!("{:<6} {} {}", label, "✗".red(), s.to_string().red()),
            };
            lines.push(line);
        }
        let close = match self.close {
            None => format!("{:<6} {}", "ssh", "- not closed".dimmed()),
            Some(status) if status.success() => format!("{:<6} {} closed", "ssh", "✓".green()),
            Some(status) => format!(
                "{:<6} {} close returned {}",
                "ssh",
                "⚠".yellow(),
                status.code().map_or_else(|| "a signal".to_string(), |c| c.to_string())
            ),
        };
        lines.push(close);
        lines.join("\n")
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from interactive prompts.
#[derive(Debug)]
pub enum InteractiveError {
    /// User dismissed the prompt
    Cancelled,
    /// IO error during prompt
    IoError(String),
}

impl fmt::Display for InteractiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InteractiveError::Cancelled => write!(f, "Operation cancelled by user"),
            InteractiveError::IoError(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl std::error::Error for InteractiveError {}

// =============================================================================
// Tests
// =============================================================================
