//! unisync: selective file synchronisation with a remote host.
//!
//! A run opens one authenticated ssh master connection, decides which paths
//! to synchronise (interactively in nnn, or from the cached selection), runs
//! unison for the file content and for the links, then closes the master.

pub mod cli;
pub mod config;
pub mod interactive;
pub mod paths;
pub mod process;
pub mod remote;

use std::future::Future;

use anyhow::{Context, Result, bail};

use crate::cli::Cli;
use crate::config::{Config, ToolPrograms, resolve_config_path};
use crate::interactive::{SessionReport, confirm_force};
use crate::paths::{PathSelector, prepare_cache_dir};
use crate::process::interrupted;
use crate::remote::{ConnectionHandle, ConnectionManager, DATA_DIR, SyncOrchestrator, remote_root};

/// Run one synchronisation session and return the exit code to report.
///
/// Ctrl-C at any point after the configuration is loaded aborts the session.
pub async fn run_with(cli: Cli) -> Result<u8> {
    run_until(cli, interrupted()).await
}

/// Like [`run_with`], aborted when `cancel` resolves instead of on Ctrl-C.
///
/// Configuration and directories are checked before anything is spawned.
/// Once the master connection is open it is closed on every path out of
/// this function, cancellation included; a failed close is logged, never
/// raised.
pub async fn run_until<F>(cli: Cli, cancel: F) -> Result<u8>
where
    F: Future<Output = ()>,
{
    tokio::pin!(cancel);

    let config_path = resolve_config_path(cli.config.as_deref())?;
    let config = Config::load(&config_path, &cli.overrides())
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;
    let programs = config.programs.locate(cli.select)?;

    if cli.select {
        prepare_cache_dir(&config.cache.dir).with_context(|| {
            format!("Failed to prepare cache directory {}", config.cache.dir.display())
        })?;
    }
    let selector = PathSelector::initialize(config.roots.local(), &config.cache.dir)?
        .with_program(&programs.nnn);

    let mut manager = ConnectionManager::new().with_program(&programs.ssh);
    let handle = manager
        .open_until(
            &config.server,
            &config.session.control_path,
            config.session.connect_timeout,
            cancel.as_mut(),
        )
        .await
        .context("Failed to open the ssh master connection")?;

    let mut report = SessionReport::default();
    let outcome = tokio::select! {
        outcome = sync_session(&cli, &config, &programs, &selector, &handle, &mut report) => outcome,
        () = cancel.as_mut() => {
            tracing::warn!("interrupted, skipping the remaining steps");
            Err(anyhow::anyhow!("Synchronisation interrupted"))
        }
    };

    match manager.close(handle).await {
        Ok(status) => {
            if !status.success() {
                tracing::warn!(code = ?status.code(), "closing the master connection failed");
            }
            report.close = Some(status);
        }
        Err(e) => tracing::warn!(error = %e, "failed to close the master connection"),
    }

    outcome?;
    eprintln!("{}", report.render());
    Ok(report.exit_code())
}

async fn sync_session(
    cli: &Cli,
    config: &Config,
    programs: &ToolPrograms,
    selector: &PathSelector,
    handle: &ConnectionHandle,
    report: &mut SessionReport,
) -> Result<()> {
    let paths = if cli.select {
        let paths = selector
            .select_interactively(config.session.choice_timeout)
            .await?;
        selector.store(&paths)?;
        paths
    } else {
        selector.load_cached()?
    };
    report.selected = paths.len();

    let mut engine = SyncOrchestrator::new().with_program(&programs.unison);
    if let Some(timeout) = config.session.transfer_timeout {
        engine = engine.with_transfer_timeout(timeout);
    }

    if paths.is_empty() {
        tracing::info!("no paths selected, skipping data sync");
    } else if cli.force
        && !cli.yes
        && !confirm_force(&remote_root(handle, &config.roots, DATA_DIR), &paths)?
    {
        tracing::info!("forced sync declined, skipping data sync");
    } else {
        let status = engine
            .sync_data(handle, &config.roots, &config.tools, &paths, cli.force)
            .await
            .context("Data sync failed to run")?;
        report.data = Some(status.into());
        if status.code().is_none() {
            bail!("Data sync was terminated by a signal");
        }
    }

    if cli.no_links {
        tracing::info!("skipping links sync");
    } else {
        // Selected paths are real files locally; keep their links out of the way.
        let status = engine
            .sync_links(handle, &config.roots, &config.tools, &paths)
            .await
            .context("Links sync failed to run")?;
        report.links = Some(status.into());
    }

    Ok(())
}
