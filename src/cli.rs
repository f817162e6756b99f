use std::path::PathBuf;

use clap::Parser;

use crate::config::ConfigOverrides;

/// File synchronisation application.
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "unisync",
    version,
    about = "File synchronisation application",
    after_help = "Copyright © 2025 Paul Retourné.\nLicense GPLv3+: GNU GPL version 3 or later <https://gnu.org/licenses/gpl.html>."
)]
pub struct Cli {
    /// Local root (overrides the configuration)
    pub local: Option<String>,

    /// Remote root (overrides the configuration)
    pub remote: Option<String>,

    /// IP address of the server
    #[arg(long, conflicts_with = "hostname")]
    pub ip: Option<String>,

    /// Hostname of the server
    #[arg(long)]
    pub hostname: Option<String>,

    /// Path to the configuration file
    #[arg(long, value_name = "path_to_config", env = "UNISYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Pick the paths to synchronise in nnn instead of reusing the last selection
    #[arg(long)]
    pub select: bool,

    /// Let the remote side win every conflict (runs unison in batch mode)
    #[arg(long)]
    pub force: bool,

    /// Do not ask for confirmation before a forced sync
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Skip synchronising the links
    #[arg(long)]
    pub no_links: bool,

    /// Debug logging (when RUST_LOG is not set)
    #[arg(long, short)]
    pub verbose: bool,
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            local: self.local.clone(),
            remote: self.remote.clone(),
            ip: self.ip.clone(),
            hostname: self.hostname.clone(),
        }
    }
}
