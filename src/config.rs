//! Configuration model for unisync.
//!
//! Configuration lives in `~/.config/unisync/config.toml`:
//!
//! ```toml
//! [Server]
//! user = "alice"
//! ip = "10.0.0.5"            # or: hostname = "files.example.org"
//! port = 8443
//! sshargs = "-i ~/.ssh/id_files"
//!
//! [Roots]
//! local = "~/files"
//! remote = "files"
//!
//! [Unison]
//! auto = true                 # valueless flag, emitted as `-auto`
//! times = ""                  # also a flag
//! log = "false"               # keyed option, emitted as `-log false`
//! ```
//!
//! `Server` and `Roots` may be omitted, in which case their keys are read from
//! the top level of the file. Keys in an optional `[DEFAULT]` table act as
//! fallbacks for `Server`/`Roots` and are never classified as unison options.
//!
//! Everything is validated once in [`RawConfig::validate`]; the resulting
//! [`Config`] is never mutated afterwards.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use serde::Deserialize;
use thiserror::Error;
use toml::{Table, Value};

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CHOICE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_CONTROL_PATH: &str = "~/.ssh/control_%C";
pub const DEFAULT_CACHE_DIR: &str = "~/.unisync";

const SERVER_SECTION: &str = "Server";
const ROOTS_SECTION: &str = "Roots";
const UNISON_SECTION: &str = "Unison";
const OTHER_SECTION: &str = "Other";
const TOOLS_SECTION: &str = "Tools";
const DEFAULT_SECTION: &str = "DEFAULT";

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Missing required configuration key `{0}`")]
    Missing(&'static str),

    #[error("No configuration file found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Required program `{tool}` not found ({program})")]
    ToolNotFound { tool: &'static str, program: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// Identity and reachability of the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    user: String,
    ip: Option<IpAddr>,
    hostname: Option<String>,
    port: u16,
    ssh_options: Vec<String>,
}

impl ServerConfig {
    /// Validate server fields.
    ///
    /// Empty strings count as absent. At least one of `ip`/`hostname` must be
    /// given and a non-empty `ip` must be an IPv4 or IPv6 literal. A port of
    /// `None` means [`DEFAULT_PORT`].
    pub fn validate(
        user: &str,
        ip: Option<&str>,
        hostname: Option<&str>,
        port: Option<u16>,
    ) -> Result<Self, ConfigError> {
        if user.trim().is_empty() {
            return Err(ConfigError::Missing("user"));
        }

        let ip = ip.filter(|s| !s.is_empty());
        let hostname = hostname.filter(|s| !s.is_empty());
        if ip.is_none() && hostname.is_none() {
            return Err(ConfigError::invalid(
                "ip",
                "a remote must be provided (ip or hostname)",
            ));
        }

        let ip = ip
            .map(|raw| {
                raw.parse::<IpAddr>()
                    .map_err(|_| ConfigError::invalid("ip", format!("`{raw}` is not an IP address")))
            })
            .transpose()?;

        let port = port.unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(ConfigError::invalid("port", "must be a positive integer"));
        }

        Ok(Self {
            user: user.to_string(),
            ip,
            hostname: hostname.map(str::to_string),
            port,
            ssh_options: Vec::new(),
        })
    }

    /// Extra arguments handed to every ssh invocation.
    pub fn with_ssh_options(mut self, options: Vec<String>) -> Self {
        self.ssh_options = options;
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ssh_options(&self) -> &[String] {
        &self.ssh_options
    }

    /// Host to connect to: the IP address when set, otherwise the hostname.
    pub fn target(&self) -> String {
        match (&self.ip, &self.hostname) {
            (Some(ip), _) => ip.to_string(),
            (None, Some(host)) => host.clone(),
            // validate() guarantees one of the two.
            (None, None) => String::new(),
        }
    }

    /// Host as it appears inside a URI authority (IPv6 literals bracketed).
    pub fn uri_host(&self) -> String {
        match self.ip {
            Some(IpAddr::V6(v6)) => format!("[{v6}]"),
            _ => self.target(),
        }
    }

    /// `user@target` destination understood by ssh.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.target())
    }
}

// =============================================================================
// Roots
// =============================================================================

/// The two top-level directories being synchronised.
///
/// Existence is not checked here; the path selector does that lazily.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootsConfig {
    local: PathBuf,
    remote: String,
}

impl RootsConfig {
    pub fn new(local: &str, remote: &str) -> Result<Self, ConfigError> {
        if local.is_empty() {
            return Err(ConfigError::Missing("local"));
        }
        if remote.is_empty() {
            return Err(ConfigError::Missing("remote"));
        }
        Ok(Self {
            local: expand_tilde(local),
            remote: remote.to_string(),
        })
    }

    pub fn local(&self) -> &Path {
        &self.local
    }

    /// Remote root, relative to the remote user's home unless absolute.
    pub fn remote(&self) -> &str {
        &self.remote
    }
}

// =============================================================================
// Unison options
// =============================================================================

/// Pass-through options for unison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOptions {
    flags: IndexSet<String>,
    keyed: IndexMap<String, String>,
}

impl ToolOptions {
    /// Valueless switches, emitted as `-name`.
    pub fn flags(&self) -> &IndexSet<String> {
        &self.flags
    }

    /// Name/value pairs, emitted as `-name value`.
    pub fn keyed(&self) -> &IndexMap<String, String> {
        &self.keyed
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.keyed.is_empty()
    }
}

/// Split raw unison entries into flags and keyed options.
///
/// Keys present in `default_keys` are inherited template noise and skipped.
/// An absent value and an empty value both make a flag. Insertion order is
/// kept and duplicate flags collapse into one.
pub fn classify_tool_options<I, K>(raw: I, default_keys: &HashSet<String>) -> ToolOptions
where
    I: IntoIterator<Item = (K, Option<String>)>,
    K: Into<String>,
{
    let mut options = ToolOptions::default();
    for (key, value) in raw {
        let key = key.into();
        if default_keys.contains(&key) {
            continue;
        }
        match value {
            Some(value) if !value.is_empty() => {
                options.keyed.insert(key, value);
            }
            _ => {
                options.flags.insert(key);
            }
        }
    }
    options
}

// =============================================================================
// Cache, session and programs
// =============================================================================

/// Directory holding persisted state (the `paths` selection cache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLocation {
    pub dir: PathBuf,
}

impl Default for CacheLocation {
    fn default() -> Self {
        Self {
            dir: expand_tilde(DEFAULT_CACHE_DIR),
        }
    }
}

/// Timeouts and the ssh control socket template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub choice_timeout: Duration,
    /// Bound on each unison run; `None` waits as long as unison runs.
    pub transfer_timeout: Option<Duration>,
    pub control_path: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            choice_timeout: Duration::from_secs(DEFAULT_CHOICE_TIMEOUT_SECS),
            transfer_timeout: None,
            control_path: DEFAULT_CONTROL_PATH.to_string(),
        }
    }
}

/// External programs driven by unisync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPrograms {
    pub ssh: PathBuf,
    pub unison: PathBuf,
    pub nnn: PathBuf,
}

impl Default for ToolPrograms {
    fn default() -> Self {
        Self {
            ssh: PathBuf::from("ssh"),
            unison: PathBuf::from("unison"),
            nnn: PathBuf::from("nnn"),
        }
    }
}

impl ToolPrograms {
    /// Resolve every program through `PATH`, failing on the first one missing.
    ///
    /// The browser is only required when `need_browser` is set.
    pub fn locate(&self, need_browser: bool) -> Result<Self, ConfigError> {
        let find = |tool: &'static str, program: &Path| {
            which::which(program).map_err(|_| ConfigError::ToolNotFound {
                tool,
                program: program.display().to_string(),
            })
        };
        Ok(Self {
            ssh: find("ssh", &self.ssh)?,
            unison: find("unison", &self.unison)?,
            nnn: if need_browser {
                find("nnn", &self.nnn)?
            } else {
                self.nnn.clone()
            },
        })
    }
}

/// Fully validated configuration for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub server: ServerConfig,
    pub roots: RootsConfig,
    pub tools: ToolOptions,
    pub cache: CacheLocation,
    pub session: SessionSettings,
    pub programs: ToolPrograms,
}

// =============================================================================
// Loading
// =============================================================================

/// Values supplied on the command line, applied on top of the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub local: Option<String>,
    pub remote: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct OtherSection {
    cache_dir: Option<String>,
    connect_timeout: Option<u64>,
    choice_timeout: Option<u64>,
    transfer_timeout: Option<u64>,
    control_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ToolsSection {
    ssh: Option<String>,
    unison: Option<String>,
    nnn: Option<String>,
}

/// Configuration as read from the file, before validation.
#[derive(Debug, Clone, Default)]
pub struct RawConfig {
    pub user: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<i64>,
    pub sshargs: Option<String>,
    pub local: Option<String>,
    pub remote: Option<String>,
    pub unison: Vec<(String, Option<String>)>,
    pub default_keys: HashSet<String>,
    other: OtherSection,
    tools: ToolsSection,
}

impl RawConfig {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: Table = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded configuration file");
        Self::from_table(&doc)
    }

    /// Build from an already parsed TOML document.
    pub fn from_table(doc: &Table) -> Result<Self, ConfigError> {
        let defaults = match doc.get(DEFAULT_SECTION) {
            Some(Value::Table(t)) => t.clone(),
            Some(_) => return Err(ConfigError::invalid("DEFAULT", "must be a table")),
            None => Table::new(),
        };
        let server = section_or_top(doc, SERVER_SECTION);
        let roots = section_or_top(doc, ROOTS_SECTION);

        let lookup = |table: &Table, key: &'static str| -> Result<Option<String>, ConfigError> {
            match table.get(key).or_else(|| defaults.get(key)) {
                None => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(_) => Err(ConfigError::invalid(key, "expected a string")),
            }
        };

        let port = match server.get("port").or_else(|| defaults.get("port")) {
            None => None,
            Some(Value::Integer(n)) => Some(*n),
            Some(Value::String(s)) => Some(
                s.trim()
                    .parse()
                    .map_err(|_| ConfigError::invalid("port", format!("`{s}` is not an integer")))?,
            ),
            Some(_) => return Err(ConfigError::invalid("port", "expected an integer")),
        };

        let unison = match doc.get(UNISON_SECTION) {
            None => Vec::new(),
            Some(Value::Table(t)) => unison_entries(t)?,
            Some(_) => return Err(ConfigError::invalid("Unison", "must be a table")),
        };

        Ok(Self {
            user: lookup(server, "user")?,
            ip: lookup(server, "ip")?,
            hostname: lookup(server, "hostname")?,
            port,
            sshargs: lookup(server, "sshargs")?,
            local: lookup(roots, "local")?,
            remote: lookup(roots, "remote")?,
            unison,
            default_keys: defaults.keys().cloned().collect(),
            other: typed_section(doc, OTHER_SECTION)?,
            tools: typed_section(doc, TOOLS_SECTION)?,
        })
    }

    /// Apply command-line values. Choosing one addressing mode clears the other.
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(local) = &overrides.local {
            self.local = Some(local.clone());
        }
        if let Some(remote) = &overrides.remote {
            self.remote = Some(remote.clone());
        }
        if let Some(ip) = &overrides.ip {
            self.ip = Some(ip.clone());
            self.hostname = None;
        }
        if let Some(hostname) = &overrides.hostname {
            self.hostname = Some(hostname.clone());
            self.ip = None;
        }
    }

    /// Validate into an immutable [`Config`].
    pub fn validate(self) -> Result<Config, ConfigError> {
        let port = self
            .port
            .map(|p| {
                u16::try_from(p)
                    .map_err(|_| ConfigError::invalid("port", format!("{p} is out of range")))
            })
            .transpose()?;
        let user = self.user.ok_or(ConfigError::Missing("user"))?;
        let ssh_options = match &self.sshargs {
            Some(raw) => shell_words::split(raw)
                .map_err(|e| ConfigError::invalid("sshargs", e.to_string()))?,
            None => Vec::new(),
        };
        let server = ServerConfig::validate(
            &user,
            self.ip.as_deref(),
            self.hostname.as_deref(),
            port,
        )?
        .with_ssh_options(ssh_options);

        let roots = RootsConfig::new(
            self.local.as_deref().ok_or(ConfigError::Missing("local"))?,
            self.remote.as_deref().ok_or(ConfigError::Missing("remote"))?,
        )?;

        let tools = classify_tool_options(self.unison, &self.default_keys);

        let cache = match self.other.cache_dir.as_deref() {
            Some(dir) if !dir.is_empty() => CacheLocation {
                dir: expand_tilde(dir),
            },
            _ => CacheLocation::default(),
        };

        let mut session = SessionSettings::default();
        if let Some(secs) = self.other.connect_timeout {
            session.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.other.choice_timeout {
            session.choice_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.other.transfer_timeout {
            if secs == 0 {
                return Err(ConfigError::invalid(
                    "transfer_timeout",
                    "must be a positive number of seconds",
                ));
            }
            session.transfer_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(path) = self.other.control_path.filter(|p| !p.is_empty()) {
            session.control_path = path;
        }

        let defaults = ToolPrograms::default();
        let programs = ToolPrograms {
            ssh: self.tools.ssh.map(|p| expand_tilde(&p)).unwrap_or(defaults.ssh),
            unison: self
                .tools
                .unison
                .map(|p| expand_tilde(&p))
                .unwrap_or(defaults.unison),
            nnn: self.tools.nnn.map(|p| expand_tilde(&p)).unwrap_or(defaults.nnn),
        };

        Ok(Config {
            server,
            roots,
            tools,
            cache,
            session,
            programs,
        })
    }
}

impl Config {
    /// Load, override and validate in one step.
    pub fn load(path: &Path, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let mut raw = RawConfig::load(path)?;
        raw.apply(overrides);
        raw.validate()
    }
}

/// Default configuration file location (`<config_dir>/unisync/config.toml`).
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| expand_tilde("~/.config"))
        .join("unisync")
        .join("config.toml")
}

/// Pick the configuration file: the explicit path if it is a file, else the default one.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        tracing::warn!(path = %path.display(), "configuration file not found, trying default location");
    }
    let default = default_config_path();
    if default.is_file() {
        Ok(default)
    } else {
        Err(ConfigError::NotFound(
            explicit.map(Path::to_path_buf).unwrap_or(default),
        ))
    }
}

/// Expand a leading `~` or `~/` using the local home directory.
///
/// `~user/...` and paths without a tilde are returned unchanged.
pub fn expand_tilde(path: &str) -> PathBuf {
    let Some(home) = dirs::home_dir() else {
        return PathBuf::from(path);
    };
    if path == "~" {
        home
    } else if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(path)
    }
}

fn section_or_top<'a>(doc: &'a Table, name: &str) -> &'a Table {
    match doc.get(name) {
        Some(Value::Table(t)) => t,
        _ => doc,
    }
}

fn typed_section<T>(doc: &Table, name: &'static str) -> Result<T, ConfigError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match doc.get(name) {
        None => Ok(T::default()),
        Some(value) => value
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::invalid(name, e.to_string())),
    }
}

/// TOML has no valueless keys: `true` stands for one, `false` drops the key.
fn unison_entries(table: &Table) -> Result<Vec<(String, Option<String>)>, ConfigError> {
    let mut entries = Vec::with_capacity(table.len());
    for (key, value) in table {
        let value = match value {
            Value::Boolean(true) => None,
            Value::Boolean(false) => continue,
            Value::String(s) => Some(s.clone()),
            Value::Integer(n) => Some(n.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Datetime(d) => Some(d.to_string()),
            Value::Array(_) | Value::Table(_) => {
                return Err(ConfigError::invalid(
                    "Unison",
                    format!("option `{key}` must be a scalar"),
                ));
            }
        };
        entries.push((key.clone(), value));
    }
    Ok(entries)
}
