//! Load config from file and environment.

use std::net::{IpAddr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use treeshare_core::{Capabilities, Identifier, IdentifierError};

/// Node configuration. File: `--config`, ~/.config/treeshare/config.toml or /etc/treeshare/config.toml.
/// Env overrides: TREESHARE_USER, TREESHARE_IDENTIFIER, TREESHARE_GROUP, TREESHARE_PORT, TREESHARE_ROOT_DIR,
/// TREESHARE_DOWNLOAD_DIR, TREESHARE_SEARCH, TREESHARE_DOWNLOAD.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// User half of the identifier (default $USER).
    #[serde(default = "default_user")]
    pub user: String,
    /// Full `user@host` override; when set, `user` and the system hostname are ignored.
    #[serde(default)]
    pub identifier: Option<Identifier>,
    /// Multicast group, IPv4 or IPv6 (default ff02::4105:4105).
    #[serde(default = "default_group")]
    pub group: IpAddr,
    /// Multicast UDP port (default 4105).
    #[serde(default = "default_port")]
    pub port: u16,
    /// IPv6 interface index for joining and sending; 0 lets the OS pick.
    #[serde(default)]
    pub interface: u32,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    /// Do not loop our own datagrams back to us.
    #[serde(default)]
    pub suppress_loopback: bool,
    #[serde(default = "default_advertisement_interval_ms")]
    pub advertisement_interval_ms: u64,
    #[serde(default = "default_max_advertisement_age_ms")]
    pub max_advertisement_age_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Datagram byte budget, both directions.
    #[serde(default = "default_maximum_message_size")]
    pub maximum_message_size: usize,
    #[serde(default = "default_true")]
    pub search: bool,
    #[serde(default = "default_true")]
    pub download: bool,
    /// Root of the shared tree. Searches never leave it.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Received files land in `<download_dir>/<host>/`.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Accept, connect and per-read timeout for file transfers.
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    /// Concurrent file transfer sessions, both directions.
    #[serde(default = "default_max_transfers")]
    pub max_transfers: usize,
    /// How long `search` listens for results; there is no end-of-results marker.
    #[serde(default = "default_search_window_ms")]
    pub search_window_ms: u64,
    /// Replies to requests older than this are dropped.
    #[serde(default = "default_request_ttl_ms")]
    pub request_ttl_ms: u64,
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "treeshare".to_string())
}
fn default_group() -> IpAddr {
    IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x4105, 0x4105))
}
fn default_port() -> u16 {
    4105
}
fn default_ttl() -> u32 {
    2
}
fn default_advertisement_interval_ms() -> u64 {
    5000
}
fn default_max_advertisement_age_ms() -> u64 {
    15000
}
fn default_sweep_interval_ms() -> u64 {
    1000
}
fn default_maximum_message_size() -> usize {
    500
}
fn default_true() -> bool {
    true
}
fn default_root_dir() -> PathBuf {
    PathBuf::from("root_dir")
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_socket_timeout_ms() -> u64 {
    10_000
}
fn default_max_transfers() -> usize {
    4
}
fn default_search_window_ms() -> u64 {
    3000
}
fn default_request_ttl_ms() -> u64 {
    30_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: default_user(),
            identifier: None,
            group: default_group(),
            port: default_port(),
            interface: 0,
            ttl: default_ttl(),
            suppress_loopback: false,
            advertisement_interval_ms: default_advertisement_interval_ms(),
            max_advertisement_age_ms: default_max_advertisement_age_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            maximum_message_size: default_maximum_message_size(),
            search: true,
            download: true,
            root_dir: default_root_dir(),
            download_dir: default_download_dir(),
            socket_timeout_ms: default_socket_timeout_ms(),
            max_transfers: default_max_transfers(),
            search_window_ms: default_search_window_ms(),
            request_ttl_ms: default_request_ttl_ms(),
        }
    }
}

impl Config {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            search: self.search,
            download: self.download,
        }
    }

    /// The configured identifier, else `user@<this host>`.
    pub fn identifier(&self) -> Result<Identifier, ConfigError> {
        if let Some(id) = &self.identifier {
            return Ok(id.clone());
        }
        let host = hostname::get().map_err(ConfigError::Hostname)?;
        Ok(Identifier::new(&self.user, &host.to_string_lossy())?)
    }

    pub fn advertisement_interval(&self) -> Duration {
        Duration::from_millis(self.advertisement_interval_ms)
    }
    pub fn max_advertisement_age(&self) -> Duration {
        Duration::from_millis(self.max_advertisement_age_ms)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }
    pub fn search_window(&self) -> Duration {
        Duration::from_millis(self.search_window_ms)
    }
    pub fn request_ttl(&self) -> Duration {
        Duration::from_millis(self.request_ttl_ms)
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if !self.group.is_multicast() {
            return Err(ConfigError::Invalid(format!(
                "group {} is not a multicast address",
                self.group
            )));
        }
        if self.max_transfers == 0 {
            return Err(ConfigError::Invalid("max_transfers must be at least 1".into()));
        }
        for (name, ms) in [
            ("advertisement_interval_ms", self.advertisement_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ] {
            if ms == 0 {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        Ok(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{0}")]
    Invalid(String),
    #[error("cannot determine hostname: {0}")]
    Hostname(std::io::Error),
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

/// Load config: explicit file if given (must exist), else the first default path present,
/// else defaults; then env vars on top.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let c = match explicit {
        Some(p) => parse_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => parse_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(c, |k| std::env::var(k).ok()).validate()
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("TREESHARE_USER") {
        c.user = s;
    }
    if let Some(id) = var("TREESHARE_IDENTIFIER").and_then(|s| Identifier::parse(&s).ok()) {
        c.identifier = Some(id);
    }
    if let Some(g) = var("TREESHARE_GROUP").and_then(|s| s.parse().ok()) {
        c.group = g;
    }
    if let Some(p) = var("TREESHARE_PORT").and_then(|s| s.parse().ok()) {
        c.port = p;
    }
    if let Some(s) = var("TREESHARE_ROOT_DIR") {
        c.root_dir = PathBuf::from(s);
    }
    if let Some(s) = var("TREESHARE_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(s);
    }
    if let Some(b) = var("TREESHARE_SEARCH").and_then(|s| s.parse().ok()) {
        c.search = b;
    }
    if let Some(b) = var("TREESHARE_DOWNLOAD").and_then(|s| s.parse().ok()) {
        c.download = b;
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/treeshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/treeshare/config.toml"));
    out
}

fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
