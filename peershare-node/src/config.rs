//! Load config from file and environment, then let the command line override it.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Node configuration. File: ~/.config/peershare/config.toml or /etc/peershare/config.toml.
/// Env overrides: PEERSHARE_LISTEN_PORT, PEERSHARE_BIND_IP, PEERSHARE_ADVERTISE_IP,
/// PEERSHARE_DATA_DIR, PEERSHARE_POLL_INTERVAL_MS, PEERSHARE_LOG_LEVEL.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen port (default 4545).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Address the listener binds to (default 0.0.0.0).
    #[serde(default = "default_bind_ip")]
    pub bind_ip: Ipv4Addr,
    /// Address reported by MYIP and used for self-connect checks. Probed when unset.
    #[serde(default)]
    pub advertise_ip: Option<Ipv4Addr>,
    /// Directory uploads are written to and downloads are served from.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Upper bound on one reactor wait, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Outgoing connect timeout, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// tracing filter used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_port() -> u16 {
    4545
}
fn default_bind_ip() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            bind_ip: default_bind_ip(),
            advertise_ip: None,
            data_dir: default_data_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (explicit path or the first
/// standard path that exists), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

/// Apply environment overrides. Values that do not parse are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("PEERSHARE_LISTEN_PORT").and_then(|s| s.parse().ok()) {
        c.listen_port = p;
    }
    if let Some(ip) = var("PEERSHARE_BIND_IP").and_then(|s| s.parse().ok()) {
        c.bind_ip = ip;
    }
    if let Some(ip) = var("PEERSHARE_ADVERTISE_IP").and_then(|s| s.parse().ok()) {
        c.advertise_ip = Some(ip);
    }
    if let Some(dir) = var("PEERSHARE_DATA_DIR").filter(|s| !s.is_empty()) {
        c.data_dir = PathBuf::from(dir);
    }
    if let Some(ms) = var("PEERSHARE_POLL_INTERVAL_MS").and_then(|s| s.parse().ok()) {
        c.poll_interval_ms = ms;
    }
    if let Some(level) = var("PEERSHARE_LOG_LEVEL").filter(|s| !s.is_empty()) {
        c.log_level = level;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peershare/config.toml"));
    }
    out.push(PathBuf::from("/etc/peershare/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
