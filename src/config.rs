//! Configuration for proxycraft
//!
//! Mirrors the CLI surface described in the external-interfaces section:
//! listen address, CA paths, MITM toggle, upstream proxy, and the
//! dump/output/auto-save knobs consumed by the (out-of-scope) archival
//! sink.

use crate::error::{ProxyError, ProxyResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default in-memory traffic store capacity (entries).
pub const DEFAULT_STORE_CAPACITY: usize = 2000;

/// Mode the inspection surface runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Cli,
    Web,
}

/// Upstream proxy scheme, parsed from `-upstream-proxy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamProxy {
    Http(String),
    Https(String),
    Socks5(String),
}

impl UpstreamProxy {
    pub fn parse(url: &str) -> ProxyResult<Self> {
        if let Some(rest) = url.strip_prefix("http://") {
            Ok(UpstreamProxy::Http(rest.to_string()))
        } else if let Some(rest) = url.strip_prefix("https://") {
            Ok(UpstreamProxy::Https(rest.to_string()))
        } else if let Some(rest) = url.strip_prefix("socks5://") {
            Ok(UpstreamProxy::Socks5(rest.to_string()))
        } else {
            Err(ProxyError::InvalidConfig {
                field: "upstream_proxy".into(),
                value: url.into(),
                reason: "scheme must be http, https, or socks5".into(),
            })
        }
    }

    pub fn authority(&self) -> &str {
        match self {
            UpstreamProxy::Http(a) | UpstreamProxy::Https(a) | UpstreamProxy::Socks5(a) => a,
        }
    }
}

/// CA-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// Directory holding `proxycraft-ca.pem` / `proxycraft-ca-key.pem`.
    pub cert_dir: PathBuf,
    /// Custom root cert path (`-use-ca`), overrides generation when set.
    pub custom_cert_path: Option<PathBuf>,
    /// Custom root key path (`-use-key`).
    pub custom_key_path: Option<PathBuf>,
    pub validity_days: i64,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_dir: default_cert_dir(),
            custom_cert_path: None,
            custom_key_path: None,
            validity_days: 3650,
        }
    }
}

/// Resolve the CA storage directory, honoring `PROXYCRAFT_CERT_DIR`.
pub fn default_cert_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PROXYCRAFT_CERT_DIR") {
        return PathBuf::from(dir);
    }
    dirs_home().join(".proxycraft")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Traffic-store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_STORE_CAPACITY,
        }
    }
}

/// Main configuration structure, the core's only input boundary besides
/// the Archival Sink and Provider Annotator traits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub verbose: bool,
    pub mitm: bool,
    pub mode: Mode,
    pub output_file: Option<PathBuf>,
    pub dump: bool,
    pub auto_save_secs: Option<u64>,
    pub ca: CaConfig,
    pub store: StoreConfig,
    #[serde(skip)]
    pub upstream_proxy: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8080,
            verbose: false,
            mitm: false,
            mode: Mode::Cli,
            output_file: None,
            dump: false,
            auto_save_secs: None,
            ca: CaConfig::default(),
            store: StoreConfig::default(),
            upstream_proxy: None,
        }
    }
}

impl Config {
    /// Parsed upstream proxy, if one was configured.
    pub fn upstream_proxy(&self) -> ProxyResult<Option<UpstreamProxy>> {
        match &self.upstream_proxy {
            Some(url) => Ok(Some(UpstreamProxy::parse(url)?)),
            None => Ok(None),
        }
    }

    /// Expand `~` and environment variables in user-supplied paths.
    pub fn expand_paths(&mut self) {
        self.ca.cert_dir = expand_path(&self.ca.cert_dir);
        if let Some(p) = &self.ca.custom_cert_path {
            self.ca.custom_cert_path = Some(expand_path(p));
        }
        if let Some(p) = &self.ca.custom_key_path {
            self.ca.custom_key_path = Some(expand_path(p));
        }
        if let Some(p) = &self.output_file {
            self.output_file = Some(expand_path(p));
        }
    }

    pub fn validate(&self) -> ProxyResult<()> {
        if self.listen_port == 0 {
            return Err(ProxyError::InvalidConfig {
                field: "listen_port".into(),
                value: "0".into(),
                reason: "port must be > 0".into(),
            });
        }
        if self.store.capacity == 0 {
            return Err(ProxyError::InvalidConfig {
                field: "store.capacity".into(),
                value: "0".into(),
                reason: "capacity must be > 0".into(),
            });
        }
        if (self.ca.custom_cert_path.is_some()) != (self.ca.custom_key_path.is_some()) {
            return Err(ProxyError::InvalidConfig {
                field: "ca.custom_cert_path/custom_key_path".into(),
                value: "partial".into(),
                reason: "-use-ca and -use-key must be supplied together".into(),
            });
        }
        Ok(())
    }

    pub fn ensure_directories(&self) -> ProxyResult<()> {
        std::fs::create_dir_all(&self.ca.cert_dir)?;
        Ok(())
    }

    /// Load a TOML config file, falling back to defaults if absent.
    pub fn load_from(path: &Path) -> ProxyResult<Self> {
        if path.exists() {
            debug!("loading config from {:?}", path);
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            debug!("config not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&path_str).as_ref())
}
