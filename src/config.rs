//! `config.toml` plus `REMOTED_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ------------------------- Sections -------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub art: Art,
    #[serde(default)]
    pub bus: Bus,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "d8080")]
    pub port: u16,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
}
fn default_bind() -> String {
    "127.0.0.1".into()
}
const fn d8080() -> u16 {
    8080
}
fn default_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}
impl Default for Server {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: d8080(),
            token: None,
            version: default_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Art {
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default = "default_allowed_roots")]
    pub allowed_roots: Vec<String>,
}
fn default_allowed_roots() -> Vec<String> {
    vec!["/tmp".into(), "/var/tmp".into()]
}
impl Default for Art {
    fn default() -> Self {
        Self {
            cache_dir: None,
            allowed_roots: default_allowed_roots(),
        }
    }
}

impl Art {
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        match self.cache_dir.as_deref() {
            Some(dir) => PathBuf::from(expand(dir)),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("umr")
                .join("art"),
        }
    }

    #[must_use]
    pub fn allowed_roots(&self) -> Vec<PathBuf> {
        self.allowed_roots
            .iter()
            .map(|root| PathBuf::from(expand(root)))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bus {
    #[serde(default = "d2000")]
    pub call_timeout_ms: u64,
    #[serde(default = "d1500")]
    pub hub_timeout_ms: u64,
    #[serde(default = "d2000")]
    pub push_timeout_ms: u64,
    /// Per-endpoint limit inside one enumeration; keep it under `hub_timeout_ms`.
    #[serde(default = "d1000")]
    pub endpoint_timeout_ms: u64,
}
const fn d1000() -> u64 {
    1000
}
const fn d2000() -> u64 {
    2000
}
const fn d1500() -> u64 {
    1500
}
impl Default for Bus {
    fn default() -> Self {
        Self {
            call_timeout_ms: d2000(),
            hub_timeout_ms: d1500(),
            push_timeout_ms: d2000(),
            endpoint_timeout_ms: d1000(),
        }
    }
}

impl Bus {
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    #[must_use]
    pub const fn hub_timeout(&self) -> Duration {
        Duration::from_millis(self.hub_timeout_ms)
    }

    #[must_use]
    pub const fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    #[must_use]
    pub const fn endpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.endpoint_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Logging {
    #[serde(default = "default_level")]
    pub level: String,
}
fn default_level() -> String {
    "info".into()
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

// ------------------------- Loading -------------------------

#[must_use]
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("umr").join("config.toml"))
}

impl Config {
    /// Reads `path`, or the default location when `None`. Only an explicitly
    /// named file has to exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };
        if !required && !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut cfg: Self = toml::from_str(text)?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Applies `REMOTED_*` overrides; `lookup` is `std::env::var` in the daemon.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = lookup("REMOTED_BIND") {
            self.server.bind = bind;
        }
        if let Some(port) = lookup("REMOTED_PORT").and_then(|p| p.trim().parse().ok()) {
            self.server.port = port;
        }
        if let Some(token) = lookup("REMOTED_TOKEN") {
            self.server.token = Some(token);
        }
        if let Some(version) = lookup("REMOTED_VERSION") {
            self.server.version = version;
        }
        if let Some(dir) = lookup("REMOTED_ART_CACHE") {
            self.art.cache_dir = Some(dir);
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        self.server.token = self
            .server
            .token
            .take()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if self.server.version.trim().is_empty() {
            self.server.version = default_version();
        }
    }

    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

// ------------------------- Utils -------------------------

/// Expands `$HOME`, `$XDG_CONFIG_HOME`, `$XDG_CACHE_HOME` and
/// `$XDG_RUNTIME_DIR` in a configured path.
#[must_use]
pub fn expand(path: &str) -> String {
    let mut s = path.to_string();
    if let Some(home) = dirs::home_dir() {
        s = s.replace("$HOME", home.to_string_lossy().as_ref());
    }
    if let Some(cfg) = dirs::config_dir() {
        s = s.replace("$XDG_CONFIG_HOME", cfg.to_string_lossy().as_ref());
    }
    if let Some(cache) = dirs::cache_dir() {
        s = s.replace("$XDG_CACHE_HOME", cache.to_string_lossy().as_ref());
    }
    if let Ok(run) = std::env::var("XDG_RUNTIME_DIR") {
        s = s.replace("$XDG_RUNTIME_DIR", &run);
    } else {
        let uid = nix::unistd::Uid::current().as_raw();
        s = s.replace("$XDG_RUNTIME_DIR", &format!("/run/user/{uid}"));
    }
    s
}
