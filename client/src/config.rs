use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ClientError, Result};

pub const CONFIG_ENV: &str = "TASKSYNC_CONFIG";
pub const URL_ENV: &str = "TASKSYNC_URL";
pub const ANON_KEY_ENV: &str = "TASKSYNC_ANON_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the hosted project, e.g. `https://abc.supabase.co`.
    pub project_url: String,
    /// Public (anon) API key sent as `apikey` on every request.
    pub anon_key: String,
    /// Table holding task rows.
    pub table: String,
    pub realtime: RealtimeConfig,
    /// Where the terminal UI writes its log. `None` uses the data dir.
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub heartbeat_secs: u64,
    pub max_reconnect_delay_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            project_url: String::new(),
            anon_key: String::new(),
            table: "tasks".to_string(),
            realtime: RealtimeConfig::default(),
            log_file: None,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 25,
            max_reconnect_delay_secs: 30,
        }
    }
}

impl RealtimeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs.max(1))
    }
}

impl ClientConfig {
    pub fn new(project_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            project_url: project_url.into(),
            anon_key: anon_key.into(),
            ..Self::default()
        }
    }

    /// Reads the config file (if any), applies environment overrides and validates.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(default_path);
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("reading config from {}", path.display());
        let text = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ClientError::Config(e.to_string()))
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(URL_ENV).filter(|v| !v.is_empty()) {
            self.project_url = url;
        }
        if let Some(key) = lookup(ANON_KEY_ENV).filter(|v| !v.is_empty()) {
            self.anon_key = key;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.project_url.trim().is_empty() {
            return Err(ClientError::Config(format!(
                "project_url is not set (config file or {URL_ENV})"
            )));
        }
        if self.anon_key.trim().is_empty() {
            return Err(ClientError::Config(format!(
                "anon_key is not set (config file or {ANON_KEY_ENV})"
            )));
        }
        if self.table.trim().is_empty() {
            return Err(ClientError::Config("table must not be empty".into()));
        }
        self.base_url().map(|_| ())
    }

    /// Project URL with a trailing slash so relative joins keep its path.
    pub fn base_url(&self) -> Result<Url> {
        let mut raw = self.project_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let url = Url::parse(&raw)
            .map_err(|e| ClientError::Config(format!("invalid project_url {raw:?}: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ClientError::Config(format!(
                "project_url must be http or https, got {other}"
            ))),
        }
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url()?
            .join(path)
            .map_err(|e| ClientError::Config(format!("bad endpoint {path}: {e}")))
    }

    pub fn rest_url(&self) -> Result<Url> {
        self.endpoint(&format!("rest/v1/{}", self.table))
    }

    pub fn auth_url(&self, path: &str) -> Result<Url> {
        self.endpoint(&format!("auth/v1/{path}"))
    }

    pub fn realtime_url(&self) -> Result<Url> {
        let mut url = self.endpoint("realtime/v1/websocket")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Config(format!("cannot use {scheme} for {url}")))?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_file.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("tasksync")
                .join("tasksync.log")
        })
    }
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tasksync").join("config.toml"))
}
