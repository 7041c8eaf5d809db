use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::SyncConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub sync: SyncSettings,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  /// Bound on each remote call, in seconds
  pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8000/".to_string(),
      request_timeout_secs: 20,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
  /// Failed attempts after which a queued mutation is dropped
  pub max_retries: u32,
  /// Connectivity heartbeat interval, in seconds
  pub poll_interval_secs: u64,
  /// Path requested by the heartbeat
  pub health_path: String,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      max_retries: 3,
      poll_interval_secs: 15,
      health_path: "/".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Database location (default: $XDG_DATA_HOME/telemed-sync/cache.db)
  pub path: Option<PathBuf>,
  /// Age after which cached answers are reported as stale
  pub stale_after_minutes: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      stale_after_minutes: 60,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./telemed-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/telemed-sync/config.yaml
  ///
  /// Without a file, defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("telemed-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("telemed-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-defaults config
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Where the local store lives.
  pub fn cache_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.cache.path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("telemed-sync").join("cache.db"))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.api.request_timeout_secs)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.sync.poll_interval_secs.max(1))
  }

  pub fn stale_time(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.cache.stale_after_minutes)
  }

  pub fn sync_config(&self) -> SyncConfig {
    SyncConfig {
      max_retries: self.sync.max_retries,
      request_timeout: self.request_timeout(),
    }
  }

  /// Get the API bearer token from the environment, if set.
  ///
  /// Checks TELEMED_API_TOKEN.
  pub fn api_token() -> Option<String> {
    std::env::var("TELEMED_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
