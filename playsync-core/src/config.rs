//! Configuration
//!
//! Everything the core needs from the outside world: OAuth client
//! registration, remote endpoints, sync tunables and where credentials live.
//! Values come from defaults, then an optional TOML file, then environment
//! overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Default authorization endpoint
pub const DEFAULT_AUTHORIZE_URL: &str = "https://accounts.spotify.com/authorize";

/// Default token endpoint
pub const DEFAULT_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

/// Default Web API base URL
pub const DEFAULT_API_BASE_URL: &str = "https://api.spotify.com/v1";

const ENV_CLIENT_ID: &str = "PLAYSYNC_CLIENT_ID";
const ENV_REDIRECT_URI: &str = "PLAYSYNC_REDIRECT_URI";
const ENV_SCOPES: &str = "PLAYSYNC_SCOPES";
const ENV_POLL_INTERVAL_MS: &str = "PLAYSYNC_POLL_INTERVAL_MS";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auth: AuthConfig,
    pub api: ApiConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
}

/// OAuth client registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// OAuth client identifier (opaque)
    pub client_id: String,
    /// Where the provider sends the user back with `?code=`
    pub redirect_uri: String,
    /// Requested scopes, joined with spaces in the authorize URL
    pub scopes: Vec<String>,
    pub authorize_url: String,
    pub token_url: String,
    /// After this long an outstanding verifier counts as abandoned
    pub login_timeout_secs: u64,
}

/// Remote player API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

/// Sync loop tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period between the end of one poll and the start of the next
    pub poll_interval_ms: u64,
    pub seek_settle_ms: u64,
    pub play_pause_settle_ms: u64,
    /// How long a like/unlike overrides the server (propagation lag)
    pub favorite_settle_ms: u64,
    /// Slack around a seek target before the server counts as caught up
    pub seek_tolerance_ms: u64,
    /// Added per consecutive failure to the retry delay
    pub retry_base_ms: u64,
    /// Upper bound on the retry delay
    pub retry_max_ms: u64,
}

/// Credential persistence
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file for the credential store. `None` keeps credentials in memory.
    pub credentials_path: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            redirect_uri: "http://127.0.0.1:8888/callback".to_string(),
            scopes: [
                "user-read-currently-playing",
                "user-read-playback-state",
                "user-modify-playback-state",
                "user-library-read",
                "user-library-modify",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            login_timeout_secs: 600,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            seek_settle_ms: 2_000,
            play_pause_settle_ms: 2_000,
            favorite_settle_ms: 3_500,
            seek_tolerance_ms: 1_500,
            retry_base_ms: 1_000,
            retry_max_ms: 10_000,
        }
    }
}

impl AuthConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}

impl ApiConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn seek_settle(&self) -> Duration {
        Duration::from_millis(self.seek_settle_ms)
    }

    pub fn play_pause_settle(&self) -> Duration {
        Duration::from_millis(self.play_pause_settle_ms)
    }

    pub fn favorite_settle(&self) -> Duration {
        Duration::from_millis(self.favorite_settle_ms)
    }

    pub fn seek_tolerance(&self) -> Duration {
        Duration::from_millis(self.seek_tolerance_ms)
    }

    /// Delay before the next poll given the current failure streak
    ///
    /// Grows linearly with the streak and never drops below the poll interval,
    /// so a short interval cannot turn an outage into a request storm.
    pub fn retry_delay(&self, consecutive_failures: u32) -> Duration {
        let interval = self.poll_interval_ms;
        if consecutive_failures == 0 {
            return Duration::from_millis(interval);
        }
        let backoff = self
            .retry_base_ms
            .saturating_mul(consecutive_failures as u64)
            .min(self.retry_max_ms);
        Duration::from_millis(interval.max(backoff))
    }
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `PLAYSYNC_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(client_id) = lookup(ENV_CLIENT_ID) {
            self.auth.client_id = client_id;
        }
        if let Some(redirect_uri) = lookup(ENV_REDIRECT_URI) {
            self.auth.redirect_uri = redirect_uri;
        }
        if let Some(scopes) = lookup(ENV_SCOPES) {
            self.auth.scopes = scopes
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(interval) = lookup(ENV_POLL_INTERVAL_MS) {
            self.sync.poll_interval_ms = interval.trim().parse().map_err(|_| {
                Error::Config(format!(
                    "{} must be an integer, got {:?}",
                    ENV_POLL_INTERVAL_MS, interval
                ))
            })?;
        }
        Ok(())
    }

    /// Check the values the rest of the crate relies on
    pub fn validate(&self) -> Result<()> {
        if self.auth.client_id.trim().is_empty() {
            return Err(Error::Config("auth.client_id is required".to_string()));
        }
        for (name, value) in [
            ("auth.redirect_uri", &self.auth.redirect_uri),
            ("auth.authorize_url", &self.auth.authorize_url),
            ("auth.token_url", &self.auth.token_url),
            ("api.base_url", &self.api.base_url),
        ] {
            url::Url::parse(value)
                .map_err(|e| Error::Config(format!("{} is not a URL: {}", name, e)))?;
        }
        if self.sync.poll_interval_ms == 0 {
            return Err(Error::Config("sync.poll_interval_ms must be positive".to_string()));
        }
        if self.sync.retry_max_ms < self.sync.retry_base_ms {
            return Err(Error::Config(
                "sync.retry_max_ms must not be smaller than sync.retry_base_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Credential file path, falling back to the per-user config directory
    pub fn credentials_path(&self) -> Option<PathBuf> {
        self.storage
            .credentials_path
            .clone()
            .or_else(default_credentials_path)
    }
}

/// `<config dir>/playsync/credentials.json`
pub fn default_credentials_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("playsync").join("credentials.json"))
}
