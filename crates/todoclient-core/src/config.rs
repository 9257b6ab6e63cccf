//! Client configuration management.
//!
//! Configuration is stored at `~/.config/todoclient/config.json` and may be
//! overridden from the environment (a `.env` file is honored by the CLI):
//!
//! - `TODO_API_BASE_URL`: base URL of the to-do service
//! - `TODO_ALLOW_INSECURE_COOKIE`: store the refresh credential over HTTP
//! - `TODO_REQUIRE_PROFILE`: reject logins that return no user profile

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::credentials::{CookieOptions, DEFAULT_REFRESH_TTL_DAYS, MAX_REFRESH_TTL_DAYS};
use crate::cache::DEFAULT_STALE_MINUTES;

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "todoclient";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_BASE_URL: &str = "http://localhost:5000";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Refresh calls get a shorter bound since every failing request waits on them.
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 15;

/// Where the refresh credential is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RefreshStore {
    #[default]
    Keyring,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub refresh_cookie_ttl_days: i64,
    pub allow_insecure_refresh_cookie: bool,
    pub require_server_profile: bool,
    pub resource_stale_minutes: i64,
    pub refresh_store: RefreshStore,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            refresh_cookie_ttl_days: DEFAULT_REFRESH_TTL_DAYS,
            allow_insecure_refresh_cookie: false,
            require_server_profile: false,
            resource_stale_minutes: DEFAULT_STALE_MINUTES,
            refresh_store: RefreshStore::default(),
        }
    }
}

impl ClientConfig {
    /// Load the config file (defaults when absent), then apply environment
    /// overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for persisted credentials.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("TODO_API_BASE_URL").filter(|u| !u.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        if let Some(flag) = lookup("TODO_ALLOW_INSECURE_COOKIE").and_then(|v| parse_flag(&v)) {
            self.allow_insecure_refresh_cookie = flag;
        }
        if let Some(flag) = lookup("TODO_REQUIRE_PROFILE").and_then(|v| parse_flag(&v)) {
            self.require_server_profile = flag;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.base_url)
            .with_context(|| format!("Invalid base URL: {}", self.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Base URL must use http or https: {}", self.base_url);
        }
        if self.request_timeout_secs == 0 || self.refresh_timeout_secs == 0 {
            anyhow::bail!("Timeouts must be greater than zero");
        }
        if !(1..=MAX_REFRESH_TTL_DAYS).contains(&self.refresh_cookie_ttl_days) {
            anyhow::bail!(
                "refresh_cookie_ttl_days must be between 1 and {}, got {}",
                MAX_REFRESH_TTL_DAYS,
                self.refresh_cookie_ttl_days
            );
        }
        Ok(())
    }

    pub fn is_secure_channel(&self) -> bool {
        reqwest::Url::parse(&self.base_url)
            .map(|url| url.scheme() == "https")
            .unwrap_or(false)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn cookie_options(&self) -> CookieOptions {
        CookieOptions::strict(self.is_secure_channel(), self.refresh_cookie_ttl_days)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.is_secure_channel());
        assert_eq!(config.refresh_store, RefreshStore::Keyring);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"base_url":"https://todo.example.com","refresh_store":"file"}"#).unwrap();
        assert!(config.is_secure_channel());
        assert_eq!(config.request_timeout(), Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS));
        assert_eq!(config.refresh_store, RefreshStore::File);
        assert!(config.cookie_options().secure);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("TODO_API_BASE_URL", " https://api.example.com "),
            ("TODO_ALLOW_INSECURE_COOKIE", "yes"),
            ("TODO_REQUIRE_PROFILE", "maybe"),
        ]
        .into_iter()
        .collect();

        let mut config = ClientConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.base_url, "https://api.example.com");
        assert!(config.allow_insecure_refresh_cookie);
        // Unparseable flags are ignored
        assert!(!config.require_server_profile);
    }

    #[test]
    fn test_rejects_bad_urls() {
        let mut config = ClientConfig::default();
        config.base_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());
        config.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_cookie_lifetime() {
        let mut config = ClientConfig::default();
        for ttl_days in [0, -3, MAX_REFRESH_TTL_DAYS + 1, 1_000_000_000_000] {
            config.refresh_cookie_ttl_days = ttl_days;
            assert!(config.validate().is_err(), "accepted {}", ttl_days);
        }
        config.refresh_cookie_ttl_days = MAX_REFRESH_TTL_DAYS;
        assert!(config.validate().is_ok());
    }
}
