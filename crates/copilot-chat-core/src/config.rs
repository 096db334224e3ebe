//! Application configuration management.
//!
//! Configuration is stored at `~/.config/copilot-chat/config.json`. A missing
//! file yields defaults; unknown or missing fields fall back per field.
//! Credentials live under the data directory, logs under the cache directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/data/cache directory paths
pub const APP_NAME: &str = "copilot-chat";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Credential file name in the data directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Default chat model.
pub const DEFAULT_MODEL: &str = "gpt-4.1";

/// Refresh the bearer token this long before it expires.
/// 60s covers clock skew plus the length of one request.
const DEFAULT_REFRESH_MARGIN_SECS: u64 = 60;

/// Chunks the stream reader may run ahead of the consumer.
const DEFAULT_STREAM_QUEUE_DEPTH: usize = 16;

/// Timeout for non-streaming requests, and for the gap between stream chunks.
/// Long replies from large models can pause for a while between chunks.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Public identity-provider and backend endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub device_code: String,
    pub device_token: String,
    pub bearer_exchange: String,
    pub chat_completions: String,
    pub claude_messages: String,
    pub models: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            device_code: "https://github.com/login/device/code".to_string(),
            device_token: "https://github.com/login/oauth/access_token".to_string(),
            bearer_exchange: "https://api.github.com/copilot_internal/v2/token".to_string(),
            chat_completions: "https://api.githubcopilot.com/chat/completions".to_string(),
            claude_messages: "https://api.githubcopilot.com/v1/messages".to_string(),
            models: "https://api.githubcopilot.com/models".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: String,
    pub system_prompt: Option<String>,
    pub token_refresh_margin_secs: u64,
    pub stream_queue_depth: usize,
    pub request_timeout_secs: u64,
    pub endpoints: Endpoints,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
            token_refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
            stream_queue_depth: DEFAULT_STREAM_QUEUE_DEPTH,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            endpoints: Endpoints::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn credentials_path(&self) -> Result<PathBuf> {
        let data_dir =
            dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME).join(CREDENTIALS_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir =
            dirs::cache_dir().ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_refresh_margin_secs as i64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Queue depth for streaming, never zero.
    pub fn queue_depth(&self) -> usize {
        self.stream_queue_depth.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.model, "gpt-4.1");
        assert_eq!(config.refresh_margin(), chrono::Duration::seconds(60));
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"model": "claude-sonnet-4", "endpoints": {"models": "http://localhost:8080/models"}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.model, "claude-sonnet-4");
        assert_eq!(config.stream_queue_depth, 16);
        assert_eq!(config.endpoints.models, "http://localhost:8080/models");
        assert_eq!(
            config.endpoints.device_code,
            Endpoints::default().device_code
        );
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            system_prompt: Some("Answer in Korean.".to_string()),
            stream_queue_depth: 0,
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.queue_depth(), 1);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
