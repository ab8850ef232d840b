use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigurationError;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// REST base URL (e.g., "http://localhost:8080" or "https://sync.example.com")
    pub endpoint: Option<String>,
    /// Bearer token sent with every request
    pub api_key: Option<String>,
    /// Real-time channel URL; derived from the endpoint when unset
    pub realtime_url: Option<String>,
    pub poll_interval_secs: u64,
    pub debounce_ms: u64,
    /// Attempts made by `sync --retry`
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    pub connectivity_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            realtime_url: None,
            poll_interval_secs: 30,
            debounce_ms: 2000,
            max_retries: 3,
            request_timeout_secs: 30,
            connectivity_interval_secs: 10,
        }
    }
}

impl SyncConfig {
    /// Returns true if an endpoint is configured
    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn endpoint(&self) -> Result<&str, ConfigurationError> {
        self.endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or(ConfigurationError::MissingEndpoint)
    }

    /// The configured real-time URL, or `<endpoint as ws(s)>/ws`.
    pub fn realtime_url(&self) -> Option<String> {
        if let Some(url) = &self.realtime_url {
            return Some(url.clone());
        }
        let endpoint = self.endpoint.as_deref()?;
        let base = if let Some(rest) = endpoint.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = endpoint.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            format!("ws://{}", endpoint)
        };
        Some(format!("{}/ws", base.trim_end_matches('/')))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connectivity_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity_interval_secs)
    }

    /// Rejects intervals that would make the engine spin.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let positive = [
            ("sync.poll_interval_secs", self.poll_interval_secs),
            ("sync.request_timeout_secs", self.request_timeout_secs),
            ("sync.connectivity_interval_secs", self.connectivity_interval_secs),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigurationError::Invalid {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if let Some(endpoint) = &self.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(ConfigurationError::Invalid {
                    key: "sync.endpoint".to_string(),
                    message: format!("expected an http(s) URL, got '{}'", endpoint),
                });
            }
        }
        Ok(())
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Directory holding the local store and engine state
    pub data_dir: ConfigValue<PathBuf>,
    /// Identity this device syncs as
    pub user_id: ConfigValue<Option<String>>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Sync configuration
    pub sync: SyncConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    user_id: Option<String>,
    sync: Option<SyncConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut data_dir = ConfigValue::new(Self::default_data_dir(), ConfigSource::Default);
        let mut user_id = ConfigValue::new(None, ConfigSource::Default);
        let mut config_file = None;
        let mut sync = SyncConfig::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(dir) = file_config.data_dir {
                // Resolve relative paths against config file's directory
                let resolved = if dir.is_relative() {
                    path.parent().map(|p| p.join(&dir)).unwrap_or(dir)
                } else {
                    dir
                };
                data_dir = ConfigValue::new(resolved, ConfigSource::File);
            }
            if let Some(user) = file_config.user_id {
                user_id = ConfigValue::new(Some(user), ConfigSource::File);
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
        }

        // Apply environment variable overrides
        if let Ok(dir) = std::env::var("SPLITSYNC_DATA_DIR") {
            data_dir = ConfigValue::new(PathBuf::from(dir), ConfigSource::Environment);
        }
        if let Ok(user) = std::env::var("SPLITSYNC_USER_ID") {
            user_id = ConfigValue::new(Some(user), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("SPLITSYNC_ENDPOINT") {
            sync.endpoint = Some(url);
        }
        if let Ok(key) = std::env::var("SPLITSYNC_API_KEY") {
            sync.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("SPLITSYNC_REALTIME_URL") {
            sync.realtime_url = Some(url);
        }

        Ok(Self {
            data_dir,
            user_id,
            config_file,
            sync,
        })
    }

    pub fn user_id(&self) -> Result<&str, ConfigurationError> {
        self.user_id
            .value
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigurationError::MissingUserId)
    }

    /// Where persisted engine state (queue, watermark) lives.
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.value.join("state")
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/splitsync/
    /// - macOS: ~/Library/Application Support/splitsync/
    /// - Windows: %APPDATA%/splitsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("splitsync")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/splitsync/
    /// - macOS: ~/Library/Application Support/splitsync/
    /// - Windows: %APPDATA%/splitsync/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("splitsync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert!(config.data_dir.value.ends_with("splitsync"));
        assert_eq!(config.data_dir.source, ConfigSource::Default);
        assert_eq!(config.sync.poll_interval_secs, 30);
        assert_eq!(config.sync.debounce_ms, 2000);
        assert_eq!(config.sync.max_retries, 3);
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "data_dir: /custom/splitsync").unwrap();
        writeln!(file, "user_id: asha").unwrap();
        writeln!(file, "sync:").unwrap();
        writeln!(file, "  endpoint: https://sync.example.com").unwrap();
        writeln!(file, "  poll_interval_secs: 60").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(config.data_dir.value, PathBuf::from("/custom/splitsync"));
        assert_eq!(config.data_dir.source, ConfigSource::File);
        assert_eq!(config.user_id().unwrap(), "asha");
        assert_eq!(config.user_id.source, ConfigSource::File);
        assert_eq!(config.sync.endpoint().unwrap(), "https://sync.example.com");
        assert_eq!(config.sync.poll_interval_secs, 60);
        // Unspecified sync keys keep their defaults
        assert_eq!(config.sync.request_timeout_secs, 30);
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_relative_data_dir_resolves_against_config_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "data_dir: data\n").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.data_dir.value, temp_dir.path().join("data"));
        assert_eq!(config.state_dir(), temp_dir.path().join("data").join("state"));
    }

    #[test]
    #[ignore] // Run with --ignored; env vars can pollute parallel tests
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "user_id: fromfile").unwrap();

        std::env::set_var("SPLITSYNC_USER_ID", "fromenv");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.user_id().unwrap(), "fromenv");
        assert_eq!(config.user_id.source, ConfigSource::Environment);

        std::env::remove_var("SPLITSYNC_USER_ID");
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_missing_endpoint_and_user() {
        let sync = SyncConfig::default();
        assert_eq!(sync.endpoint(), Err(ConfigurationError::MissingEndpoint));
        assert!(sync.realtime_url().is_none());
    }

    #[test]
    fn test_realtime_url_derived_from_endpoint() {
        let mut sync = SyncConfig {
            endpoint: Some("https://sync.example.com/".to_string()),
            ..Default::default()
        };
        assert_eq!(
            sync.realtime_url().as_deref(),
            Some("wss://sync.example.com/ws")
        );

        sync.endpoint = Some("http://localhost:8080".to_string());
        assert_eq!(sync.realtime_url().as_deref(), Some("ws://localhost:8080/ws"));

        sync.realtime_url = Some("ws://push.example.com/live".to_string());
        assert_eq!(
            sync.realtime_url().as_deref(),
            Some("ws://push.example.com/live")
        );
    }

    #[test]
    fn test_validate_rejects_zero_intervals_and_bad_urls() {
        let sync = SyncConfig {
            poll_interval_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            sync.validate(),
            Err(ConfigurationError::Invalid { key, .. }) if key == "sync.poll_interval_secs"
        ));

        let sync = SyncConfig {
            endpoint: Some("ftp://example.com".to_string()),
            ..Default::default()
        };
        assert!(sync.validate().is_err());
        assert!(SyncConfig::default().validate().is_ok());
    }
}
