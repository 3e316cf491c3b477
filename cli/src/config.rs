// Configuration management for jacquard-cli
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/jacquard/config.json
// - Linux: ~/.config/jacquard/config.json
// - Windows: %APPDATA%\jacquard\config.json

use anyhow::{Context, Result};
use jacquard_core::SdkConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log output settings
    pub log: LogConfig,

    /// Settings handed to the SDK
    pub sdk: SdkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when RUST_LOG is unset and no -v is given
    pub level: String,

    /// Line format for both console and file output
    pub format: LogFormat,

    /// Also write logs to a daily rolling file
    pub file: bool,

    /// Directory for log files; defaults to the data directory
    pub directory: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Text,
            file: false,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("Unknown log format '{}', expected text or json", other),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("jacquard");
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("jacquard");
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Where log files go
    pub fn log_dir(&self) -> Result<PathBuf> {
        match &self.log.directory {
            Some(directory) => Ok(PathBuf::from(directory)),
            None => Ok(Self::data_dir()?.join("logs")),
        }
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .sdk
                .validate()
                .with_context(|| format!("Invalid settings in {}", config_file.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value; the SDK settings must still validate afterwards
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "log.level" => updated.log.level = value.to_string(),
            "log.format" => updated.log.format = value.parse()?,
            "log.file" => updated.log.file = value.parse().context("Invalid boolean value")?,
            "log.directory" => {
                updated.log.directory = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "sdk.default_mtu" => updated.sdk.default_mtu = value.parse().context("Invalid MTU")?,
            "sdk.connection_timeout_secs" => {
                updated.sdk.connection_timeout_secs = value.parse().context("Invalid number")?
            }
            "sdk.command_timeout_ms" => {
                updated.sdk.command_timeout_ms = value.parse().context("Invalid number")?
            }
            "sdk.command_retries" => {
                updated.sdk.command_retries = value.parse().context("Invalid number")?
            }
            "sdk.reconnect_interval_ms" => {
                updated.sdk.reconnect_interval_ms = value.parse().context("Invalid number")?
            }
            "sdk.max_reconnect_interval_ms" => {
                updated.sdk.max_reconnect_interval_ms = value.parse().context("Invalid number")?
            }
            "sdk.notification_buffer_limit" => {
                updated.sdk.notification_buffer_limit = value.parse().context("Invalid number")?
            }
            "sdk.notification_queue_depth" => {
                updated.sdk.notification_queue_depth = value.parse().context("Invalid number")?
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated
            .sdk
            .validate()
            .with_context(|| format!("Rejected {} = {}", key, value))?;
        *self = updated;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let sdk = &self.sdk;
        vec![
            ("log.level".to_string(), self.log.level.clone()),
            ("log.format".to_string(), self.log.format.to_string()),
            ("log.file".to_string(), self.log.file.to_string()),
            (
                "log.directory".to_string(),
                self.log.directory.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("sdk.default_mtu".to_string(), sdk.default_mtu.to_string()),
            (
                "sdk.connection_timeout_secs".to_string(),
                sdk.connection_timeout_secs.to_string(),
            ),
            ("sdk.command_timeout_ms".to_string(), sdk.command_timeout_ms.to_string()),
            ("sdk.command_retries".to_string(), sdk.command_retries.to_string()),
            (
                "sdk.reconnect_interval_ms".to_string(),
                sdk.reconnect_interval_ms.to_string(),
            ),
            (
                "sdk.max_reconnect_interval_ms".to_string(),
                sdk.max_reconnect_interval_ms.to_string(),
            ),
            (
                "sdk.notification_buffer_limit".to_string(),
                sdk.notification_buffer_limit.to_string(),
            ),
            (
                "sdk.notification_queue_depth".to_string(),
                sdk.notification_queue_depth.to_string(),
            ),
            (
                "sdk.startup_commands".to_string(),
                sdk.startup_commands.len().to_string(),
            ),
        ]
    }
}
