//! Configuration management for correlate
//!
//! Handles loading and validation of correlate.toml configuration files.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,

    /// Correlation table settings
    #[serde(default)]
    pub table: TableConfig,

    /// JSON message settings
    #[serde(default)]
    pub messages: MessagesConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for machines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unknown log format: {s}. Expected one of: pretty, json"
            )),
        }
    }
}

/// Correlation table configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableConfig {
    /// Message carried by a timeout when the registration supplies none
    #[serde(default = "default_failure_message")]
    pub default_failure_message: String,

    /// Maximum number of pending entries (0 = unlimited)
    #[serde(default)]
    pub max_pending: usize,

    /// Reject message registrations that carry no request identifier
    #[serde(default = "default_true")]
    pub fail_on_missing_id: bool,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            default_failure_message: default_failure_message(),
            max_pending: 0,
            fail_on_missing_id: true,
        }
    }
}

fn default_failure_message() -> String {
    "request timed out".to_string()
}

fn default_true() -> bool {
    true
}

/// JSON message configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagesConfig {
    /// Top-level field holding the request identifier
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            id_field: default_id_field(),
        }
    }
}

fn default_id_field() -> String {
    crate::message::DEFAULT_ID_FIELD.to_string()
}

impl Config {
    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&text)
    }

    /// Load from `path` when given, defaults otherwise
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load_from)
    }

    /// Check semantic constraints serde cannot express
    pub fn validate(&self) -> crate::Result<()> {
        if self.table.default_failure_message.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "table.default_failure_message must not be empty".to_string(),
            )
            .into());
        }
        if self.messages.id_field.trim().is_empty() {
            return Err(
                ConfigError::ValidationError("messages.id_field must not be empty".to_string())
                    .into(),
            );
        }
        if self.log.level.parse::<crate::logging::LogLevel>().is_err()
            && tracing_subscriber::EnvFilter::try_new(&self.log.level).is_err()
        {
            return Err(ConfigError::ValidationError(format!(
                "log.level is not a valid filter: {}",
                self.log.level
            ))
            .into());
        }
        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.table.default_failure_message, "request timed out");
        assert_eq!(config.table.max_pending, 0);
        assert!(config.table.fail_on_missing_id);
        assert_eq!(config.messages.id_field, "request_id");
        assert_eq!(config.log.format, LogFormat::Pretty);
        config.validate().unwrap();
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let config = Config::from_toml_str(
            r#"
            [table]
            max_pending = 64

            [log]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.table.max_pending, 64);
        assert_eq!(config.table.default_failure_message, "request timed out");
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn empty_id_field_is_rejected() {
        let err = Config::from_toml_str("[messages]\nid_field = \"  \"\n").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ValidationError(_))));
    }

    #[test]
    fn empty_failure_message_is_rejected() {
        let err = Config::from_toml_str("[table]\ndefault_failure_message = \"\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ValidationError(_))));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = Config::from_toml_str("[table\n").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ParseFailed(_))));
    }

    #[test]
    fn load_from_missing_file() {
        let err = Config::load_from(Path::new("/nonexistent/correlate.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn load_from_file_and_render() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("correlate.toml");
        std::fs::write(&path, "[table]\nfail_on_missing_id = false\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(!config.table.fail_on_missing_id);

        let rendered = config.to_toml_string().unwrap();
        let reparsed = Config::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn log_format_parse_and_display() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}
