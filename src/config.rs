//! Configuration module for the conversion service.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the conversion server.
#[derive(Parser, Debug)]
#[command(name = "kurs-server")]
#[command(version = "0.1.0")]
#[command(about = "A currency conversion service", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:5000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// CBR endpoint URL
    #[arg(long)]
    pub cbr_url: Option<String>,

    /// Rate cache lifetime in seconds (0 = refresh on every request)
    #[arg(short = 't', long)]
    pub cache_lifetime: Option<u64>,

    /// Upstream exchange timeout in seconds (0 = no timeout)
    #[arg(long)]
    pub upstream_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cbr: CbrConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// CBR provider configuration.
#[derive(Debug, Deserialize)]
pub struct CbrConfig {
    /// Endpoint URL for the daily rate feed
    #[serde(default = "default_cbr_url")]
    pub url: String,
    /// Rate cache lifetime in seconds
    #[serde(default = "default_cache_lifetime")]
    pub cache_lifetime: u64,
    /// Upstream exchange timeout in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout: u64,
}

impl Default for CbrConfig {
    fn default() -> Self {
        Self {
            url: default_cbr_url(),
            cache_lifetime: default_cache_lifetime(),
            timeout: default_upstream_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_cbr_url() -> String {
    "https://www.cbr.ru/scripts/XML_daily.asp".to_string()
}

fn default_cache_lifetime() -> u64 {
    120 // 2 minutes
}

fn default_upstream_timeout() -> u64 {
    10 // seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub cbr_url: String,
    pub cache_lifetime: u64,
    pub upstream_timeout: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            cbr_url: cli.cbr_url.unwrap_or(toml_config.cbr.url),
            cache_lifetime: cli
                .cache_lifetime
                .unwrap_or(toml_config.cbr.cache_lifetime),
            upstream_timeout: cli
                .upstream_timeout
                .unwrap_or(toml_config.cbr.timeout),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:5000");
        assert_eq!(config.cbr.url, "https://www.cbr.ru/scripts/XML_daily.asp");
        assert_eq!(config.cbr.cache_lifetime, 120);
        assert_eq!(config.cbr.timeout, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:8080"

            [cbr]
            url = "http://localhost:9000/rates"
            cache_lifetime = 300
            timeout = 5

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.cbr.url, "http://localhost:9000/rates");
        assert_eq!(config.cbr.cache_lifetime, 300);
        assert_eq!(config.cbr.timeout, 5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let cli = CliArgs {
            config: None,
            listen: Some("127.0.0.1:7000".to_string()),
            cbr_url: None,
            cache_lifetime: Some(0),
            upstream_timeout: None,
            log_level: "info".to_string(),
        };

        let config = Config::resolve(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.cache_lifetime, 0);
        assert_eq!(config.cbr_url, "https://www.cbr.ru/scripts/XML_daily.asp");
        assert_eq!(config.upstream_timeout, 10);
    }
}
