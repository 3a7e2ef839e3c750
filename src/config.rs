//! Configuration module for the ident-responder binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::responder::{ResponderConfig, DEFAULT_TIMEOUT, IDENT_PORT};

/// Command-line arguments for the responder
#[derive(Parser, Debug, Default)]
#[command(name = "ident-responder")]
#[command(version)]
#[command(about = "Answer a single ident (RFC 1413) query, then exit", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g., 0.0.0.0 or ::)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Port to listen on
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Login to report to the peer (defaults to $USER)
    #[arg(short = 'i', long)]
    pub identity: Option<String>,

    /// Seconds to wait for a peer, and for its request
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ident: IdentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Accept and read/write timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            timeout: default_timeout(),
        }
    }
}

/// Reply-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct IdentConfig {
    /// Login reported for every request
    pub identity: Option<String>,
}

/// Logging configuration
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
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    IDENT_PORT
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub identity: String,
    pub timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config, std::env::var("USER").ok())
    }

    /// Merge CLI args, TOML values and the login fallback.
    fn merge(
        cli: CliArgs,
        toml_config: TomlConfig,
        login: Option<String>,
    ) -> Result<Self, ConfigError> {
        let host = cli.listen.unwrap_or(toml_config.server.listen);
        let ip: IpAddr = host
            .parse()
            .map_err(|_| ConfigError::InvalidListen(host.clone()))?;
        let port = cli.port.unwrap_or(toml_config.server.port);

        let timeout = cli.timeout.unwrap_or(toml_config.server.timeout);
        if timeout == 0 {
            return Err(ConfigError::InvalidTimeout);
        }

        let identity = cli
            .identity
            .or(toml_config.ident.identity)
            .or(login)
            .filter(|identity| !identity.is_empty())
            .ok_or(ConfigError::MissingIdentity)?;

        Ok(Config {
            listen: SocketAddr::new(ip, port),
            identity,
            timeout: Duration::from_secs(timeout),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }

    /// Settings handed to the responder.
    pub fn responder_config(&self) -> ResponderConfig {
        ResponderConfig {
            listen: self.listen,
            timeout: self.timeout,
            identity: self.identity.clone(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
    InvalidTimeout,
    MissingIdentity,
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
            ConfigError::InvalidListen(addr) => {
                write!(f, "Invalid listen address '{addr}'")
            }
            ConfigError::InvalidTimeout => write!(f, "Timeout must be at least one second"),
            ConfigError::MissingIdentity => {
                write!(f, "No identity given and $USER is not set")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
