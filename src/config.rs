//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "ready-echo")]
#[command(author = "ready-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded readiness-driven TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IP address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Per-connection echo buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Maximum readiness events returned by a single poll
    #[arg(long)]
    pub max_batch: Option<usize>,

    /// Chunks echoed per readable event before other sockets get a turn
    #[arg(long)]
    pub reads_per_event: Option<usize>,

    /// Listen backlog for pending connections
    #[arg(long)]
    pub backlog: Option<i32>,

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
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
        }
    }
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Bytes read (and echoed) per chunk, owned by each connection
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Capacity of the readiness event batch
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Chunks echoed per readable event
    #[serde(default = "default_reads_per_event")]
    pub reads_per_event: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_batch: default_max_batch(),
            reads_per_event: default_reads_per_event(),
        }
    }
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8546
}

fn default_backlog() -> i32 {
    1024
}

fn default_buffer_size() -> usize {
    1024
}

fn default_max_batch() -> usize {
    1024
}

fn default_reads_per_event() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub backlog: i32,
    pub buffer_size: usize,
    pub max_batch: usize,
    pub reads_per_event: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: default_port(),
            backlog: default_backlog(),
            buffer_size: default_buffer_size(),
            max_batch: default_max_batch(),
            reads_per_event: default_reads_per_event(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from parsed CLI args.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        let host = cli.host.unwrap_or(toml_config.server.host);
        let host: IpAddr = host
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("host '{host}' is not an IP address")))?;

        let config = Config {
            host,
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.runtime.buffer_size),
            max_batch: cli.max_batch.unwrap_or(toml_config.runtime.max_batch),
            reads_per_event: cli
                .reads_per_event
                .unwrap_or(toml_config.runtime.reads_per_event),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Address the listener binds to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be non-zero".into()));
        }
        if self.max_batch == 0 {
            return Err(ConfigError::Invalid("max_batch must be non-zero".into()));
        }
        if self.reads_per_event == 0 {
            return Err(ConfigError::Invalid("reads_per_event must be non-zero".into()));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive".into()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
