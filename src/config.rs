//! Configuration module for the logsock server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the packet log server
#[derive(Parser, Debug)]
#[command(name = "logsock")]
#[command(author = "logsock authors")]
#[command(version = "0.1.0")]
#[command(about = "Appends newline-terminated packets to a shared log and replies with the whole log", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Run as a background daemon
    #[arg(short = 'd', long)]
    pub daemon: bool,

    /// Path of the shared data file
    #[arg(short = 'f', long)]
    pub data_file: Option<PathBuf>,

    /// Seconds between timestamp records (0 disables them)
    #[arg(long)]
    pub timestamp_interval: Option<u64>,

    /// Largest packet accepted, in bytes, including the newline
    #[arg(long)]
    pub max_packet_size: Option<usize>,

    /// Cap on concurrently served connections (unbounded when unset)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Write operational logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub packet: PacketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Concurrent connection cap
    pub max_connections: Option<usize>,
    /// Detach from the terminal after binding
    #[serde(default)]
    pub daemon: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: None,
            daemon: false,
        }
    }
}

/// Shared log configuration
#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Backing file for the shared log
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
    /// Seconds between timestamp records
    #[serde(default = "default_timestamp_interval")]
    pub timestamp_interval: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            data_file: default_data_file(),
            timestamp_interval: default_timestamp_interval(),
        }
    }
}

/// Packet framing configuration
#[derive(Debug, Deserialize)]
pub struct PacketConfig {
    /// Hard ceiling for a single packet
    #[serde(default = "default_max_packet_size")]
    pub max_size: usize,
    /// Starting capacity of the per-connection packet buffer
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,
    /// Size of a single socket read
    #[serde(default = "default_read_size")]
    pub read_size: usize,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_packet_size(),
            initial_capacity: default_initial_capacity(),
            read_size: default_read_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_data_file() -> PathBuf {
    PathBuf::from("/var/tmp/aesdsocketdata")
}

fn default_timestamp_interval() -> u64 {
    10
}

fn default_max_packet_size() -> usize {
    10 * 1024 * 1024 // 10 MB
}

fn default_initial_capacity() -> usize {
    1024
}

fn default_read_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub daemon: bool,
    pub data_file: PathBuf,
    /// `None` disables the timestamp task.
    pub timestamp_interval: Option<Duration>,
    pub max_packet_size: usize,
    pub initial_capacity: usize,
    pub read_size: usize,
    pub max_connections: Option<usize>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{listen}'")))?;

        let interval = cli
            .timestamp_interval
            .unwrap_or(toml_config.log.timestamp_interval);

        let config = Config {
            listen,
            daemon: cli.daemon || toml_config.server.daemon,
            data_file: cli.data_file.unwrap_or(toml_config.log.data_file),
            timestamp_interval: (interval > 0).then(|| Duration::from_secs(interval)),
            max_packet_size: cli
                .max_packet_size
                .unwrap_or(toml_config.packet.max_size),
            initial_capacity: toml_config.packet.initial_capacity,
            read_size: toml_config.packet.read_size,
            max_connections: cli
                .max_connections
                .or(toml_config.server.max_connections),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            log_file: cli.log_file.or(toml_config.logging.file),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_packet_size == 0 {
            return Err(ConfigError::Invalid("max packet size must be non-zero".into()));
        }
        if self.initial_capacity == 0 || self.read_size == 0 {
            return Err(ConfigError::Invalid(
                "initial capacity and read size must be non-zero".into(),
            ));
        }
        if self.initial_capacity > self.max_packet_size {
            return Err(ConfigError::Invalid(format!(
                "initial capacity {} exceeds max packet size {}",
                self.initial_capacity, self.max_packet_size
            )));
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid("max connections must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let toml = TomlConfig::default();
        Config {
            listen: SocketAddr::from(([0, 0, 0, 0], 9000)),
            daemon: false,
            data_file: toml.log.data_file,
            timestamp_interval: Some(Duration::from_secs(toml.log.timestamp_interval)),
            max_packet_size: toml.packet.max_size,
            initial_capacity: toml.packet.initial_capacity,
            read_size: toml.packet.read_size,
            max_connections: None,
            log_level: toml.logging.level,
            log_file: None,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
