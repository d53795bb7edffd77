//! Configuration for the framecast server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the frame server
#[derive(Parser, Debug, Default)]
#[command(name = "framecast")]
#[command(author = "framecast authors")]
#[command(version = "0.1.0")]
#[command(about = "A binary-frame broadcast server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of simultaneous connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of mailbox worker threads (0 disables the mailbox)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

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
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub listen: String,
    pub max_connections: usize,
    /// Poll timeout; bounds how long a shutdown request goes unnoticed
    pub poll_timeout_ms: u64,
    /// Size of the per-read buffer
    pub read_buffer_size: usize,
    /// Deliver a client's own messages back to it
    pub echo_to_sender: bool,
    /// Tell a client when one of its frames is rejected
    pub notify_rejections: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: 1024,
            poll_timeout_ms: 100,
            read_buffer_size: 2048,
            echo_to_sender: true,
            notify_rejections: false,
        }
    }
}

/// Framing limits. Absent values mean unbounded.
#[derive(Debug, Deserialize, Default)]
pub struct ProtocolConfig {
    /// Largest declared frame length accepted
    pub max_frame_length: Option<u32>,
    /// Largest receive buffer a connection may hold
    pub max_pending_bytes: Option<usize>,
}

/// Mailbox consumer configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub pop_timeout_ms: u64,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            batch_size: 64,
            pop_timeout_ms: 100,
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

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub poll_timeout: Duration,
    pub read_buffer_size: usize,
    pub echo_to_sender: bool,
    pub notify_rejections: bool,
    pub max_frame_length: Option<u32>,
    pub max_pending_bytes: Option<usize>,
    pub mailbox_workers: usize,
    pub mailbox_batch_size: usize,
    pub mailbox_pop_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(
            SocketAddr::from(([127, 0, 0, 1], 8080)),
            CliArgs::default(),
            TomlConfig::default(),
        )
    }
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

        Self::from_parts(cli, toml_config)
    }

    /// Merge parsed CLI args with a parsed TOML file and validate the result.
    pub fn from_parts(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = match cli.listen {
            Some(ref listen) => listen.clone(),
            None => toml_config.server.listen.clone(),
        };
        let listen = parse_listen(&listen)?;

        Ok(Self::resolve(listen, cli, toml_config))
    }

    fn resolve(listen: SocketAddr, cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        let mailbox = toml_config.mailbox;

        Config {
            listen,
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            poll_timeout: Duration::from_millis(server.poll_timeout_ms),
            read_buffer_size: server.read_buffer_size.max(1),
            echo_to_sender: server.echo_to_sender,
            notify_rejections: server.notify_rejections,
            max_frame_length: toml_config.protocol.max_frame_length,
            max_pending_bytes: toml_config.protocol.max_pending_bytes,
            mailbox_workers: cli.workers.unwrap_or(mailbox.workers),
            mailbox_batch_size: mailbox.batch_size.max(1),
            mailbox_pop_timeout: Duration::from_millis(mailbox.pop_timeout_ms),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }
}

fn parse_listen(listen: &str) -> Result<SocketAddr, ConfigError> {
    match listen.parse::<SocketAddr>() {
        Ok(addr) if addr.port() != 0 => Ok(addr),
        _ => Err(ConfigError::InvalidListen(listen.to_string())),
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
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
                write!(
                    f,
                    "Invalid listen address '{}': expected host:port with a non-zero port",
                    addr
                )
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
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.server.max_connections, 1024);
        assert!(config.server.echo_to_sender);
        assert!(!config.server.notify_rejections);
        assert_eq!(config.protocol.max_frame_length, None);
        assert_eq!(config.mailbox.workers, 1);
        assert_eq!(config.logging.level, "info");

        let resolved = Config::default();
        assert_eq!(resolved.listen, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(resolved.poll_timeout, Duration::from_millis(100));
        assert_eq!(resolved.read_buffer_size, 2048);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            max_connections = 16
            echo_to_sender = false

            [protocol]
            max_frame_length = 65536

            [mailbox]
            workers = 0

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml_config.server.poll_timeout_ms, 100);
        assert_eq!(toml_config.mailbox.batch_size, 64);

        let config = Config::from_parts(CliArgs::default(), toml_config).unwrap();
        assert_eq!(config.listen, SocketAddr::from(([0, 0, 0, 0], 9000)));
        assert_eq!(config.max_connections, 16);
        assert!(!config.echo_to_sender);
        assert_eq!(config.max_frame_length, Some(65536));
        assert_eq!(config.max_pending_bytes, None);
        assert_eq!(config.mailbox_workers, 0);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            [mailbox]
            workers = 4
            "#,
        )
        .unwrap();
        let cli = CliArgs::parse_from([
            "framecast",
            "-l",
            "127.0.0.1:7000",
            "-w",
            "2",
            "--log-level",
            "warn",
        ]);

        let config = Config::from_parts(cli, toml_config).unwrap();
        assert_eq!(config.listen.port(), 7000);
        assert_eq!(config.mailbox_workers, 2);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_invalid_listen() {
        for bad in ["localhost", "127.0.0.1:0", "127.0.0.1:99999"] {
            let cli = CliArgs {
                listen: Some(bad.to_string()),
                ..CliArgs::default()
            };
            assert!(matches!(
                Config::from_parts(cli, TomlConfig::default()),
                Err(ConfigError::InvalidListen(_))
            ));
        }
    }
}
