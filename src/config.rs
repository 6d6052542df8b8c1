//! Configuration module for the hgs2hpc server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the conversion server
#[derive(Parser, Debug)]
#[command(name = "hgs2hpc")]
#[command(author = "hgs2hpc authors")]
#[command(version = "0.1.0")]
#[command(about = "Serves heliographic to helioprojective conversions over a Unix socket", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path of the Unix socket to listen on (e.g., /tmp/hgs2hpc.sock)
    #[arg(short, long)]
    pub socket: Option<PathBuf>,

    /// Permission mode applied to the socket file, in octal (e.g., 777)
    #[arg(short, long, value_parser = parse_mode)]
    pub mode: Option<u32>,

    /// Maximum number of pending connections
    #[arg(short, long)]
    pub backlog: Option<u32>,

    /// Transformer helper program started once per connection
    #[arg(short = 'x', long)]
    pub transformer: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transformer: TransformerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Socket path to bind
    #[serde(default = "default_socket")]
    pub socket: PathBuf,
    /// Permission mode of the socket file
    #[serde(default = "default_mode")]
    pub mode: u32,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            mode: default_mode(),
            backlog: default_backlog(),
            workers: None,
        }
    }
}

/// Transformer helper configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TransformerConfig {
    /// Program to run
    pub command: Option<String>,
    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,
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

fn default_socket() -> PathBuf {
    PathBuf::from("/tmp/hgs2hpc.sock")
}

fn default_mode() -> u32 {
    0o777 // any local user may connect
}

fn default_backlog() -> u32 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Parse an octal permission mode such as `777`, `0777` or `0o777`.
fn parse_mode(value: &str) -> Result<u32, String> {
    let digits = value.strip_prefix("0o").unwrap_or(value);
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|e| format!("invalid octal mode '{value}': {e}"))?;
    if mode > 0o7777 {
        return Err(format!("mode '{value}' is out of range"));
    }
    Ok(mode)
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub socket: PathBuf,
    pub mode: u32,
    pub backlog: u32,
    pub transformer_command: String,
    pub transformer_args: Vec<String>,
    pub workers: Option<usize>,
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

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        if toml_config.server.mode > 0o7777 {
            return Err(ConfigError::InvalidMode(toml_config.server.mode));
        }

        let transformer_command = cli
            .transformer
            .or(toml_config.transformer.command)
            .ok_or(ConfigError::MissingTransformer)?;

        Ok(Config {
            socket: cli.socket.unwrap_or(toml_config.server.socket),
            mode: cli.mode.unwrap_or(toml_config.server.mode),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            transformer_command,
            transformer_args: toml_config.transformer.args,
            workers: cli.workers.or(toml_config.server.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidMode(u32),
    MissingTransformer,
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
            ConfigError::InvalidMode(mode) => {
                write!(f, "Socket mode {mode:#o} is out of range")
            }
            ConfigError::MissingTransformer => write!(
                f,
                "No transformer configured: pass --transformer or set [transformer] command"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["hgs2hpc"];
        argv.extend_from_slice(args);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.socket, PathBuf::from("/tmp/hgs2hpc.sock"));
        assert_eq!(config.server.mode, 0o777);
        assert_eq!(config.server.backlog, 10_000);
        assert!(config.transformer.command.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            socket = "/run/hgs2hpc/convert.sock"
            mode = 0o770
            backlog = 64
            workers = 4

            [transformer]
            command = "python3"
            args = ["-u", "hgs2hpc_helper.py"]

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.server.socket,
            PathBuf::from("/run/hgs2hpc/convert.sock")
        );
        assert_eq!(config.server.mode, 0o770);
        assert_eq!(config.server.backlog, 64);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.transformer.command.as_deref(), Some("python3"));
        assert_eq!(config.transformer.args, vec!["-u", "hgs2hpc_helper.py"]);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            socket = "/tmp/from-file.sock"
            backlog = 5

            [transformer]
            command = "file-helper"

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["-s", "/tmp/from-cli.sock", "-x", "cli-helper", "-m", "0o700"]),
            toml_config,
        )
        .unwrap();

        assert_eq!(config.socket, PathBuf::from("/tmp/from-cli.sock"));
        assert_eq!(config.transformer_command, "cli-helper");
        assert_eq!(config.mode, 0o700);
        assert_eq!(config.backlog, 5);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_missing_transformer() {
        let result = Config::merge(cli(&[]), TomlConfig::default());
        assert!(matches!(result, Err(ConfigError::MissingTransformer)));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("777"), Ok(0o777));
        assert_eq!(parse_mode("0777"), Ok(0o777));
        assert_eq!(parse_mode("0o660"), Ok(0o660));
        assert!(parse_mode("789").is_err());
        assert!(parse_mode("17777").is_err());
    }
}
