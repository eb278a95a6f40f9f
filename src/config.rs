//! Configuration for the beansdb front end.
//!
//! Supports both command-line arguments and an optional TOML configuration
//! file. CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "beansdb")]
#[command(author = "beansdb authors")]
#[command(version = "1.0.0")]
#[command(about = "A memcached-compatible persistent key-value server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:7900)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Directory the storage engine keeps its data files in
    #[arg(short = 'H', long)]
    pub home: Option<String>,

    /// Number of reactor worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum value size in bytes a `set`/`append` will accept
    #[arg(short = 'M', long)]
    pub max_value_size: Option<usize>,

    /// Allow the `stopme` command to shut the server down
    #[arg(long)]
    pub enable_stop: bool,

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
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of reactor worker threads
    pub workers: Option<usize>,
    /// Initial per-connection read buffer size
    #[serde(default = "default_read_buf_size")]
    pub read_buf_size: usize,
    /// Read buffer capacity above which it is shrunk back down on idle
    #[serde(default = "default_read_buf_high_watermark")]
    pub read_buf_high_watermark: usize,
    /// Maximum number of pooled connection records kept on the freelist
    #[serde(default = "default_freelist_cap")]
    pub freelist_cap: usize,
    /// Maximum concurrent connections accepted per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Wall-clock threshold (ms) past which a command counts as slow
    #[serde(default = "default_slow_cmd_threshold_ms")]
    pub slow_cmd_threshold_ms: u64,
    /// Whether the `stopme` command is honored
    #[serde(default)]
    pub enable_stop: bool,
    /// Maximum verbosity level accepted by the `verbosity` command
    #[serde(default = "default_max_verbosity")]
    pub max_verbosity: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            read_buf_size: default_read_buf_size(),
            read_buf_high_watermark: default_read_buf_high_watermark(),
            freelist_cap: default_freelist_cap(),
            max_connections: default_max_connections(),
            slow_cmd_threshold_ms: default_slow_cmd_threshold_ms(),
            enable_stop: false,
            max_verbosity: default_max_verbosity(),
        }
    }
}

/// Storage-related configuration.
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Directory the storage engine keeps its data files in
    #[serde(default = "default_home")]
    pub home: String,
    /// Maximum accepted value size, in bytes, for `set`/`append`
    #[serde(default = "default_max_value_size")]
    pub max_value_size: usize,
    /// `(limit_kb, period_secs)` passed to the background flush loop
    #[serde(default = "default_flush_limit_kb")]
    pub flush_limit_kb: usize,
    #[serde(default = "default_flush_period_secs")]
    pub flush_period_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            max_value_size: default_max_value_size(),
            flush_limit_kb: default_flush_limit_kb(),
            flush_period_secs: default_flush_period_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    "0.0.0.0:7900".to_string()
}
fn default_home() -> String {
    "./data".to_string()
}
fn default_read_buf_size() -> usize {
    16 * 1024
}
fn default_read_buf_high_watermark() -> usize {
    1024 * 1024
}
fn default_freelist_cap() -> usize {
    512
}
fn default_max_connections() -> usize {
    10_000
}
fn default_slow_cmd_threshold_ms() -> u64 {
    100
}
fn default_max_verbosity() -> i64 {
    2
}
fn default_max_value_size() -> usize {
    1024 * 1024
}
fn default_flush_limit_kb() -> usize {
    16 * 1024
}
fn default_flush_period_secs() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration, merged from CLI args and TOML file.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub home: String,
    pub workers: usize,
    pub read_buf_size: usize,
    pub read_buf_high_watermark: usize,
    pub freelist_cap: usize,
    pub max_connections: usize,
    pub slow_cmd_threshold_ms: u64,
    pub enable_stop: bool,
    pub max_verbosity: i64,
    pub max_value_size: usize,
    pub flush_limit_kb: usize,
    pub flush_period_secs: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::from_cli(cli)
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let workers = cli
            .workers
            .or(toml_config.server.workers)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            });

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            home: cli.home.unwrap_or(toml_config.storage.home),
            workers,
            read_buf_size: toml_config.server.read_buf_size,
            read_buf_high_watermark: toml_config.server.read_buf_high_watermark,
            freelist_cap: toml_config.server.freelist_cap,
            max_connections: toml_config.server.max_connections,
            slow_cmd_threshold_ms: toml_config.server.slow_cmd_threshold_ms,
            enable_stop: cli.enable_stop || toml_config.server.enable_stop,
            max_verbosity: toml_config.server.max_verbosity,
            max_value_size: cli.max_value_size.unwrap_or(toml_config.storage.max_value_size),
            flush_limit_kb: toml_config.storage.flush_limit_kb,
            flush_period_secs: toml_config.storage.flush_period_secs,
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
    fn default_toml_config_has_sane_values() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:7900");
        assert_eq!(config.storage.max_value_size, 1024 * 1024);
        assert!(!config.server.enable_stop);
    }

    #[test]
    fn toml_parsing_overrides_defaults() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:7900"
            workers = 4
            enable_stop = true

            [storage]
            home = "/var/lib/beansdb"
            max_value_size = 4194304

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:7900");
        assert_eq!(config.server.workers, Some(4));
        assert!(config.server.enable_stop);
        assert_eq!(config.storage.home, "/var/lib/beansdb");
        assert_eq!(config.storage.max_value_size, 4194304);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn cli_overrides_toml() {
        let cli = CliArgs {
            config: None,
            listen: Some("127.0.0.1:9999".to_string()),
            home: None,
            workers: Some(2),
            max_value_size: None,
            enable_stop: false,
            log_level: "info".to_string(),
        };
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9999");
        assert_eq!(config.workers, 2);
    }
}
