//! Configuration for the beansd server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use chrono::NaiveDateTime;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

const BEFORE_TIME_FORMAT: &str = "%Y-%m-%d-%H:%M:%S";

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "beansd")]
#[command(version)]
#[command(about = "A memcached-compatible front end for an append-only key-value store", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// TCP port to listen on
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Interface to listen on
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Max simultaneous connections
    #[arg(short = 'c', long)]
    pub maxconns: Option<usize>,

    /// Number of worker threads
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Home of the database; multiple directories separated by `,` or `:`
    #[arg(short = 'H', long)]
    pub dbhome: Option<String>,

    /// Log16 of the number of database files
    #[arg(short = 'T', long)]
    pub height: Option<u8>,

    /// Slow command time limit, in milliseconds
    #[arg(short = 's', long)]
    pub slow_ms: Option<u64>,

    /// Flush period, in seconds
    #[arg(short = 'f', long)]
    pub flush_period: Option<u32>,

    /// Flush limit, in KB
    #[arg(short = 'n', long)]
    pub flush_limit: Option<u32>,

    /// Serve only data written before this time (read-only),
    /// as YYYY-MM-DD-HH:MM:SS
    #[arg(short = 'm', long)]
    pub before: Option<String>,

    /// Max size of a data file in MB (5..=4000)
    #[arg(short = 'F', long)]
    pub max_bucket_mb: Option<u32>,

    /// Check file sizes against buckets.txt at startup
    #[arg(short = 'C', long)]
    pub check_file_size: bool,

    /// Allow shutdown through the `stopme` command
    #[arg(short = 'S', long)]
    pub enable_stopme: bool,

    /// Verbose output; repeat for very verbose
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub flush: FlushSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_maxconns")]
    pub maxconns: usize,
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Capacity of the connection-shell freelist; 0 disables pooling.
    #[serde(default = "default_conn_pool")]
    pub conn_pool: usize,
    #[serde(default = "default_slow_ms")]
    pub slow_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            listen: default_listen(),
            port: default_port(),
            maxconns: default_maxconns(),
            threads: default_threads(),
            conn_pool: default_conn_pool(),
            slow_ms: default_slow_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_home")]
    pub home: String,
    #[serde(default = "default_height")]
    pub height: u8,
    #[serde(default = "default_max_bucket_mb")]
    pub max_bucket_mb: u32,
    #[serde(default)]
    pub check_file_size: bool,
}

impl Default for StorageSection {
    fn default() -> Self {
        StorageSection {
            home: default_home(),
            height: default_height(),
            max_bucket_mb: default_max_bucket_mb(),
            check_file_size: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FlushSection {
    #[serde(default = "default_flush_period")]
    pub period: u32,
    #[serde(default = "default_flush_limit")]
    pub limit_kb: u32,
}

impl Default for FlushSection {
    fn default() -> Self {
        FlushSection {
            period: default_flush_period(),
            limit_kb: default_flush_limit(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7900
}

fn default_maxconns() -> usize {
    1024
}

fn default_threads() -> usize {
    16
}

fn default_conn_pool() -> usize {
    200
}

fn default_slow_ms() -> u64 {
    100
}

fn default_home() -> String {
    "testdb".to_string()
}

fn default_height() -> u8 {
    1
}

fn default_max_bucket_mb() -> u32 {
    4000
}

fn default_flush_period() -> u32 {
    600
}

fn default_flush_limit() -> u32 {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub port: u16,
    pub maxconns: usize,
    pub threads: usize,
    pub homes: Vec<PathBuf>,
    pub height: u8,
    pub slow_cmd_ms: u64,
    pub flush_period: u32,
    pub flush_limit_kb: u32,
    /// Unix time; non-zero puts the store into read-only mode.
    pub before_time: i64,
    pub max_bucket_mb: u32,
    pub check_file_size: bool,
    pub stopme: bool,
    pub verbose: u8,
    pub conn_pool: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: default_listen(),
            port: default_port(),
            maxconns: default_maxconns(),
            threads: default_threads(),
            homes: vec![PathBuf::from(default_home())],
            height: default_height(),
            slow_cmd_ms: default_slow_ms(),
            flush_period: default_flush_period(),
            flush_limit_kb: default_flush_limit(),
            before_time: 0,
            max_bucket_mb: default_max_bucket_mb(),
            check_file_size: false,
            stopme: false,
            verbose: 0,
            conn_pool: default_conn_pool(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and an optional TOML file; CLI
    /// arguments win.
    pub fn load() -> Result<Config, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let before_time = match cli.before {
            Some(ref s) => parse_before_time(s)?,
            None => 0,
        };

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            port: cli.port.unwrap_or(toml_config.server.port),
            maxconns: cli.maxconns.unwrap_or(toml_config.server.maxconns),
            threads: cli.threads.unwrap_or(toml_config.server.threads),
            homes: split_homes(&cli.dbhome.unwrap_or(toml_config.storage.home)),
            height: cli.height.unwrap_or(toml_config.storage.height),
            slow_cmd_ms: cli.slow_ms.unwrap_or(toml_config.server.slow_ms),
            flush_period: cli.flush_period.unwrap_or(toml_config.flush.period),
            flush_limit_kb: cli.flush_limit.unwrap_or(toml_config.flush.limit_kb),
            before_time,
            max_bucket_mb: cli
                .max_bucket_mb
                .unwrap_or(toml_config.storage.max_bucket_mb),
            check_file_size: cli.check_file_size || toml_config.storage.check_file_size,
            stopme: cli.enable_stopme,
            verbose: cli.verbose,
            conn_pool: toml_config.server.conn_pool,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if !(5..=4000).contains(&self.max_bucket_mb) {
            return Err(ConfigError::BadBucketSize(self.max_bucket_mb));
        }
        if self.homes.is_empty() {
            return Err(ConfigError::NoHomes);
        }
        Ok(())
    }
}

fn split_homes(spec: &str) -> Vec<PathBuf> {
    spec.split(|c: char| c == ',' || c == ':')
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn parse_before_time(spec: &str) -> Result<i64, ConfigError> {
    let naive = NaiveDateTime::parse_from_str(spec, BEFORE_TIME_FORMAT)
        .map_err(|_| ConfigError::BadBeforeTime(spec.to_string()))?;
    naive
        .and_local_timezone(chrono::Local)
        .earliest()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| ConfigError::BadBeforeTime(spec.to_string()))
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    BadBeforeTime(String),
    BadBucketSize(u32),
    NoThreads,
    NoHomes,
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
            ConfigError::BadBeforeTime(s) => {
                write!(f, "Invalid time '{}', need {}", s, BEFORE_TIME_FORMAT)
            }
            ConfigError::BadBucketSize(mb) => {
                write!(f, "Max bucket size {} MB out of range (5..=4000)", mb)
            }
            ConfigError::NoThreads => write!(f, "Number of threads must be greater than 0"),
            ConfigError::NoHomes => write!(f, "At least one database home is required"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 7900);
        assert_eq!(config.threads, 16);
        assert_eq!(config.maxconns, 1024);
        assert_eq!(config.homes, vec![PathBuf::from("testdb")]);
        assert_eq!(config.slow_cmd_ms, 100);
        assert_eq!(config.flush_period, 600);
        assert_eq!(config.flush_limit_kb, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1"
            port = 7901
            threads = 4
            conn_pool = 0

            [storage]
            home = "db1,db2"
            height = 2

            [flush]
            period = 60
            limit_kb = 512

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1");
        assert_eq!(config.server.port, 7901);
        assert_eq!(config.server.threads, 4);
        assert_eq!(config.server.conn_pool, 0);
        assert_eq!(config.storage.home, "db1,db2");
        assert_eq!(config.flush.period, 60);
        assert_eq!(config.flush.limit_kb, 512);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_split_homes() {
        assert_eq!(
            split_homes("a,b:c"),
            vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")]
        );
        assert_eq!(split_homes("testdb"), vec![PathBuf::from("testdb")]);
    }

    #[test]
    fn test_before_time_parsing() {
        let ts = parse_before_time("2020-01-02-03:04:05").unwrap();
        assert!(ts > 1_500_000_000);
        assert!(parse_before_time("not-a-time").is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.threads = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NoThreads)));

        let mut config = Config::default();
        config.max_bucket_mb = 4001;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadBucketSize(4001))
        ));
    }
}
