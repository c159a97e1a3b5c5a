//! Configuration module for echo-bench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over the built-in defaults.

use bytes::Bytes;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the load generator
#[derive(Parser, Debug, Default)]
#[command(name = "echo-bench")]
#[command(author = "echo-bench authors")]
#[command(version = "0.1.0")]
#[command(about = "A concurrent load generator for TCP echo servers", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server address to connect to (e.g., 127.0.0.1:12345)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Number of concurrent connections
    #[arg(short = 'n', long)]
    pub connections: Option<usize>,

    /// Requests sent on each connection
    #[arg(short, long)]
    pub iterations: Option<u64>,

    /// Payload sent on every request; `\n`, `\r`, `\t`, `\0` and `\\` are unescaped
    #[arg(short, long)]
    pub payload: Option<String>,

    /// Maximum bytes read per reply
    #[arg(long)]
    pub read_buffer: Option<usize>,

    /// Compare every reply with the payload
    #[arg(long)]
    pub verify: bool,

    /// Connect timeout in seconds (0 = no timeout)
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Timeout for each write and read in seconds (0 = no timeout)
    #[arg(long)]
    pub io_timeout: Option<u64>,

    /// Report format (text, json)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Run the built-in echo server on the target address instead of the benchmark
    #[arg(long)]
    pub serve: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Target server configuration
#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    /// Address of the echo server
    #[serde(default = "default_address")]
    pub address: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

/// Load shape configuration
#[derive(Debug, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_connections")]
    pub connections: usize,
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    /// Payload, with the same escapes as the CLI flag
    #[serde(default = "default_payload")]
    pub payload: String,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default)]
    pub verify: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            connections: default_connections(),
            iterations: default_iterations(),
            payload: default_payload(),
            read_buffer_size: default_read_buffer_size(),
            verify: false,
        }
    }
}

/// Timeout configuration, in seconds. Zero disables a timeout.
#[derive(Debug, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_io_secs")]
    pub io_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            io_secs: default_io_secs(),
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

fn default_address() -> String {
    "127.0.0.1:12345".to_string()
}

fn default_connections() -> usize {
    100
}

fn default_iterations() -> u64 {
    1000
}

fn default_payload() -> String {
    "hello\\n".to_string()
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_connect_secs() -> u64 {
    5
}

fn default_io_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// How the final report is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(ConfigError::Invalid(format!(
                "unknown output format '{other}' (expected text or json)"
            ))),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub target: String,
    pub connections: usize,
    pub iterations: u64,
    pub payload: Bytes,
    pub read_buffer_size: usize,
    pub verify: bool,
    pub connect_timeout: Option<Duration>,
    pub io_timeout: Option<Duration>,
    pub output: OutputFormat,
    pub serve: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target: default_address(),
            connections: default_connections(),
            iterations: default_iterations(),
            payload: Bytes::from(unescape(&default_payload())),
            read_buffer_size: default_read_buffer_size(),
            verify: false,
            connect_timeout: secs(default_connect_secs()),
            io_timeout: secs(default_io_secs()),
            output: OutputFormat::Text,
            serve: false,
            log_level: default_log_level(),
        }
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

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over a parsed TOML config and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let payload = unescape(&cli.payload.unwrap_or(toml_config.load.payload));
        let output = match cli.output {
            Some(ref s) => s.parse()?,
            None => OutputFormat::Text,
        };

        let config = Config {
            target: cli.target.unwrap_or(toml_config.target.address),
            connections: cli.connections.unwrap_or(toml_config.load.connections),
            iterations: cli.iterations.unwrap_or(toml_config.load.iterations),
            payload: Bytes::from(payload),
            read_buffer_size: cli.read_buffer.unwrap_or(toml_config.load.read_buffer_size),
            verify: cli.verify || toml_config.load.verify,
            connect_timeout: secs(cli.connect_timeout.unwrap_or(toml_config.timeouts.connect_secs)),
            io_timeout: secs(cli.io_timeout.unwrap_or(toml_config.timeouts.io_secs)),
            output,
            serve: cli.serve,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Total requests the run is expected to issue.
    ///
    /// Validation guarantees the product fits in a `u64`.
    pub fn total_requests(&self) -> u64 {
        (self.connections as u64).saturating_mul(self.iterations)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.connections == 0 {
            return Err(ConfigError::Invalid("connections must be at least 1".into()));
        }
        if self.iterations == 0 {
            return Err(ConfigError::Invalid("iterations must be at least 1".into()));
        }
        if self.payload.is_empty() {
            return Err(ConfigError::Invalid("payload must not be empty".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "read buffer size must be at least 1".into(),
            ));
        }
        if (self.connections as u64).checked_mul(self.iterations).is_none() {
            return Err(ConfigError::Invalid(format!(
                "{} connections x {} iterations overflows the request count",
                self.connections, self.iterations
            )));
        }
        Ok(())
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

/// Expand the backslash escapes accepted in payload strings.
///
/// Unknown escapes are kept verbatim, backslash included.
fn unescape(input: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();

    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'0') => out.push(0),
            Some(b'\\') => out.push(b'\\'),
            Some(other) => {
                out.push(b'\\');
                out.push(other);
            }
            None => out.push(b'\\'),
        }
    }

    out
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.target, "127.0.0.1:12345");
        assert_eq!(config.connections, 100);
        assert_eq!(config.iterations, 1000);
        assert_eq!(&config.payload[..], b"hello\n");
        assert_eq!(config.read_buffer_size, 4096);
        assert!(!config.verify);
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.io_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.output, OutputFormat::Text);
        assert_eq!(config.total_requests(), 100_000);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [target]
            address = "10.0.0.1:7"

            [load]
            connections = 8
            iterations = 50
            payload = "ping\r\n"
            verify = true

            [timeouts]
            connect_secs = 0
            io_secs = 2

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml_config.load.read_buffer_size, 4096);

        let config = Config::resolve(CliArgs::default(), toml_config).unwrap();
        assert_eq!(config.target, "10.0.0.1:7");
        assert_eq!(config.connections, 8);
        assert_eq!(config.iterations, 50);
        assert_eq!(&config.payload[..], b"ping\r\n");
        assert!(config.verify);
        assert_eq!(config.connect_timeout, None);
        assert_eq!(config.io_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [load]
            connections = 8
            iterations = 50
        "#,
        )
        .unwrap();
        let cli = CliArgs {
            connections: Some(2),
            output: Some("JSON".to_string()),
            ..CliArgs::default()
        };

        let config = Config::resolve(cli, toml_config).unwrap();
        assert_eq!(config.connections, 2);
        assert_eq!(config.iterations, 50);
        assert_eq!(config.output, OutputFormat::Json);
    }

    #[test]
    fn test_cli_flags_parse() {
        let cli = CliArgs::try_parse_from([
            "echo-bench",
            "-t",
            "localhost:9000",
            "-n",
            "10",
            "-i",
            "100",
            "-p",
            "k",
            "--verify",
        ])
        .unwrap();

        let config = Config::resolve(cli, TomlConfig::default()).unwrap();
        assert_eq!(config.target, "localhost:9000");
        assert_eq!(config.total_requests(), 1000);
        assert_eq!(&config.payload[..], b"k");
        assert!(config.verify);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let zero_connections = CliArgs {
            connections: Some(0),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::resolve(zero_connections, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));

        let zero_iterations = CliArgs {
            iterations: Some(0),
            ..CliArgs::default()
        };
        assert!(Config::resolve(zero_iterations, TomlConfig::default()).is_err());

        let empty_payload = CliArgs {
            payload: Some(String::new()),
            ..CliArgs::default()
        };
        assert!(Config::resolve(empty_payload, TomlConfig::default()).is_err());

        let overflowing = CliArgs {
            connections: Some(2),
            iterations: Some(u64::MAX),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::resolve(overflowing, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));

        let largest = CliArgs {
            connections: Some(1),
            iterations: Some(u64::MAX),
            ..CliArgs::default()
        };
        let config = Config::resolve(largest, TomlConfig::default()).unwrap();
        assert_eq!(config.total_requests(), u64::MAX);

        let bad_output = CliArgs {
            output: Some("csv".to_string()),
            ..CliArgs::default()
        };
        assert!(Config::resolve(bad_output, TomlConfig::default()).is_err());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("hello\\n"), b"hello\n");
        assert_eq!(unescape("a\\tb\\r\\n"), b"a\tb\r\n");
        assert_eq!(unescape("\\\\n"), b"\\n");
        assert_eq!(unescape("\\0"), [0u8]);
        assert_eq!(unescape("\\x"), b"\\x");
        assert_eq!(unescape("end\\"), b"end\\");
    }
}
