//! Configuration module for echo-rate.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Which side of the echo exchange this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

/// Transport used for the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Tcp,
    Udp,
}

/// Scheduling model for the client pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Single session driven by a synchronous mio polling loop.
    Mio,
    /// Any number of sessions as cooperative tasks on one tokio thread.
    Tokio,
}

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "echo-rate")]
#[command(author = "echo-rate authors")]
#[command(version = "0.1.0")]
#[command(about = "TCP/UDP echo throughput client and server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run as server or client
    #[arg(short, long, value_enum)]
    pub role: Option<Role>,

    /// Transport protocol
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportType>,

    /// Client scheduling model
    #[arg(long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Peer host for clients, bind host for servers
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to connect to or listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of concurrent client sessions
    #[arg(short = 'n', long)]
    pub sessions: Option<usize>,

    /// Unacknowledged bytes allowed before a client stops sending
    #[arg(long)]
    pub max_inflight_bytes: Option<usize>,

    /// Maximum bytes per TCP read
    #[arg(long)]
    pub recv_chunk_size: Option<usize>,

    /// Client read/write deadline in milliseconds
    #[arg(long)]
    pub io_timeout_ms: Option<u64>,

    /// TCP server idle eviction timeout in milliseconds
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// Rate report interval in milliseconds
    #[arg(long)]
    pub report_interval_ms: Option<u64>,

    /// Stop each client session after this many echoed bytes
    #[arg(long)]
    pub limit_bytes: Option<u64>,

    /// Disable checking echoed bytes against the payload
    #[arg(long)]
    pub no_verify: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Addressing shared by both roles
#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default = "default_transport")]
    pub transport: TransportType,
    /// Peer or bind host; the role default applies when unset
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum bytes per TCP read, on either side
    #[serde(default = "default_recv_chunk_size")]
    pub recv_chunk_size: usize,
    /// Report interval; the role default applies when unset
    pub report_interval_ms: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            transport: default_transport(),
            host: None,
            port: default_port(),
            recv_chunk_size: default_recv_chunk_size(),
            report_interval_ms: None,
        }
    }
}

/// Client pump settings
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeType,
    #[serde(default = "default_sessions")]
    pub sessions: usize,
    #[serde(default = "default_max_inflight_bytes")]
    pub max_inflight_bytes: usize,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_verify")]
    pub verify: bool,
    pub limit_bytes: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            sessions: default_sessions(),
            max_inflight_bytes: default_max_inflight_bytes(),
            io_timeout_ms: default_io_timeout_ms(),
            verify: default_verify(),
            limit_bytes: None,
        }
    }
}

/// Server multiplexer settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_udp_idle_reset_ms")]
    pub udp_idle_reset_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            udp_idle_reset_ms: default_udp_idle_reset_ms(),
            max_connections: default_max_connections(),
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

fn default_role() -> Role {
    Role::Server
}

fn default_transport() -> TransportType {
    TransportType::Tcp
}

fn default_runtime() -> RuntimeType {
    RuntimeType::Mio
}

fn default_host(role: Role) -> String {
    match role {
        Role::Client => "127.0.0.1".to_string(),
        Role::Server => "0.0.0.0".to_string(),
    }
}

fn default_port() -> u16 {
    4242
}

fn default_sessions() -> usize {
    1
}

fn default_max_inflight_bytes() -> usize {
    8192
}

fn default_recv_chunk_size() -> usize {
    1024
}

fn default_io_timeout_ms() -> u64 {
    5000
}

fn default_idle_timeout_ms() -> u64 {
    10_000
}

fn default_udp_idle_reset_ms() -> u64 {
    6000
}

fn default_max_connections() -> usize {
    1024
}

fn default_verify() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_report_interval(role: Role) -> Duration {
    match role {
        Role::Client => Duration::from_secs(2),
        Role::Server => Duration::from_secs(5),
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub transport: TransportType,
    pub runtime: RuntimeType,
    pub host: String,
    pub port: u16,
    pub sessions: usize,
    pub max_inflight_bytes: usize,
    pub recv_chunk_size: usize,
    pub io_timeout: Duration,
    pub idle_timeout: Duration,
    pub udp_idle_reset: Duration,
    pub report_interval: Duration,
    pub max_connections: usize,
    pub verify: bool,
    pub limit_bytes: Option<u64>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(None, TomlConfig::default())
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

        let config = Config::merge(Some(cli), toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: Option<CliArgs>, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            network,
            client,
            server,
            logging,
        } = toml_config;

        let role = cli.as_ref().and_then(|c| c.role).unwrap_or(network.role);
        let report_interval = cli
            .as_ref()
            .and_then(|c| c.report_interval_ms)
            .or(network.report_interval_ms)
            .map(Duration::from_millis)
            .unwrap_or_else(|| default_report_interval(role));

        let mut config = Config {
            role,
            transport: network.transport,
            runtime: client.runtime,
            host: network.host.unwrap_or_else(|| default_host(role)),
            port: network.port,
            sessions: client.sessions,
            max_inflight_bytes: client.max_inflight_bytes,
            recv_chunk_size: network.recv_chunk_size,
            io_timeout: Duration::from_millis(client.io_timeout_ms),
            idle_timeout: Duration::from_millis(server.idle_timeout_ms),
            udp_idle_reset: Duration::from_millis(server.udp_idle_reset_ms),
            report_interval,
            max_connections: server.max_connections,
            verify: client.verify,
            limit_bytes: client.limit_bytes,
            log_level: logging.level,
        };

        let Some(cli) = cli else {
            return config;
        };

        if let Some(transport) = cli.transport {
            config.transport = transport;
        }
        if let Some(runtime) = cli.runtime {
            config.runtime = runtime;
        }
        if let Some(host) = cli.host {
            config.host = host;
        }
        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(sessions) = cli.sessions {
            config.sessions = sessions;
        }
        if let Some(max_inflight_bytes) = cli.max_inflight_bytes {
            config.max_inflight_bytes = max_inflight_bytes;
        }
        if let Some(recv_chunk_size) = cli.recv_chunk_size {
            config.recv_chunk_size = recv_chunk_size;
        }
        if let Some(ms) = cli.io_timeout_ms {
            config.io_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = cli.idle_timeout_ms {
            config.idle_timeout = Duration::from_millis(ms);
        }
        if cli.limit_bytes.is_some() {
            config.limit_bytes = cli.limit_bytes;
        }
        if cli.no_verify {
            config.verify = false;
        }
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }

        config
    }

    /// Reject combinations the pumps and multiplexers cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sessions == 0 {
            return Err(ConfigError::Invalid("sessions must be at least 1".into()));
        }
        if self.recv_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "recv_chunk_size must be greater than 0".into(),
            ));
        }
        if self.role == Role::Client && self.runtime == RuntimeType::Mio && self.sessions > 1 {
            return Err(ConfigError::Invalid(format!(
                "the mio client runtime drives a single session; use --runtime tokio for {} sessions",
                self.sessions
            )));
        }
        Ok(())
    }

    /// Address string clients connect to and servers bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
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
