//! Configuration Module
//!
//! Provides TOML-based configuration for mqttmux with support for:
//! - Channel behaviour (resend interval, command mode and timeout)
//! - Proxy settings (listen address, upstream broker, flow control)
//! - Environment variable overrides (MQTTMUX_* prefix)

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Channel and reactor configuration
    pub channel: ChannelConfig,
    /// Proxy configuration
    pub proxy: ProxyConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Channel manager configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Delay before an unacknowledged message is sent again, 0 disables
    #[serde(default = "default_resend_interval", with = "humantime_serde")]
    pub resend_interval: Duration,
    /// Whether manager calls wait for the reactor to run them
    #[serde(default = "default_true")]
    pub blocking: bool,
    /// Upper bound on how long a blocking call waits
    #[serde(default, with = "humantime_serde")]
    pub command_timeout: Option<Duration>,
}

fn default_resend_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            resend_interval: default_resend_interval(),
            blocking: true,
            command_timeout: None,
        }
    }
}

/// Proxy configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address downstream clients connect to
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Upstream broker, `tcp://host:port`
    #[serde(default = "default_broker_uri")]
    pub broker_uri: String,
    /// Upstream-bound messages a session may have unacknowledged before
    /// its members are paused
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u16,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 1883))
}

fn default_broker_uri() -> String {
    "tcp://localhost:1884".to_string()
}

fn default_max_in_flight() -> u16 {
    0xFFFF
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            broker_uri: default_broker_uri(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl ProxyConfig {
    pub fn broker(&self) -> Result<BrokerUri, ConfigError> {
        BrokerUri::parse(&self.broker_uri)
    }
}

/// Upstream broker address parsed from `tcp://host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUri {
    pub host: String,
    pub port: u16,
}

impl BrokerUri {
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| {
            ConfigError::Validation(format!("invalid broker URI '{}': {}", uri, reason))
        };

        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid("expected tcp://host:port"))?;
        if !scheme.eq_ignore_ascii_case("tcp") {
            return Err(invalid("only the tcp scheme is supported"));
        }
        let authority = rest.strip_suffix('/').unwrap_or(rest);
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|&p| p != 0)
            .ok_or_else(|| invalid("bad port"))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl BrokerUri {
    /// Look the host up; the first address wins
    pub fn resolve(&self) -> Result<SocketAddr, ConfigError> {
        let unresolved = |reason: String| {
            ConfigError::Validation(format!("cannot resolve broker {}: {}", self, reason))
        };
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| unresolved(e.to_string()))?
            .next()
            .ok_or_else(|| unresolved("no addresses".to_string()))
    }
}

impl fmt::Display for BrokerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQTTMUX__` prefix with double underscores for nesting:
    ///    - `MQTTMUX__PROXY__BIND=0.0.0.0:1884` overrides `proxy.bind`
    ///    - `MQTTMUX__CHANNEL__RESEND_INTERVAL=5s` overrides `channel.resend_interval`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("channel.resend_interval", "30s")?
            .set_default("channel.blocking", true)?
            .set_default("proxy.bind", "0.0.0.0:1883")?
            .set_default("proxy.broker_uri", "tcp://localhost:1884")?
            .set_default("proxy.max_in_flight", 0xFFFF)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MQTTMUX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.max_in_flight == 0 {
            return Err(ConfigError::Validation(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if let Some(timeout) = self.channel.command_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::Validation(
                    "command_timeout must be positive when set".to_string(),
                ));
            }
        }
        self.proxy.broker()?;
        Ok(())
    }
}
