//! mqttmux - N:1 MQTT 3.1 proxy
//!
//! Usage:
//!   mqttmux [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>          Configuration file path
//!   -b, --bind <ADDR>            Bind address (default: 0.0.0.0:1883)
//!   --broker <URI>               Upstream broker (default: tcp://localhost:1884)
//!   --max-in-flight <N>          Unacknowledged upstream messages per session
//!   --resend-interval <SECS>     Resend delay for unacknowledged messages, 0 disables
//!   -l, --log-level              Log level (error, warn, info, debug, trace)
//!   -h, --help                   Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mqttmux::config::Config;
use mqttmux::manager::ChannelManager;
use mqttmux::proxy;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

/// mqttmux - shares one upstream MQTT session between many client connections
#[derive(Parser, Debug)]
#[command(name = "mqttmux")]
#[command(author = "mqttmux Contributors")]
#[command(version)]
#[command(about = "N:1 MQTT 3.1 session proxy")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address for downstream clients
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Upstream broker URI (tcp://host:port)
    #[arg(long)]
    broker: Option<String>,

    /// Unacknowledged upstream-bound messages per session before pausing clients
    #[arg(long)]
    max_in_flight: Option<u16>,

    /// Seconds before an unacknowledged message is resent (0 disables)
    #[arg(long)]
    resend_interval: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    // CLI overrides config, config overrides default (warn)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Some(bind) = args.bind {
        config.proxy.bind = bind;
    }
    if let Some(broker) = args.broker {
        config.proxy.broker_uri = broker;
    }
    if let Some(max_in_flight) = args.max_in_flight {
        config.proxy.max_in_flight = max_in_flight;
    }
    if let Some(secs) = args.resend_interval {
        config.channel.resend_interval = Duration::from_secs(secs);
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!("Starting mqttmux proxy");
    info!("  Upstream broker: {}", config.proxy.broker_uri);
    info!("  Max in flight per session: {}", config.proxy.max_in_flight);
    info!("  Resend interval: {:?}", config.channel.resend_interval);

    let manager = ChannelManager::start(&config.channel)?;
    let addr = proxy::start(&manager, &config.proxy)?;
    info!("  Bind address: {}", addr);

    // The reactor thread does all the work from here on
    loop {
        std::thread::park();
    }
}
