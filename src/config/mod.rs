use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::ConnectionKind;

const CONFIG_LOCATIONS: &[&str] = &["config/inverter2http.yaml", "inverter2http.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("Unable to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: serde_yml::Error },
    #[error("Network transport selected but no host given")]
    MissingHost,
    #[error("Serial transport selected but no serial port given")]
    MissingSerialPort,
    #[error("Invalid collector url {0}")]
    InvalidCollectorUrl(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("Unknown log level {0}, expected debug, info, warning, error or critical")]
    UnknownLogLevel(String),
}

#[derive(Deserialize, Serialize, Clone, Copy, PartialEq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Network,
}

fn serial_port_default() -> String { "/dev/ttyUSB0".to_string() }
fn serial_baudrate_default() -> u32 { 9600 }
fn slave_id_default() -> u8 { 1 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SerialConfig {
    #[serde(default="serial_port_default")]
    pub port: String,
    #[serde(default="serial_baudrate_default")]
    pub baudrate: u32,
    #[serde(default="slave_id_default")]
    pub slave_id: u8,
}

fn network_port_default() -> u16 { 502 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct NetworkConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default="network_port_default")]
    pub port: u16,
    #[serde(default="slave_id_default")]
    pub slave_id: u8,
}

fn serial_default() -> SerialConfig {
    SerialConfig { port: serial_port_default(), baudrate: serial_baudrate_default(), slave_id: slave_id_default() }
}
fn network_default() -> NetworkConfig {
    NetworkConfig { host: None, port: network_port_default(), slave_id: slave_id_default() }
}
fn transport_kind_default() -> TransportKind { TransportKind::Serial }
fn device_timeout_default() -> u64 { 5 }
fn expected_model_default() -> String { "SUN2000".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    #[serde(default="transport_kind_default")]
    pub transport: TransportKind,
    #[serde(default="serial_default")]
    pub serial: SerialConfig,
    #[serde(default="network_default")]
    pub network: NetworkConfig,
    /// Seconds a single request may take
    #[serde(default="device_timeout_default")]
    pub timeout: u64,
    /// Model name prefix the identity probe must see, empty disables the check
    #[serde(default="expected_model_default")]
    pub expected_model: String,
}

fn poll_interval_default() -> u64 { 30 }
fn retry_delay_default() -> u64 { 5 }
fn max_consecutive_errors_default() -> u32 { 5 }
fn connect_retry_delay_default() -> u64 { 30 }
fn reconnect_delay_default() -> u64 { 10 }
fn reconnect_backoff_default() -> u64 { 60 }

/// All values are seconds except the error threshold
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PollingConfig {
    #[serde(default="poll_interval_default")]
    pub interval: u64,
    #[serde(default="retry_delay_default")]
    pub retry_delay: u64,
    #[serde(default="max_consecutive_errors_default")]
    pub max_consecutive_errors: u32,
    #[serde(default="connect_retry_delay_default")]
    pub connect_retry_delay: u64,
    #[serde(default="reconnect_delay_default")]
    pub reconnect_delay: u64,
    #[serde(default="reconnect_backoff_default")]
    pub reconnect_backoff: u64,
}

fn base_url_default() -> String { "http://localhost:3001".to_string() }
fn telemetry_path_default() -> String { "/api/inverter/telemetry".to_string() }
fn health_path_default() -> String { "/health".to_string() }
fn collector_timeout_default() -> u64 { 10 }
fn max_attempts_default() -> u32 { 3 }
fn dispatch_retry_delay_default() -> u64 { 2 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct CollectorConfig {
    #[serde(default="base_url_default")]
    pub base_url: String,
    #[serde(default="telemetry_path_default")]
    pub telemetry_path: String,
    #[serde(default="health_path_default")]
    pub health_path: String,
    #[serde(default="collector_timeout_default")]
    pub timeout: u64,
    #[serde(default="max_attempts_default")]
    pub max_attempts: u32,
    #[serde(default="dispatch_retry_delay_default")]
    pub retry_delay: u64,
}

impl CollectorConfig {
    pub fn telemetry_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.telemetry_path)
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.health_path)
    }
}

fn log_level_default() -> String { "info".to_string() }

/// Accepted level names and the env_logger filter each one stands for
const LOG_LEVELS: &[(&str, &str)] = &[
    ("trace", "trace"),
    ("debug", "debug"),
    ("info", "info"),
    ("warn", "warn"),
    ("warning", "warn"),
    ("error", "error"),
    ("critical", "error"),
];

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct LoggingConfig {
    #[serde(default="log_level_default")]
    pub level: String,
}

impl LoggingConfig {
    /// The env_logger filter for `level`, None if the name is unknown
    pub fn filter(&self) -> Option<&'static str> {
        let level = self.level.trim().to_lowercase();
        LOG_LEVELS.iter().find(|(name, _)| *name == level).map(|(_, filter)| *filter)
    }
}

fn device_default() -> DeviceConfig {
    DeviceConfig {
        transport: transport_kind_default(),
        serial: serial_default(),
        network: network_default(),
        timeout: device_timeout_default(),
        expected_model: expected_model_default(),
    }
}
fn polling_default() -> PollingConfig {
    PollingConfig {
        interval: poll_interval_default(),
        retry_delay: retry_delay_default(),
        max_consecutive_errors: max_consecutive_errors_default(),
        connect_retry_delay: connect_retry_delay_default(),
        reconnect_delay: reconnect_delay_default(),
        reconnect_backoff: reconnect_backoff_default(),
    }
}
fn collector_default() -> CollectorConfig {
    CollectorConfig {
        base_url: base_url_default(),
        telemetry_path: telemetry_path_default(),
        health_path: health_path_default(),
        timeout: collector_timeout_default(),
        max_attempts: max_attempts_default(),
        retry_delay: dispatch_retry_delay_default(),
    }
}
fn logging_default() -> LoggingConfig { LoggingConfig { level: log_level_default() } }

/// The complete service configuration.
///
/// Built once at startup and handed to each component by reference. Nothing
/// changes it while the service runs.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ServiceConfig {
    #[serde(default="device_default")]
    pub device: DeviceConfig,
    #[serde(default="polling_default")]
    pub polling: PollingConfig,
    #[serde(default="collector_default")]
    pub collector: CollectorConfig,
    #[serde(default="logging_default")]
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            device: device_default(),
            polling: polling_default(),
            collector: collector_default(),
            logging: logging_default(),
        }
    }
}

/// Transport parameters resolved from the config, one variant per physical link
#[derive(Clone, Debug, PartialEq)]
pub enum Transport {
    Serial { port: String, baudrate: u32, slave_id: u8, timeout: Duration },
    Network { host: String, port: u16, slave_id: u8, timeout: Duration },
}

impl Transport {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            Transport::Serial { .. } => ConnectionKind::Rtu,
            Transport::Network { .. } => ConnectionKind::Tcp,
        }
    }

    pub fn slave_id(&self) -> u8 {
        match self {
            Transport::Serial { slave_id, .. } | Transport::Network { slave_id, .. } => *slave_id,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            Transport::Serial { timeout, .. } | Transport::Network { timeout, .. } => *timeout,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Serial { port, baudrate, slave_id, .. } => write!(f, "{port} @ {baudrate}bps (slave {slave_id})"),
            Transport::Network { host, port, slave_id, .. } => write!(f, "{host}:{port} (slave {slave_id})"),
        }
    }
}

/// Values given on the command line, they win over the config file
#[derive(Default, Debug, Clone)]
pub struct Overrides {
    pub transport: Option<TransportKind>,
    pub serial_port: Option<String>,
    pub baudrate: Option<u32>,
    pub slave_id: Option<u8>,
    pub tcp_host: Option<String>,
    pub tcp_port: Option<u16>,
    pub poll_interval: Option<u64>,
    pub backend_url: Option<String>,
    pub backend_timeout: Option<u64>,
    pub log_level: Option<String>,
}

impl ServiceConfig {
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(kind) = overrides.transport {
            self.device.transport = kind;
        }
        if let Some(port) = overrides.serial_port {
            self.device.serial.port = port;
        }
        if let Some(baudrate) = overrides.baudrate {
            self.device.serial.baudrate = baudrate;
        }
        if let Some(slave_id) = overrides.slave_id {
            self.device.serial.slave_id = slave_id;
            self.device.network.slave_id = slave_id;
        }
        if let Some(host) = overrides.tcp_host {
            /* Giving a host implies the network transport */
            self.device.network.host = Some(host);
            self.device.transport = TransportKind::Network;
        }
        if let Some(port) = overrides.tcp_port {
            self.device.network.port = port;
        }
        if let Some(interval) = overrides.poll_interval {
            self.polling.interval = interval;
        }
        if let Some(url) = overrides.backend_url {
            self.collector.base_url = url;
        }
        if let Some(timeout) = overrides.backend_timeout {
            self.collector.timeout = timeout;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level.to_lowercase();
        }
    }

    /// Loads the first config file found, or the defaults if there is none
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        for location in CONFIG_LOCATIONS {
            let path = Path::new(location);
            if path.exists() {
                return Self::from_file(path);
            }
        }

        info!("No config file found, using defaults");
        Ok(ServiceConfig::default())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config = Self::from_yaml(&contents)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yml::Error> {
        /* An empty file is a valid config with all defaults */
        if contents.trim().is_empty() {
            return Ok(ServiceConfig::default());
        }
        serde_yml::from_str(contents)
    }

    /// Resolves the configured transport into its tagged form
    pub fn transport(&self) -> Result<Transport, ConfigError> {
        let timeout = Duration::from_secs(self.device.timeout);
        match self.device.transport {
            TransportKind::Serial => {
                let serial = &self.device.serial;
                if serial.port.trim().is_empty() {
                    return Err(ConfigError::MissingSerialPort);
                }
                Ok(Transport::Serial {
                    port: serial.port.clone(),
                    baudrate: serial.baudrate,
                    slave_id: serial.slave_id,
                    timeout,
                })
            }
            TransportKind::Network => {
                let network = &self.device.network;
                let host = match network.host.as_deref().map(str::trim) {
                    Some(h) if !h.is_empty() => h.to_string(),
                    _ => return Err(ConfigError::MissingHost),
                };
                Ok(Transport::Network { host, port: network.port, slave_id: network.slave_id, timeout })
            }
        }
    }

    /// Checks everything that would make the service useless before it starts
    pub fn validate(&self) -> Result<Transport, ConfigError> {
        let transport = self.transport()?;

        if self.device.timeout == 0 {
            return Err(ConfigError::Zero("device.timeout"));
        }
        if self.polling.interval == 0 {
            return Err(ConfigError::Zero("polling.interval"));
        }
        if self.polling.max_consecutive_errors == 0 {
            return Err(ConfigError::Zero("polling.max_consecutive_errors"));
        }
        if self.collector.timeout == 0 {
            return Err(ConfigError::Zero("collector.timeout"));
        }
        if self.collector.max_attempts == 0 {
            return Err(ConfigError::Zero("collector.max_attempts"));
        }
        if self.logging.filter().is_none() {
            return Err(ConfigError::UnknownLogLevel(self.logging.level.clone()));
        }

        let url = &self.collector.base_url;
        let host = url.strip_prefix("http://").or_else(|| url.strip_prefix("https://"));
        if host.map_or(true, |h| h.trim_matches('/').is_empty()) {
            return Err(ConfigError::InvalidCollectorUrl(url.clone()));
        }

        Ok(transport)
    }

    /// Human readable dump used by `--show-config`
    pub fn describe(&self) -> String {
        let mut out = String::new();
        out.push_str("Inverter Connection:\n");
        match self.device.transport {
            TransportKind::Serial => {
                out.push_str("  Type:           RTU\n");
                out.push_str(&format!("  Serial Port:    {}\n", self.device.serial.port));
                out.push_str(&format!("  Baudrate:       {}\n", self.device.serial.baudrate));
                out.push_str(&format!("  Slave ID:       {}\n", self.device.serial.slave_id));
            }
            TransportKind::Network => {
                out.push_str("  Type:           TCP\n");
                out.push_str(&format!("  TCP Host:       {}\n", self.device.network.host.as_deref().unwrap_or("<unset>")));
                out.push_str(&format!("  TCP Port:       {}\n", self.device.network.port));
                out.push_str(&format!("  Slave ID:       {}\n", self.device.network.slave_id));
            }
        }
        out.push_str(&format!("  Poll Interval:  {}s\n", self.polling.interval));
        out.push_str(&format!("  Retry Delay:    {}s\n", self.polling.retry_delay));
        out.push_str(&format!("  Max Errors:     {}\n", self.polling.max_consecutive_errors));
        out.push_str("\nCollector:\n");
        out.push_str(&format!("  URL:            {}\n", self.collector.base_url));
        out.push_str(&format!("  Endpoint:       {}\n", self.collector.telemetry_path));
        out.push_str(&format!("  Timeout:        {}s\n", self.collector.timeout));
        out.push_str("\nLogging:\n");
        out.push_str(&format!("  Level:          {}\n", self.logging.level));
        out
    }
}
