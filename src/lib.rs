//! Inverter telemetry acquisition service
//!
//! Keeps a Modbus session to one inverter, reads all register groups on a fixed
//! period and forwards every complete snapshot to an HTTP collector.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod models;
pub mod reader;
pub mod registers;
pub mod scheduler;
pub mod session;

// Re-export common types for easier access
pub use config::{ServiceConfig, Transport};
pub use connection::{ConnectionManager, ConnectionState};
pub use dispatch::{Dispatcher, Transmission};
pub use models::TelemetrySnapshot;
pub use reader::TelemetryReader;
pub use scheduler::{PollingPolicy, PollingScheduler};
pub use session::{Connector, DeviceSession, ModbusConnector};
