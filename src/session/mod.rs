//! Device session capability.
//!
//! A session is an open transport to the inverter through which register reads
//! are issued. It is not safe for concurrent use; the connection manager owns
//! the only live session and hands out `&mut` access for one read pass at a time.

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Transport;
use crate::models::MetricMap;
use crate::registers::Register;

pub mod decode;
pub mod modbus;

#[cfg(test)]
pub(crate) mod fake;

pub use modbus::{ModbusConnector, ModbusSession};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Modbus exception code sent back by the device
    #[error("Device answered with exception code {0:#04x}")]
    Exception(u8),
    #[error("Unable to decode register {register}: {reason}")]
    Decode { register: &'static str, reason: String },
    #[error("Session is closed")]
    Closed,
}

#[async_trait]
pub trait DeviceSession: Send {
    /// Reads all given registers, keyed by register name
    async fn read_group(&mut self, registers: &[Register]) -> Result<MetricMap, SessionError>;

    async fn read_one(&mut self, register: &Register) -> Result<serde_json::Value, SessionError>;

    /// Releases the transport. Calling it on a closed session does nothing.
    async fn close(&mut self);
}

/// Opens sessions for a resolved transport
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, transport: &Transport) -> Result<Box<dyn DeviceSession>, SessionError>;
}
