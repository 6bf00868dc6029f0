use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::Transport;
use crate::models::{DeviceIdentity, MetricMap};
use crate::registers::{DEVICE_INFO, DEVICE_STATUS, MODEL_NAME, SERIAL_NUMBER};
use crate::session::{Connector, DeviceSession, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// The session is open but the last health check failed
    Degraded,
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Transport {target} unreachable: {source}")]
    TransportUnreachable { target: String, source: SessionError },
    #[error("Transport {target} misconfigured: {source}")]
    Misconfigured { target: String, source: SessionError },
    #[error("Identity probe failed: {0}")]
    IdentityProbeFailed(SessionError),
    #[error("Device reports model {model:?}, expected {expected}")]
    ProtocolMismatch { model: String, expected: String },
}

/// Owns the only device session and its lifecycle.
pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    transport: Transport,
    expected_model: String,
    session: Option<Box<dyn DeviceSession>>,
    state: ConnectionState,
    identity: Option<DeviceIdentity>,
}

impl ConnectionManager {
    pub fn new(connector: Box<dyn Connector>, transport: Transport, expected_model: String) -> Self {
        ConnectionManager {
            connector,
            transport,
            expected_model,
            session: None,
            state: ConnectionState::Disconnected,
            identity: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some() && self.state != ConnectionState::Disconnected
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn session(&mut self) -> Option<&mut (dyn DeviceSession + 'static)> {
        self.session.as_deref_mut()
    }

    /// Opens the transport and probes the device identity
    pub async fn connect(&mut self) -> Result<DeviceIdentity, ConnectionError> {
        if self.session.is_some() {
            self.disconnect().await;
        }

        info!("Connecting to inverter via {} {}", self.transport.kind().as_str().to_uppercase(), self.transport);
        let mut session = match self.connector.open(&self.transport).await {
            Ok(s) => s,
            Err(e) => {
                let target = self.transport.to_string();
                return Err(match &e {
                    SessionError::Io(io) if io.kind() == std::io::ErrorKind::InvalidInput => {
                        ConnectionError::Misconfigured { target, source: e }
                    }
                    _ => ConnectionError::TransportUnreachable { target, source: e },
                });
            }
        };

        let identity = match probe_identity(session.as_mut()).await {
            Ok(identity) => identity,
            Err(e) => {
                session.close().await;
                return Err(ConnectionError::IdentityProbeFailed(e));
            }
        };

        if !identity.model.starts_with(&self.expected_model) {
            session.close().await;
            return Err(ConnectionError::ProtocolMismatch {
                model: identity.model,
                expected: self.expected_model.clone(),
            });
        }

        info!("Connected to inverter model {} serial {}", identity.model, identity.serial_number);
        self.session = Some(session);
        self.state = ConnectionState::Connected;
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Releases the transport. Safe to call in any state and any number of times.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
            info!("Disconnected from inverter");
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Reads the status register. Never fails, a broken session marks the
    /// connection degraded.
    pub async fn health_check(&mut self) -> bool {
        let session = match self.session.as_mut() {
            Some(s) => s,
            None => return false,
        };

        match session.read_one(&DEVICE_STATUS).await {
            Ok(status) => {
                debug!("Health check passed, device status {status}");
                self.state = ConnectionState::Connected;
                true
            }
            Err(e) => {
                warn!("Health check failed: {e}");
                self.state = ConnectionState::Degraded;
                false
            }
        }
    }

    /// A successful read proves the session works again
    pub fn mark_healthy(&mut self) {
        if self.session.is_some() {
            self.state = ConnectionState::Connected;
        }
    }

    /// Disconnects, waits `backoff` and connects once. Retrying is up to the caller.
    pub async fn reconnect(&mut self, backoff: Duration) -> Result<DeviceIdentity, ConnectionError> {
        self.disconnect().await;
        tokio::time::sleep(backoff).await;
        let result = self.connect().await;
        if let Err(e) = &result {
            error!("Reconnect failed: {e}");
        }
        result
    }

    /// Static nameplate data, only used for logging
    pub async fn device_info(&mut self) -> Result<MetricMap, SessionError> {
        let session = self.session.as_mut().ok_or(SessionError::Closed)?;
        session.read_group(DEVICE_INFO).await
    }
}

async fn probe_identity(session: &mut dyn DeviceSession) -> Result<DeviceIdentity, SessionError> {
    let model = session.read_one(&MODEL_NAME).await?;
    let serial_number = session.read_one(&SERIAL_NUMBER).await?;
    Ok(DeviceIdentity {
        model: text_of(model),
        serial_number: text_of(serial_number),
    })
}

fn text_of(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::{transport, FakeDevice};

    fn manager(device: &FakeDevice) -> ConnectionManager {
        ConnectionManager::new(Box::new(device.clone()), transport(), "SUN2000".to_string())
    }

    #[tokio::test]
    async fn test_connect_caches_identity() {
        let device = FakeDevice::new();
        let mut cm = manager(&device);
        assert_eq!(cm.state(), ConnectionState::Disconnected);

        let identity = cm.connect().await.unwrap();
        assert_eq!(identity.model, "SUN2000-100KTL-M1");
        assert_eq!(identity.serial_number, "TEST123");
        assert_eq!(cm.state(), ConnectionState::Connected);
        assert!(cm.is_connected());
        assert_eq!(cm.identity().unwrap().model, "SUN2000-100KTL-M1");
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let device = FakeDevice::new().with(|s| s.open_failures = 1);
        let mut cm = manager(&device);

        let err = cm.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::TransportUnreachable { .. }));
        assert_eq!(cm.state(), ConnectionState::Disconnected);
        assert!(!cm.is_connected());
    }

    #[tokio::test]
    async fn test_failed_identity_read_closes_session() {
        let device = FakeDevice::new().with(|s| s.fail_single_reads = true);
        let mut cm = manager(&device);

        assert!(matches!(cm.connect().await, Err(ConnectionError::IdentityProbeFailed(_))));
        assert_eq!(cm.state(), ConnectionState::Disconnected);
        assert_eq!(device.state().closes, 1);
    }

    #[tokio::test]
    async fn test_connect_wrong_model() {
        let device = FakeDevice::new().with(|s| s.model = "LUNA2000".to_string());
        let mut cm = manager(&device);

        assert!(matches!(cm.connect().await, Err(ConnectionError::ProtocolMismatch { .. })));
        assert!(!cm.is_connected());
        assert_eq!(device.state().closes, 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let device = FakeDevice::new();
        let mut cm = manager(&device);

        cm.disconnect().await;
        cm.connect().await.unwrap();
        cm.disconnect().await;
        cm.disconnect().await;

        assert_eq!(cm.state(), ConnectionState::Disconnected);
        assert_eq!(device.state().closes, 1);
    }

    #[tokio::test]
    async fn test_connect_twice_keeps_one_session() {
        let device = FakeDevice::new();
        let mut cm = manager(&device);

        cm.connect().await.unwrap();
        cm.connect().await.unwrap();
        assert_eq!(device.state().opens, 2);
        assert_eq!(device.state().closes, 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        let device = FakeDevice::new();
        let mut cm = manager(&device);
        assert!(!cm.health_check().await);

        cm.connect().await.unwrap();
        assert!(cm.health_check().await);

        device.state().fail_single_reads = true;
        assert!(!cm.health_check().await);
        assert_eq!(cm.state(), ConnectionState::Degraded);
        assert!(cm.is_connected());

        cm.mark_healthy();
        assert_eq!(cm.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replaces_session() {
        let device = FakeDevice::new();
        let mut cm = manager(&device);
        cm.connect().await.unwrap();

        let started = tokio::time::Instant::now();
        cm.reconnect(Duration::from_secs(10)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(device.state().opens, 2);
        assert_eq!(device.state().closes, 1);
        assert_eq!(cm.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_device_info() {
        let device = FakeDevice::new();
        let mut cm = manager(&device);
        assert!(cm.device_info().await.is_err());

        cm.connect().await.unwrap();
        let info = cm.device_info().await.unwrap();
        assert_eq!(info.len(), DEVICE_INFO.len());
        assert_eq!(info["model_name"].value, "SUN2000-100KTL-M1");
    }
}
