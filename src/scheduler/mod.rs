use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc::{error::TrySendError, Sender};
use tokio_util::sync::CancellationToken;

use crate::config::PollingConfig;
use crate::connection::ConnectionManager;
use crate::dispatch::Transmission;
use crate::models::TelemetrySnapshot;
use crate::reader::TelemetryReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Starting,
    Polling,
    /// Read passes failed this many times in a row
    Degraded(u32),
    Reconnecting,
    BackingOff,
}

/// What one loop iteration did, decides the wait before the next one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Published,
    ReadFailed(u32),
    Reconnected,
    ReconnectFailed,
    ConnectFailed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollingPolicy {
    pub interval: Duration,
    pub retry_delay: Duration,
    pub max_consecutive_errors: u32,
    pub connect_retry_delay: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_backoff: Duration,
}

impl From<&PollingConfig> for PollingPolicy {
    fn from(c: &PollingConfig) -> Self {
        PollingPolicy {
            interval: Duration::from_secs(c.interval),
            retry_delay: Duration::from_secs(c.retry_delay),
            max_consecutive_errors: c.max_consecutive_errors,
            connect_retry_delay: Duration::from_secs(c.connect_retry_delay),
            reconnect_delay: Duration::from_secs(c.reconnect_delay),
            reconnect_backoff: Duration::from_secs(c.reconnect_backoff),
        }
    }
}

/// The single polling loop of the service.
///
/// Owns the connection manager, so the device session is only ever used by
/// this task. Snapshots are handed to the dispatcher queue without waiting.
pub struct PollingScheduler {
    connection: ConnectionManager,
    reader: TelemetryReader,
    sender: Sender<Transmission>,
    policy: PollingPolicy,
    state: SchedulerState,
    consecutive_errors: u32,
    reconnects: u32,
}

impl PollingScheduler {
    pub fn new(connection: ConnectionManager, reader: TelemetryReader, sender: Sender<Transmission>, policy: PollingPolicy) -> Self {
        PollingScheduler {
            connection,
            reader,
            sender,
            policy,
            state: SchedulerState::Starting,
            consecutive_errors: 0,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Forced reconnects since start
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Polling started. Polling every {}s", self.policy.interval.as_secs());

        while !shutdown.is_cancelled() {
            let outcome = self.poll_once().await;
            let delay = self.delay_after(outcome);
            if delay.is_zero() {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Stopping polling");
        self.connection.disconnect().await;
    }

    pub fn delay_after(&self, outcome: TickOutcome) -> Duration {
        match outcome {
            TickOutcome::Published => self.policy.interval,
            TickOutcome::ReadFailed(_) => self.policy.retry_delay,
            TickOutcome::Reconnected => Duration::ZERO,
            TickOutcome::ReconnectFailed => self.policy.reconnect_backoff,
            TickOutcome::ConnectFailed => self.policy.connect_retry_delay,
        }
    }

    /// One iteration: make sure there is a connection, read, hand off
    pub async fn poll_once(&mut self) -> TickOutcome {
        if !self.connection.is_connected() {
            if let Err(e) = self.connection.connect().await {
                error!("Failed to connect to inverter: {e}. Retrying in {}s", self.policy.connect_retry_delay.as_secs());
                self.state = SchedulerState::BackingOff;
                return TickOutcome::ConnectFailed;
            }
            self.log_device_info().await;
            self.state = SchedulerState::Polling;
        }

        let result = match self.connection.session() {
            Some(session) => self.reader.read_all(session).await,
            None => return TickOutcome::ConnectFailed,
        };

        match result {
            Ok(snapshot) => {
                self.consecutive_errors = 0;
                self.connection.mark_healthy();
                self.state = SchedulerState::Polling;
                self.hand_off(snapshot);
                TickOutcome::Published
            }
            Err(e) => {
                self.consecutive_errors += 1;
                error!("Error in polling loop (attempt {}): {}", self.consecutive_errors, e);

                if self.consecutive_errors < self.policy.max_consecutive_errors {
                    if !self.connection.health_check().await {
                        warn!("Inverter does not answer status reads either");
                    }
                    self.state = SchedulerState::Degraded(self.consecutive_errors);
                    return TickOutcome::ReadFailed(self.consecutive_errors);
                }

                self.force_reconnect().await
            }
        }
    }

    async fn force_reconnect(&mut self) -> TickOutcome {
        error!("Too many consecutive errors ({}). Reconnecting...", self.consecutive_errors);
        self.state = SchedulerState::Reconnecting;
        self.consecutive_errors = 0;
        self.reconnects += 1;

        match self.connection.reconnect(self.policy.reconnect_delay).await {
            Ok(_) => {
                info!("Successfully reconnected to inverter");
                self.log_device_info().await;
                self.state = SchedulerState::Polling;
                TickOutcome::Reconnected
            }
            Err(_) => {
                error!("Failed to reconnect. Waiting {}s before retry...", self.policy.reconnect_backoff.as_secs());
                self.state = SchedulerState::BackingOff;
                TickOutcome::ReconnectFailed
            }
        }
    }

    fn hand_off(&self, snapshot: TelemetrySnapshot) {
        match self.sender.try_send(Transmission::Telemetry(snapshot)) {
            Ok(()) => debug!("Telemetry queued for dispatch"),
            Err(TrySendError::Full(_)) => warn!("Dispatch queue is full, dropping this snapshot"),
            Err(TrySendError::Closed(_)) => error!("Dispatcher is gone, dropping this snapshot"),
        }
    }

    async fn log_device_info(&mut self) {
        match self.connection.device_info().await {
            Ok(info) => {
                info!("Device Information:");
                for (key, metric) in info.iter() {
                    info!("  {}: {} {}", key, metric.value, metric.unit.as_deref().unwrap_or(""));
                }
            }
            Err(e) => warn!("Could not read device info: {e}"),
        }
    }
}
