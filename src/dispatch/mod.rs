//! Delivery of snapshots to the HTTP collector.
//!
//! The dispatcher runs as its own task and receives snapshots over a bounded
//! channel, so a slow or unreachable collector never holds up polling. Snapshots
//! are delivered one at a time in the order they were read.

use std::time::Duration;

use log::{debug, error, info, warn};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::config::CollectorConfig;
use crate::models::TelemetrySnapshot;

/// Snapshots waiting for the collector before new ones are dropped
pub const QUEUE_CAPACITY: usize = 100;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

pub enum Transmission {
    Telemetry(TelemetrySnapshot),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    /// The collector refused the request, sending it again will not help
    #[error("Collector rejected telemetry with {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("Collector unavailable after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    /// The request could not be built or its answer not be read
    #[error("Unable to encode telemetry request: {0}")]
    Encode(reqwest::Error),
    #[error("Unable to build HTTP client: {0}")]
    Client(reqwest::Error),
}

impl DispatchError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::Rejected { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_attempts: 3, delay: Duration::from_secs(2) }
    }
}

/// Outcome of a single POST
enum Attempt {
    Delivered(StatusCode),
    /// Not worth another attempt
    Final(DispatchError),
    Transient(String),
}

pub struct Dispatcher {
    client: Client,
    telemetry_url: String,
    health_url: String,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(config: &CollectorConfig) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .user_agent(concat!("inverter2http/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(DispatchError::Client)?;

        Ok(Dispatcher {
            client,
            telemetry_url: config.telemetry_url(),
            health_url: config.health_url(),
            policy: RetryPolicy {
                max_attempts: config.max_attempts,
                delay: Duration::from_secs(config.retry_delay),
            },
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn channel() -> (Sender<Transmission>, Receiver<Transmission>) {
        tokio::sync::mpsc::channel(QUEUE_CAPACITY)
    }

    /// Posts the snapshot, retrying transient failures with a fixed delay
    pub async fn send(&self, snapshot: &TelemetrySnapshot) -> Result<(), DispatchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!("Sending telemetry to {} (attempt {attempt})", self.telemetry_url);

            let last = match self.post(snapshot).await {
                Attempt::Delivered(status) => {
                    info!("Telemetry sent successfully. Status: {}", status.as_u16());
                    return Ok(());
                }
                Attempt::Final(e) => return Err(e),
                Attempt::Transient(reason) => reason,
            };

            if attempt >= self.policy.max_attempts {
                return Err(DispatchError::Exhausted { attempts: attempt, last });
            }

            warn!("Telemetry delivery failed, retrying ({}/{}): {}", attempt, self.policy.max_attempts, last);
            tokio::time::sleep(self.policy.delay).await;
        }
    }

    async fn post(&self, snapshot: &TelemetrySnapshot) -> Attempt {
        let response = match self.client.post(&self.telemetry_url).json(snapshot).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Attempt::Transient("timeout sending telemetry".to_string()),
            Err(e) if e.is_connect() => return Attempt::Transient(format!("connection error: {e}")),
            Err(e) if e.is_builder() || e.is_redirect() || e.is_decode() => {
                return Attempt::Final(DispatchError::Encode(e))
            }
            Err(e) => return Attempt::Transient(format!("connection lost: {e}")),
        };

        let status = response.status();
        if status.is_success() {
            return Attempt::Delivered(status);
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            return Attempt::Final(DispatchError::Rejected { status, body });
        }
        Attempt::Transient(format!("HTTP {} - {}", status.as_u16(), body))
    }

    /// Advisory reachability check, never fails
    pub async fn ping(&self) -> bool {
        match self.client.get(&self.health_url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!("Collector ping failed: {e}");
                false
            }
        }
    }

    /// Delivers queued snapshots until every sender is gone and the queue is empty
    pub async fn start_thread(&self, mut rx: Receiver<Transmission>) {
        while let Some(transmission) = rx.recv().await {
            match transmission {
                Transmission::Telemetry(snapshot) => {
                    if let Err(e) = self.send(&snapshot).await {
                        if e.is_fatal() {
                            error!("Dropping telemetry of {}: {}", snapshot.device_id, e);
                        } else {
                            warn!("Dropping telemetry of {}: {}", snapshot.device_id, e);
                        }
                    }
                }
            }
        }
        info!("Telemetry queue closed, dispatcher exiting");
    }
}
