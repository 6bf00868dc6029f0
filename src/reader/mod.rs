use std::collections::BTreeMap;

use chrono::Utc;
use log::{debug, error};
use thiserror::Error;

use crate::models::{ConnectionKind, DataQuality, SnapshotMetadata, TelemetrySnapshot};
use crate::registers::{Category, MODEL_NAME, TELEMETRY_GROUPS};
use crate::session::{DeviceSession, SessionError};

/// Group name used when the identity read fails
pub const IDENTITY_GROUP: &str = "identity";

#[derive(Error, Debug)]
#[error("Failed to read group {group}: {cause}")]
pub struct ReadError {
    pub group: &'static str,
    #[source]
    pub cause: SessionError,
}

/// Reads every register group in catalogue order and assembles a snapshot
pub struct TelemetryReader {
    connection_kind: ConnectionKind,
}

impl TelemetryReader {
    pub fn new(connection_kind: ConnectionKind) -> Self {
        TelemetryReader { connection_kind }
    }

    /// One read pass. Either every group is read or no snapshot is produced.
    pub async fn read_all(&self, session: &mut dyn DeviceSession) -> Result<TelemetrySnapshot, ReadError> {
        let read_timestamp = Utc::now();
        let mut categories = BTreeMap::new();

        for group in TELEMETRY_GROUPS {
            match session.read_group(group.registers).await {
                Ok(values) => {
                    debug!("Read {} values from group {}", values.len(), group.category);
                    categories.insert(group.category, values);
                }
                Err(cause) => {
                    error!("Error reading group {}: {}", group.category, cause);
                    return Err(ReadError { group: group.category.as_str(), cause });
                }
            }
        }

        let device_id = match session.read_one(&MODEL_NAME).await {
            Ok(serde_json::Value::String(model)) => model,
            Ok(other) => other.to_string(),
            Err(cause) => {
                error!("Error reading device identity: {}", cause);
                return Err(ReadError { group: IDENTITY_GROUP, cause });
            }
        };

        debug!("Successfully read all data from inverter {device_id}");
        Ok(TelemetrySnapshot {
            device_id,
            timestamp: Utc::now(),
            categories,
            metadata: SnapshotMetadata {
                connection_type: self.connection_kind,
                data_quality: DataQuality::Good,
                read_timestamp,
            },
        })
    }
}

/// Category names a complete snapshot carries
pub fn expected_categories() -> Vec<Category> {
    TELEMETRY_GROUPS.iter().map(|g| g.category).collect()
}
