use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registers::Category;

/// How the device is attached
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionKind {
    #[serde(rename = "rtu")]
    Rtu,
    #[serde(rename = "tcp")]
    Tcp,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Rtu => "rtu",
            ConnectionKind::Tcp => "tcp",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    Good,
}

/// One decoded register value together with its engineering unit
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricValue {
    pub value: serde_json::Value,
    pub unit: Option<String>,
}

impl MetricValue {
    pub fn new(value: impl Into<serde_json::Value>, unit: Option<&str>) -> Self {
        MetricValue {
            value: value.into(),
            unit: unit.map(|u| u.to_string()),
        }
    }
}

pub type MetricMap = BTreeMap<String, MetricValue>;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SnapshotMetadata {
    pub connection_type: ConnectionKind,
    pub data_quality: DataQuality,
    pub read_timestamp: DateTime<Utc>,
}

/// One complete read pass over every register group.
///
/// Built by the reader only when all groups were read, so every field can be
/// treated as captured at the same moment. Never modified after construction.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TelemetrySnapshot {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub categories: BTreeMap<Category, MetricMap>,
    pub metadata: SnapshotMetadata,
}

impl TelemetrySnapshot {
    pub fn metric(&self, category: Category, name: &str) -> Option<&MetricValue> {
        self.categories.get(&category)?.get(name)
    }
}

/// Identity cached by the connection manager after a successful probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub model: String,
    pub serial_number: String,
}
