//! Scriptable in-memory device used by the unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Transport;
use crate::models::{MetricMap, MetricValue};
use crate::registers::{Register, RegisterFormat, MODEL_NAME};
use super::{Connector, DeviceSession, SessionError};

#[derive(Default)]
pub(crate) struct FakeState {
    pub opens: u32,
    pub closes: u32,
    pub open_failures: u32,
    /// Telemetry group reads that fail before reads start succeeding again
    pub read_failures: u32,
    /// Group reads containing this register always fail
    pub failing_register: Option<&'static str>,
    pub fail_single_reads: bool,
    pub group_reads: u32,
    pub model: String,
    pub values: HashMap<&'static str, Value>,
}

#[derive(Clone)]
pub(crate) struct FakeDevice {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        let state = FakeState { model: "SUN2000-100KTL-M1".to_string(), ..Default::default() };
        FakeDevice { state: Arc::new(Mutex::new(state)) }
    }

    pub fn with<F: FnOnce(&mut FakeState)>(self, f: F) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn value_of(&self, reg: &Register) -> Value {
        let state = self.state();
        if let Some(v) = state.values.get(reg.name) {
            return v.clone();
        }
        match (reg.format, reg.name) {
            (RegisterFormat::Str, "model_name") => Value::from(state.model.clone()),
            (RegisterFormat::Str, _) => Value::from("TEST123"),
            _ => Value::from(0),
        }
    }
}

pub(crate) struct FakeSession {
    device: FakeDevice,
    open: bool,
}

#[async_trait]
impl DeviceSession for FakeSession {
    async fn read_group(&mut self, registers: &[Register]) -> Result<MetricMap, SessionError> {
        if !self.open {
            return Err(SessionError::Closed);
        }
        {
            let mut state = self.device.state();
            state.group_reads += 1;
            /* the nameplate read after connecting never uses up a scripted failure */
            let nameplate = registers.iter().any(|r| r.name == MODEL_NAME.name);
            if state.read_failures > 0 && !nameplate {
                state.read_failures -= 1;
                return Err(SessionError::Timeout(std::time::Duration::from_secs(5)));
            }
            if let Some(name) = state.failing_register {
                if registers.iter().any(|r| r.name == name) {
                    return Err(SessionError::Protocol(format!("illegal data address for {name}")));
                }
            }
        }

        let mut values = MetricMap::new();
        for reg in registers {
            values.insert(reg.name.to_string(), MetricValue::new(self.device.value_of(reg), reg.unit));
        }
        Ok(values)
    }

    async fn read_one(&mut self, register: &Register) -> Result<Value, SessionError> {
        if !self.open {
            return Err(SessionError::Closed);
        }
        if self.device.state().fail_single_reads {
            return Err(SessionError::Timeout(std::time::Duration::from_secs(5)));
        }
        Ok(self.device.value_of(register))
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            self.device.state().closes += 1;
        }
    }
}

#[async_trait]
impl Connector for FakeDevice {
    async fn open(&self, _transport: &Transport) -> Result<Box<dyn DeviceSession>, SessionError> {
        let mut state = self.state();
        state.opens += 1;
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(SessionError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused")));
        }
        drop(state);
        Ok(Box::new(FakeSession { device: self.clone(), open: true }))
    }
}

pub(crate) fn transport() -> Transport {
    Transport::Network {
        host: "127.0.0.1".to_string(),
        port: 502,
        slave_id: 1,
        timeout: std::time::Duration::from_secs(5),
    }
}
