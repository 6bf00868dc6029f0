use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use inverter2http::{
    config::CollectorConfig,
    models::{MetricMap, MetricValue},
    registers::{Register, RegisterFormat},
    session::SessionError,
    ConnectionManager, Connector, DeviceSession, Dispatcher, PollingPolicy, PollingScheduler, TelemetryReader, Transport,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Inverter that always answers with the same values
struct SteadyInverter;

struct SteadySession;

fn value_of(reg: &Register) -> Value {
    match (reg.format, reg.name) {
        (_, "active_power") => Value::from(1500),
        (RegisterFormat::Str, "model_name") => Value::from("SUN2000-100KTL-M1"),
        (RegisterFormat::Str, _) => Value::from("TEST123"),
        _ => Value::from(0),
    }
}

#[async_trait]
impl DeviceSession for SteadySession {
    async fn read_group(&mut self, registers: &[Register]) -> Result<MetricMap, SessionError> {
        Ok(registers
            .iter()
            .map(|r| (r.name.to_string(), MetricValue::new(value_of(r), r.unit)))
            .collect())
    }

    async fn read_one(&mut self, register: &Register) -> Result<Value, SessionError> {
        Ok(value_of(register))
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl Connector for SteadyInverter {
    async fn open(&self, _transport: &Transport) -> Result<Box<dyn DeviceSession>, SessionError> {
        Ok(Box::new(SteadySession))
    }
}

fn policy() -> PollingPolicy {
    PollingPolicy {
        interval: Duration::from_secs(1),
        retry_delay: Duration::from_secs(1),
        max_consecutive_errors: 5,
        connect_retry_delay: Duration::from_secs(30),
        reconnect_delay: Duration::from_secs(10),
        reconnect_backoff: Duration::from_secs(60),
    }
}

fn collector(server: &MockServer) -> CollectorConfig {
    CollectorConfig {
        base_url: server.uri(),
        telemetry_path: "/api/inverter/telemetry".to_string(),
        health_path: "/health".to_string(),
        timeout: 2,
        max_attempts: 3,
        retry_delay: 2,
    }
}

async fn wait_for_requests(server: &MockServer, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if server.received_requests().await.unwrap_or_default().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("collector did not receive {count} requests in time");
}

/// Starts dispatcher and scheduler, stops both once `count` POSTs arrived
async fn run_service(server: &MockServer, count: usize) {
    let dispatcher = Dispatcher::new(&collector(server)).unwrap();
    let (tx, rx) = Dispatcher::channel();
    let dispatch_task = tokio::spawn(async move { dispatcher.start_thread(rx).await });

    let transport = Transport::Network {
        host: "127.0.0.1".to_string(),
        port: 502,
        slave_id: 1,
        timeout: Duration::from_secs(5),
    };
    let reader = TelemetryReader::new(transport.kind());
    let connection = ConnectionManager::new(Box::new(SteadyInverter), transport, "SUN2000".to_string());
    let scheduler = PollingScheduler::new(connection, reader, tx, policy());

    let shutdown = CancellationToken::new();
    let poll_task = tokio::spawn(scheduler.run(shutdown.clone()));

    wait_for_requests(server, count).await;
    shutdown.cancel();
    poll_task.await.unwrap();
    dispatch_task.await.unwrap();
}

#[tokio::test]
async fn test_three_ticks_three_posts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/inverter/telemetry"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    run_service(&server, 3).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);

    let bodies: Vec<Value> = requests.iter().map(|r| serde_json::from_slice(&r.body).unwrap()).collect();
    let mut last = None;
    for body in bodies.iter() {
        assert_eq!(body["device_id"], "SUN2000-100KTL-M1");
        assert_eq!(body["power"]["active_power"]["value"], 1500);
        assert_eq!(body["power"]["active_power"]["unit"], "W");
        assert_eq!(body["metadata"]["connection_type"], "tcp");
        assert_eq!(body["metadata"]["data_quality"], "good");
        for category in ["power", "voltage_current", "energy", "temperature", "grid", "status", "pv_strings"] {
            assert!(body[category].is_object(), "missing {category}");
        }

        let ts = DateTime::parse_from_rfc3339(body["timestamp"].as_str().unwrap()).unwrap();
        if let Some(prev) = last {
            assert!(ts > prev);
        }
        last = Some(ts);
    }
}

#[tokio::test]
async fn test_rejecting_collector_does_not_stop_polling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    run_service(&server, 2).await;

    /* one attempt per snapshot, 400 is never retried */
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
