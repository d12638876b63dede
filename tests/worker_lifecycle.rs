//! Worker start hooks and the blocking watchdog on real workers.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{client, test_config, wait_for, TestServer};
use serde_json::json;
use worker_telemetry::app;
use worker_telemetry::http::{ExchangeHooks, RequestRecord};
use worker_telemetry::lifecycle::{WorkerBridge, WorkerOptions};
use worker_telemetry::observability::watchdog::BLOCKING_DETECTED;
use worker_telemetry::observability::{MemorySink, Severity, WatchdogLauncher};

#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct RecordingLauncher(EventLog);

impl WatchdogLauncher for RecordingLauncher {
    fn start(&self, max_blocking: Duration) {
        let worker = std::thread::current().name().unwrap_or("").to_string();
        self.0.push(format!("watchdog {:?} on {}", max_blocking, worker));
    }
}

struct RecordingHooks(EventLog);

impl ExchangeHooks for RecordingHooks {
    fn on_exchange_complete(&self, record: RequestRecord) {
        self.0.push(format!("request {:?}", record.http_status));
    }
}

fn options_with_launcher(max_blocking_secs: f64, events: &EventLog) -> (WorkerOptions, String) {
    let mut config = test_config("127.0.0.1:0");
    config.observability.max_blocking_secs = max_blocking_secs;

    let bridge = WorkerBridge::new(
        &config.observability,
        Arc::new(RecordingLauncher(events.clone())),
    );
    let options = WorkerOptions::new(
        app::router(&config),
        Arc::new(RecordingHooks(events.clone())),
        &config,
    )
    .with_worker_hook(Arc::new(bridge));
    (options, config.listener.bind_address.clone())
}

async fn wait_for_events(events: &EventLog, count: usize) -> Vec<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let seen = events.events();
        if seen.len() >= count || tokio::time::Instant::now() >= deadline {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn watchdog_is_armed_before_first_request() {
    let events = EventLog::default();
    let (options, bind) = options_with_launcher(0.25, &events);
    let server = TestServer::start_with(&test_config(&bind), &options, MemorySink::new());

    let response = client().get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let seen = wait_for_events(&events, 2).await;
    assert_eq!(
        seen,
        vec![
            format!("watchdog {:?} on worker-0", Duration::from_millis(250)),
            "request Some(200)".to_string(),
        ]
    );
}

#[tokio::test]
async fn zero_threshold_never_starts_watchdog() {
    let events = EventLog::default();
    let (options, bind) = options_with_launcher(0.0, &events);
    let server = TestServer::start_with(&test_config(&bind), &options, MemorySink::new());

    client().get(server.url("/health")).send().await.unwrap();

    let seen = wait_for_events(&events, 1).await;
    assert_eq!(seen, vec!["request Some(200)".to_string()]);
}

#[tokio::test]
async fn every_worker_arms_its_own_watchdog() {
    let events = EventLog::default();
    let (options, bind) = options_with_launcher(1.0, &events);
    let mut config = test_config(&bind);
    config.listener.workers = 3;
    let server = TestServer::start_with(&config, &options, MemorySink::new());

    let mut seen = wait_for_events(&events, 3).await;
    seen.sort();
    assert_eq!(
        seen,
        (0..3)
            .map(|id| format!("watchdog {:?} on worker-{}", Duration::from_secs(1), id))
            .collect::<Vec<_>>()
    );
    server.stop();
}

#[tokio::test]
async fn blocking_handler_is_reported() {
    let mut config = test_config("127.0.0.1:0");
    config.observability.max_blocking_secs = 0.1;
    let server = TestServer::start(&config);

    let response = client().get(server.url("/block?ms=400")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "blocked 400 ms\n");

    let reports = wait_for(&server.sink, BLOCKING_DETECTED, 1).await;
    assert!(!reports.is_empty());
    let report = &reports[0];
    assert_eq!(report.severity(), Severity::Warning);
    assert_eq!(report.get("worker"), Some(&json!("worker-0")));
    assert_eq!(report.get("max_blocking_time"), Some(&json!(0.1)));
    let blocked = report.get("blocking_time").and_then(|v| v.as_f64()).unwrap();
    assert!(blocked > 0.1);
}

#[tokio::test]
async fn stopped_server_refuses_connections() {
    let server = TestServer::start(&test_config("127.0.0.1:0"));
    let addr = server.addr();
    client().get(server.url("/health")).send().await.unwrap();

    tokio::task::spawn_blocking(move || server.stop()).await.unwrap();

    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}
