//! Access log: one structured record per finished exchange.

use std::sync::Arc;
use std::time::Duration;

use crate::http::exchange::{RequestRecord, X_FORWARD_FOR, X_UNIQUE_ID};
use crate::observability::logging::{LogRecord, LogSink};

/// Message of every access log record.
pub const REQUEST_HANDLED: &str = "request handled";

/// Turns finished exchanges into `request handled` records.
pub struct AccessLogRecorder {
    sink: Arc<dyn LogSink>,
    environment: Option<String>,
}

impl AccessLogRecorder {
    pub fn new(sink: Arc<dyn LogSink>, environment: Option<String>) -> Self {
        Self { sink, environment }
    }

    /// Read the deployment tag from the named process environment variable.
    pub fn from_env(sink: Arc<dyn LogSink>, var: &str) -> Self {
        Self::new(sink, std::env::var(var).ok())
    }

    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    /// Build the record for an exchange without emitting it.
    pub fn build(&self, record: &RequestRecord) -> LogRecord {
        let mut log = LogRecord::info(REQUEST_HANDLED)
            .field_opt("response_bytes", record.response_bytes)
            .field_opt("request_time", request_time(record))
            .field_opt("remote_addr", client_address(record))
            .field_opt("http_status", record.http_status)
            .field_opt("http_request", record.request_line.clone())
            .field_opt("request_uid", record.header(X_UNIQUE_ID))
            .field_opt("env", self.environment.clone());

        // Fixed fields above win over application context with the same key.
        for (key, value) in record.log_context.snapshot() {
            log.insert_if_absent(key, value);
        }
        log
    }

    /// Emit the record for a finished exchange.
    pub fn record(&self, record: &RequestRecord) {
        self.sink.emit(self.build(record));
    }
}

/// Client address for the log: the peer's host, or `X-Forward-For` when the
/// transport reports an empty address.
pub fn client_address(record: &RequestRecord) -> Option<String> {
    let host = record.client_address.host();
    if host.is_empty() {
        record.header(X_FORWARD_FOR).map(str::to_owned)
    } else {
        Some(host)
    }
}

/// Elapsed seconds rounded to the microsecond, if the exchange finished.
pub fn request_time(record: &RequestRecord) -> Option<f64> {
    record.elapsed().map(round_micros)
}

fn round_micros(elapsed: Duration) -> f64 {
    let micros = (elapsed.as_nanos() + 500) / 1_000;
    micros as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::exchange::{LogContext, PeerAddr};
    use crate::observability::logging::{MemorySink, Severity};
    use axum::http::HeaderValue;
    use serde_json::{json, Value};
    use std::net::SocketAddr;

    fn recorder(sink: &MemorySink, env: Option<&str>) -> AccessLogRecorder {
        AccessLogRecorder::new(Arc::new(sink.clone()), env.map(str::to_owned))
    }

    fn finished(peer: PeerAddr, elapsed: Duration) -> RequestRecord {
        let mut record = RequestRecord::new(peer);
        record.request_line = Some("GET /n/inbox HTTP/1.1".into());
        record.respond(200);
        record.add_bytes(42);
        record.finish_time = Some(record.start_time + elapsed);
        record
    }

    fn socket(addr: &str) -> PeerAddr {
        PeerAddr::from(addr.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn emits_one_info_record_with_standard_fields() {
        let sink = MemorySink::new();
        let record = finished(socket("192.0.2.10:40000"), Duration::from_millis(250));

        recorder(&sink, Some("prod")).record(&record);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        let log = &records[0];
        assert_eq!(log.severity(), Severity::Info);
        assert_eq!(log.message(), "request handled");
        assert_eq!(log.get("response_bytes"), Some(&json!(42)));
        assert_eq!(log.get("request_time"), Some(&json!(0.25)));
        assert_eq!(log.get("remote_addr"), Some(&json!("192.0.2.10")));
        assert_eq!(log.get("http_status"), Some(&json!(200)));
        assert_eq!(log.get("http_request"), Some(&json!("GET /n/inbox HTTP/1.1")));
        assert_eq!(log.get("env"), Some(&json!("prod")));
    }

    #[test]
    fn request_time_rounds_to_microseconds() {
        let record = finished(
            socket("127.0.0.1:1"),
            Duration::from_nanos(1_234_567_600),
        );
        assert_eq!(request_time(&record), Some(1.234568));

        let record = finished(socket("127.0.0.1:1"), Duration::from_nanos(1_234_567_400));
        assert_eq!(request_time(&record), Some(1.234567));

        let record = finished(socket("127.0.0.1:1"), Duration::ZERO);
        assert_eq!(request_time(&record), Some(0.0));
    }

    #[test]
    fn opaque_address_is_used_verbatim() {
        let record = finished(PeerAddr::Opaque("pipe-7".into()), Duration::ZERO);
        assert_eq!(client_address(&record).as_deref(), Some("pipe-7"));
    }

    #[test]
    fn empty_address_falls_back_to_forward_header() {
        let mut record = finished(PeerAddr::Opaque(String::new()), Duration::ZERO);
        record
            .headers
            .insert(X_FORWARD_FOR, HeaderValue::from_static("203.0.113.5"));

        assert_eq!(client_address(&record).as_deref(), Some("203.0.113.5"));
    }

    #[test]
    fn empty_address_without_header_is_omitted() {
        let sink = MemorySink::new();
        let record = finished(PeerAddr::Opaque(String::new()), Duration::ZERO);

        recorder(&sink, None).record(&record);

        assert!(sink.records()[0].get("remote_addr").is_none());
    }

    #[test]
    fn forward_header_ignored_when_peer_known() {
        let mut record = finished(socket("10.0.0.1:9"), Duration::ZERO);
        record
            .headers
            .insert(X_FORWARD_FOR, HeaderValue::from_static("203.0.113.5"));
        assert_eq!(client_address(&record).as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn unique_id_present_only_with_header() {
        let sink = MemorySink::new();
        let recorder = recorder(&sink, None);

        let mut tagged = finished(socket("127.0.0.1:1"), Duration::ZERO);
        tagged
            .headers
            .insert(X_UNIQUE_ID, HeaderValue::from_static("abc123"));
        recorder.record(&tagged);
        recorder.record(&finished(socket("127.0.0.1:1"), Duration::ZERO));

        let records = sink.records();
        assert_eq!(records[0].get("request_uid"), Some(&json!("abc123")));
        assert!(!records[1].fields().contains_key("request_uid"));
    }

    #[test]
    fn absent_values_are_omitted_not_null() {
        let sink = MemorySink::new();
        let record = RequestRecord::new(socket("127.0.0.1:1"));

        recorder(&sink, None).record(&record);

        let log = &sink.records()[0];
        for key in [
            "request_time",
            "http_status",
            "response_bytes",
            "http_request",
            "request_uid",
            "env",
        ] {
            assert!(!log.fields().contains_key(key), "{} should be omitted", key);
        }
        assert!(log.fields().values().all(|v| !v.is_null()));
        assert_eq!(log.get("remote_addr"), Some(&json!("127.0.0.1")));
    }

    #[test]
    fn non_utf8_header_degrades_to_omission() {
        let mut record = finished(socket("127.0.0.1:1"), Duration::ZERO);
        record.headers.insert(
            X_UNIQUE_ID,
            HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap(),
        );
        let sink = MemorySink::new();
        recorder(&sink, None).record(&record);
        assert!(sink.records()[0].get("request_uid").is_none());
    }

    #[test]
    fn log_context_merges_without_overriding_fixed_fields() {
        let sink = MemorySink::new();
        let context = LogContext::new();
        context.insert("account_id", "acc-1");
        context.insert("http_status", 999);
        context.insert("nothing", Value::Null);
        let record =
            finished(socket("127.0.0.1:1"), Duration::ZERO).with_log_context(context);

        recorder(&sink, None).record(&record);

        let log = &sink.records()[0];
        assert_eq!(log.get("account_id"), Some(&json!("acc-1")));
        assert_eq!(log.get("http_status"), Some(&json!(200)));
        assert!(!log.fields().contains_key("nothing"));
    }
}
