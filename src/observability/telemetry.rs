//! Exchange hooks backed by the access log and the error classifier.

use std::sync::Arc;

use crate::config::ObservabilityConfig;
use crate::http::errors::handle_exchange_error;
use crate::http::exchange::RequestRecord;
use crate::http::hooks::{ErrorOutcome, ExchangeFailure, ExchangeHooks};
use crate::observability::access_log::AccessLogRecorder;
use crate::observability::logging::LogSink;

/// Plugs request logging and disconnect suppression into the host.
pub struct Telemetry {
    sink: Arc<dyn LogSink>,
    recorder: AccessLogRecorder,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn LogSink>, recorder: AccessLogRecorder) -> Self {
        Self { sink, recorder }
    }

    pub fn from_config(config: &ObservabilityConfig, sink: Arc<dyn LogSink>) -> Self {
        let recorder = AccessLogRecorder::from_env(Arc::clone(&sink), &config.env_var);
        Self::new(sink, recorder)
    }

    pub fn recorder(&self) -> &AccessLogRecorder {
        &self.recorder
    }
}

impl ExchangeHooks for Telemetry {
    fn on_exchange_complete(&self, record: RequestRecord) {
        self.recorder.record(&record);
    }

    fn on_exchange_error(&self, failure: &ExchangeFailure<'_>) -> ErrorOutcome {
        handle_exchange_error(self.sink.as_ref(), failure)
    }
}
