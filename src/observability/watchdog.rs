//! Blocking-time watchdog.
//!
//! # Detection
//! A heartbeat task on the worker's own event loop sleeps for a short sample
//! interval and measures how late it was woken. The loop can only wake it
//! late if some other unit of work kept the loop busy, so lateness above the
//! threshold is reported as one blocking episode.
//!
//! ```text
//! |-- sleep(interval) --|######## blocked ########|
//!                       ^ due                     ^ woken
//!                       '------- lateness --------'
//! ```
//!
//! The report is written after the block ends, with the measured duration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::observability::logging::{LogRecord, LogSink};

/// Message of every blocking report.
pub const BLOCKING_DETECTED: &str = "Blocking detected";

const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);
const MAX_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Starts a watchdog for the calling worker. Fire-and-forget.
pub trait WatchdogLauncher: Send + Sync {
    fn start(&self, max_blocking: Duration);
}

/// Watchdog measuring scheduling latency of the current tokio event loop.
pub struct LoopLatencyWatchdog {
    sink: Arc<dyn LogSink>,
}

impl LoopLatencyWatchdog {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

impl WatchdogLauncher for LoopLatencyWatchdog {
    fn start(&self, max_blocking: Duration) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(error = %e, "No event loop to watch, blocking watchdog not started");
                return;
            }
        };

        let worker = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        let sink = Arc::clone(&self.sink);

        tracing::debug!(
            worker = %worker,
            max_blocking_secs = max_blocking.as_secs_f64(),
            "Blocking watchdog started"
        );
        handle.spawn(heartbeat(sink, worker, max_blocking));
    }
}

/// How often the heartbeat samples for a given threshold.
pub fn sample_interval(max_blocking: Duration) -> Duration {
    (max_blocking / 4).clamp(MIN_SAMPLE_INTERVAL, MAX_SAMPLE_INTERVAL)
}

/// Report for one heartbeat, if it was woken later than the threshold allows.
pub fn blocking_report(lateness: Duration, max_blocking: Duration, worker: &str) -> Option<LogRecord> {
    if lateness <= max_blocking {
        return None;
    }
    Some(
        LogRecord::warning(BLOCKING_DETECTED)
            .field("blocking_time", round_micros(lateness))
            .field("max_blocking_time", max_blocking.as_secs_f64())
            .field("worker", worker),
    )
}

async fn heartbeat(sink: Arc<dyn LogSink>, worker: String, max_blocking: Duration) {
    let interval = sample_interval(max_blocking);
    loop {
        let due = Instant::now() + interval;
        tokio::time::sleep_until(due.into()).await;
        let lateness = Instant::now().saturating_duration_since(due);
        if let Some(report) = blocking_report(lateness, max_blocking, &worker) {
            sink.emit(report);
        }
    }
}

fn round_micros(d: Duration) -> f64 {
    ((d.as_nanos() + 500) / 1_000) as f64 / 1_000_000.0
}
