//! Per-connection HTTP serving.
//!
//! # Responsibilities
//! - Serve one accepted connection with hyper HTTP/1.1 (keep-alive)
//! - Open a `RequestRecord` for every exchange and expose `LogContext`,
//!   `PeerAddr` and `RawUri` to the application as request extensions
//! - Dispatch into the axum `Router`
//! - Count response body bytes as they are handed to the transport
//! - Call exactly one of the completion and error hooks per exchange

use std::convert::Infallible;
use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use hyper::body::{Body as HttpBody, Bytes, Frame, Incoming, SizeHint};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tower::ServiceExt;

use crate::http::exchange::{ExchangeSlot, LogContext, PeerAddr, RawUri, RequestRecord};
use crate::http::hooks::{report_unexpected, ErrorOutcome, ExchangeFailure, ExchangeHooks};
use crate::net::connection::{ConnectionId, ConnectionTracker};

/// HTTP server for one worker. Cheap to clone; clones share the tracker.
#[derive(Clone)]
pub struct HttpServer {
    app: Router,
    hooks: Arc<dyn ExchangeHooks>,
    tracker: ConnectionTracker,
}

impl HttpServer {
    pub fn new(app: Router, hooks: Arc<dyn ExchangeHooks>) -> Self {
        Self {
            app,
            hooks,
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Serve every exchange on one connection until it closes.
    pub async fn serve_connection<I>(&self, io: I, peer: PeerAddr)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let guard = self.tracker.track();
        let slot = Arc::new(ExchangeSlot::default());

        let service = {
            let server = self.clone();
            let slot = Arc::clone(&slot);
            service_fn(move |request: Request<Incoming>| {
                let server = server.clone();
                let slot = Arc::clone(&slot);
                let peer = peer.clone();
                async move { Ok::<_, Infallible>(server.dispatch(request, peer, slot).await) }
            })
        };

        let result = http1::Builder::new()
            .keep_alive(true)
            .serve_connection(TokioIo::new(io), service)
            .await;

        let in_flight = slot.take();
        match result {
            Ok(()) => {
                if let Some(record) = in_flight {
                    self.complete(record);
                }
            }
            Err(error) => self.fail(&error, in_flight, guard.id()),
        }
    }

    async fn dispatch(
        &self,
        request: Request<Incoming>,
        peer: PeerAddr,
        slot: Arc<ExchangeSlot>,
    ) -> Response<CountingBody> {
        // A body hyper never polled to the end (e.g. HEAD) leaves its record
        // behind; the next request on the connection closes it out.
        if let Some(leftover) = slot.take() {
            self.complete(leftover);
        }

        let log_context = LogContext::new();
        let raw_uri = RawUri(
            request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| request.uri().to_string()),
        );
        slot.begin(
            RequestRecord::for_request(peer.clone(), &request).with_log_context(log_context.clone()),
        );

        let mut request = request.map(Body::new);
        let extensions = request.extensions_mut();
        extensions.insert(log_context);
        extensions.insert(peer);
        extensions.insert(raw_uri);

        let response = match self.app.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        let status = response.status().as_u16();
        slot.update(|record| record.respond(status));
        response.map(|body| CountingBody::new(body, slot, Arc::clone(&self.hooks)))
    }

    fn complete(&self, mut record: RequestRecord) {
        if record.finish_time.is_none() {
            record.finish();
        }
        self.hooks.on_exchange_complete(record);
    }

    fn fail(&self, error: &hyper::Error, in_flight: Option<RequestRecord>, connection: ConnectionId) {
        let Some(mut record) = in_flight else {
            // Nothing was being served: idle keep-alive resets, bad request heads.
            tracing::debug!(connection_id = %connection, error = %error, "Connection closed with error");
            return;
        };
        record.finish();

        let hung_up;
        let error: &(dyn StdError + 'static) = if peer_hung_up(error, &record) {
            hung_up = io::Error::new(io::ErrorKind::BrokenPipe, error.to_string());
            &hung_up
        } else {
            error
        };
        let failure = ExchangeFailure {
            error,
            record: &record,
        };
        // hyper has already torn the connection down by the time it reports
        // an error, so a close request is satisfied by returning.
        match self.hooks.on_exchange_error(&failure) {
            ErrorOutcome::Handled { close_connection } => {
                tracing::trace!(connection_id = %connection, close_connection, "Exchange error handled");
            }
            ErrorOutcome::Unhandled => report_unexpected(&failure),
        }
    }
}

/// hyper reports a client that closed while the response was still being
/// written as an incomplete message, not as an I/O error.
fn peer_hung_up(error: &hyper::Error, record: &RequestRecord) -> bool {
    error.is_incomplete_message() && record.http_status.is_some()
}

/// Response body that counts bytes and completes the exchange at its end.
pub struct CountingBody {
    inner: Body,
    slot: Arc<ExchangeSlot>,
    hooks: Arc<dyn ExchangeHooks>,
    finished: bool,
}

impl CountingBody {
    fn new(inner: Body, slot: Arc<ExchangeSlot>, hooks: Arc<dyn ExchangeHooks>) -> Self {
        Self {
            inner,
            slot,
            hooks,
            finished: false,
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(mut record) = self.slot.take() {
            record.finish();
            self.hooks.on_exchange_complete(record);
        }
    }
}

impl HttpBody for CountingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    let n = data.len() as u64;
                    self.slot.update(|record| record.add_bytes(n));
                }
            }
            Poll::Ready(None) => self.finish(),
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        // Dropped before the end means the write failed; the error path owns
        // the record then.
        if self.inner.is_end_stream() {
            self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::hooks::DefaultHooks;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct Recording {
        completed: Mutex<Vec<RequestRecord>>,
    }

    impl ExchangeHooks for Recording {
        fn on_exchange_complete(&self, record: RequestRecord) {
            self.completed.lock().unwrap().push(record);
        }
    }

    fn app() -> Router {
        use axum::routing::get;
        use axum::Extension;

        Router::new()
            .route("/", get(|| async { "hello" }))
            .route(
                "/slow",
                get(|| async {
                    let chunks = futures_util::stream::unfold(0u32, |n| async move {
                        if n > 0 {
                            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                        }
                        (n < 5).then(|| (Ok::<_, Infallible>(Bytes::from("chunk\n")), n + 1))
                    });
                    Body::from_stream(chunks)
                }),
            )
            .route(
                "/ctx",
                get(|Extension(ctx): Extension<LogContext>| async move {
                    ctx.insert("user", "u1");
                    "tagged"
                }),
            )
    }

    async fn exchange(server: HttpServer, raw: &'static [u8]) -> String {
        let (mut client, server_side) = tokio::io::duplex(64 * 1024);
        let peer = PeerAddr::Opaque("test".into());
        let serving = tokio::spawn(async move { server.serve_connection(server_side, peer).await });

        client.write_all(raw).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        serving.await.unwrap();
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn completed_exchange_reaches_hook_once() {
        let hooks = Arc::new(Recording::default());
        let server = HttpServer::new(app(), hooks.clone());

        let response = exchange(
            server,
            b"GET / HTTP/1.1\r\nHost: x\r\nX-Unique-Id: abc123\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"));

        let completed = hooks.completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        let record = &completed[0];
        assert_eq!(record.http_status, Some(200));
        assert_eq!(record.response_bytes, Some(5));
        assert_eq!(record.request_line.as_deref(), Some("GET / HTTP/1.1"));
        assert_eq!(record.header("x-unique-id"), Some("abc123"));
        assert!(record.elapsed().is_some());
    }

    #[tokio::test]
    async fn keep_alive_exchanges_are_recorded_separately() {
        let hooks = Arc::new(Recording::default());
        let server = HttpServer::new(app(), hooks.clone());

        exchange(
            server,
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\nGET /missing HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;

        let completed = hooks.completed.lock().unwrap();
        let statuses: Vec<_> = completed.iter().map(|r| r.http_status).collect();
        assert_eq!(statuses, vec![Some(200), Some(404)]);
    }

    #[tokio::test]
    async fn application_context_lands_on_record() {
        let hooks = Arc::new(Recording::default());
        let server = HttpServer::new(app(), hooks.clone());

        exchange(
            server,
            b"GET /ctx HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;

        let completed = hooks.completed.lock().unwrap();
        assert_eq!(
            completed[0].log_context.snapshot().get("user"),
            Some(&serde_json::Value::from("u1"))
        );
    }

    #[tokio::test]
    async fn client_leaving_mid_stream_is_a_socket_error() {
        use crate::observability::{AccessLogRecorder, LogSink, MemorySink, Severity, Telemetry};

        let sink = MemorySink::new();
        let shared: Arc<dyn LogSink> = Arc::new(sink.clone());
        let telemetry = Telemetry::new(Arc::clone(&shared), AccessLogRecorder::new(shared, None));
        let server = HttpServer::new(app(), Arc::new(telemetry));

        let (mut client, server_side) = tokio::io::duplex(64 * 1024);
        let serving = tokio::spawn(async move {
            server
                .serve_connection(server_side, PeerAddr::Opaque("test".into()))
                .await
        });

        client
            .write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&received).contains("chunk") {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before first chunk");
            received.extend_from_slice(&buf[..n]);
        }
        drop(client);
        serving.await.unwrap();

        let socket_errors = sink.with_message("Socket error");
        assert_eq!(socket_errors.len(), 1);
        assert_eq!(socket_errors[0].severity(), Severity::Info);
        assert!(socket_errors[0].get("exc").is_some());
        assert!(sink.with_message("request handled").is_empty());
    }

    #[tokio::test]
    async fn tracker_counts_open_connection() {
        let server = HttpServer::new(app(), Arc::new(DefaultHooks));
        let tracker = server.tracker().clone();
        let (client, server_side) = tokio::io::duplex(1024);

        let serving = tokio::spawn(async move {
            server
                .serve_connection(server_side, PeerAddr::Opaque(String::new()))
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(tracker.active_count(), 1);

        drop(client);
        serving.await.unwrap();
        assert_eq!(tracker.active_count(), 0);
    }
}
