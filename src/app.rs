//! Bundled demo application.
//!
//! Small axum router used by the binary and by the integration tests:
//! - `GET /` greets and tags the access log through `LogContext`
//! - `GET /health` liveness check
//! - `GET /stream?chunks=N&interval_ms=M` chunked body, one chunk every M ms
//! - `GET /block?ms=N` holds the worker loop, to exercise the watchdog

use std::convert::Infallible;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::Query;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::timeout::TimeoutLayer;

use crate::config::ServerConfig;
use crate::http::exchange::{LogContext, PeerAddr, RawUri};

const MAX_CHUNKS: u32 = 1_000;
const MAX_BLOCK_MS: u64 = 10_000;

/// Build the demo router with the configured request timeout.
#[allow(deprecated)]
pub fn router(config: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/stream", get(stream))
        .route("/block", get(block))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.timeouts.request_secs,
        )))
}

async fn index(
    context: Option<Extension<LogContext>>,
    peer: Option<Extension<PeerAddr>>,
    uri: Option<Extension<RawUri>>,
) -> String {
    if let Some(Extension(context)) = context {
        context.insert("handler", "index");
        if let Some(Extension(RawUri(uri))) = &uri {
            context.insert("raw_uri", uri.as_str());
        }
    }
    match peer {
        Some(Extension(peer)) => format!("hello {}\n", peer.host()),
        None => "hello\n".to_string(),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    chunks: Option<u32>,
    interval_ms: Option<u64>,
}

async fn stream(Query(params): Query<StreamParams>) -> Body {
    let chunks = params.chunks.unwrap_or(10).min(MAX_CHUNKS);
    let interval = Duration::from_millis(params.interval_ms.unwrap_or(100));

    let body = futures_util::stream::unfold(0u32, move |n| async move {
        if n >= chunks {
            return None;
        }
        tokio::time::sleep(interval).await;
        let chunk = Bytes::from(format!("chunk {}\n", n));
        Some((Ok::<_, Infallible>(chunk), n + 1))
    });
    Body::from_stream(body)
}

#[derive(Debug, Deserialize)]
struct BlockParams {
    ms: u64,
}

async fn block(Query(params): Query<BlockParams>) -> String {
    let ms = params.ms.min(MAX_BLOCK_MS);
    // Deliberately synchronous: holds the whole worker loop.
    std::thread::sleep(Duration::from_millis(ms));
    format!("blocked {} ms\n", ms)
}
