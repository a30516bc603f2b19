use std::convert::Infallible;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::Stream as FuturesStream;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use turret_vision::CancelToken;

use crate::{FrameBus, FramePacket, Stream, TrackingMeta};

const BOUNDARY: &str = "frame";

const INDEX_HTML: &str = r#"<!doctype html>
<html>
  <head><title>turret</title></head>
  <body style="background:#111;color:#ccc;font-family:monospace">
    <h2>turret</h2>
    <div style="display:flex;gap:8px">
      <img src="/frame" width="500" height="500">
      <img src="/delta" width="500" height="500">
      <img src="/thresh" width="500" height="500">
    </div>
  </body>
</html>
"#;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

/// A server that is accepting connections.
pub struct RunningServer {
    pub local_addr: SocketAddr,
    pub task: tokio::task::JoinHandle<()>,
}

#[derive(Clone)]
struct AppState {
    bus: FrameBus,
    shutdown: CancelToken,
}

/// Binds `cfg.bind_addr` and serves the bus until `shutdown` fires.
///
/// Open MJPEG streams end on shutdown as well, so the returned task completes.
pub async fn start_server(
    bus: FrameBus,
    cfg: ServerConfig,
    shutdown: CancelToken,
) -> anyhow::Result<RunningServer> {
    let state = AppState {
        bus,
        shutdown: shutdown.clone(),
    };
    let app = Router::new()
        .route("/", get(|| async { Html(INDEX_HTML) }))
        .route(Stream::Frame.path(), get(frame_stream))
        .route(Stream::Delta.path(), get(delta_stream))
        .route(Stream::Thresh.path(), get(thresh_stream))
        .route("/meta", get(meta))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("could not bind {}: {e}", cfg.bind_addr))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "visualizer listening");

    let mut shutdown = shutdown;
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        match served {
            Ok(()) => info!("visualizer stopped"),
            Err(e) => warn!(error = %e, "visualizer failed"),
        }
    });

    Ok(RunningServer { local_addr, task })
}

async fn frame_stream(State(state): State<AppState>) -> Response {
    mjpeg(state, Stream::Frame)
}

async fn delta_stream(State(state): State<AppState>) -> Response {
    mjpeg(state, Stream::Delta)
}

async fn thresh_stream(State(state): State<AppState>) -> Response {
    mjpeg(state, Stream::Thresh)
}

async fn meta(State(state): State<AppState>) -> Json<TrackingMeta> {
    Json(state.bus.meta())
}

fn mjpeg(state: AppState, stream: Stream) -> Response {
    let body = Body::from_stream(mjpeg_parts(state, stream));
    match Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
    {
        Ok(response) => response,
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn mjpeg_parts(
    state: AppState,
    stream: Stream,
) -> impl FuturesStream<Item = Result<Bytes, Infallible>> {
    let AppState { bus, mut shutdown } = state;
    let mut rx = bus.subscribe(stream);
    drop(bus);
    debug!(?stream, "viewer connected");
    async_stream::stream! {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = rx.recv() => next,
            };
            match next {
                Ok(packet) => yield Ok(part(&packet)),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(?stream, skipped, "viewer lagging");
                    continue;
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(?stream, "viewer disconnected");
    }
}

/// One `multipart/x-mixed-replace` part holding a JPEG.
fn part(packet: &FramePacket) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        packet.data.len()
    );
    let mut out = Vec::with_capacity(header.len() + packet.data.len() + 2);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&packet.data);
    out.extend_from_slice(b"\r\n");
    Bytes::from(out)
}
