//! HTTP front end

use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeFile;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::broadcast::FrameBroadcaster;
use crate::frame::EncodedFrame;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::timelapse::{self, TimelapsePhase, TimelapseSettings, VideoEncoder};

pub const BOUNDARY: &str = "frame";

#[derive(Clone)]
pub struct AppState {
    frames: FrameBroadcaster,
    stats: Arc<PipelineStats>,
    timelapse: Arc<TimelapseSettings>,
    encoder: Arc<dyn VideoEncoder>,
    phase: watch::Receiver<TimelapsePhase>,
    token: CancellationToken,
}

impl AppState {
    pub fn new(
        frames: FrameBroadcaster,
        stats: Arc<PipelineStats>,
        timelapse: TimelapseSettings,
        encoder: Arc<dyn VideoEncoder>,
        phase: watch::Receiver<TimelapsePhase>,
        token: CancellationToken,
    ) -> Self {
        Self {
            frames,
            stats,
            timelapse: Arc::new(timelapse),
            encoder,
            phase,
            token,
        }
    }
}

/// Build the router. Live streams and on-demand renders are exempt from the
/// request timeout.
pub fn router(state: AppState, read_timeout: Duration) -> Router {
    let video = ServeFile::new(state.timelapse.video_path());

    let bounded = Router::new()
        .route("/", get(index_handler))
        .route("/snap", get(snapshot_handler))
        .route("/health", get(health_handler))
        .route_service("/timelapse.mp4", video)
        .layer(TimeoutLayer::new(read_timeout));

    Router::new()
        .route("/stream", get(stream_handler))
        .route("/timelapse", get(timelapse_handler))
        .merge(bounded)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the state's cancellation token fires.
pub async fn serve(listener: TcpListener, state: AppState, read_timeout: Duration) -> io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "Starting http server");

    let token = state.token.clone();
    axum::serve(listener, router(state, read_timeout))
        .with_graceful_shutdown(async move {
            token.cancelled().await;
            info!("Gracefully shutting down http server");
        })
        .await
}

/// One `multipart/x-mixed-replace` part holding a JPEG.
fn multipart_part(frame: &EncodedFrame) -> Bytes {
    let head = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );
    let mut part = BytesMut::with_capacity(head.len() + frame.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(frame.bytes());
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

async fn index_handler() -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>cam-server</title></head>
<body>
    <h1>cam-server {version}</h1>
    <ul>
        <li><a href="/stream">/stream</a> - live MJPEG stream</li>
        <li><a href="/snap">/snap</a> - single JPEG snapshot</li>
        <li><a href="/timelapse">/timelapse</a> - download a freshly rendered timelapse</li>
        <li><a href="/timelapse.mp4">/timelapse.mp4</a> - latest periodic timelapse</li>
        <li><a href="/health">/health</a> - pipeline status</li>
    </ul>
</body>
</html>"#,
        version = env!("CARGO_PKG_VERSION")
    ))
}

async fn stream_handler(State(state): State<AppState>) -> Response {
    debug!("Stream client connected");
    let parts = state
        .frames
        .stream(state.token.clone())
        .map(|frame| Ok::<_, Infallible>(multipart_part(&frame)));

    (
        [
            (header::CONTENT_TYPE, format!("multipart/x-mixed-replace; boundary={BOUNDARY}")),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate".to_string()),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

async fn snapshot_handler(State(state): State<AppState>) -> Response {
    if state.token.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    match state.frames.snapshot(&state.token).await {
        Ok(frame) => ([(header::CONTENT_TYPE, "image/jpeg")], frame.into_bytes()).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn timelapse_handler(State(state): State<AppState>) -> Response {
    match timelapse::render_on_demand(state.encoder.as_ref(), &state.timelapse).await {
        Ok(video) => ([(header::CONTENT_TYPE, "video/x-matroska")], video).into_response(),
        Err(e) => {
            error!(error = %e, "On-demand timelapse render failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timelapse: TimelapsePhase,
    stats: StatsSnapshot,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.token.is_cancelled() {
        "shutting_down"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        timelapse: *state.phase.borrow(),
        stats: state.stats.snapshot(),
    })
}
