use crate::events::{EventBus, StreamEvent};
use crate::metrics::Metrics;
use crate::poller::LatestSample;
use crate::report::render::{CommitGate, ReportStore};
use crate::report::{reduce, ReportError};
use crate::tracking::{TrackingError, TrackingSession};
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{
    header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    HeaderValue, StatusCode,
};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub session: TrackingSession,
    pub bus: EventBus,
    pub latest: LatestSample,
    pub reports: ReportStore,
    pub min_report_samples: usize,
    pub report_timeout: Duration,
}

pub fn build_router(state: HttpAppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/start-tracking", post(start_tracking))
        .route("/api/stop-tracking", post(stop_tracking))
        .route("/api/tracking-status", get(tracking_status))
        .route("/api/generate-report", post(generate_report))
        .route("/api/download-report/:filename", get(download_report))
        .with_state(state)
}

/// Failures that cross into the request layer.
#[derive(Debug)]
pub enum ApiError {
    Tracking(TrackingError),
    Report(ReportError),
    NoSample,
}

impl From<TrackingError> for ApiError {
    fn from(err: TrackingError) -> Self {
        Self::Tracking(err)
    }
}

impl From<ReportError> for ApiError {
    fn from(err: ReportError) -> Self {
        Self::Report(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Tracking(err @ TrackingError::AlreadyTracking) => {
                (StatusCode::CONFLICT, err.to_string())
            }
            ApiError::Report(err) => {
                let status = match err {
                    ReportError::InsufficientData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    ReportError::NotFound(_) => StatusCode::NOT_FOUND,
                    ReportError::Render(_)
                    | ReportError::Timeout(_)
                    | ReportError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
            ApiError::NoSample => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no sample collected yet".to_string(),
            ),
        };
        (status, Json(json!({ "status": "error", "message": message }))).into_response()
    }
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../assets/index.html"))
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn stats_handler(State(state): State<HttpAppState>) -> Result<Response, ApiError> {
    let latest = state.latest.read().await.clone();
    let sample = latest.ok_or(ApiError::NoSample)?;
    Ok(Json(sample).into_response())
}

async fn start_tracking(State(state): State<HttpAppState>) -> Result<Response, ApiError> {
    let info = state.session.start(Instant::now()).await?;
    state.metrics.inc_session_started();
    Ok(Json(json!({ "status": "started", "duration": info.duration_secs })).into_response())
}

async fn stop_tracking(State(state): State<HttpAppState>) -> impl IntoResponse {
    let info = state.session.stop().await;
    Json(json!({ "status": "stopped", "data_points": info.data_points }))
}

async fn tracking_status(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(state.session.status(Instant::now()).await)
}

async fn generate_report(State(state): State<HttpAppState>) -> Result<Response, ApiError> {
    let result = render_report(&state).await;
    state.metrics.inc_report(result.is_ok());
    let (filename, data_points) = result.map_err(|err| {
        warn!(error = %err, "report generation failed");
        err
    })?;
    Ok(Json(json!({
        "status": "success",
        "filename": filename,
        "data_points": data_points,
    }))
    .into_response())
}

async fn render_report(state: &HttpAppState) -> Result<(String, usize), ReportError> {
    let samples = state.session.frozen_samples().await;
    let store = state.reports.clone();
    let min_samples = state.min_report_samples;
    let timeout = state.report_timeout;
    let gate = CommitGate::new();

    let mut job = {
        let gate = gate.clone();
        tokio::task::spawn_blocking(move || -> Result<(String, usize), ReportError> {
            let report = reduce(&samples, min_samples)?;
            let filename = store.write(&report, SystemTime::now(), &gate)?;
            Ok((filename, report.data_points))
        })
    };

    let joined = match tokio::time::timeout(timeout, &mut job).await {
        Ok(joined) => joined,
        // Cancelled before the job committed: it drops its temp file.
        Err(_) if gate.try_cancel() => return Err(ReportError::Timeout(timeout)),
        // Already committed: wait for the persisted name.
        Err(_) => job.await,
    };
    joined.unwrap_or_else(|join_err| {
        Err(ReportError::Render(std::io::Error::other(
            join_err.to_string(),
        )))
    })
}

async fn download_report(
    State(state): State<HttpAppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let path = state.reports.resolve(&filename)?;
    let body = tokio::fs::read(&path)
        .await
        .map_err(|_| ReportError::NotFound(filename.clone()))?;

    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        response.headers_mut().insert(CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HttpAppState>) -> Response {
    let events = state.bus.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, events))
}

async fn stream_events(
    mut socket: WebSocket,
    mut events: tokio::sync::broadcast::Receiver<StreamEvent>,
) {
    if send_event(&mut socket, &StreamEvent::Connected).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "stream subscriber lagged, dropping oldest events");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("stream subscriber disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &StreamEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => socket.send(Message::Text(text)).await,
        Err(err) => {
            warn!(error = %err, "failed to encode stream event");
            Ok(())
        }
    }
}
