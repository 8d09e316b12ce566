//! HTTP surface: viewer SSE stream, CI webhooks and supervision endpoints.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use logstream_core::{
    BuildFinished, PollerInfo, PoolError, PostBuildPool, StreamCoordinator, StreamError,
    StreamEvent, StreamKey, SubscriberId,
};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

/// Shared handler context. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: StreamCoordinator,
    pub post_build: Arc<PostBuildPool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pollers", get(pollers))
        .route("/deployments/:deployment_id/log/stream", get(log_stream))
        .route("/webhooks/build-started", post(build_started))
        .route("/webhooks/build-finished", post(build_finished))
        .with_state(state)
}

/// Error body returned by every failing handler.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

pub enum ApiError {
    Stream(StreamError),
    Pool(PoolError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Stream(err @ StreamError::NoActiveSession { .. }) => {
                (StatusCode::NOT_FOUND, err.to_string())
            }
            ApiError::Stream(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            ApiError::Pool(err) => {
                warn!(event = "post_build.rejected", error = %err);
                (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        ApiError::Stream(err)
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        ApiError::Pool(err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_pollers: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: logstream_core::VERSION.to_string(),
        active_pollers: state.coordinator.active_pollers().len(),
    })
}

async fn pollers(State(state): State<AppState>) -> Json<Vec<PollerInfo>> {
    Json(state.coordinator.active_pollers())
}

/// GET /deployments/:deployment_id/log/stream
///
/// `connected`, then the replayed log as one `log` event, then live `log`
/// events, then a single `complete`. Closing the connection detaches the
/// viewer; it never stops the build's poll loop directly. The response
/// ends when the viewer outlives the configured subscriber timeout.
async fn log_stream(
    State(state): State<AppState>,
    Path(deployment_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.coordinator.subscribe(&deployment_id)?;
    debug!(stream_key = %subscription.stream_key(), "viewer connected");

    let detach = DetachOnDrop {
        coordinator: state.coordinator.clone(),
        stream_key: subscription.stream_key().clone(),
        id: subscription.id(),
    };
    let stream = UnboundedReceiverStream::new(subscription.into_receiver()).map(move |event| {
        let _ = &detach;
        Ok(sse_event(&event))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

/// Detaches the viewer as soon as its response stream is dropped, instead
/// of waiting for the next liveness check to notice the closed channel.
struct DetachOnDrop {
    coordinator: StreamCoordinator,
    stream_key: StreamKey,
    id: SubscriberId,
}

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        let DetachOnDrop {
            coordinator,
            stream_key,
            id,
        } = self;
        if coordinator.remove_subscriber(stream_key, *id) {
            debug!(stream_key = %stream_key, "viewer disconnected");
        }
    }
}

fn sse_event(event: &StreamEvent) -> Event {
    let data = match event {
        StreamEvent::Connected => "",
        StreamEvent::Log(text) | StreamEvent::Complete(text) => text.as_str(),
    };
    Event::default().event(event.kind()).data(data)
}

/// Body of the "build started" webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStarted {
    pub deployment_id: String,
    pub job_name: String,
    pub build_number: u64,
}

async fn build_started(
    State(state): State<AppState>,
    Json(body): Json<BuildStarted>,
) -> StatusCode {
    state
        .coordinator
        .build_started(&body.deployment_id, &body.job_name, body.build_number);
    StatusCode::ACCEPTED
}

async fn build_finished(
    State(state): State<AppState>,
    Json(body): Json<BuildFinished>,
) -> Result<StatusCode, ApiError> {
    // The ticket is dropped: outcomes surface through logs and dead letters.
    state.post_build.build_finished(body).await?;
    Ok(StatusCode::ACCEPTED)
}
