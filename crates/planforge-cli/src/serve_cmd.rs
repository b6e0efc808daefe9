use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use planforge_core::cache::RequestCache;
use planforge_core::events::{ChannelSink, ProgressEvent};
use planforge_core::generator::{GenerationContext, Generator, ProfileStore};
use planforge_core::orchestrator::{
    GenerationParams, Orchestrator, OrchestratorConfig, OrchestratorError,
};
use planforge_core::status;
use planforge_db::models::GenerationKind;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Conflict => Self::conflict(err.user_message()),
            OrchestratorError::NotFound => Self::not_found(err.user_message()),
            OrchestratorError::Internal(inner) => Self::internal(inner),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub cache: Arc<RequestCache>,
    pub profiles: Arc<dyn ProfileStore>,
    pub generator: Arc<dyn Generator>,
    pub config: OrchestratorConfig,
}

impl AppState {
    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.pool.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.profiles),
            Arc::clone(&self.generator),
            None,
            self.config.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/generations/{request_id}", post(start_generation))
        .route("/api/generations/{request_id}/status", get(generation_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("planforge serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("planforge serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StartGenerationBody {
    user_id: Uuid,
    kind: GenerationKind,
    #[serde(default)]
    target_day: Option<i32>,
}

impl StartGenerationBody {
    fn context(&self) -> GenerationContext {
        match self.kind {
            GenerationKind::Plan => GenerationContext::Plan {
                target_day: self.target_day,
            },
            GenerationKind::Split => GenerationContext::Split,
        }
    }
}

/// Open a generation stream for `request_id`.
///
/// The orchestrator runs on its own task and feeds the response through a
/// channel, so a client disconnect drops only the SSE body, never the work.
/// Rejections that happen before any event is emitted (conflict, expired
/// request) map to plain HTTP errors instead of a stream.
async fn start_generation(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<StartGenerationBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let params = GenerationParams {
        request_id,
        user_id: body.user_id,
        context: body.context(),
    };

    let orchestrator = state.orchestrator();
    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(16);
    let handle = tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx);
        orchestrator.run(params, &mut sink).await
    });

    // Wait for the first event. If the task finishes without emitting one,
    // the request was rejected up front and deserves an HTTP status.
    let Some(first) = rx.recv().await else {
        return Err(match handle.await {
            Ok(Err(err)) => err.into(),
            Ok(Ok(())) => AppError::internal(anyhow::anyhow!("stream ended without events")),
            Err(join_err) => AppError::internal(join_err.into()),
        });
    };

    let stream = async_stream::stream! {
        yield Ok(sse_event(&first));
        while let Some(event) = rx.recv().await {
            yield Ok(sse_event(&event));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &ProgressEvent) -> Event {
    Event::default().data(event.to_json().to_string())
}

/// Polling endpoint: JSON status for a request.
async fn generation_status(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<status::StatusResponse>, AppError> {
    let response = status::get_status(&state.pool, &state.cache, &state.config, request_id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
