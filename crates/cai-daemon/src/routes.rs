//! Axum router and all HTTP handlers for cai-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. Handlers are `pub(crate)` so the scenario
//! tests in `tests/` can compose the router directly.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info};

use crate::{
    api_types::{
        EnqueueChatRequest, EnqueueChatResponse, ErrorResponse, HealthResponse,
        QueueStatsResponse, RequestStatusResponse,
    },
    state::AppState,
};
use cai_queue::EnqueueError;
use cai_schemas::ChatInput;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/chat/enqueue", post(enqueue_chat))
        .route("/v1/queue/requests/:id", get(request_status))
        .route("/v1/queue/stats", get(queue_stats))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let (database_ok, schema_present) = match st.store.status().await {
        Ok(status) => (status.ok, status.has_queue_table),
        Err(_) => (false, false),
    };

    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: database_ok,
            service: st.build.service,
            version: st.build.version,
            database_ok,
            schema_present,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/chat/enqueue
// ---------------------------------------------------------------------------

/// The single write path into the queue. Priority defaults to the caller's
/// role-derived priority when omitted; explicit values are clamped by the
/// broker.
pub(crate) async fn enqueue_chat(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<EnqueueChatRequest>,
) -> Response {
    let user = st.auth.resolve(&headers);

    let priority = match body.priority {
        Some(p) => p,
        None => st.broker.user_priority(&user.user_id).await,
    };

    let input = ChatInput {
        message_id: body.message_id,
        thread_id: body.thread_id,
        custom_gpt_id: body.custom_gpt_id,
        user_message: body.user_message,
        context_messages: body.context_messages,
        attachments: body.attachments,
    };

    match st.broker.enqueue_chat(input, priority, &user.user_id).await {
        Ok(request_id) => {
            info!(request_id = %request_id, user_id = %user.user_id, priority, "chat request accepted");
            (
                StatusCode::ACCEPTED,
                Json(EnqueueChatResponse {
                    request_id,
                    status: "pending",
                    priority: priority.clamp(cai_queue::PRIORITY_MIN, cai_queue::PRIORITY_MAX),
                }),
            )
                .into_response()
        }
        Err(EnqueueError::Invalid(msg)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse { error: msg }),
        )
            .into_response(),
        Err(EnqueueError::Conflict { id }) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: format!("request id already queued: {id}"),
            }),
        )
            .into_response(),
        Err(EnqueueError::Store(e)) => {
            error!(error = %e, "enqueue failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "failed to enqueue request".to_string(),
                }),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /v1/queue/requests/:id
// ---------------------------------------------------------------------------

pub(crate) async fn request_status(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match st.broker.request_status(&id).await {
        Ok(Some(row)) => (StatusCode::OK, Json(RequestStatusResponse::from_row(row))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no request with id {id}"),
            }),
        )
            .into_response(),
        Err(e) => {
            error!(request_id = %id, error = %e, "status lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "status lookup failed".to_string(),
                }),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /v1/queue/stats
// ---------------------------------------------------------------------------

pub(crate) async fn queue_stats(State(st): State<Arc<AppState>>) -> Response {
    match st.broker.stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(QueueStatsResponse {
                total_requests: stats.counts.total,
                pending: stats.counts.pending,
                processing: stats.counts.processing,
                completed: stats.counts.completed,
                failed: stats.counts.failed,
                queue_size: stats.queue_size,
                avg_processing_ms: stats.avg_processing_ms,
                queue_health: stats.health.as_str().to_string(),
                cache_updated: stats.cache_updated,
            }),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "stats query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "stats query failed".to_string(),
                }),
            )
                .into_response()
        }
    }
}
