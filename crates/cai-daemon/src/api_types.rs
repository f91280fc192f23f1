//! Request/response DTOs for the daemon's HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cai_schemas::{AttachmentRef, ContextMessage};
use cai_store::QueueRequestRow;

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueChatRequest {
    pub message_id: String,
    pub thread_id: String,
    pub custom_gpt_id: String,
    pub user_message: String,
    #[serde(default)]
    pub context_messages: Vec<ContextMessage>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    /// 1 (most urgent) .. 10. Omitted → derived from the caller's role.
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueChatResponse {
    pub request_id: String,
    pub status: &'static str,
    pub priority: i32,
}

// ---------------------------------------------------------------------------
// Status lookup
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RequestStatusResponse {
    pub id: String,
    pub request_type: String,
    pub status: String,
    pub priority: i32,
    pub user_id: String,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub response_content: Option<String>,
    pub response_metadata: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl RequestStatusResponse {
    pub fn from_row(row: QueueRequestRow) -> Self {
        let response_metadata = row
            .response_metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());

        Self {
            id: row.id,
            request_type: row.request_type.as_str().to_string(),
            status: row.status.as_str().to_string(),
            priority: row.priority,
            user_id: row.user_id,
            retry_count: row.retry_count,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            response_content: row.response_content,
            response_metadata,
            error_message: row.error_message,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats / health / errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub total_requests: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub queue_size: i64,
    pub avg_processing_ms: Option<f64>,
    pub queue_health: String,
    pub cache_updated: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub database_ok: bool,
    pub schema_present: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
