//! Queue broker: policy on top of the store.
//!
//! The broker owns the queue semantics the rest of the system relies on:
//!
//! 1. **Priority-fair FIFO.** The next request worked is the one minimising
//!    `(priority, created_at)`. Priority is externally assigned; the broker
//!    never re-ranks.
//! 2. **Single claimer.** Claim is atomic with the status transition; two
//!    concurrent claimers produce at most one winner per row.
//! 3. **Terminal completion.** Completing an already-terminal row is
//!    reported distinctly ([`CompleteOutcome::AlreadySettled`]) but is not
//!    an error — the row is no longer the caller's responsibility.
//! 4. **Cached statistics.** `stats()` may serve a snapshot up to 30s old.
//!
//! The intake surface (`enqueue_chat`) also lives here: it is the only
//! write path into the queue.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use cai_schemas::{ChatInput, RequestPayload, UserRole};
use cai_store::{
    ClaimedRequest, InsertRequestError, NewQueueRequest, QueueCounts, QueueRequestRow,
    RequestOutcome, Store,
};

const STATS_CACHE_TTL: Duration = Duration::from_secs(30);

pub const PRIORITY_MIN: i32 = 1;
pub const PRIORITY_MAX: i32 = 10;
pub const PRIORITY_DEFAULT: i32 = 5;

// ---------------------------------------------------------------------------
// Outcomes and errors
// ---------------------------------------------------------------------------

/// Result of a completion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// The row transitioned processing → completed|failed just now.
    Completed,
    /// The row was not in `processing` (already terminal or unknown).
    AlreadySettled,
}

/// Intake failure. `Invalid` never enters the queue.
#[derive(Debug)]
pub enum EnqueueError {
    Invalid(String),
    Conflict { id: String },
    Store(anyhow::Error),
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueError::Invalid(msg) => write!(f, "invalid enqueue request: {msg}"),
            EnqueueError::Conflict { id } => write!(f, "request id already queued: {id}"),
            EnqueueError::Store(e) => write!(f, "enqueue store failure: {e:#}"),
        }
    }
}

impl std::error::Error for EnqueueError {}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Coarse operator-facing health of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueHealth {
    Critical,
    Warning,
    Active,
    Idle,
}

impl QueueHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueHealth::Critical => "critical",
            QueueHealth::Warning => "warning",
            QueueHealth::Active => "active",
            QueueHealth::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub counts: QueueCounts,
    /// pending + processing.
    pub queue_size: i64,
    pub avg_processing_ms: Option<f64>,
    pub health: QueueHealth,
    pub cache_updated: DateTime<Utc>,
}

/// Health thresholds: a deep backlog is critical, a building backlog or
/// slow processing warns, any work at all is active.
fn classify_health(pending: i64, processing: i64, avg_processing_ms: Option<f64>) -> QueueHealth {
    if pending > 50 {
        QueueHealth::Critical
    } else if pending > 20 || avg_processing_ms.is_some_and(|ms| ms > 30_000.0) {
        QueueHealth::Warning
    } else if processing > 0 || pending > 0 {
        QueueHealth::Active
    } else {
        QueueHealth::Idle
    }
}

fn clamp_priority(priority: i32) -> i32 {
    priority.clamp(PRIORITY_MIN, PRIORITY_MAX)
}

// ---------------------------------------------------------------------------
// QueueBroker
// ---------------------------------------------------------------------------

pub struct QueueBroker {
    store: Store,
    stats_cache: Mutex<Option<(Instant, QueueStats)>>,
}

impl QueueBroker {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            stats_cache: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Claim the next request in `(priority, created_at)` order, or `None`
    /// when the queue is empty.
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<ClaimedRequest>> {
        let claimed = self.store.claim_one(now).await?;

        if let Some(ref req) = claimed {
            info!(
                request_id = %req.id,
                priority = req.priority,
                user_id = %req.user_id,
                "claimed queue request"
            );
        }

        Ok(claimed)
    }

    /// Record the terminal outcome for a claimed row.
    pub async fn complete(&self, id: &str, outcome: &RequestOutcome) -> Result<CompleteOutcome> {
        let transitioned = self.store.complete(id, outcome).await?;

        if transitioned {
            info!(request_id = %id, "queue request settled");
            Ok(CompleteOutcome::Completed)
        } else {
            warn!(
                request_id = %id,
                "complete on a row not in processing; treating as settled"
            );
            Ok(CompleteOutcome::AlreadySettled)
        }
    }

    /// Persist one failed attempt before a retry.
    pub async fn record_retry(&self, id: &str) -> Result<Option<i32>> {
        self.store.increment_retry_count(id).await
    }

    /// Queue statistics, served from a snapshot at most 30 seconds old.
    pub async fn stats(&self) -> Result<QueueStats> {
        {
            let cache = self
                .stats_cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some((at, ref snapshot)) = *cache {
                if at.elapsed() < STATS_CACHE_TTL {
                    return Ok(snapshot.clone());
                }
            }
        }

        let counts = self.store.get_stats().await?;
        let avg_processing_ms = self.store.average_processing_ms().await?;
        let snapshot = QueueStats {
            queue_size: counts.pending + counts.processing,
            avg_processing_ms,
            health: classify_health(counts.pending, counts.processing, avg_processing_ms),
            cache_updated: Utc::now(),
            counts,
        };

        let mut cache = self
            .stats_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cache = Some((Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }

    /// Purge terminal rows older than `retention_days`. Returns the number
    /// of rows removed. Pending and processing rows are never touched.
    pub async fn sweep_expired(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        let removed = self.store.purge_terminal_older_than(cutoff).await?;

        if removed > 0 {
            info!(removed, retention_days, "queue retention sweep completed");
        }

        Ok(removed)
    }

    /// Fetch a row for status reporting.
    pub async fn request_status(&self, id: &str) -> Result<Option<QueueRequestRow>> {
        self.store.fetch_request(id).await
    }

    /// Default priority for a user, from their role. Unknown users and
    /// lookup failures fall back to the neutral default.
    pub async fn user_priority(&self, user_id: &str) -> i32 {
        match self.store.user_role(user_id).await {
            Ok(Some(role)) => role.default_priority(),
            Ok(None) => PRIORITY_DEFAULT,
            Err(e) => {
                warn!(user_id, error = %e, "user priority lookup failed");
                PRIORITY_DEFAULT
            }
        }
    }

    // -----------------------------------------------------------------------
    // Intake
    // -----------------------------------------------------------------------

    /// The only write path into the queue. Validates the payload, silently
    /// clamps priority into [1,10], assigns a fresh id, inserts a pending
    /// row, and returns the id.
    pub async fn enqueue_chat(
        &self,
        input: ChatInput,
        priority: i32,
        user_id: &str,
    ) -> std::result::Result<String, EnqueueError> {
        validate_chat_input(&input).map_err(EnqueueError::Invalid)?;
        if user_id.is_empty() {
            return Err(EnqueueError::Invalid("user_id must not be empty".into()));
        }

        let request_id = Uuid::new_v4().to_string();
        let priority = clamp_priority(priority);
        let message_id = Some(input.message_id.clone());

        let req = NewQueueRequest {
            id: request_id.clone(),
            payload: RequestPayload::Chat(input),
            priority,
            user_id: user_id.to_string(),
            message_id,
        };

        match self.store.insert_request(&req).await {
            Ok(()) => {
                info!(
                    request_id = %request_id,
                    priority,
                    user_id,
                    "chat request enqueued"
                );
                Ok(request_id)
            }
            Err(InsertRequestError::Conflict { id }) => Err(EnqueueError::Conflict { id }),
            Err(InsertRequestError::Store(e)) => Err(EnqueueError::Store(e)),
        }
    }
}

/// Shape checks for the chat payload; anything failing here never enters
/// the queue.
fn validate_chat_input(input: &ChatInput) -> std::result::Result<(), String> {
    if input.message_id.is_empty() {
        return Err("message_id must not be empty".into());
    }
    if input.thread_id.is_empty() {
        return Err("thread_id must not be empty".into());
    }
    if input.custom_gpt_id.is_empty() {
        return Err("custom_gpt_id must not be empty".into());
    }
    if input.user_message.trim().is_empty() {
        return Err("user_message must not be empty".into());
    }
    Ok(())
}

/// Convenience for callers that already know the role but not the user row.
pub fn priority_for_role(role: UserRole) -> i32 {
    clamp_priority(role.default_priority())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_input() -> ChatInput {
        ChatInput {
            message_id: "msg-1".into(),
            thread_id: "thr-1".into(),
            custom_gpt_id: "gpt-1".into(),
            user_message: "hello".into(),
            context_messages: vec![],
            attachments: vec![],
        }
    }

    #[test]
    fn priority_clamps_silently_to_the_band() {
        assert_eq!(clamp_priority(0), 1);
        assert_eq!(clamp_priority(-3), 1);
        assert_eq!(clamp_priority(11), 10);
        assert_eq!(clamp_priority(7), 7);
    }

    #[test]
    fn health_thresholds_follow_the_backlog() {
        assert_eq!(classify_health(51, 0, None), QueueHealth::Critical);
        assert_eq!(classify_health(21, 0, None), QueueHealth::Warning);
        assert_eq!(classify_health(0, 0, Some(31_000.0)), QueueHealth::Warning);
        assert_eq!(classify_health(1, 0, None), QueueHealth::Active);
        assert_eq!(classify_health(0, 1, Some(5_000.0)), QueueHealth::Active);
        assert_eq!(classify_health(0, 0, None), QueueHealth::Idle);
    }

    #[test]
    fn validation_rejects_blank_fields() {
        assert!(validate_chat_input(&chat_input()).is_ok());

        let mut missing_msg = chat_input();
        missing_msg.user_message = "   ".into();
        assert!(validate_chat_input(&missing_msg).is_err());

        let mut missing_thread = chat_input();
        missing_thread.thread_id = String::new();
        assert!(validate_chat_input(&missing_thread).is_err());
    }

    #[test]
    fn role_priorities_stay_inside_the_band() {
        for role in [
            UserRole::Executive,
            UserRole::SeniorAdvisor,
            UserRole::Advisor,
            UserRole::JuniorAdvisor,
            UserRole::Staff,
            UserRole::Intern,
            UserRole::FinancialAdvisor,
        ] {
            let p = priority_for_role(role);
            assert!((PRIORITY_MIN..=PRIORITY_MAX).contains(&p));
        }
    }
}
