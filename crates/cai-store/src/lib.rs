//! Typed Postgres layer over the shared inference store.
//!
//! This crate owns the SQL. Everything above it (queue broker, side-effect
//! writer, daemon) goes through the [`Store`] handle; nothing else holds a
//! pool. All multi-statement work runs inside a single transaction, and the
//! dispatcher-critical single statements (`claim_one`, `complete`) retry
//! transient connection failures a bounded number of times before surfacing
//! the error to the caller.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use cai_schemas::{
    MessageRole, RequestPayload, RequestStatus, RequestType, ResponseMetadata, Specialization,
    ToolsEnabled, UserRole,
};

pub const ENV_DB_URL: &str = "CAI_DATABASE_URL";

/// Transient-failure retry budget for single-statement queue operations.
const STORE_RETRY_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Store handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect using the CAI_DATABASE_URL environment variable.
    pub async fn connect_from_env() -> Result<Self> {
        let url =
            std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
        Self::connect(&url).await
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .context("failed to connect to Postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run embedded SQLx migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("store migrate failed")?;
        Ok(())
    }

    /// Connectivity + schema presence probe for health endpoints.
    pub async fn status(&self) -> Result<StoreStatus> {
        let (one,): (i32,) = sqlx::query_as("select 1")
            .fetch_one(&self.pool)
            .await
            .context("status connectivity query failed")?;

        let (exists,): (bool,) = sqlx::query_as(
            r#"
            select exists (
                select 1
                from information_schema.tables
                where table_schema='public' and table_name='inference_queue'
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("status table-exists query failed")?;

        Ok(StoreStatus {
            ok: one == 1,
            has_queue_table: exists,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub ok: bool,
    pub has_queue_table: bool,
}

// ---------------------------------------------------------------------------
// Transient-failure retry
// ---------------------------------------------------------------------------

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}

/// Detect a Postgres unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Retry `f` on transient connection failures with a short linear delay.
/// Non-transient errors and retry exhaustion surface to the caller, who
/// treats them as a cycle exception (circuit-breaker input).
async fn retry_transient<T, F, Fut>(op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && attempt + 1 < STORE_RETRY_ATTEMPTS => {
                attempt += 1;
                warn!(op, attempt, error = %e, "transient store failure, retrying");
                tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
            Err(e) => return Err(anyhow::Error::new(e).context(format!("{op} failed"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue rows
// ---------------------------------------------------------------------------

/// A new pending row. `payload` is encoded to the `input_data` text
/// container on insert; the `request_type` column carries the tag.
#[derive(Debug, Clone)]
pub struct NewQueueRequest {
    pub id: String,
    pub payload: RequestPayload,
    /// 1 is most urgent, 10 least. Callers clamp before constructing.
    pub priority: i32,
    pub user_id: String,
    pub message_id: Option<String>,
}

/// The slice of a queue row a worker needs after a successful claim.
#[derive(Debug, Clone)]
pub struct ClaimedRequest {
    pub id: String,
    pub request_type: RequestType,
    pub input_data: String,
    pub priority: i32,
    pub user_id: String,
    pub message_id: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl ClaimedRequest {
    /// Decode the typed payload. A decode failure means the row was enqueued
    /// by something that bypassed intake validation; the dispatcher fails
    /// the row rather than dropping it.
    pub fn payload(&self) -> Result<RequestPayload> {
        RequestPayload::decode(self.request_type, &self.input_data)
    }
}

/// Full queue row, as read back for status lookups.
#[derive(Debug, Clone)]
pub struct QueueRequestRow {
    pub id: String,
    pub request_type: RequestType,
    pub status: RequestStatus,
    pub priority: i32,
    pub user_id: String,
    pub message_id: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub response_content: Option<String>,
    pub response_metadata: Option<String>,
    pub error_message: Option<String>,
}

/// Terminal disposition of a processed request.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Success {
        content: String,
        metadata: ResponseMetadata,
    },
    Failure {
        error_message: String,
    },
}

/// Counts by status plus total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

// ---------------------------------------------------------------------------
// InsertRequestError
// ---------------------------------------------------------------------------

/// Insert failure. `Conflict` means the id already exists; intake surfaces
/// it to the HTTP layer as a client error, everything else is a store fault.
#[derive(Debug)]
pub enum InsertRequestError {
    Conflict { id: String },
    Store(anyhow::Error),
}

impl std::fmt::Display for InsertRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InsertRequestError::Conflict { id } => {
                write!(f, "queue row id already exists: {id}")
            }
            InsertRequestError::Store(e) => write!(f, "insert_request store failure: {e:#}"),
        }
    }
}

impl std::error::Error for InsertRequestError {}

// ---------------------------------------------------------------------------
// Queue operations
// ---------------------------------------------------------------------------

impl Store {
    /// Insert a pending row. Fails with [`InsertRequestError::Conflict`]
    /// when the id collides.
    pub async fn insert_request(
        &self,
        req: &NewQueueRequest,
    ) -> std::result::Result<(), InsertRequestError> {
        let input_data = req
            .payload
            .encode()
            .map_err(InsertRequestError::Store)?;

        let res = sqlx::query(
            r#"
            insert into inference_queue (
              id, request_type, input_data, status, priority, user_id, message_id
            ) values (
              $1, $2, $3, 'pending', $4, $5, $6
            )
            "#,
        )
        .bind(&req.id)
        .bind(req.payload.request_type().as_str())
        .bind(&input_data)
        .bind(req.priority)
        .bind(&req.user_id)
        .bind(&req.message_id)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(InsertRequestError::Conflict {
                id: req.id.clone(),
            }),
            Err(e) => Err(InsertRequestError::Store(
                anyhow::Error::new(e).context("insert_request failed"),
            )),
        }
    }

    /// Atomically claim the single highest-priority pending row.
    ///
    /// `FOR UPDATE SKIP LOCKED` makes concurrent claimers safe: at most one
    /// wins a given row; the loser sees a different row or `None`. Tie-break
    /// is `priority ASC, created_at ASC`.
    pub async fn claim_one(&self, now: DateTime<Utc>) -> Result<Option<ClaimedRequest>> {
        let row = retry_transient("claim_one", || {
            sqlx::query(
                r#"
                with next_request as (
                    select id
                    from inference_queue
                    where status = 'pending'
                    order by priority asc, created_at asc
                    limit 1
                    for update skip locked
                )
                update inference_queue
                   set status     = 'processing',
                       started_at = $1
                 where id in (select id from next_request)
                returning id, request_type, input_data, priority, user_id,
                          message_id, retry_count, created_at, started_at
                "#,
            )
            .bind(now)
            .fetch_optional(&self.pool)
        })
        .await?;

        let Some(row) = row else { return Ok(None) };

        Ok(Some(ClaimedRequest {
            id: row.try_get("id")?,
            request_type: RequestType::parse(&row.try_get::<String, _>("request_type")?)?,
            input_data: row.try_get("input_data")?,
            priority: row.try_get("priority")?,
            user_id: row.try_get("user_id")?,
            message_id: row.try_get("message_id")?,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
        }))
    }

    /// Terminal transition. Returns `false` when the row is not in
    /// `processing` (already terminal, unknown id, or never claimed) —
    /// callers can distinguish that from a successful transition but a
    /// terminal row is no longer their responsibility either way.
    pub async fn complete(&self, id: &str, outcome: &RequestOutcome) -> Result<bool> {
        let (status, content, metadata, error_message) = match outcome {
            RequestOutcome::Success { content, metadata } => (
                RequestStatus::Completed,
                Some(content.clone()),
                Some(metadata.encode()?),
                None,
            ),
            RequestOutcome::Failure { error_message } => (
                RequestStatus::Failed,
                None,
                None,
                Some(error_message.clone()),
            ),
        };

        let row = retry_transient("complete", || {
            sqlx::query(
                r#"
                update inference_queue
                   set status            = $2,
                       completed_at      = now(),
                       response_content  = $3,
                       response_metadata = $4,
                       error_message     = $5
                 where id = $1
                   and status = 'processing'
                returning id
                "#,
            )
            .bind(id)
            .bind(status.as_str())
            .bind(&content)
            .bind(&metadata)
            .bind(&error_message)
            .fetch_optional(&self.pool)
        })
        .await?;

        Ok(row.is_some())
    }

    /// Persist one failed attempt before a retry. Only meaningful while the
    /// row is in `processing`; returns the new count, or `None` if the row
    /// was not in `processing`.
    pub async fn increment_retry_count(&self, id: &str) -> Result<Option<i32>> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            update inference_queue
               set retry_count = retry_count + 1
             where id = $1
               and status = 'processing'
            returning retry_count
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("increment_retry_count failed")?;

        Ok(row.map(|(n,)| n))
    }

    /// Counts by status plus total.
    pub async fn get_stats(&self) -> Result<QueueCounts> {
        let rows = sqlx::query(
            r#"
            select status, count(*)::bigint as n
            from inference_queue
            group by status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("get_stats failed")?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.total += n;
            match RequestStatus::parse(&status)? {
                RequestStatus::Pending => counts.pending = n,
                RequestStatus::Processing => counts.processing = n,
                RequestStatus::Completed => counts.completed = n,
                RequestStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    /// Mean wall-clock processing time of completed rows, in milliseconds.
    /// `None` until something has completed.
    pub async fn average_processing_ms(&self) -> Result<Option<f64>> {
        let (avg,): (Option<f64>,) = sqlx::query_as(
            r#"
            select avg(extract(epoch from (completed_at - started_at)) * 1000.0)
            from inference_queue
            where status = 'completed'
              and started_at is not null
              and completed_at is not null
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("average_processing_ms failed")?;

        Ok(avg)
    }

    /// Delete terminal rows older than the cutoff. Pending and processing
    /// rows are never touched, regardless of age.
    pub async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            r#"
            delete from inference_queue
            where status in ('completed', 'failed')
              and created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("purge_terminal_older_than failed")?;

        Ok(res.rows_affected())
    }

    /// Fetch a single row by id (status lookups).
    pub async fn fetch_request(&self, id: &str) -> Result<Option<QueueRequestRow>> {
        let row = sqlx::query(
            r#"
            select id, request_type, status, priority, user_id, message_id,
                   retry_count, created_at, started_at, completed_at,
                   response_content, response_metadata, error_message
            from inference_queue
            where id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch_request failed")?;

        let Some(row) = row else { return Ok(None) };

        Ok(Some(QueueRequestRow {
            id: row.try_get("id")?,
            request_type: RequestType::parse(&row.try_get::<String, _>("request_type")?)?,
            status: RequestStatus::parse(&row.try_get::<String, _>("status")?)?,
            priority: row.try_get("priority")?,
            user_id: row.try_get("user_id")?,
            message_id: row.try_get("message_id")?,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            response_content: row.try_get("response_content")?,
            response_metadata: row.try_get("response_metadata")?,
            error_message: row.try_get("error_message")?,
        }))
    }

    /// Operator tool for crash recovery: return a stuck `processing` row to
    /// `pending`. Nothing in the worker calls this automatically — stuck
    /// rows are a manual-reset concern by design.
    pub async fn reset_processing_to_pending(&self, id: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            update inference_queue
               set status     = 'pending',
                   started_at = null
             where id = $1
               and status = 'processing'
            returning id
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("reset_processing_to_pending failed")?;

        Ok(row.is_some())
    }
}

// ---------------------------------------------------------------------------
// Side-effect target rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: String,
    pub external_auth_id: String,
    pub email: String,
    pub display_name: String,
    pub role: UserRole,
}

#[derive(Debug, Clone)]
pub struct NewCustomGpt {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub specialization: Specialization,
    pub tools_enabled: ToolsEnabled,
}

#[derive(Debug, Clone)]
pub struct NewThread {
    pub id: String,
    pub user_id: String,
    pub custom_gpt_id: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub thread_id: String,
    pub user_id: String,
    pub custom_gpt_id: Option<String>,
    pub content: String,
    pub role: MessageRole,
    pub confidence_score: Option<f64>,
    pub model_used: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub compliance_flags: Vec<String>,
    pub sec_compliant: bool,
    pub human_review_required: bool,
}

impl Store {
    /// Create the user only if the id is absent. Returns `true` when this
    /// call inserted the row; either way the row exists on success.
    pub async fn upsert_user_if_absent(&self, user: &NewUser) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            insert into users (id, external_auth_id, email, display_name, role)
            values ($1, $2, $3, $4, $5)
            on conflict do nothing
            returning id
            "#,
        )
        .bind(&user.id)
        .bind(&user.external_auth_id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.role.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("upsert_user_if_absent failed")?;

        Ok(row.is_some())
    }

    pub async fn upsert_custom_gpt_if_absent(&self, gpt: &NewCustomGpt) -> Result<bool> {
        let tools =
            serde_json::to_value(gpt.tools_enabled).context("encode tools_enabled failed")?;

        let row: Option<(String,)> = sqlx::query_as(
            r#"
            insert into custom_gpts (
              id, user_id, name, description, system_prompt, specialization, tools_enabled
            ) values ($1, $2, $3, $4, $5, $6, $7)
            on conflict (id) do nothing
            returning id
            "#,
        )
        .bind(&gpt.id)
        .bind(&gpt.user_id)
        .bind(&gpt.name)
        .bind(&gpt.description)
        .bind(&gpt.system_prompt)
        .bind(gpt.specialization.as_str())
        .bind(tools)
        .fetch_optional(&self.pool)
        .await
        .context("upsert_custom_gpt_if_absent failed")?;

        Ok(row.is_some())
    }

    pub async fn upsert_thread_if_absent(&self, thread: &NewThread) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            insert into threads (id, user_id, custom_gpt_id, title, last_message_at)
            values ($1, $2, $3, $4, now())
            on conflict (id) do nothing
            returning id
            "#,
        )
        .bind(&thread.id)
        .bind(&thread.user_id)
        .bind(&thread.custom_gpt_id)
        .bind(&thread.title)
        .fetch_optional(&self.pool)
        .await
        .context("upsert_thread_if_absent failed")?;

        Ok(row.is_some())
    }

    /// Append a message and bump the owning thread's counters in one
    /// transaction. Returns the generated message id.
    pub async fn insert_message(&self, msg: &NewMessage) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        let flags =
            serde_json::to_value(&msg.compliance_flags).context("encode compliance_flags failed")?;

        let mut tx = self.pool.begin().await.context("insert_message begin failed")?;

        sqlx::query(
            r#"
            insert into messages (
              id, thread_id, user_id, custom_gpt_id, content, role,
              confidence_score, model_used, processing_time_ms,
              compliance_flags, sec_compliant, human_review_required
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&message_id)
        .bind(&msg.thread_id)
        .bind(&msg.user_id)
        .bind(&msg.custom_gpt_id)
        .bind(&msg.content)
        .bind(msg.role.as_str())
        .bind(msg.confidence_score)
        .bind(&msg.model_used)
        .bind(msg.processing_time_ms)
        .bind(flags)
        .bind(msg.sec_compliant)
        .bind(msg.human_review_required)
        .execute(&mut *tx)
        .await
        .context("insert_message failed")?;

        sqlx::query(
            r#"
            update threads
               set message_count   = message_count + 1,
                   last_message_at = now(),
                   updated_at      = now()
             where id = $1
            "#,
        )
        .bind(&msg.thread_id)
        .execute(&mut *tx)
        .await
        .context("insert_message thread bump failed")?;

        tx.commit().await.context("insert_message commit failed")?;

        Ok(message_id)
    }

    /// Configuration slice of an active custom GPT, as the inference
    /// adapter consumes it. Unknown specializations degrade to `general`.
    pub async fn fetch_custom_gpt_profile(
        &self,
        id: &str,
    ) -> Result<Option<cai_schemas::CustomGptProfile>> {
        let row = sqlx::query(
            r#"
            select id, specialization, system_prompt, tools_enabled
            from custom_gpts
            where id = $1
              and is_active
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch_custom_gpt_profile failed")?;

        let Some(row) = row else { return Ok(None) };

        let tools: serde_json::Value = row.try_get("tools_enabled")?;
        Ok(Some(cai_schemas::CustomGptProfile {
            id: row.try_get("id")?,
            specialization: Specialization::parse_or_general(
                &row.try_get::<String, _>("specialization")?,
            ),
            system_prompt: row.try_get("system_prompt")?,
            tools_enabled: serde_json::from_value::<ToolsEnabled>(tools).unwrap_or_default(),
        }))
    }

    /// Role of an active user, if the row exists.
    pub async fn user_role(&self, user_id: &str) -> Result<Option<UserRole>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            select role
            from users
            where id = $1
              and is_active
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("user_role failed")?;

        match row {
            Some((role,)) => Ok(Some(UserRole::parse(&role)?)),
            None => Ok(None),
        }
    }
}

pub use cai_schemas as schemas;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_covers_io_and_pool_timeouts() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_transient(&io));
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn retry_gives_up_after_the_budget() {
        let mut calls = 0u32;
        let res: Result<()> = retry_transient("op", || {
            calls += 1;
            async { Err(sqlx::Error::PoolTimedOut) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls, STORE_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn retry_passes_through_non_transient_immediately() {
        let mut calls = 0u32;
        let res: Result<()> = retry_transient("op", || {
            calls += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls, 1);
    }
}
