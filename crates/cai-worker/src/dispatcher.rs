//! The dispatcher: poll → claim → acquire GPU → infer (bounded retries) →
//! persist side effects → complete → release.
//!
//! One request is in flight at a time. Every known failure is recovered
//! locally by driving the row to a terminal state; only genuinely
//! unexpected errors escape a cycle and feed the circuit breaker, which
//! halts the worker after five consecutive bad cycles.

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use cai_audit::{AuditLog, ComplianceStatus};
use cai_config::WorkerConfig;
use cai_gpu::{AcquireOutcome, GpuArbiter};
use cai_inference::{BackendAdapter, ChatAgent, ChatRequestContext, InferError};
use cai_queue::QueueBroker;
use cai_schemas::{
    CustomGptProfile, InferenceOutput, RequestPayload, ResponseMetadata, Specialization,
    ToolsEnabled,
};
use cai_store::{ClaimedRequest, RequestOutcome};

use crate::side_effects::{AssistantPersist, SideEffectWriter};

/// Milestone interval for logging health metrics.
const STATS_MILESTONE: u64 = 100;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Delay before re-attempting a failed inference: `min(2^attempt, 10)`
/// seconds, where `attempt` is the zero-based index of the attempt that
/// just failed.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = 1u64.checked_shl(attempt.min(10)).unwrap_or(u64::MAX);
    Duration::from_secs(base.min(10))
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Counts consecutive cycle-level failures. Recorded request failures are
/// normal cycles and do not feed the breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive: u32,
    threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold,
        }
    }

    /// Record one bad cycle; returns how long to sleep before the next.
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive += 1;
        Duration::from_secs(u64::from(2 * self.consecutive).min(30))
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn tripped(&self) -> bool {
        self.consecutive >= self.threshold
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

// ---------------------------------------------------------------------------
// WorkerStats
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    pub requests_processed: u64,
    pub requests_successful: u64,
    pub total_processing_ms: u64,
}

impl WorkerStats {
    fn record(&mut self, processing_ms: u64, success: bool) {
        self.requests_processed += 1;
        if success {
            self.requests_successful += 1;
        }
        self.total_processing_ms += processing_ms;
    }

    pub fn average_processing_ms(&self) -> u64 {
        self.total_processing_ms / self.requests_processed.max(1)
    }

    pub fn success_rate(&self) -> f64 {
        if self.requests_processed == 0 {
            return 0.0;
        }
        self.requests_successful as f64 / self.requests_processed as f64
    }
}

/// What one tick of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A request was driven to a terminal state.
    Processed,
    /// The queue was empty.
    Idle,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher<B: BackendAdapter> {
    queue: Arc<QueueBroker>,
    arbiter: Arc<GpuArbiter>,
    agent: ChatAgent<B>,
    writer: SideEffectWriter,
    audit: AuditLog,
    cfg: WorkerConfig,
    stats: WorkerStats,
    shutdown: watch::Receiver<bool>,
}

impl<B: BackendAdapter> Dispatcher<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<QueueBroker>,
        arbiter: Arc<GpuArbiter>,
        agent: ChatAgent<B>,
        writer: SideEffectWriter,
        audit: AuditLog,
        cfg: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            arbiter,
            agent,
            writer,
            audit,
            cfg,
            stats: WorkerStats::default(),
            shutdown,
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Run until shutdown is signalled or the circuit breaker trips. The
    /// in-flight request always finishes before the loop exits.
    pub async fn run(&mut self) -> Result<()> {
        self.audit_system(
            "worker_start",
            ComplianceStatus::Compliant,
            json!({
                "poll_interval": self.cfg.poll_interval_secs,
                "max_queue_retries": self.cfg.max_queue_retries,
                "gpu_timeout": self.cfg.gpu_timeout_secs,
            }),
        );
        info!(
            poll_interval = self.cfg.poll_interval_secs,
            max_queue_retries = self.cfg.max_queue_retries,
            gpu_timeout = self.cfg.gpu_timeout_secs,
            "dispatcher loop starting"
        );

        let mut breaker = CircuitBreaker::new(5);
        let result = loop {
            if *self.shutdown.borrow() {
                info!("shutdown signalled; dispatcher loop exiting");
                break Ok(());
            }

            match self.run_once().await {
                Ok(CycleOutcome::Processed) => {
                    breaker.record_success();
                    if self.stats.requests_processed % STATS_MILESTONE == 0 {
                        self.log_health_metrics().await;
                    }
                }
                Ok(CycleOutcome::Idle) => {
                    breaker.record_success();
                    self.idle_sleep().await;
                }
                Err(e) => {
                    let delay = breaker.record_failure();
                    error!(
                        consecutive_errors = breaker.consecutive(),
                        retry_delay_secs = delay.as_secs(),
                        error = %e,
                        "dispatcher cycle failed"
                    );

                    if breaker.tripped() {
                        self.audit_system(
                            "worker_halted",
                            ComplianceStatus::NonCompliant,
                            json!({"consecutive_errors": breaker.consecutive()}),
                        );
                        break Err(anyhow!(
                            "circuit breaker tripped after {} consecutive cycle failures",
                            breaker.consecutive()
                        ));
                    }

                    tokio::time::sleep(delay).await;
                }
            }
        };

        self.audit_system(
            "worker_stop",
            ComplianceStatus::Compliant,
            json!({
                "requests_processed": self.stats.requests_processed,
                "requests_successful": self.stats.requests_successful,
                "average_processing_ms": self.stats.average_processing_ms(),
            }),
        );

        result
    }

    /// One tick: claim and fully settle at most one request.
    pub async fn run_once(&mut self) -> Result<CycleOutcome> {
        let Some(claimed) = self.queue.claim_next(Utc::now()).await? else {
            debug!("no requests in queue");
            return Ok(CycleOutcome::Idle);
        };

        self.audit_request(
            "inference_request_start",
            &claimed,
            ComplianceStatus::Compliant,
            json!({
                "request_type": claimed.request_type.as_str(),
                "priority": claimed.priority,
                "retry_count": claimed.retry_count,
            }),
        );
        info!(
            request_id = %claimed.id,
            request_type = claimed.request_type.as_str(),
            priority = claimed.priority,
            "processing inference request"
        );

        let started = tokio::time::Instant::now();
        let outcome = self.settle(&claimed).await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let success = matches!(outcome, RequestOutcome::Success { .. });
        self.stats.record(elapsed_ms, success);

        let (status, details) = match &outcome {
            RequestOutcome::Success { metadata, .. } => (
                terminal_status(metadata),
                json!({
                    "success": true,
                    "processing_time_ms": elapsed_ms,
                    "confidence_score": metadata.confidence_score,
                }),
            ),
            RequestOutcome::Failure { error_message } => (
                ComplianceStatus::NonCompliant,
                json!({"success": false, "error": error_message}),
            ),
        };
        self.audit_request("inference_request_complete", &claimed, status, details);

        if success {
            info!(request_id = %claimed.id, processing_time_ms = elapsed_ms, "request completed successfully");
        } else {
            warn!(request_id = %claimed.id, processing_time_ms = elapsed_ms, "request failed after all retries");
        }

        Ok(CycleOutcome::Processed)
    }

    /// Drive one claimed request to its terminal state, releasing the GPU
    /// on every path. Returns the recorded outcome.
    async fn settle(&mut self, claimed: &ClaimedRequest) -> Result<RequestOutcome> {
        // Undecodable payloads are terminal: they can only come from a
        // writer that bypassed intake validation.
        let ctx = match self.request_context(claimed).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(request_id = %claimed.id, error = %e, "undecodable input_data");
                let outcome = RequestOutcome::Failure {
                    error_message: format!("Invalid request payload: {e:#}"),
                };
                self.queue.complete(&claimed.id, &outcome).await?;
                return Ok(outcome);
            }
        };

        let gpu_timeout = Duration::from_secs(self.cfg.gpu_timeout_secs);
        let permit = match self.arbiter.acquire(gpu_timeout, &claimed.id).await? {
            AcquireOutcome::Acquired(permit) => {
                self.audit_request(
                    "gpu_acquired",
                    claimed,
                    ComplianceStatus::Compliant,
                    json!({}),
                );
                permit
            }
            AcquireOutcome::TimedOut { waited } => {
                self.audit_request(
                    "gpu_timeout",
                    claimed,
                    ComplianceStatus::NonCompliant,
                    json!({"waited_ms": waited.as_millis() as u64}),
                );
                let outcome = RequestOutcome::Failure {
                    error_message: "GPU resource timeout".into(),
                };
                self.queue.complete(&claimed.id, &outcome).await?;
                return Ok(outcome);
            }
        };

        let outcome = match self.infer_with_retries(claimed, &ctx).await {
            Ok(output) => {
                let metadata = self.persist_side_effects(claimed, &ctx, &output).await;
                RequestOutcome::Success {
                    content: output.content,
                    metadata,
                }
            }
            Err(e) => RequestOutcome::Failure {
                error_message: e.user_facing_message().to_string(),
            },
        };

        self.queue.complete(&claimed.id, &outcome).await?;

        self.audit_request(
            "gpu_released",
            claimed,
            ComplianceStatus::Compliant,
            json!({}),
        );
        permit.release();

        Ok(outcome)
    }

    /// Up to `max_queue_retries + 1` attempts with capped exponential
    /// backoff. A usage-limit error is terminal immediately. Each failed
    /// attempt that will be retried is persisted on the row first.
    async fn infer_with_retries(
        &mut self,
        claimed: &ClaimedRequest,
        ctx: &ChatRequestContext,
    ) -> std::result::Result<InferenceOutput, InferError> {
        let max_attempts = self.cfg.max_queue_retries + 1;
        let deadline = Duration::from_secs(self.cfg.backend.timeout_secs);

        let mut attempt: u32 = 0;
        loop {
            match self.agent.infer(ctx, deadline).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    let last = attempt + 1 >= max_attempts || !e.is_retryable();
                    warn!(
                        request_id = %claimed.id,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        is_last_attempt = last,
                        "inference attempt failed"
                    );

                    if last {
                        return Err(e);
                    }

                    if let Err(store_err) = self.queue.record_retry(&claimed.id).await {
                        warn!(request_id = %claimed.id, error = %store_err, "failed to persist retry count");
                    }
                    self.audit_request(
                        "inference_request_retry",
                        claimed,
                        ComplianceStatus::Compliant,
                        json!({"attempt": attempt + 1, "error": e.to_string()}),
                    );

                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Run the side-effect writer; its failure is folded into the metadata,
    /// never into the queue outcome.
    async fn persist_side_effects(
        &mut self,
        claimed: &ClaimedRequest,
        ctx: &ChatRequestContext,
        output: &InferenceOutput,
    ) -> ResponseMetadata {
        let mut metadata = ResponseMetadata::from_output(output);

        let persist = AssistantPersist {
            request_id: claimed.id.clone(),
            user_id: claimed.user_id.clone(),
            custom_gpt_id: ctx.custom_gpt.id.clone(),
            thread_id: ctx.thread_id.clone(),
            specialization: ctx.custom_gpt.specialization,
            content: output.content.clone(),
            confidence_score: output.confidence_score,
            model_used: output.model_used.clone(),
            processing_time_ms: output.processing_time_ms,
            compliance_flags: output.compliance_flags.clone(),
            sec_compliant: output.sec_compliant,
            human_review_required: output.human_review_required,
        };

        match self
            .writer
            .persist_assistant_message(&persist, &mut self.audit)
            .await
        {
            Ok(message_id) => metadata.assistant_message_id = Some(message_id),
            Err(e) => {
                warn!(request_id = %claimed.id, error = %e, "side-effect write failed; completing anyway");
                metadata.side_effect_error = Some(e.to_string());
            }
        }

        metadata
    }

    /// Decode the payload and resolve the custom GPT profile. A missing
    /// profile degrades to a minimal `general` one — the side-effect writer
    /// will materialize the row afterwards.
    async fn request_context(&self, claimed: &ClaimedRequest) -> Result<ChatRequestContext> {
        let RequestPayload::Chat(input) = claimed.payload()?;

        let custom_gpt = match self
            .queue
            .store()
            .fetch_custom_gpt_profile(&input.custom_gpt_id)
            .await
        {
            Ok(Some(profile)) => profile,
            Ok(None) => minimal_profile(&input.custom_gpt_id),
            Err(e) => {
                warn!(
                    request_id = %claimed.id,
                    custom_gpt_id = %input.custom_gpt_id,
                    error = %e,
                    "custom GPT lookup failed; using minimal profile"
                );
                minimal_profile(&input.custom_gpt_id)
            }
        };

        Ok(ChatRequestContext {
            message_id: input.message_id,
            thread_id: input.thread_id,
            user_id: claimed.user_id.clone(),
            custom_gpt,
            user_message: input.user_message,
            context_messages: input.context_messages,
            attachments: input.attachments,
        })
    }

    async fn idle_sleep(&mut self) {
        let poll = Duration::from_secs(self.cfg.poll_interval_secs);
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn log_health_metrics(&self) {
        let arbiter = self.arbiter.snapshot();
        let queue = self.queue.stats().await.ok();
        info!(
            requests_processed = self.stats.requests_processed,
            success_rate = self.stats.success_rate(),
            average_processing_ms = self.stats.average_processing_ms(),
            gpu_total_acquisitions = arbiter.total_acquisitions,
            gpu_available = arbiter.available,
            queue_health = queue.as_ref().map(|q| q.health.as_str()).unwrap_or("unknown"),
            "worker health metrics"
        );
    }

    fn audit_request(
        &mut self,
        action: &str,
        claimed: &ClaimedRequest,
        status: ComplianceStatus,
        details: serde_json::Value,
    ) {
        if let Err(e) = self
            .audit
            .append(action, &claimed.user_id, &claimed.id, status, details)
        {
            warn!(action, error = %e, "compliance audit append failed");
        }
    }

    fn audit_system(&mut self, action: &str, status: ComplianceStatus, details: serde_json::Value) {
        if let Err(e) = self.audit.append(action, "system", action, status, details) {
            warn!(action, error = %e, "compliance audit append failed");
        }
    }
}

/// Compliance status of a successful completion, for the audit stream.
fn terminal_status(metadata: &ResponseMetadata) -> ComplianceStatus {
    if !metadata.sec_compliant {
        ComplianceStatus::NonCompliant
    } else if metadata.human_review_required {
        ComplianceStatus::ReviewRequired
    } else {
        ComplianceStatus::Compliant
    }
}

fn minimal_profile(custom_gpt_id: &str) -> CustomGptProfile {
    CustomGptProfile {
        id: custom_gpt_id.to_string(),
        specialization: Specialization::General,
        system_prompt: String::new(),
        tools_enabled: ToolsEnabled::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps_at_ten_seconds() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(4), Duration::from_secs(10));
        assert_eq!(backoff_delay(30), Duration::from_secs(10));
    }

    #[test]
    fn backoff_grows_monotonically_until_the_cap() {
        let mut prev = Duration::ZERO;
        for attempt in 0..16 {
            let d = backoff_delay(attempt);
            assert!(d >= prev, "backoff regressed at attempt {attempt}");
            assert!(d <= Duration::from_secs(10));
            prev = d;
        }
    }

    #[test]
    fn breaker_trips_at_five_and_resets_on_success() {
        let mut breaker = CircuitBreaker::new(5);

        for i in 1..=4 {
            let delay = breaker.record_failure();
            assert_eq!(delay, Duration::from_secs((2 * i) as u64));
            assert!(!breaker.tripped());
        }

        // One clean cycle clears the streak.
        breaker.record_success();
        assert_eq!(breaker.consecutive(), 0);

        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.tripped());
    }

    #[test]
    fn breaker_delay_caps_at_thirty_seconds() {
        let mut breaker = CircuitBreaker::new(100);
        let mut last = Duration::ZERO;
        for _ in 0..40 {
            last = breaker.record_failure();
        }
        assert_eq!(last, Duration::from_secs(30));
    }

    #[test]
    fn stats_track_success_rate_and_average() {
        let mut stats = WorkerStats::default();
        stats.record(100, true);
        stats.record(300, false);
        assert_eq!(stats.requests_processed, 2);
        assert_eq!(stats.requests_successful, 1);
        assert_eq!(stats.average_processing_ms(), 200);
        assert!((stats.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn terminal_status_orders_non_compliant_over_review() {
        let mut metadata = ResponseMetadata {
            model_used: "general_gpt-oss".into(),
            processing_time_ms: 1,
            confidence_score: 0.85,
            input_tokens: 0,
            output_tokens: 0,
            compliance_flags: vec![],
            sec_compliant: true,
            human_review_required: false,
            tool_interactions: vec![],
            assistant_message_id: None,
            side_effect_error: None,
        };
        assert_eq!(terminal_status(&metadata), ComplianceStatus::Compliant);

        metadata.human_review_required = true;
        assert_eq!(terminal_status(&metadata), ComplianceStatus::ReviewRequired);

        metadata.sec_compliant = false;
        assert_eq!(terminal_status(&metadata), ComplianceStatus::NonCompliant);
    }
}
