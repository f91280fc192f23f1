//! Idempotent persistence of a successful inference: user → custom GPT →
//! thread → assistant message, in that order.
//!
//! The chain is lazy materialization: rows are created only if absent and
//! never mutated afterwards. A failed prerequisite logs a warning and the
//! chain continues — the assistant message insert is always attempted. Only
//! a failed message insert is reported, and even that is non-fatal to the
//! queue row: the inference result has already been computed.

use tracing::{info, warn};

use cai_audit::{AuditLog, ComplianceStatus};
use cai_schemas::{MessageRole, Specialization, ToolsEnabled, UserRole};
use cai_store::{NewCustomGpt, NewMessage, NewThread, NewUser, Store};

// ---------------------------------------------------------------------------
// SideEffectError
// ---------------------------------------------------------------------------

/// The assistant message could not be persisted. Non-fatal: callers still
/// complete the queue row and surface this in response metadata.
#[derive(Debug)]
pub struct SideEffectError(pub anyhow::Error);

impl std::fmt::Display for SideEffectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "assistant message not persisted: {:#}", self.0)
    }
}

impl std::error::Error for SideEffectError {}

// ---------------------------------------------------------------------------
// AssistantPersist
// ---------------------------------------------------------------------------

/// Everything the writer needs after a successful inference.
#[derive(Debug, Clone)]
pub struct AssistantPersist {
    pub request_id: String,
    pub user_id: String,
    pub custom_gpt_id: String,
    pub thread_id: String,
    pub specialization: Specialization,
    pub content: String,
    pub confidence_score: f64,
    pub model_used: String,
    pub processing_time_ms: i64,
    pub compliance_flags: Vec<String>,
    pub sec_compliant: bool,
    pub human_review_required: bool,
}

// ---------------------------------------------------------------------------
// SideEffectWriter
// ---------------------------------------------------------------------------

pub struct SideEffectWriter {
    store: Store,
}

impl SideEffectWriter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Run the full chain. Returns the new assistant message id.
    pub async fn persist_assistant_message(
        &self,
        req: &AssistantPersist,
        audit: &mut AuditLog,
    ) -> std::result::Result<String, SideEffectError> {
        self.ensure_user(req, audit).await;
        self.ensure_custom_gpt(req, audit).await;
        self.ensure_thread(req, audit).await;

        let message = NewMessage {
            thread_id: req.thread_id.clone(),
            user_id: req.user_id.clone(),
            custom_gpt_id: Some(req.custom_gpt_id.clone()),
            content: req.content.clone(),
            role: MessageRole::Assistant,
            confidence_score: Some(req.confidence_score),
            model_used: Some(req.model_used.clone()),
            processing_time_ms: Some(req.processing_time_ms),
            compliance_flags: req.compliance_flags.clone(),
            sec_compliant: req.sec_compliant,
            human_review_required: req.human_review_required,
        };

        match self.store.insert_message(&message).await {
            Ok(message_id) => {
                info!(
                    request_id = %req.request_id,
                    thread_id = %req.thread_id,
                    message_id = %message_id,
                    "assistant message persisted"
                );
                audit_step(
                    audit,
                    "assistant_message_persisted",
                    req,
                    ComplianceStatus::Compliant,
                    serde_json::json!({"message_id": message_id}),
                );
                Ok(message_id)
            }
            Err(e) => {
                audit_step(
                    audit,
                    "assistant_message_persist_failed",
                    req,
                    ComplianceStatus::ReviewRequired,
                    serde_json::json!({"error": format!("{e:#}")}),
                );
                Err(SideEffectError(e))
            }
        }
    }

    /// Prerequisite 1: a minimal user row, synthesized when absent.
    async fn ensure_user(&self, req: &AssistantPersist, audit: &mut AuditLog) {
        let user = NewUser {
            id: req.user_id.clone(),
            external_auth_id: req.user_id.clone(),
            email: format!("{}@advisors.local", req.user_id),
            display_name: format!("User {}", short_id(&req.user_id)),
            role: UserRole::FinancialAdvisor,
        };

        match self.store.upsert_user_if_absent(&user).await {
            Ok(created) => {
                if created {
                    info!(user_id = %req.user_id, "materialized user row");
                    audit_step(
                        audit,
                        "user_materialized",
                        req,
                        ComplianceStatus::Compliant,
                        serde_json::json!({}),
                    );
                }
            }
            Err(e) => {
                warn!(
                    request_id = %req.request_id,
                    user_id = %req.user_id,
                    error = %e,
                    "failed to create/verify user; continuing"
                );
            }
        }
    }

    /// Prerequisite 2: a minimal custom GPT tied to the user.
    async fn ensure_custom_gpt(&self, req: &AssistantPersist, audit: &mut AuditLog) {
        let spec = req.specialization.as_str();
        let gpt = NewCustomGpt {
            id: req.custom_gpt_id.clone(),
            user_id: req.user_id.clone(),
            name: format!("Auto-generated {spec} GPT"),
            description: format!("Automatically generated custom GPT for {spec} tasks"),
            system_prompt: format!("You are a helpful {spec} assistant."),
            specialization: req.specialization,
            tools_enabled: ToolsEnabled::default(),
        };

        match self.store.upsert_custom_gpt_if_absent(&gpt).await {
            Ok(created) => {
                if created {
                    info!(custom_gpt_id = %req.custom_gpt_id, specialization = spec, "materialized custom GPT row");
                    audit_step(
                        audit,
                        "custom_gpt_materialized",
                        req,
                        ComplianceStatus::Compliant,
                        serde_json::json!({"specialization": spec}),
                    );
                }
            }
            Err(e) => {
                warn!(
                    request_id = %req.request_id,
                    custom_gpt_id = %req.custom_gpt_id,
                    error = %e,
                    "failed to create/verify custom GPT; continuing"
                );
            }
        }
    }

    /// Prerequisite 3: the thread linking user and custom GPT.
    async fn ensure_thread(&self, req: &AssistantPersist, audit: &mut AuditLog) {
        let thread = NewThread {
            id: req.thread_id.clone(),
            user_id: req.user_id.clone(),
            custom_gpt_id: req.custom_gpt_id.clone(),
            title: format!("Chat with {}", req.specialization.as_str()),
        };

        match self.store.upsert_thread_if_absent(&thread).await {
            Ok(created) => {
                if created {
                    info!(thread_id = %req.thread_id, "materialized thread row");
                    audit_step(
                        audit,
                        "thread_materialized",
                        req,
                        ComplianceStatus::Compliant,
                        serde_json::json!({}),
                    );
                }
            }
            Err(e) => {
                warn!(
                    request_id = %req.request_id,
                    thread_id = %req.thread_id,
                    error = %e,
                    "failed to create/verify thread; continuing"
                );
            }
        }
    }
}

fn audit_step(
    audit: &mut AuditLog,
    action: &str,
    req: &AssistantPersist,
    status: ComplianceStatus,
    details: serde_json::Value,
) {
    if let Err(e) = audit.append(action, &req.user_id, &req.request_id, status, details) {
        warn!(action, error = %e, "compliance audit append failed");
    }
}

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::short_id;

    #[test]
    fn short_id_clips_long_ids_and_keeps_short_ones() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("u-1"), "u-1");
    }
}
