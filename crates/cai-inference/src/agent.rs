//! The chat agent: prompt assembly, confidence and compliance heuristics,
//! and the single backend call.

use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::backend::{BackendAdapter, BackendRequest};
use crate::error::InferError;
use crate::prompts::system_template;
use cai_schemas::{
    AttachmentRef, ContextMessage, CustomGptProfile, InferenceOutput, Specialization,
    FLAG_HUMAN_REVIEW_REQUIRED, FLAG_LOW_CONFIDENCE, FLAG_SEC_NON_COMPLIANT,
};

/// Phrases that make a response non-compliant regardless of anything else.
const PROHIBITED_PHRASES: &[&str] = &["guaranteed returns", "risk-free"];

/// System instructions from the custom GPT are clipped to this many chars
/// before entering the prompt.
const SYSTEM_PROMPT_CLIP: usize = 200;
/// Context messages are clipped to this many chars each.
const CONTEXT_CLIP: usize = 100;
/// Only this many trailing context messages enter the prompt.
const CONTEXT_WINDOW: usize = 2;

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

/// Per-call budgets, applied before and during the backend call.
#[derive(Debug, Clone)]
pub struct ModelBudgets {
    pub max_output_tokens: u32,
    pub max_input_tokens: u32,
    pub temperature: f32,
    pub request_timeout: Duration,
}

impl Default for ModelBudgets {
    fn default() -> Self {
        Self {
            max_output_tokens: 4096,
            max_input_tokens: 8192,
            temperature: 0.3,
            request_timeout: Duration::from_secs(180),
        }
    }
}

// ---------------------------------------------------------------------------
// ChatRequestContext
// ---------------------------------------------------------------------------

/// Everything the agent needs to answer one chat request.
#[derive(Debug, Clone)]
pub struct ChatRequestContext {
    pub message_id: String,
    pub thread_id: String,
    pub user_id: String,
    pub custom_gpt: CustomGptProfile,
    pub user_message: String,
    /// Chronological, most recent last.
    pub context_messages: Vec<ContextMessage>,
    /// Metadata only; content is dereferenced out-of-band.
    pub attachments: Vec<AttachmentRef>,
}

// ---------------------------------------------------------------------------
// ChatAgent
// ---------------------------------------------------------------------------

pub struct ChatAgent<B: BackendAdapter> {
    backend: B,
    chat_model: String,
    budgets: ModelBudgets,
}

impl<B: BackendAdapter> ChatAgent<B> {
    pub fn new(backend: B, chat_model: impl Into<String>, budgets: ModelBudgets) -> Self {
        Self {
            backend,
            chat_model: chat_model.into(),
            budgets,
        }
    }

    /// Run one inference. `deadline` caps the backend call; the agent's own
    /// `request_timeout` budget applies when tighter. No internal retries.
    pub async fn infer(
        &self,
        ctx: &ChatRequestContext,
        deadline: Duration,
    ) -> Result<InferenceOutput, InferError> {
        let specialization = ctx.custom_gpt.specialization;
        let system = system_template(specialization);
        let prompt = build_conversation_prompt(
            &ctx.custom_gpt.system_prompt,
            &ctx.context_messages,
            &ctx.user_message,
        );

        // Pre-flight input budget. A request that cannot fit is terminal;
        // retrying it would burn the same budget again.
        let estimated = estimate_tokens(system) + estimate_tokens(&prompt);
        if estimated > i64::from(self.budgets.max_input_tokens) {
            return Err(InferError::UsageLimitExceeded(format!(
                "estimated {estimated} input tokens exceeds limit {}",
                self.budgets.max_input_tokens
            )));
        }

        debug!(
            message_id = %ctx.message_id,
            specialization = specialization.as_str(),
            context_len = ctx.context_messages.len(),
            "running chat agent"
        );

        let started = Instant::now();
        let response = self
            .backend
            .complete(
                BackendRequest {
                    model: self.chat_model.clone(),
                    system: system.to_string(),
                    prompt,
                    max_tokens: self.budgets.max_output_tokens,
                    temperature: self.budgets.temperature,
                },
                deadline.min(self.budgets.request_timeout),
            )
            .await?;
        let processing_time_ms = started.elapsed().as_millis() as i64;

        let confidence_score = confidence_for(specialization);
        let sec_compliant = passes_sec_scan(&response.content);
        // Low-confidence answers and anything from the compliance desk go
        // to a human; the SEC scan only drives the flag.
        let human_review_required =
            confidence_score < 0.7 || specialization == Specialization::Compliance;

        let mut compliance_flags = Vec::new();
        if !sec_compliant {
            compliance_flags.push(FLAG_SEC_NON_COMPLIANT.to_string());
        }
        if human_review_required {
            compliance_flags.push(FLAG_HUMAN_REVIEW_REQUIRED.to_string());
        }
        if confidence_score < 0.5 {
            compliance_flags.push(FLAG_LOW_CONFIDENCE.to_string());
        }

        info!(
            message_id = %ctx.message_id,
            specialization = specialization.as_str(),
            processing_time_ms,
            confidence_score,
            sec_compliant,
            "chat processing completed"
        );

        Ok(InferenceOutput {
            content: response.content,
            model_used: format!("{}_{}", specialization.as_str(), self.chat_model),
            processing_time_ms,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            confidence_score,
            sec_compliant,
            human_review_required,
            compliance_flags,
            tool_interactions: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Heuristics
// ---------------------------------------------------------------------------

/// Assemble the conversation prompt: clipped custom instructions, the last
/// two context messages (clipped), the current message, then a terminal
/// instruction.
fn build_conversation_prompt(
    system_prompt: &str,
    context_messages: &[ContextMessage],
    user_message: &str,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !system_prompt.is_empty() {
        parts.push(format!(
            "Instructions: {}",
            clip_chars(system_prompt, SYSTEM_PROMPT_CLIP)
        ));
    }

    let tail_start = context_messages.len().saturating_sub(CONTEXT_WINDOW);
    for msg in &context_messages[tail_start..] {
        parts.push(format!("{}: {}", msg.role, clip_chars(&msg.content, CONTEXT_CLIP)));
    }

    parts.push(format!("User: {user_message}"));
    parts.push("Respond briefly and helpfully:".to_string());

    parts.join("\n")
}

/// Char-boundary-safe prefix clip.
fn clip_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Rough token estimate for the pre-flight input budget (≈4 chars/token).
fn estimate_tokens(s: &str) -> i64 {
    (s.chars().count() as i64 + 3) / 4
}

/// Heuristic confidence: compliance answers carry the highest stakes and
/// the lowest confidence; data-driven specializations sit in between.
fn confidence_for(specialization: Specialization) -> f64 {
    match specialization {
        Specialization::Compliance => 0.75,
        Specialization::Crm | Specialization::Portfolio => 0.80,
        _ => 0.85,
    }
}

/// Scan the response for prohibited language.
fn passes_sec_scan(content: &str) -> bool {
    let lowered = content.to_lowercase();
    !PROHIBITED_PHRASES.iter().any(|p| lowered.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::ScriptedBackend;
    use cai_schemas::ToolsEnabled;
    use chrono::Utc;

    fn gpt(specialization: Specialization) -> CustomGptProfile {
        CustomGptProfile {
            id: "gpt-1".into(),
            specialization,
            system_prompt: "Answer like a fiduciary.".into(),
            tools_enabled: ToolsEnabled::default(),
        }
    }

    fn ctx_message(content: &str) -> ContextMessage {
        ContextMessage {
            id: "m".into(),
            thread_id: "t".into(),
            content: content.into(),
            role: "user".into(),
            timestamp: Utc::now(),
            attachments: vec![],
            compliance_flags: vec![],
        }
    }

    fn request(specialization: Specialization) -> ChatRequestContext {
        ChatRequestContext {
            message_id: "msg-1".into(),
            thread_id: "thr-1".into(),
            user_id: "user-1".into(),
            custom_gpt: gpt(specialization),
            user_message: "Should I rebalance?".into(),
            context_messages: vec![],
            attachments: vec![],
        }
    }

    #[test]
    fn prompt_takes_only_the_last_two_context_messages() {
        let msgs = vec![
            ctx_message("first"),
            ctx_message("second"),
            ctx_message("third"),
        ];
        let prompt = build_conversation_prompt("sys", &msgs, "now");
        assert!(!prompt.contains("first"));
        assert!(prompt.contains("second"));
        assert!(prompt.contains("third"));
        assert!(prompt.ends_with("Respond briefly and helpfully:"));
    }

    #[test]
    fn prompt_clips_system_and_context_content() {
        let long_sys = "s".repeat(500);
        let long_ctx = "c".repeat(500);
        let prompt = build_conversation_prompt(&long_sys, &[ctx_message(&long_ctx)], "q");
        assert!(prompt.contains(&"s".repeat(200)));
        assert!(!prompt.contains(&"s".repeat(201)));
        assert!(prompt.contains(&"c".repeat(100)));
        assert!(!prompt.contains(&"c".repeat(101)));
    }

    #[test]
    fn clip_respects_multibyte_boundaries() {
        let s = "é".repeat(10);
        assert_eq!(clip_chars(&s, 3), "ééé");
        assert_eq!(clip_chars("ab", 5), "ab");
    }

    #[test]
    fn confidence_table_matches_specialization_stakes() {
        assert_eq!(confidence_for(Specialization::Compliance), 0.75);
        assert_eq!(confidence_for(Specialization::Crm), 0.80);
        assert_eq!(confidence_for(Specialization::Portfolio), 0.80);
        assert_eq!(confidence_for(Specialization::General), 0.85);
        assert_eq!(confidence_for(Specialization::Tax), 0.85);
    }

    #[test]
    fn prohibited_phrases_fail_the_sec_scan_case_insensitively() {
        assert!(!passes_sec_scan("These are Guaranteed Returns."));
        assert!(!passes_sec_scan("a RISK-FREE strategy"));
        assert!(passes_sec_scan("Diversification reduces risk."));
    }

    #[tokio::test]
    async fn compliant_answer_yields_clean_output() {
        let backend = ScriptedBackend::always_ok("Diversify across asset classes.", 120, 40);
        let agent = ChatAgent::new(backend, "gpt-oss", ModelBudgets::default());

        let out = agent
            .infer(&request(Specialization::General), Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(out.content, "Diversify across asset classes.");
        assert_eq!(out.model_used, "general_gpt-oss");
        assert!(out.sec_compliant);
        assert!(!out.human_review_required);
        assert!(out.compliance_flags.is_empty());
        assert_eq!(out.input_tokens, 120);
        assert_eq!(out.output_tokens, 40);
    }

    #[tokio::test]
    async fn prohibited_phrase_fails_the_scan_without_forcing_review() {
        let backend = ScriptedBackend::always_ok("This fund has guaranteed returns.", 0, 0);
        let agent = ChatAgent::new(backend, "gpt-oss", ModelBudgets::default());

        let out = agent
            .infer(&request(Specialization::General), Duration::from_secs(30))
            .await
            .unwrap();

        assert!(!out.sec_compliant);
        // The scan only drives the flag; general confidence is 0.85, so the
        // review rule stays quiet.
        assert!(!out.human_review_required);
        assert!(out.compliance_flags.contains(&FLAG_SEC_NON_COMPLIANT.to_string()));
        assert!(!out
            .compliance_flags
            .contains(&FLAG_HUMAN_REVIEW_REQUIRED.to_string()));
    }

    #[tokio::test]
    async fn compliance_specialization_always_requires_review() {
        let backend = ScriptedBackend::always_ok("Rule 206(4)-1 applies.", 0, 0);
        let agent = ChatAgent::new(backend, "gpt-oss", ModelBudgets::default());

        let out = agent
            .infer(&request(Specialization::Compliance), Duration::from_secs(30))
            .await
            .unwrap();

        assert!(out.human_review_required);
        assert!(out
            .compliance_flags
            .contains(&FLAG_HUMAN_REVIEW_REQUIRED.to_string()));
        assert!(out.sec_compliant);
    }

    #[tokio::test]
    async fn oversized_input_is_a_usage_limit_error_without_a_backend_call() {
        let backend = ScriptedBackend::always_ok("unreachable", 0, 0);
        let calls = backend.calls_handle();
        let agent = ChatAgent::new(backend, "gpt-oss", ModelBudgets::default());

        let mut req = request(Specialization::General);
        req.user_message = "x".repeat(40_000);

        let err = agent.infer(&req, Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, InferError::UsageLimitExceeded(_)));
        assert!(!err.is_retryable());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
