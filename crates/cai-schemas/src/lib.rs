//! Shared domain records for the inference core.
//!
//! Everything that crosses a crate boundary — queue payloads, adapter
//! inputs/outputs, status enums — lives here. Structured payloads are typed
//! in memory and serialized to a single JSON text container only at the
//! store boundary (`RequestPayload::encode` / `decode`).

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Compliance flags
// ---------------------------------------------------------------------------

pub const FLAG_SEC_NON_COMPLIANT: &str = "SEC_NON_COMPLIANT";
pub const FLAG_HUMAN_REVIEW_REQUIRED: &str = "HUMAN_REVIEW_REQUIRED";
pub const FLAG_LOW_CONFIDENCE: &str = "LOW_CONFIDENCE";
pub const FLAG_ERROR: &str = "ERROR";

// ---------------------------------------------------------------------------
// RequestStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a queue row.
///
/// Transitions: pending → processing (claim), processing → completed|failed
/// (finish). No other edges occur; terminal rows never leave their state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "processing" => Ok(RequestStatus::Processing),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(anyhow!("invalid request status: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// RequestType
// ---------------------------------------------------------------------------

/// Kind of work a queue row carries. Only `chat` has a fully specified
/// payload; the other kinds are reserved for the document pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Chat,
    MeetingTranscription,
    DocumentAnalysis,
    ComplianceCheck,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Chat => "chat",
            RequestType::MeetingTranscription => "meeting_transcription",
            RequestType::DocumentAnalysis => "document_analysis",
            RequestType::ComplianceCheck => "compliance_check",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "chat" => Ok(RequestType::Chat),
            "meeting_transcription" => Ok(RequestType::MeetingTranscription),
            "document_analysis" => Ok(RequestType::DocumentAnalysis),
            "compliance_check" => Ok(RequestType::ComplianceCheck),
            other => Err(anyhow!("invalid request type: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Specialization
// ---------------------------------------------------------------------------

/// Custom-GPT specialization tag. Selects the prompt template and the
/// confidence heuristic in the inference adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specialization {
    Crm,
    Portfolio,
    Compliance,
    General,
    Retirement,
    Tax,
}

impl Specialization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Specialization::Crm => "crm",
            Specialization::Portfolio => "portfolio",
            Specialization::Compliance => "compliance",
            Specialization::General => "general",
            Specialization::Retirement => "retirement",
            Specialization::Tax => "tax",
        }
    }

    /// Parse a specialization tag, falling back to `General` for anything
    /// unknown — the adapter must keep answering even for stale tags.
    pub fn parse_or_general(s: &str) -> Self {
        match s {
            "crm" => Specialization::Crm,
            "portfolio" => Specialization::Portfolio,
            "compliance" => Specialization::Compliance,
            "retirement" => Specialization::Retirement,
            "tax" => Specialization::Tax,
            _ => Specialization::General,
        }
    }
}

// ---------------------------------------------------------------------------
// UserRole
// ---------------------------------------------------------------------------

/// Advisory-firm role. Drives the default queue priority when an enqueue
/// request does not carry an explicit one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Executive,
    SeniorAdvisor,
    Advisor,
    JuniorAdvisor,
    Staff,
    Intern,
    FinancialAdvisor,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Executive => "executive",
            UserRole::SeniorAdvisor => "senior_advisor",
            UserRole::Advisor => "advisor",
            UserRole::JuniorAdvisor => "junior_advisor",
            UserRole::Staff => "staff",
            UserRole::Intern => "intern",
            UserRole::FinancialAdvisor => "financial_advisor",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "executive" => Ok(UserRole::Executive),
            "senior_advisor" => Ok(UserRole::SeniorAdvisor),
            "advisor" => Ok(UserRole::Advisor),
            "junior_advisor" => Ok(UserRole::JuniorAdvisor),
            "staff" => Ok(UserRole::Staff),
            "intern" => Ok(UserRole::Intern),
            "financial_advisor" => Ok(UserRole::FinancialAdvisor),
            other => Err(anyhow!("invalid user role: {}", other)),
        }
    }

    /// Default queue priority for the role (1 = most urgent, 10 = least).
    /// Only the ranked ladder gets a non-neutral value; roles outside it
    /// (lazily-materialized `financial_advisor` rows) stay at the neutral
    /// default.
    pub fn default_priority(&self) -> i32 {
        match self {
            UserRole::Executive => 1,
            UserRole::SeniorAdvisor => 2,
            UserRole::Advisor => 3,
            UserRole::JuniorAdvisor => 4,
            UserRole::Staff => 5,
            UserRole::Intern => 6,
            UserRole::FinancialAdvisor => 5,
        }
    }
}

// ---------------------------------------------------------------------------
// MessageRole
// ---------------------------------------------------------------------------

/// Author of a thread message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(anyhow!("invalid message role: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// ToolsEnabled
// ---------------------------------------------------------------------------

/// Integration flags on a custom GPT. Stored as a JSON object on the row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsEnabled {
    #[serde(default)]
    pub redtail_crm: bool,
    #[serde(default)]
    pub albridge_portfolio: bool,
    #[serde(default)]
    pub black_diamond: bool,
}

// ---------------------------------------------------------------------------
// Chat payload
// ---------------------------------------------------------------------------

/// One prior message carried as conversation context. Chronologically
/// ordered in `ChatInput::context_messages`, most recent last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub id: String,
    pub thread_id: String,
    pub content: String,
    pub role: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default)]
    pub compliance_flags: Vec<String>,
}

/// Attachment metadata only — content is dereferenced out-of-band by the
/// file service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size: i64,
    pub url: String,
    pub uploaded_at: DateTime<Utc>,
}

/// The decoded `input_data` of a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInput {
    pub message_id: String,
    pub thread_id: String,
    pub custom_gpt_id: String,
    pub user_message: String,
    #[serde(default)]
    pub context_messages: Vec<ContextMessage>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

/// Custom-GPT configuration the adapter needs to answer a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomGptProfile {
    pub id: String,
    pub specialization: Specialization,
    pub system_prompt: String,
    #[serde(default)]
    pub tools_enabled: ToolsEnabled,
}

// ---------------------------------------------------------------------------
// RequestPayload — tagged in-memory form of input_data
// ---------------------------------------------------------------------------

/// Typed `input_data`, tagged by the row's `request_type` column. The tag
/// lives in the column, not in the JSON text, so encode/decode is keyed.
#[derive(Debug, Clone)]
pub enum RequestPayload {
    Chat(ChatInput),
}

impl RequestPayload {
    pub fn request_type(&self) -> RequestType {
        match self {
            RequestPayload::Chat(_) => RequestType::Chat,
        }
    }

    /// Serialize to the store's single-text-container form.
    pub fn encode(&self) -> Result<String> {
        match self {
            RequestPayload::Chat(input) => {
                serde_json::to_string(input).context("encode chat input_data failed")
            }
        }
    }

    /// Decode the store's text container, keyed by the row's request_type.
    /// Unsupported kinds are a decode error, not a silent fallback — the
    /// dispatcher turns this into a failed row, never a dropped one.
    pub fn decode(request_type: RequestType, raw: &str) -> Result<Self> {
        match request_type {
            RequestType::Chat => {
                let input: ChatInput =
                    serde_json::from_str(raw).context("decode chat input_data failed")?;
                Ok(RequestPayload::Chat(input))
            }
            other => Err(anyhow!(
                "no payload codec for request type: {}",
                other.as_str()
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// InferenceOutput / ResponseMetadata
// ---------------------------------------------------------------------------

/// What the inference adapter produces for a successful call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub content: String,
    pub model_used: String,
    pub processing_time_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Heuristic, in [0,1].
    pub confidence_score: f64,
    pub sec_compliant: bool,
    pub human_review_required: bool,
    pub compliance_flags: Vec<String>,
    pub tool_interactions: Vec<Value>,
}

/// The `response_metadata` written next to `response_content` on a
/// completed row. Field set is the §6 contract consumed by the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub model_used: String,
    pub processing_time_ms: i64,
    pub confidence_score: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub compliance_flags: Vec<String>,
    pub sec_compliant: bool,
    pub human_review_required: bool,
    pub tool_interactions: Vec<Value>,
    /// Id of the persisted assistant message, when the side-effect chain
    /// succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_message_id: Option<String>,
    /// Why the assistant message could not be persisted. The inference
    /// result is still delivered; persistence is best-effort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effect_error: Option<String>,
}

impl ResponseMetadata {
    pub fn from_output(out: &InferenceOutput) -> Self {
        Self {
            model_used: out.model_used.clone(),
            processing_time_ms: out.processing_time_ms,
            confidence_score: out.confidence_score,
            input_tokens: out.input_tokens,
            output_tokens: out.output_tokens,
            compliance_flags: out.compliance_flags.clone(),
            sec_compliant: out.sec_compliant,
            human_review_required: out.human_review_required,
            tool_interactions: out.tool_interactions.clone(),
            assistant_message_id: None,
            side_effect_error: None,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("encode response_metadata failed")
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("decode response_metadata failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_and_rejects_unknown() {
        for st in [
            RequestStatus::Pending,
            RequestStatus::Processing,
            RequestStatus::Completed,
            RequestStatus::Failed,
        ] {
            assert_eq!(RequestStatus::parse(st.as_str()).unwrap(), st);
        }
        assert!(RequestStatus::parse("cancelled").is_err());
    }

    #[test]
    fn terminal_statuses_are_exactly_completed_and_failed() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::Processing.is_terminal());
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
    }

    #[test]
    fn unknown_specialization_falls_back_to_general() {
        assert_eq!(
            Specialization::parse_or_general("estate_planning"),
            Specialization::General
        );
        assert_eq!(Specialization::parse_or_general("tax"), Specialization::Tax);
    }

    #[test]
    fn role_priorities_match_the_role_ladder() {
        assert_eq!(UserRole::Executive.default_priority(), 1);
        assert_eq!(UserRole::Intern.default_priority(), 6);
        assert!(UserRole::SeniorAdvisor.default_priority() < UserRole::Staff.default_priority());
        // Outside the ranked ladder: synthesized advisor rows queue at the
        // neutral default, never ahead of staff.
        assert_eq!(UserRole::FinancialAdvisor.default_priority(), 5);
    }

    #[test]
    fn chat_payload_encodes_without_a_type_tag() {
        let input = ChatInput {
            message_id: "msg-1".into(),
            thread_id: "thr-1".into(),
            custom_gpt_id: "gpt-1".into(),
            user_message: "hello".into(),
            context_messages: vec![],
            attachments: vec![],
        };
        let raw = RequestPayload::Chat(input).encode().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        // The tag is the request_type column, never part of the container.
        assert!(value.get("request_type").is_none());
        assert_eq!(value["message_id"], "msg-1");

        let decoded = RequestPayload::decode(RequestType::Chat, &raw).unwrap();
        let RequestPayload::Chat(chat) = decoded;
        assert_eq!(chat.thread_id, "thr-1");
    }

    #[test]
    fn decode_rejects_kinds_without_a_codec() {
        let err = RequestPayload::decode(RequestType::DocumentAnalysis, "{}").unwrap_err();
        assert!(err.to_string().contains("document_analysis"));
    }

    #[test]
    fn context_message_defaults_empty_collections() {
        let raw = r#"{
            "id": "m1",
            "thread_id": "t1",
            "content": "prior",
            "role": "user",
            "timestamp": "2025-06-01T12:00:00Z"
        }"#;
        let msg: ContextMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.attachments.is_empty());
        assert!(msg.compliance_flags.is_empty());
    }
}
