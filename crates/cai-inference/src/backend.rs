//! Backend seam: the HTTP client speaking the OpenAI-compatible
//! chat-completions surface, behind a trait so tests can script responses.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::InferError;
use cai_config::BackendConfig;

/// One completion call. `system` and `prompt` are already assembled; the
/// backend does no prompt surgery of its own.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub content: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Run one completion. `deadline` is a hard per-call budget; the
    /// implementation must not outlive it.
    async fn complete(
        &self,
        req: BackendRequest,
        deadline: Duration,
    ) -> Result<BackendResponse, InferError>;
}

// ---------------------------------------------------------------------------
// HttpBackend
// ---------------------------------------------------------------------------

/// reqwest-backed adapter for a local model server (Ollama or anything else
/// exposing `POST {base_url}/chat/completions`).
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionReply {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

impl HttpBackend {
    pub fn new(cfg: &BackendConfig) -> Result<Self, InferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| InferError::Other(anyhow::Error::new(e).context("build http client")))?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn classify_send_error(e: reqwest::Error) -> InferError {
        if e.is_timeout() || e.is_connect() {
            InferError::Transient(e.to_string())
        } else {
            InferError::Other(anyhow::Error::new(e).context("backend request failed"))
        }
    }
}

#[async_trait]
impl BackendAdapter for HttpBackend {
    async fn complete(
        &self,
        req: BackendRequest,
        deadline: Duration,
    ) -> Result<BackendResponse, InferError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = CompletionBody {
            model: &req.model,
            messages: vec![
                WireMessage {
                    role: "system",
                    content: &req.system,
                },
                WireMessage {
                    role: "user",
                    content: &req.prompt,
                },
            ],
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            stream: false,
        };

        debug!(model = %req.model, url = %url, "sending completion request");

        let resp = self
            .client
            .post(&url)
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_send_error)?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(InferError::UsageLimitExceeded(format!(
                "backend rejected with 429 for model {}",
                req.model
            )));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(InferError::BackendMisbehaviour(format!(
                "backend returned {status}: {text}"
            )));
        }

        let reply: CompletionReply = resp
            .json()
            .await
            .map_err(|e| InferError::BackendMisbehaviour(format!("undecodable reply: {e}")))?;

        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| InferError::BackendMisbehaviour("reply carried no choices".into()))?;

        let usage = reply.usage.unwrap_or_default();

        Ok(BackendResponse {
            content: choice.message.content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }
}
