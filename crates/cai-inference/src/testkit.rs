//! Deterministic backend double for adapter and dispatcher tests.
//! No randomness, no network I/O.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::backend::{BackendAdapter, BackendRequest, BackendResponse};
use crate::error::InferError;

/// One scripted reply.
pub enum ScriptedReply {
    Ok {
        content: String,
        input_tokens: i64,
        output_tokens: i64,
    },
    Misbehaviour(String),
    Transient(String),
    UsageLimit(String),
}

/// Replays a fixed script of replies in order; once the script is exhausted
/// it keeps returning the final entry. Counts calls so tests can assert how
/// many attempts the caller made.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<ScriptedReply>>,
    last: Mutex<Option<ScriptedReply>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<ScriptedReply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A backend that always answers with the same content.
    pub fn always_ok(content: &str, input_tokens: i64, output_tokens: i64) -> Self {
        Self::new(vec![ScriptedReply::Ok {
            content: content.to_string(),
            input_tokens,
            output_tokens,
        }])
    }

    /// `failures` misbehaviour replies, then success with `content`.
    pub fn fail_n_then_ok(failures: usize, content: &str) -> Self {
        let mut script: Vec<ScriptedReply> = (0..failures)
            .map(|i| ScriptedReply::Misbehaviour(format!("scripted failure {i}")))
            .collect();
        script.push(ScriptedReply::Ok {
            content: content.to_string(),
            input_tokens: 0,
            output_tokens: 0,
        });
        Self::new(script)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared call counter, for tests that move the backend into an agent.
    pub fn calls_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    fn next_reply(&self) -> ScriptedReply {
        let mut script = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match script.pop_front() {
            Some(reply) => {
                let echo = clone_reply(&reply);
                *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(echo);
                reply
            }
            None => {
                let last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
                match last.as_ref() {
                    Some(reply) => clone_reply(reply),
                    None => ScriptedReply::Misbehaviour("scripted backend had no script".into()),
                }
            }
        }
    }
}

fn clone_reply(reply: &ScriptedReply) -> ScriptedReply {
    match reply {
        ScriptedReply::Ok {
            content,
            input_tokens,
            output_tokens,
        } => ScriptedReply::Ok {
            content: content.clone(),
            input_tokens: *input_tokens,
            output_tokens: *output_tokens,
        },
        ScriptedReply::Misbehaviour(m) => ScriptedReply::Misbehaviour(m.clone()),
        ScriptedReply::Transient(m) => ScriptedReply::Transient(m.clone()),
        ScriptedReply::UsageLimit(m) => ScriptedReply::UsageLimit(m.clone()),
    }
}

#[async_trait]
impl BackendAdapter for ScriptedBackend {
    async fn complete(
        &self,
        _req: BackendRequest,
        _deadline: Duration,
    ) -> Result<BackendResponse, InferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_reply() {
            ScriptedReply::Ok {
                content,
                input_tokens,
                output_tokens,
            } => Ok(BackendResponse {
                content,
                input_tokens,
                output_tokens,
            }),
            ScriptedReply::Misbehaviour(m) => Err(InferError::BackendMisbehaviour(m)),
            ScriptedReply::Transient(m) => Err(InferError::Transient(m)),
            ScriptedReply::UsageLimit(m) => Err(InferError::UsageLimitExceeded(m)),
        }
    }
}
