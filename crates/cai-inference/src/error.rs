use std::fmt;

/// Classified inference failure.
///
/// The variant decides the dispatcher's reaction: `UsageLimitExceeded` is
/// terminal for the request, everything else may be retried within the
/// dispatcher's budget.
#[derive(Debug)]
pub enum InferError {
    /// A token or call budget was exceeded. Never retried.
    UsageLimitExceeded(String),
    /// The backend answered, but not in a shape we can use.
    BackendMisbehaviour(String),
    /// Network-level failure (connect, timeout, reset). Retryable.
    Transient(String),
    /// Anything else. Retryable, but logged at error level.
    Other(anyhow::Error),
}

impl InferError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, InferError::UsageLimitExceeded(_))
    }

    /// The message recorded on the failed queue row. These strings are a
    /// contract with the chat UI, which pattern-matches on them.
    pub fn user_facing_message(&self) -> &'static str {
        match self {
            InferError::UsageLimitExceeded(_) => {
                "Response limit exceeded. Please try a simpler request."
            }
            InferError::BackendMisbehaviour(_) => "AI model encountered an error. Please try again.",
            InferError::Transient(_) | InferError::Other(_) => {
                "AI model encountered an error. Please try again."
            }
        }
    }
}

impl fmt::Display for InferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferError::UsageLimitExceeded(msg) => write!(f, "usage limit exceeded: {msg}"),
            InferError::BackendMisbehaviour(msg) => write!(f, "backend misbehaviour: {msg}"),
            InferError::Transient(msg) => write!(f, "transient backend failure: {msg}"),
            InferError::Other(e) => write!(f, "inference failure: {e:#}"),
        }
    }
}

impl std::error::Error for InferError {}
