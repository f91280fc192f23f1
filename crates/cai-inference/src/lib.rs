//! Inference adapter: turns a claimed chat request into an
//! [`cai_schemas::InferenceOutput`] by calling an OpenAI-compatible model
//! backend.
//!
//! The adapter never retries internally and never touches the store —
//! retries are the dispatcher's concern, persistence is the side-effect
//! writer's. Failures surface as [`InferError`], classified so the
//! dispatcher can decide what is retryable.

mod agent;
mod backend;
mod error;
mod prompts;

pub use agent::{ChatAgent, ChatRequestContext, ModelBudgets};
pub use backend::{BackendAdapter, BackendRequest, BackendResponse, HttpBackend};
pub use error::InferError;
pub use prompts::system_template;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
