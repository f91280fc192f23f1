//! The worker process: dispatcher loop plus the side-effect writer.
//!
//! A worker runs one [`dispatcher::Dispatcher`] and auxiliary tasks
//! (retention sweep). Multiple worker processes may share the store and
//! contend on claims; each carries its own arbiter, stats, and breaker —
//! no in-memory state crosses process boundaries.

pub mod dispatcher;
pub mod side_effects;

pub use dispatcher::{backoff_delay, CircuitBreaker, CycleOutcome, Dispatcher, WorkerStats};
pub use side_effects::{AssistantPersist, SideEffectError, SideEffectWriter};

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use cai_queue::QueueBroker;

/// Spawn the periodic retention sweep. Sweep failures are logged and the
/// task keeps ticking; retention is never allowed to take the worker down.
pub fn spawn_retention_sweep(
    broker: Arc<QueueBroker>,
    retention_days: i64,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so boot is quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = broker.sweep_expired(retention_days).await {
                warn!(error = %e, "retention sweep failed");
            }
        }
    })
}
