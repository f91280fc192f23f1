//! Single-permit arbiter over the shared accelerator.
//!
//! One inference runs on the GPU at a time, per process. The permit is a
//! move-only token ([`GpuPermit`]): release consumes it, so releasing
//! without holding is unrepresentable, and a permit dropped on an error
//! path still frees the accelerator — every successful acquire pairs with
//! exactly one release on all paths.
//!
//! The arbiter does not guarantee FIFO over waiters; tokio's semaphore
//! queue gives bounded waits as long as hold times are bounded. It is
//! process-local and never coordinates across hosts.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
// tokio's Instant tracks the paused test clock, so wait accounting stays
// correct under `start_paused` tests as well as in production.
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Accounting
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ArbiterState {
    total_acquisitions: u64,
    total_wait_ms: u64,
    current_holder: Option<String>,
    usage_started: Option<Instant>,
}

/// Point-in-time usage statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbiterSnapshot {
    pub total_acquisitions: u64,
    pub average_wait_ms: u64,
    pub current_holder: Option<String>,
    pub current_usage_ms: Option<u64>,
    pub available: bool,
}

// ---------------------------------------------------------------------------
// GpuArbiter
// ---------------------------------------------------------------------------

pub struct GpuArbiter {
    semaphore: Arc<Semaphore>,
    state: Arc<Mutex<ArbiterState>>,
}

/// Outcome of a timed acquisition attempt.
pub enum AcquireOutcome {
    Acquired(GpuPermit),
    TimedOut { waited: Duration },
}

impl Default for GpuArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuArbiter {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            state: Arc::new(Mutex::new(ArbiterState::default())),
        }
    }

    /// Wait for the permit until `timeout` elapses. `holder_id` is recorded
    /// for observability (normally the request id).
    pub async fn acquire(&self, timeout: Duration, holder_id: &str) -> Result<AcquireOutcome> {
        let started = Instant::now();
        debug!(holder_id, timeout_secs = timeout.as_secs(), "acquiring gpu permit");

        match tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => {
                let waited = started.elapsed();
                let mut st = lock_state(&self.state);
                if let Some(ref stale) = st.current_holder {
                    // The semaphore said we are the sole holder; disagreeing
                    // accounting means the permit discipline was broken.
                    panic!("gpu arbiter accounting corrupted: stale holder {stale}");
                }
                st.total_acquisitions += 1;
                st.total_wait_ms += waited.as_millis() as u64;
                st.current_holder = Some(holder_id.to_string());
                st.usage_started = Some(Instant::now());
                drop(st);

                info!(
                    holder_id,
                    wait_ms = waited.as_millis() as u64,
                    "gpu permit acquired"
                );

                Ok(AcquireOutcome::Acquired(GpuPermit {
                    _permit: permit,
                    state: Arc::clone(&self.state),
                    holder_id: holder_id.to_string(),
                }))
            }
            Ok(Err(_)) => Err(anyhow!("gpu arbiter semaphore closed")),
            Err(_) => {
                let waited = started.elapsed();
                let holder = lock_state(&self.state).current_holder.clone();
                warn!(
                    holder_id,
                    wait_ms = waited.as_millis() as u64,
                    current_holder = ?holder,
                    "gpu permit acquisition timed out"
                );
                Ok(AcquireOutcome::TimedOut { waited })
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    pub fn snapshot(&self) -> ArbiterSnapshot {
        let st = lock_state(&self.state);
        ArbiterSnapshot {
            total_acquisitions: st.total_acquisitions,
            average_wait_ms: st.total_wait_ms / st.total_acquisitions.max(1),
            current_holder: st.current_holder.clone(),
            current_usage_ms: st
                .usage_started
                .map(|t| t.elapsed().as_millis() as u64),
            available: self.is_available(),
        }
    }
}

fn lock_state(state: &Mutex<ArbiterState>) -> std::sync::MutexGuard<'_, ArbiterState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// GpuPermit
// ---------------------------------------------------------------------------

/// Possession of this value IS the right to run on the accelerator.
pub struct GpuPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
    state: Arc<Mutex<ArbiterState>>,
    holder_id: String,
}

impl GpuPermit {
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Explicit release. Equivalent to dropping, but reads better at the
    /// end of the dispatch cycle.
    pub fn release(self) {}
}

impl Drop for GpuPermit {
    fn drop(&mut self) {
        let mut st = lock_state(&self.state);
        let usage_ms = st
            .usage_started
            .take()
            .map(|t| t.elapsed().as_millis() as u64);

        match st.current_holder.take() {
            Some(ref h) if *h == self.holder_id => {
                drop(st);
                info!(holder_id = %self.holder_id, usage_ms, "gpu permit released");
            }
            other => {
                drop(st);
                // A holder mismatch means two permits existed at once.
                if !std::thread::panicking() {
                    panic!(
                        "gpu permit release mismatch: releasing {:?}, recorded holder {:?}",
                        self.holder_id, other
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn permit_is_exclusive_until_released() {
        let arbiter = GpuArbiter::new();

        let permit = match arbiter.acquire(Duration::from_secs(1), "req-a").await.unwrap() {
            AcquireOutcome::Acquired(p) => p,
            AcquireOutcome::TimedOut { .. } => panic!("fresh arbiter must grant immediately"),
        };
        assert!(!arbiter.is_available());

        // A second waiter cannot get in while the permit is held.
        match arbiter.acquire(Duration::from_secs(1), "req-b").await.unwrap() {
            AcquireOutcome::TimedOut { .. } => {}
            AcquireOutcome::Acquired(_) => panic!("second acquire must time out"),
        }

        permit.release();
        assert!(arbiter.is_available());

        match arbiter.acquire(Duration::from_secs(1), "req-b").await.unwrap() {
            AcquireOutcome::Acquired(_) => {}
            AcquireOutcome::TimedOut { .. } => panic!("released permit must be grantable"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accounting_tracks_holder_and_acquisitions() {
        let arbiter = GpuArbiter::new();

        let permit = match arbiter.acquire(Duration::from_secs(5), "req-1").await.unwrap() {
            AcquireOutcome::Acquired(p) => p,
            AcquireOutcome::TimedOut { .. } => unreachable!(),
        };

        let snap = arbiter.snapshot();
        assert_eq!(snap.total_acquisitions, 1);
        assert_eq!(snap.current_holder.as_deref(), Some("req-1"));
        assert!(!snap.available);

        permit.release();

        let snap = arbiter.snapshot();
        assert_eq!(snap.total_acquisitions, 1);
        assert_eq!(snap.current_holder, None);
        assert_eq!(snap.current_usage_ms, None);
        assert!(snap.available);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiter_leaves_holder_accounting_alone() {
        let arbiter = GpuArbiter::new();
        let _held = match arbiter.acquire(Duration::from_secs(1), "req-holding").await.unwrap() {
            AcquireOutcome::Acquired(p) => p,
            AcquireOutcome::TimedOut { .. } => unreachable!(),
        };

        match arbiter.acquire(Duration::from_millis(50), "req-late").await.unwrap() {
            AcquireOutcome::TimedOut { waited } => {
                assert!(waited >= Duration::from_millis(50));
            }
            AcquireOutcome::Acquired(_) => panic!("must time out"),
        }

        let snap = arbiter.snapshot();
        assert_eq!(snap.current_holder.as_deref(), Some("req-holding"));
        assert_eq!(snap.total_acquisitions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_permit_frees_the_accelerator() {
        let arbiter = GpuArbiter::new();
        {
            let _permit = match arbiter.acquire(Duration::from_secs(1), "req-err").await.unwrap() {
                AcquireOutcome::Acquired(p) => p,
                AcquireOutcome::TimedOut { .. } => unreachable!(),
            };
            // Simulates an error path unwinding out of the dispatch cycle.
        }
        assert!(arbiter.is_available());
        assert_eq!(arbiter.snapshot().current_holder, None);
    }
}
