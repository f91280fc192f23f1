//! Shared state for the daemon. Handlers receive `State<Arc<AppState>>`;
//! this module owns nothing async itself.

use std::sync::Arc;

use serde::Serialize;

use crate::auth::MockAuth;
use cai_queue::QueueBroker;
use cai_store::Store;

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all handlers.
pub struct AppState {
    pub broker: Arc<QueueBroker>,
    pub store: Store,
    pub auth: MockAuth,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self {
            broker: Arc::new(QueueBroker::new(store.clone())),
            store,
            auth: MockAuth::with_demo_users(),
            build: BuildInfo {
                service: "cai-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}
