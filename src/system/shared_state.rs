//! Shared state between the estimator worker and its callers.
//!
//! Everything the worker publishes outside the output queues lives here,
//! protected by the appropriate synchronization primitives. Callers that do
//! not want to consume the state channel can poll the latest estimate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::state::PoseVelBiasState;

/// State shared between the worker thread and the system handle.
pub struct SharedState {
    /// Most recent estimate, updated after every processed frame.
    last_state: RwLock<Option<PoseVelBiasState>>,

    /// Set once the worker has drained its queues and exited.
    finished: AtomicBool,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_state: RwLock::new(None),
            finished: AtomicBool::new(false),
        })
    }

    /// Latest estimate, if any frame has been processed yet.
    pub fn last_state(&self) -> Option<PoseVelBiasState> {
        self.last_state.read().clone()
    }

    pub fn set_last_state(&self, state: PoseVelBiasState) {
        *self.last_state.write() = Some(state);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}
