//! Cooperative cancellation.
//!
//! Every public engine and indexing entry point accepts a [`CancelToken`].
//! The token is checked at suspension points (source load, step boundary,
//! per-N-cells during extraction, per-batch during embedding, after each
//! store write). A store write in flight when the token trips always
//! completes before `AbortError` surfaces, so no call leaves behind a
//! partially-written batch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::FlowError;

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. Idempotent; observed at the next suspension point.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Suspension-point check: `Err(AbortError)` once cancelled.
    pub fn check(&self) -> Result<(), FlowError> {
        if self.is_cancelled() {
            Err(FlowError::abort())
        } else {
            Ok(())
        }
    }
}
