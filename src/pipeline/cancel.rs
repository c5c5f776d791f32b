//! Cooperative cancellation for blocking stages.
//!
//! `tokio::time::timeout` only stops the async side of a job. Work already
//! handed to `spawn_blocking` keeps its thread until it returns, so the
//! extract and render loops poll a [`CancelToken`] and bail out once the job
//! it belongs to has been abandoned.

use crate::error::ConvertError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag set when a job's result is no longer wanted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once [`cancel`](Self::cancel) has been called.
    pub fn check(&self) -> Result<(), ConvertError> {
        if self.is_cancelled() {
            Err(ConvertError::Cancelled)
        } else {
            Ok(())
        }
    }
}
