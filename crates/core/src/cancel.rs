use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{PixeError, Result};

/// Cooperative cancellation signal polled at chunk and frame boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Returns `Cancelled` once the token has been triggered.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PixeError::Cancelled)
        } else {
            Ok(())
        }
    }
}
