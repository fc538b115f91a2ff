//! Cooperative cancellation token (§4.L).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{PipelineError, Result};

/// A shared, single-writer cancellation flag. Cheap to clone; all clones
/// observe the same underlying flag.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns `Err(PipelineError::Cancelled)` if the token has fired.
    /// Intended to be called between frames, between FOVs, and between
    /// stages/batches.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_not_cancelled() {
        let tok = CancelToken::new();
        assert!(tok.check().is_ok());
    }

    #[test]
    fn cancel_propagates_to_clones() {
        let tok = CancelToken::new();
        let clone = tok.clone();
        tok.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(PipelineError::Cancelled)));
    }
}
