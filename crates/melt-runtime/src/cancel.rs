use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A token used to interrupt a generation loop between decode steps.
///
/// A native call in progress is never interrupted; the flag is checked before the next step.
#[derive(Clone, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous cancellation so the token can be reused for the next turn.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst)
    }
}
