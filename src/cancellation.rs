use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Batch-wide cancellation flag shared by the supervisor and every session.
///
/// Blocking calls poll it between short waits, so a failure in one session is seen by its
/// siblings directly instead of through their sockets being torn down.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this call flipped the flag.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
