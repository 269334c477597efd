//! A cloneable handle for poking a chat session from other tasks.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;

/// A cloneable handle for poking a chat session from other tasks.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) cancel: Arc<Mutex<CancellationToken>>,
    pub(crate) is_streaming: Arc<AtomicBool>,
}

impl SessionHandle {
    pub(crate) fn new() -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            is_streaming: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Abort every stream in progress. The session strips the streaming
    /// messages on its next turn.
    pub fn abort(&self) {
        self.cancel.lock().cancel();
    }

    /// Token of the current turn
    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Install a fresh token once an abort has been applied
    pub(crate) fn reset(&self) {
        *self.cancel.lock() = CancellationToken::new();
    }

    pub(crate) fn set_streaming(&self, streaming: bool) {
        self.is_streaming.store(streaming, Ordering::Release);
    }

    /// Whether any agent is streaming into the conversation
    pub fn is_streaming(&self) -> bool {
        self.is_streaming.load(Ordering::Acquire)
    }
}
