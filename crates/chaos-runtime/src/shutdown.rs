use std::sync::{Arc, OnceLock};

use chaos_core::TerminationReason;
use tokio_util::sync::CancellationToken;

/// Single-fire termination event shared by everything that may stop the process.
///
/// The first [`fire`](Self::fire) records its reason and cancels the token;
/// every later call is a no-op that returns `false`. Signal handlers, the
/// listener task, the heartbeat and explicit stop requests can all hold a
/// clone and fire independently.
#[derive(Debug, Clone, Default)]
pub struct ShutdownTrigger {
    token: CancellationToken,
    reason: Arc<OnceLock<TerminationReason>>,
}

impl ShutdownTrigger {
    /// Create an unfired trigger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the trigger. Returns `true` only for the call that actually fired it.
    pub fn fire(&self, reason: TerminationReason) -> bool {
        match self.reason.set(reason) {
            Ok(()) => {
                self.token.cancel();
                true
            }
            Err(ignored) => {
                tracing::debug!(reason = %ignored, "Shutdown already triggered, ignoring");
                false
            }
        }
    }

    /// Whether the trigger has fired.
    pub fn is_fired(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Reason recorded by the first fire.
    pub fn reason(&self) -> Option<TerminationReason> {
        self.reason.get().cloned()
    }

    /// Wait until the trigger fires and return the recorded reason.
    pub async fn wait(&self) -> TerminationReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(TerminationReason::Stop)
    }

    /// Token cancelled when the trigger fires, for cooperative cancellation.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
