//! Cooperative stop signal for in-flight turns.

use tokio_util::sync::CancellationToken;

/// Lets an external actor ask an in-flight turn to stop at its next safe
/// point.
///
/// Purely advisory: the orchestrator consults the signal immediately after
/// the model call returns and immediately after the tool-dispatch phase
/// returns, once each per round. Work already in flight is never preempted,
/// and a stop requested after the turn completes has no effect.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Idempotent; callable from any task.
    pub fn request_stop(&self) {
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }
}
