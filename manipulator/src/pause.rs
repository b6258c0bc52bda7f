use std::sync::Arc;

use tokio::sync::watch;

/// Process-wide run/pause flag shared by the manager and every waiting axis.
///
/// `true` means motion may proceed.
#[derive(Debug, Clone)]
pub struct PauseGate {
    state: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(true);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn pause(&self) {
        self.state.send_replace(false);
    }

    pub fn resume(&self) {
        self.state.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        *self.state.borrow()
    }

    /// Returns once the gate is open.
    pub async fn wait_running(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|running| *running).await;
    }
}
