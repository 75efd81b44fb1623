//! Out-of-band verdict delivery keyed by run identity.

use super::AnalysisVerdict;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Default)]
struct ChannelState {
    waiters: HashMap<String, oneshot::Sender<AnalysisVerdict>>,
    early: HashMap<String, AnalysisVerdict>,
}

/// Delivers analysis verdicts to whoever waits for them.
///
/// A verdict posted before anyone waits is retained and handed to the
/// first waiter for that key.
#[derive(Debug, Default)]
pub struct VerdictChannel {
    state: Mutex<ChannelState>,
}

impl VerdictChannel {
    /// Creates an empty channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts a verdict for a key.
    ///
    /// Returns true if a waiter received it, false if it was retained.
    pub fn post(&self, key: &str, verdict: AnalysisVerdict) -> bool {
        let mut state = self.state.lock();
        if let Some(tx) = state.waiters.remove(key) {
            if tx.send(verdict).is_ok() {
                debug!(key = %key, verdict = %verdict, "Verdict delivered");
                return true;
            }
        }
        debug!(key = %key, verdict = %verdict, "Verdict retained until awaited");
        state.early.insert(key.to_string(), verdict);
        false
    }

    /// Registers interest in a key's verdict.
    ///
    /// A retained verdict is delivered immediately. A previous waiter for
    /// the same key is replaced; its receiver then sees a closed channel.
    pub fn subscribe(&self, key: &str) -> oneshot::Receiver<AnalysisVerdict> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if let Some(verdict) = state.early.remove(key) {
            let _ = tx.send(verdict);
        } else {
            state.waiters.insert(key.to_string(), tx);
        }
        rx
    }

    /// Drops the waiter for a key, if any.
    pub fn unsubscribe(&self, key: &str) {
        self.state.lock().waiters.remove(key);
    }

    /// Returns the number of active waiters.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Returns the number of retained verdicts.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.state.lock().early.len()
    }
}
