use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Tracks the live cancellation token per agent so one agent can be
/// aborted without touching the others. At most one live context per
/// agent per invocation; free-chat registers one per concurrent branch
/// agent.
pub struct ContextRegistry {
    root: CancellationToken,
    live: Mutex<HashMap<String, CancellationToken>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Token every per-agent token derives from; cancelling it aborts the
    /// whole invocation.
    pub fn root(&self) -> CancellationToken {
        self.root.clone()
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Issue a child token for an agent's turn. Replaces any stale entry
    /// for the same agent.
    pub fn register(&self, agent_id: &str) -> CancellationToken {
        let token = self.root.child_token();
        self.live().insert(agent_id.to_string(), token.clone());
        token
    }

    /// Drop the live entry once the agent's turn is over.
    pub fn deregister(&self, agent_id: &str) {
        self.live().remove(agent_id);
    }

    /// Abort exactly one agent's in-flight context. Returns false when the
    /// agent has no live context.
    pub fn cancel_agent(&self, agent_id: &str) -> bool {
        let live = self.live();
        match live.get(agent_id) {
            Some(token) => {
                debug!(agent_id, "Cancelling agent context");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Abort every in-flight context; returns the cancelled agent ids.
    pub fn cancel_all(&self) -> Vec<String> {
        let live = self.live();
        let mut ids: Vec<String> = live.keys().cloned().collect();
        ids.sort();
        for token in live.values() {
            token.cancel();
        }
        ids
    }

    pub fn live_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}
