use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;
use uuid::Uuid;

use conclave_core::event::{EventSink, StreamEvent};

/// A tool call waiting on a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub agent_id: String,
    pub tool: String,
    pub input_summary: String,
    pub timestamp: DateTime<Utc>,
}

/// Decision delivered back to a suspended tool call.
///
/// Denial is expressed through `approved` alone; `budget` only meters
/// auto-approval of subsequent calls by the same agent in the current
/// turn: `-1` approves all of them, `N > 0` approves the next `N - 1`,
/// and `0` grants nothing beyond the current call, so every later call
/// asks again. `approved: true, budget: 0` therefore approves exactly
/// one call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub budget: i32,
}

#[derive(Default)]
struct BrokerState {
    pending: HashMap<String, (ApprovalRequest, oneshot::Sender<ApprovalDecision>)>,
    // Remaining auto-approvals per agent; -1 = unlimited for the turn.
    credits: HashMap<String, i32>,
}

/// Manages pending approval requests with oneshot channels.
pub struct ApprovalBroker {
    state: Mutex<BrokerState>,
}

impl Default for ApprovalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Register a request and emit `ApprovalRequired`, returning a
    /// receiver to await. When the agent still holds auto-approval
    /// credits from an earlier decision, resolves immediately instead.
    pub async fn request(
        &self,
        agent_id: &str,
        tool: &str,
        input_summary: &str,
        sink: &EventSink,
    ) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().await;

        if let Some(credit) = state.credits.get_mut(agent_id) {
            if *credit == -1 || *credit > 0 {
                if *credit > 0 {
                    *credit -= 1;
                }
                debug!(agent_id = %agent_id, tool = %tool, "Auto-approving from remaining budget");
                let _ = tx.send(ApprovalDecision {
                    approved: true,
                    budget: 0,
                });
                return rx;
            }
        }

        let req = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            tool: tool.to_string(),
            input_summary: input_summary.to_string(),
            timestamp: Utc::now(),
        };

        sink.emit(StreamEvent::ApprovalRequired {
            approval_id: req.id.clone(),
            agent_id: req.agent_id.clone(),
            tool: req.tool.clone(),
            input_summary: req.input_summary.clone(),
        })
        .await;

        state.pending.insert(req.id.clone(), (req, tx));
        rx
    }

    /// Resolve a pending approval. Returns true if the request was found.
    pub async fn respond(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
        sink: &EventSink,
    ) -> bool {
        let mut state = self.state.lock().await;
        let entry = state.pending.remove(approval_id);
        if let Some((req, tx)) = entry {
            if decision.approved {
                let remaining = if decision.budget == -1 {
                    -1
                } else {
                    (decision.budget - 1).max(0)
                };
                if remaining != 0 {
                    state.credits.insert(req.agent_id.clone(), remaining);
                }
            }
            sink.emit(StreamEvent::ApprovalResult {
                approval_id: approval_id.to_string(),
                approved: decision.approved,
            })
            .await;
            // Ignore send error (the waiting call may have timed out).
            let _ = tx.send(decision);
            true
        } else {
            false
        }
    }

    /// List all pending approvals.
    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        self.state
            .lock()
            .await
            .pending
            .values()
            .map(|(req, _)| req.clone())
            .collect()
    }

    /// Forget any auto-approval credits. Called at the start of each turn.
    pub async fn reset_credits(&self) {
        self.state.lock().await.credits.clear();
    }
}
