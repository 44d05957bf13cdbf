use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{RoutingDecision, TaskCompletionSummary, TokenUsage};

/// Everything an invocation can tell its consumer, in causal emission
/// order. Every agent-scoped variant carries the agent id so concurrent
/// free-chat streams can be demultiplexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    AgentStart {
        agent_id: String,
        reason: String,
    },
    AgentToken {
        agent_id: String,
        token: String,
    },
    AgentComplete {
        agent_id: String,
        text: String,
        usage: TokenUsage,
    },
    AgentError {
        agent_id: String,
        code: ErrorCode,
        message: String,
    },
    Routing {
        decision: RoutingDecision,
    },
    BudgetExceeded {
        agent_id: String,
        limiter: String,
    },
    ApprovalRequired {
        approval_id: String,
        agent_id: String,
        tool: String,
        input_summary: String,
    },
    ApprovalResult {
        approval_id: String,
        approved: bool,
    },
    CompactionStatus {
        agent_id: String,
        dropped_messages: usize,
        summarized: bool,
    },
    OrchestratorAnalysis {
        intent: String,
        selected_agents: Vec<String>,
        needs_approval: bool,
    },
    OrchestratorDirectToken {
        token: String,
    },
    OrchestratorEvaluation {
        round: u32,
        is_complete: bool,
        next_agent_id: Option<String>,
    },
    OrchestratorSummary {
        summary: TaskCompletionSummary,
    },
    SessionEnd {
        trace_id: String,
    },
}

/// Machine-readable error classification carried on `AgentError` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    WorkerExecution,
    Cancelled,
    Timeout,
    McpConnection,
    McpTimeout,
    McpCircuitOpen,
    BudgetExceeded,
    RateLimited,
    RoutingFailure,
}

/// Bounded event pipe between graph execution and its consumer.
///
/// `emit` awaits channel capacity, so a slow consumer applies backpressure
/// instead of growing an unbounded queue. Emission never fails loudly: a
/// dropped receiver just means nobody is listening anymore.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    /// Create a sink and its receiving half with the given capacity.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: StreamEvent) {
        let _ = self.tx.send(event).await;
    }

    /// Whether the consuming half is still attached.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
