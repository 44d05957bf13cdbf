use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use conclave_core::types::{
    ChatMessage, OrchestratorAnalysis, RoutingDecision, SystemCommand,
};

/// The single mutable record threaded through one invocation.
///
/// One instance per invocation; never shared across concurrent
/// invocations of the same session. Resumption goes through an explicit
/// thread snapshot instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub messages: Vec<ChatMessage>,
    /// Index into the roster of the last agent that spoke; -1 before the
    /// first turn.
    pub last_speaker_index: i64,
    pub active_agent_id: Option<String>,
    /// Ordered queue of agents still owed a turn. Never contains the
    /// active agent.
    pub pending_agents: VecDeque<String>,
    pub system_command: Option<SystemCommand>,
    pub is_complete: bool,
    /// Append-only per-invocation routing audit log.
    pub routing_log: Vec<RoutingDecision>,
    // Orchestrator fields
    pub analysis: Option<OrchestratorAnalysis>,
    pub round: u32,
    pub max_rounds: u32,
    pub plan_approved: bool,
}

impl OrchestrationState {
    pub fn new(history: Vec<ChatMessage>, last_speaker_index: i64, max_rounds: u32) -> Self {
        Self {
            messages: history,
            last_speaker_index,
            max_rounds,
            ..Default::default()
        }
    }

    /// Apply a partial update with explicit per-field merge semantics:
    /// message history and routing log append, everything else overwrites
    /// when set. Keeps the pending-queue invariant (active agent is never
    /// pending).
    pub fn apply(&mut self, update: StateUpdate) {
        self.messages.extend(update.append_messages);
        self.routing_log.extend(update.append_routing);

        if let Some(idx) = update.last_speaker_index {
            self.last_speaker_index = idx;
        }
        if let Some(active) = update.active_agent_id {
            self.active_agent_id = active;
        }
        if let Some(pending) = update.pending_agents {
            self.pending_agents = pending;
        }
        if let Some(cmd) = update.system_command {
            self.system_command = cmd;
        }
        if let Some(complete) = update.is_complete {
            self.is_complete = complete;
        }
        if let Some(analysis) = update.analysis {
            self.analysis = Some(analysis);
        }
        if let Some(round) = update.round {
            self.round = round;
        }
        if let Some(approved) = update.plan_approved {
            self.plan_approved = approved;
        }

        if let Some(ref active) = self.active_agent_id {
            self.pending_agents.retain(|id| id != active);
        }
    }

    /// Pop the next pending agent and make it active.
    pub fn activate_next(&mut self) -> Option<String> {
        let next = self.pending_agents.pop_front()?;
        self.active_agent_id = Some(next.clone());
        Some(next)
    }

    /// Snapshot for one free-chat branch. Branches run on fully isolated
    /// state and are merged append-only afterwards.
    pub fn branch(&self) -> Self {
        self.clone()
    }

    /// Merge a finished branch back: history and routing log append; the
    /// scalar fields of the parent win.
    pub fn merge_branch(&mut self, branch: BranchOutput) {
        self.messages.extend(branch.new_messages);
        self.routing_log.extend(branch.new_routing);
    }
}

/// Partial state update produced by one graph node.
#[derive(Debug, Default)]
pub struct StateUpdate {
    pub append_messages: Vec<ChatMessage>,
    pub append_routing: Vec<RoutingDecision>,
    pub last_speaker_index: Option<i64>,
    pub active_agent_id: Option<Option<String>>,
    pub pending_agents: Option<VecDeque<String>>,
    pub system_command: Option<Option<SystemCommand>>,
    pub is_complete: Option<bool>,
    pub analysis: Option<OrchestratorAnalysis>,
    pub round: Option<u32>,
    pub plan_approved: Option<bool>,
}

/// What a free-chat branch produced, extracted before merging.
#[derive(Debug, Default)]
pub struct BranchOutput {
    pub new_messages: Vec<ChatMessage>,
    pub new_routing: Vec<RoutingDecision>,
}
