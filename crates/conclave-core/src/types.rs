use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message in the shared conversation log.
///
/// Agent turns carry the producing agent's id so multi-agent transcripts
/// stay demultiplexable. Synthetic messages (compaction summaries) are
/// flagged so windowing never drops them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            agent_id: None,
            text: text.into(),
            timestamp: Some(Utc::now()),
            synthetic: false,
        }
    }

    pub fn agent(agent_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            agent_id: Some(agent_id.into()),
            text: text.into(),
            timestamp: Some(Utc::now()),
            synthetic: false,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            agent_id: None,
            text: text.into(),
            timestamp: Some(Utc::now()),
            synthetic: false,
        }
    }

    /// A synthetic prior-summary turn produced by compaction.
    pub fn summary(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            agent_id: None,
            text: format!("[Conversation Summary]\n{}", text.into()),
            timestamp: Some(Utc::now()),
            synthetic: true,
        }
    }

    /// Speaker label for round grouping: agent id for assistant turns,
    /// role name otherwise.
    pub fn speaker(&self) -> &str {
        match self.agent_id {
            Some(ref id) => id.as_str(),
            None => match self.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
        }
    }
}

/// Token usage for one agent turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// The result of one agent turn.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub agent_id: String,
    pub text: String,
    pub usage: TokenUsage,
}

/// Backend kind of a worker executor.
///
/// A tagged variant instead of runtime type inspection: the engine
/// branches on this when it needs backend-specific behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// Chat-only backend; no tool access.
    Chat,
    /// Tool-capable backend routed through the MCP gateway.
    Tool,
}

/// Immutable audit record of one routing decision.
///
/// Appended to an append-only per-invocation log; never mutated after
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub target_agent_ids: Vec<String>,
    pub reason: String,
    pub confidence: f64,
    pub fallback_used: bool,
    pub timestamp: DateTime<Utc>,
}

impl RoutingDecision {
    pub fn new(targets: Vec<String>, reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            target_agent_ids: targets,
            reason: reason.into(),
            confidence,
            fallback_used: false,
            timestamp: Utc::now(),
        }
    }

    pub fn fallback(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target_agent_ids: vec![target.into()],
            reason: reason.into(),
            confidence: 0.0,
            fallback_used: true,
            timestamp: Utc::now(),
        }
    }
}

/// System commands detected before any routing strategy runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemCommand {
    Reset,
    Help,
    AwaitApproval,
}

/// One step in an orchestrator plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub agent_id: String,
    pub action: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// An ordered multi-agent plan produced by the analyzer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

/// Task complexity as judged by the analyzer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    #[default]
    Simple,
    Moderate,
    Complex,
}

/// The analyzer's view of one user message: intent, agent selection,
/// per-agent instructions, and an optional plan gated on human approval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorAnalysis {
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub safety_flags: Vec<String>,
    #[serde(default)]
    pub selected_agents: Vec<String>,
    #[serde(default)]
    pub agent_instructions: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub direct_response: Option<String>,
    #[serde(default)]
    pub needs_approval: bool,
}

/// The evaluator's verdict after one worker turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluatorVerdict {
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub next_agent_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub guidance: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// One grouped round of contributions in a completion summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: u32,
    pub agent_id: String,
    pub contribution: String,
}

/// Deterministic task summary rebuilt from the message log.
///
/// Contributions are grouped by consecutive-speaker round boundaries
/// rather than trusted to the model's own prose.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCompletionSummary {
    pub rounds: Vec<RoundSummary>,
    pub participating_agents: Vec<String>,
}
