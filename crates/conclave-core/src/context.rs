use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Per-agent-per-turn execution bundle: permissions, timeout budget, and
/// the cancellation signal. Owned exclusively by the worker during its
/// turn and discarded afterwards.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub agent_id: String,
    pub allowed_tools: Vec<String>,
    pub allowed_paths: Vec<String>,
    pub routing_reason: String,
    pub timeout: Duration,
    pub cancellation: CancellationToken,
    pub orchestrator_guidance: Option<String>,
    /// When set, the tool and path allowances do not apply. Explicit
    /// @mention-directed turns run with full tool access.
    pub unrestricted: bool,
}

impl ExecutionContext {
    pub fn new(
        agent_id: impl Into<String>,
        routing_reason: impl Into<String>,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            allowed_tools: vec![],
            allowed_paths: vec![],
            routing_reason: routing_reason.into(),
            timeout,
            cancellation,
            orchestrator_guidance: None,
            unrestricted: false,
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>, paths: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self.allowed_paths = paths;
        self
    }

    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.orchestrator_guidance = Some(guidance.into());
        self
    }

    /// Lift the tool and path allowances for this turn.
    pub fn with_full_access(mut self) -> Self {
        self.unrestricted = true;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn tool_allowed(&self, tool: &str) -> bool {
        self.unrestricted || self.allowed_tools.iter().any(|t| t == tool)
    }
}
