use futures::future::BoxFuture;

use conclave_core::config::AgentProfile;
use conclave_core::types::SystemCommand;

use crate::state::OrchestrationState;

mod dynamic;
mod free_chat;
mod sequential;
mod tag;

pub use dynamic::DynamicStrategy;
pub use free_chat::FreeChatStrategy;
pub use sequential::SequentialStrategy;
pub use tag::{extract_mentions, TagOnlyStrategy};

/// What a strategy decided. Strategies are infallible: zero targets plus
/// a help message is a user prompt, not an error.
#[derive(Debug, Clone, Default)]
pub struct RoutingOutcome {
    pub target_agent_ids: Vec<String>,
    pub reason: String,
    pub confidence: f64,
    pub fallback_used: bool,
    pub is_help_message: bool,
    pub help_content: Option<String>,
}

impl RoutingOutcome {
    pub fn targets(ids: Vec<String>, reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            target_agent_ids: ids,
            reason: reason.into(),
            confidence,
            ..Default::default()
        }
    }

    pub fn help(content: String, reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            is_help_message: true,
            help_content: Some(content),
            ..Default::default()
        }
    }
}

/// Pluggable policy selecting which agent(s) get the next turn.
/// `route` never fails; degraded outcomes carry `fallback_used`.
pub trait RoutingStrategy: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn route(
        &self,
        message: &str,
        agents: &[AgentProfile],
        state: &OrchestrationState,
    ) -> BoxFuture<'_, RoutingOutcome>;
}

/// Detect `/reset` and `/help` before any strategy runs. These bypass
/// routing entirely.
pub fn detect_system_command(message: &str) -> Option<SystemCommand> {
    match message.trim() {
        "/reset" => Some(SystemCommand::Reset),
        "/help" => Some(SystemCommand::Help),
        _ => None,
    }
}

/// Roster listing used for help replies: one `@id — name: role` line per
/// configured agent.
pub fn roster_help(agents: &[AgentProfile]) -> String {
    let mut lines = vec!["Available agents:".to_string()];
    for agent in agents {
        lines.push(format!("@{} — {}: {}", agent.id, agent.name, agent.role));
    }
    lines.join("\n")
}
