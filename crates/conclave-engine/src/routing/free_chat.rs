use futures::future::BoxFuture;

use conclave_core::config::AgentProfile;

use super::{RoutingOutcome, RoutingStrategy};
use crate::state::OrchestrationState;

/// Every agent answers every message. The engine fans the targets out to
/// parallel worker dispatch.
pub struct FreeChatStrategy;

impl RoutingStrategy for FreeChatStrategy {
    fn name(&self) -> &str {
        "free_chat"
    }

    fn route(
        &self,
        _message: &str,
        agents: &[AgentProfile],
        _state: &OrchestrationState,
    ) -> BoxFuture<'_, RoutingOutcome> {
        let targets: Vec<String> = agents.iter().map(|a| a.id.clone()).collect();
        let outcome = RoutingOutcome::targets(targets, "free chat: all agents respond", 1.0);
        Box::pin(async move { outcome })
    }
}
