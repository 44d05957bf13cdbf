use futures::future::BoxFuture;

use conclave_core::config::AgentProfile;

use super::{RoutingOutcome, RoutingStrategy};
use crate::state::OrchestrationState;

/// Deterministic round-robin: `agents[(last_speaker_index + 1) % n]`,
/// exactly one target.
pub struct SequentialStrategy;

impl RoutingStrategy for SequentialStrategy {
    fn name(&self) -> &str {
        "sequential"
    }

    fn route(
        &self,
        _message: &str,
        agents: &[AgentProfile],
        state: &OrchestrationState,
    ) -> BoxFuture<'_, RoutingOutcome> {
        let outcome = if agents.is_empty() {
            RoutingOutcome::default()
        } else {
            let n = agents.len() as i64;
            let idx = (state.last_speaker_index + 1).rem_euclid(n) as usize;
            let target = agents[idx].id.clone();
            RoutingOutcome::targets(
                vec![target.clone()],
                format!("round-robin turn for @{}", target),
                1.0,
            )
        };
        Box::pin(async move { outcome })
    }
}
