use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use conclave_core::config::AgentProfile;
use conclave_core::traits::ChatModel;

use super::{RoutingOutcome, RoutingStrategy};
use crate::state::OrchestrationState;

/// AI routing: a routing model picks targets from the roster.
///
/// The model answers `id[,id...]|reason`. Unknown ids are filtered; an
/// empty result or any call failure degrades to the configured default
/// agent (first agent if unset) with `confidence = 0` — this strategy
/// must never fail an invocation.
pub struct DynamicStrategy {
    model: Arc<dyn ChatModel>,
    mission: String,
    default_agent: Option<String>,
}

impl DynamicStrategy {
    pub fn new(model: Arc<dyn ChatModel>, mission: impl Into<String>, default_agent: Option<String>) -> Self {
        Self {
            model,
            mission: mission.into(),
            default_agent,
        }
    }

    fn system_prompt(&self, agents: &[AgentProfile]) -> String {
        let roster = agents
            .iter()
            .map(|a| format!("- {}: {} ({}). {}", a.id, a.name, a.role, a.instructions))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "You route messages in a multi-agent chat.\n\
             Mission: {}\n\
             Agents:\n{}\n\n\
             Reply with ONLY the target agent id(s), comma-separated, then a pipe \
             and a one-line reason. Example: researcher,writer|needs sources first",
            self.mission, roster
        )
    }

    fn fallback_target(&self, agents: &[AgentProfile]) -> Option<String> {
        match self.default_agent {
            Some(ref id) => agents
                .iter()
                .find(|a| a.id.eq_ignore_ascii_case(id))
                .map(|a| a.id.clone()),
            None => agents.first().map(|a| a.id.clone()),
        }
    }

    fn fallback(&self, agents: &[AgentProfile], why: &str) -> RoutingOutcome {
        match self.fallback_target(agents) {
            Some(target) => RoutingOutcome {
                target_agent_ids: vec![target.clone()],
                reason: format!("routing model unavailable ({}); defaulting to @{}", why, target),
                confidence: 0.0,
                fallback_used: true,
                ..Default::default()
            },
            None => RoutingOutcome::default(),
        }
    }
}

/// Parse `id[,id...]|reason` into (ids, reason).
fn parse_routing_reply(text: &str) -> (Vec<String>, String) {
    let trimmed = text.trim();
    let (ids_part, reason) = match trimmed.split_once('|') {
        Some((ids, reason)) => (ids, reason.trim().to_string()),
        None => (trimmed, String::new()),
    };
    let ids = ids_part
        .split(',')
        .map(|s| s.trim().trim_start_matches('@').to_string())
        .filter(|s| !s.is_empty())
        .collect();
    (ids, reason)
}

impl RoutingStrategy for DynamicStrategy {
    fn name(&self) -> &str {
        "dynamic"
    }

    fn route(
        &self,
        message: &str,
        agents: &[AgentProfile],
        _state: &OrchestrationState,
    ) -> BoxFuture<'_, RoutingOutcome> {
        let message = message.to_string();
        let agents = agents.to_vec();
        Box::pin(async move {
            let system = self.system_prompt(&agents);
            let reply = match self.model.invoke(&system, &message).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Routing model call failed");
                    return self.fallback(&agents, "call failed");
                }
            };

            let (raw_ids, reason) = parse_routing_reply(&reply);
            let targets: Vec<String> = raw_ids
                .iter()
                .filter_map(|id| {
                    agents
                        .iter()
                        .find(|a| a.id.eq_ignore_ascii_case(id))
                        .map(|a| a.id.clone())
                })
                .collect();

            if targets.is_empty() {
                debug!(reply = %reply, "Routing model returned no usable targets");
                return self.fallback(&agents, "no usable targets");
            }

            let reason = if reason.is_empty() {
                "routing model selection".to_string()
            } else {
                reason
            };
            RoutingOutcome::targets(targets, reason, 0.9)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_test_utils::{agent, MockChatModel};

    fn strategy(model: MockChatModel, default_agent: Option<&str>) -> DynamicStrategy {
        DynamicStrategy::new(
            Arc::new(model),
            "test mission",
            default_agent.map(String::from),
        )
    }

    #[test]
    fn parses_ids_and_reason() {
        let (ids, reason) = parse_routing_reply("researcher, writer | needs sources first");
        assert_eq!(ids, vec!["researcher".to_string(), "writer".to_string()]);
        assert_eq!(reason, "needs sources first");
    }

    #[test]
    fn parses_reply_without_reason() {
        let (ids, reason) = parse_routing_reply("@coder");
        assert_eq!(ids, vec!["coder".to_string()]);
        assert!(reason.is_empty());
    }

    #[tokio::test]
    async fn routes_to_model_selection() {
        let model = MockChatModel::replying(vec!["writer|drafting needed".to_string()]);
        let agents = vec![agent("researcher"), agent("writer")];
        let outcome = strategy(model, None)
            .route("draft the intro", &agents, &OrchestrationState::default())
            .await;
        assert_eq!(outcome.target_agent_ids, vec!["writer".to_string()]);
        assert_eq!(outcome.reason, "drafting needed");
        assert!(!outcome.fallback_used);
    }

    #[tokio::test]
    async fn unknown_ids_are_filtered() {
        let model = MockChatModel::replying(vec!["ghost,writer|mixed".to_string()]);
        let agents = vec![agent("writer")];
        let outcome = strategy(model, None)
            .route("go", &agents, &OrchestrationState::default())
            .await;
        assert_eq!(outcome.target_agent_ids, vec!["writer".to_string()]);
    }

    #[tokio::test]
    async fn model_failure_falls_back_with_zero_confidence() {
        let model = MockChatModel::failing("boom");
        let agents = vec![agent("a"), agent("b")];
        let outcome = strategy(model, Some("b"))
            .route("go", &agents, &OrchestrationState::default())
            .await;
        assert_eq!(outcome.target_agent_ids, vec!["b".to_string()]);
        assert_eq!(outcome.confidence, 0.0);
        assert!(outcome.fallback_used);
        assert!(!outcome.reason.is_empty());
    }

    #[tokio::test]
    async fn empty_reply_falls_back_to_first_agent() {
        let model = MockChatModel::replying(vec!["|no idea".to_string()]);
        let agents = vec![agent("a"), agent("b")];
        let outcome = strategy(model, None)
            .route("go", &agents, &OrchestrationState::default())
            .await;
        assert_eq!(outcome.target_agent_ids, vec!["a".to_string()]);
        assert!(outcome.fallback_used);
        assert_eq!(outcome.confidence, 0.0);
    }
}
