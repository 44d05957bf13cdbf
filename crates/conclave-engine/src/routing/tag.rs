use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::Regex;

use conclave_core::config::AgentProfile;

use super::{roster_help, RoutingOutcome, RoutingStrategy};
use crate::state::OrchestrationState;

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@([A-Za-z0-9-]+)").expect("valid mention pattern"))
}

/// Extract `@token` mentions in first-mention order, de-duplicated
/// case-insensitively.
pub fn extract_mentions(message: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for cap in mention_pattern().captures_iter(message) {
        let token = cap[1].to_string();
        if !seen
            .iter()
            .any(|s: &String| s.eq_ignore_ascii_case(&token))
        {
            seen.push(token);
        }
    }
    seen
}

/// Only explicitly @-mentioned agents speak. Zero recognized mentions
/// produce a help roster, not an error.
pub struct TagOnlyStrategy;

impl RoutingStrategy for TagOnlyStrategy {
    fn name(&self) -> &str {
        "tag_only"
    }

    fn route(
        &self,
        message: &str,
        agents: &[AgentProfile],
        _state: &OrchestrationState,
    ) -> BoxFuture<'_, RoutingOutcome> {
        let mut targets = Vec::new();
        for mention in extract_mentions(message) {
            if let Some(agent) = agents.iter().find(|a| a.id.eq_ignore_ascii_case(&mention)) {
                if !targets.contains(&agent.id) {
                    targets.push(agent.id.clone());
                }
            }
        }

        let outcome = if targets.is_empty() {
            RoutingOutcome::help(
                roster_help(agents),
                "no recognized @mention in message",
            )
        } else {
            let reason = format!("mentioned: {}", targets.join(", "));
            RoutingOutcome::targets(targets, reason, 1.0)
        };
        Box::pin(async move { outcome })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_test_utils::agent;

    #[tokio::test]
    async fn preserves_first_mention_order() {
        let agents = vec![agent("a"), agent("b")];
        let state = OrchestrationState::default();

        let outcome = TagOnlyStrategy.route("@b please go, then @a", &agents, &state).await;
        assert_eq!(outcome.target_agent_ids, vec!["b".to_string(), "a".to_string()]);

        let outcome = TagOnlyStrategy.route("@a please go, then @b", &agents, &state).await;
        assert_eq!(outcome.target_agent_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn deduplicates_repeated_mentions() {
        let agents = vec![agent("a"), agent("b")];
        let outcome = TagOnlyStrategy
            .route("@a and @A again, plus @b", &agents, &OrchestrationState::default())
            .await;
        assert_eq!(outcome.target_agent_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn matches_case_insensitively() {
        let agents = vec![agent("Coder")];
        let outcome = TagOnlyStrategy
            .route("hey @coder", &agents, &OrchestrationState::default())
            .await;
        assert_eq!(outcome.target_agent_ids, vec!["Coder".to_string()]);
    }

    #[tokio::test]
    async fn no_match_yields_help_with_full_roster() {
        let agents = vec![agent("a"), agent("b"), agent("c")];
        let outcome = TagOnlyStrategy
            .route("nobody mentioned here", &agents, &OrchestrationState::default())
            .await;
        assert!(outcome.is_help_message);
        assert!(outcome.target_agent_ids.is_empty());
        let help = outcome.help_content.unwrap();
        for id in ["a", "b", "c"] {
            assert_eq!(help.matches(&format!("@{}", id)).count(), 1);
        }
    }

    #[tokio::test]
    async fn unknown_mentions_are_ignored() {
        let agents = vec![agent("a")];
        let outcome = TagOnlyStrategy
            .route("@ghost and @a", &agents, &OrchestrationState::default())
            .await;
        assert_eq!(outcome.target_agent_ids, vec!["a".to_string()]);
    }

    #[test]
    fn mention_extraction_accepts_hyphens() {
        let mentions = extract_mentions("ping @web-search and @a2");
        assert_eq!(mentions, vec!["web-search".to_string(), "a2".to_string()]);
    }
}
