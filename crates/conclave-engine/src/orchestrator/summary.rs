use std::collections::HashSet;

use conclave_core::types::{ChatMessage, RoundSummary, TaskCompletionSummary};

const CONTRIBUTION_CHARS: usize = 200;

/// Rebuild a completion summary from the message log instead of trusting
/// the model's own prose. A new round starts whenever an agent that
/// already spoke in the current round speaks again.
pub fn build_completion_summary(messages: &[ChatMessage]) -> TaskCompletionSummary {
    let mut rounds = Vec::new();
    let mut participating: Vec<String> = Vec::new();
    let mut seen_this_round: HashSet<String> = HashSet::new();
    let mut round = 1u32;

    for msg in messages {
        let Some(agent_id) = &msg.agent_id else {
            continue;
        };
        if msg.synthetic {
            continue;
        }

        if seen_this_round.contains(agent_id) {
            round += 1;
            seen_this_round.clear();
        }
        seen_this_round.insert(agent_id.clone());

        if !participating.iter().any(|id| id == agent_id) {
            participating.push(agent_id.clone());
        }

        let mut contribution: String = msg.text.chars().take(CONTRIBUTION_CHARS).collect();
        if msg.text.chars().count() > CONTRIBUTION_CHARS {
            contribution.push('…');
        }
        rounds.push(RoundSummary {
            round,
            agent_id: agent_id.clone(),
            contribution,
        });
    }

    TaskCompletionSummary {
        rounds,
        participating_agents: participating,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_consecutive_speakers_into_rounds() {
        let messages = vec![
            ChatMessage::user("go"),
            ChatMessage::agent("a", "first pass"),
            ChatMessage::agent("b", "review one"),
            ChatMessage::agent("a", "second pass"),
            ChatMessage::agent("b", "review two"),
            ChatMessage::agent("a", "final"),
        ];

        let summary = build_completion_summary(&messages);
        let rounds: Vec<u32> = summary.rounds.iter().map(|r| r.round).collect();
        assert_eq!(rounds, vec![1, 1, 2, 2, 3]);
        assert_eq!(summary.participating_agents, vec!["a", "b"]);
    }

    #[test]
    fn user_and_synthetic_messages_are_skipped() {
        let messages = vec![
            ChatMessage::user("hello"),
            ChatMessage::summary("earlier context"),
            ChatMessage::agent("a", "reply"),
        ];

        let summary = build_completion_summary(&messages);
        assert_eq!(summary.rounds.len(), 1);
        assert_eq!(summary.participating_agents, vec!["a"]);
    }

    #[test]
    fn long_contributions_are_truncated() {
        let long = "x".repeat(500);
        let messages = vec![ChatMessage::agent("a", long)];

        let summary = build_completion_summary(&messages);
        assert!(summary.rounds[0].contribution.chars().count() <= CONTRIBUTION_CHARS + 1);
        assert!(summary.rounds[0].contribution.ends_with('…'));
    }

    #[test]
    fn empty_log_yields_empty_summary() {
        let summary = build_completion_summary(&[]);
        assert!(summary.rounds.is_empty());
        assert!(summary.participating_agents.is_empty());
    }
}
