use std::sync::Arc;

use tracing::{info, warn};

use conclave_core::config::AgentProfile;
use conclave_core::traits::ChatModel;
use conclave_core::types::EvaluatorVerdict;

use crate::state::OrchestrationState;

use super::extract_json_object;

/// Post-turn completion judge: decides whether the task is done and, if
/// not, which agent continues with what guidance.
pub struct Evaluator {
    model: Arc<dyn ChatModel>,
    mission: String,
}

impl Evaluator {
    pub fn new(model: Arc<dyn ChatModel>, mission: impl Into<String>) -> Self {
        Self {
            model,
            mission: mission.into(),
        }
    }

    /// Judge the state of the task after a worker turn. Increments the
    /// round counter, then forces completion once `max_rounds` is
    /// reached. Model failure or an unknown `next_agent_id` also
    /// completes — the loop must never run away on a broken judge.
    pub async fn evaluate(
        &self,
        original_message: &str,
        agents: &[AgentProfile],
        state: &mut OrchestrationState,
    ) -> EvaluatorVerdict {
        state.round += 1;

        if state.round >= state.max_rounds {
            info!(round = state.round, max_rounds = state.max_rounds, "Round cap reached, forcing completion");
            return EvaluatorVerdict {
                is_complete: true,
                reason: Some(format!("round cap of {} reached", state.max_rounds)),
                ..Default::default()
            };
        }

        let transcript: String = state
            .messages
            .iter()
            .map(|m| format!("{}: {}\n", m.speaker(), m.text))
            .collect();
        let roster: String = agents
            .iter()
            .map(|a| format!("- {} ({})\n", a.id, a.role))
            .collect();
        let system = format!(
            r#"You are evaluating a team of AI agents working on a task.
Mission: {}

Team roster:
{}
Respond with ONLY valid JSON:
{{
  "is_complete": true/false,
  "next_agent_id": "agent-id to continue, or null when complete",
  "reason": "brief explanation",
  "guidance": "focus for the next agent, or null",
  "summary": "one-line task summary, or null"
}}"#,
            self.mission, roster
        );
        let user = format!(
            "Original request: {}\n\nConversation so far (round {} of {}):\n{}",
            original_message, state.round, state.max_rounds, transcript
        );

        let reply = match self.model.invoke(&system, &user).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Evaluator call failed, completing the task");
                return fail_safe("evaluator unavailable");
            }
        };

        let mut verdict = match extract_json_object(&reply)
            .and_then(|json| serde_json::from_str::<EvaluatorVerdict>(json).ok())
        {
            Some(verdict) => verdict,
            None => {
                warn!(reply = %reply, "Evaluator reply was not valid JSON, completing the task");
                return fail_safe("evaluator reply unparseable");
            }
        };

        if let Some(next) = &verdict.next_agent_id {
            if !agents.iter().any(|a| a.id.eq_ignore_ascii_case(next)) {
                warn!(next_agent_id = %next, "Evaluator chose an unknown agent, completing the task");
                verdict.is_complete = true;
                verdict.next_agent_id = None;
            }
        }
        if !verdict.is_complete && verdict.next_agent_id.is_none() {
            verdict.is_complete = true;
        }

        verdict
    }
}

fn fail_safe(reason: &str) -> EvaluatorVerdict {
    EvaluatorVerdict {
        is_complete: true,
        reason: Some(reason.to_string()),
        ..Default::default()
    }
}
