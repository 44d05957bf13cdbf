use std::sync::Arc;

use tracing::{debug, warn};

use conclave_core::config::AgentProfile;
use conclave_core::traits::ChatModel;
use conclave_core::types::{ChatMessage, Complexity, OrchestratorAnalysis};

use super::extract_json_object;

/// Pre-routing analysis pass: classifies the user message, selects
/// agents, and optionally drafts an approval-gated plan.
pub struct Analyzer {
    model: Arc<dyn ChatModel>,
    mission: String,
}

impl Analyzer {
    pub fn new(model: Arc<dyn ChatModel>, mission: impl Into<String>) -> Self {
        Self {
            model,
            mission: mission.into(),
        }
    }

    fn system_prompt(&self, agents: &[AgentProfile]) -> String {
        let roster: String = agents
            .iter()
            .map(|a| format!("- {} ({}): {}\n", a.id, a.name, a.role))
            .collect();
        format!(
            r#"You are the orchestrator of a team of AI agents.
Mission: {}

Team roster:
{}
Analyze the user's message and respond with ONLY valid JSON in this format:
{{
  "intent": "what the user wants",
  "complexity": "simple" | "moderate" | "complex",
  "safety_flags": [],
  "selected_agents": ["agent-id"],
  "agent_instructions": {{"agent-id": "what this agent should focus on"}},
  "plan": {{"steps": [{{"agent_id": "...", "action": "...", "depends_on": []}}]}} or null,
  "direct_response": "answer directly, only when no agent is needed" or null,
  "needs_approval": true/false
}}"#,
            self.mission, roster
        )
    }

    /// Analyze one user message against the roster. Never fails: an
    /// unparseable or empty selection degrades to every configured agent
    /// at simple complexity.
    pub async fn analyze(
        &self,
        message: &str,
        agents: &[AgentProfile],
        history: &[ChatMessage],
    ) -> OrchestratorAnalysis {
        let system = self.system_prompt(agents);
        let tail: String = history
            .iter()
            .rev()
            .take(6)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|m| format!("{}: {}\n", m.speaker(), m.text))
            .collect();
        let user = format!("Recent conversation:\n{}\nUser message: {}", tail, message);

        let reply = match self.model.invoke(&system, &user).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Analyzer call failed, selecting full roster");
                return fallback(agents);
            }
        };

        let mut analysis = match extract_json_object(&reply)
            .and_then(|json| serde_json::from_str::<OrchestratorAnalysis>(json).ok())
        {
            Some(analysis) => analysis,
            None => {
                warn!(reply = %reply, "Analyzer reply was not valid JSON, selecting full roster");
                return fallback(agents);
            }
        };

        // Unknown agent ids are dropped; if nothing survives and the
        // orchestrator isn't answering directly, degrade to the roster.
        analysis
            .selected_agents
            .retain(|id| agents.iter().any(|a| a.id.eq_ignore_ascii_case(id)));
        if analysis.selected_agents.is_empty() && analysis.direct_response.is_none() {
            debug!("Analyzer selected no known agents, using full roster");
            analysis.selected_agents = agents.iter().map(|a| a.id.clone()).collect();
            analysis.complexity = Complexity::Simple;
        }

        analysis
    }
}

fn fallback(agents: &[AgentProfile]) -> OrchestratorAnalysis {
    OrchestratorAnalysis {
        intent: "unclassified".to_string(),
        complexity: Complexity::Simple,
        selected_agents: agents.iter().map(|a| a.id.clone()).collect(),
        ..Default::default()
    }
}
