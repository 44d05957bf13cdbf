use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ConclaveError, Result};

/// How the team decides who speaks next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    /// Deterministic round-robin over the roster.
    #[default]
    Sequential,
    /// Only @-mentioned agents speak.
    TagOnly,
    /// Every agent answers every message, concurrently.
    FreeChat,
    /// A routing model picks the targets.
    Dynamic,
}

/// One configured AI participant. Immutable for the session's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Unique per team; matched case-insensitively against @mentions.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub instructions: String,
    /// Opaque model/provider reference resolved by the worker backend.
    pub model: String,
    /// Empty means chat-only.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
}

impl AgentProfile {
    pub fn is_chat_only(&self) -> bool {
        self.allowed_tools.is_empty()
    }
}

/// Orchestrator middleware configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Id the orchestrator answers to when @-mentioned directly.
    #[serde(default = "default_orchestrator_id")]
    pub id: String,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Model reference for analysis/evaluation calls.
    pub model: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            id: default_orchestrator_id(),
            max_rounds: default_max_rounds(),
            model: "default".to_string(),
        }
    }
}

/// Token/rate ceilings enforced by the budget tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_agent_token_limit")]
    pub agent_token_limit: u64,
    #[serde(default = "default_session_token_limit")]
    pub session_token_limit: u64,
    /// Max invocations per agent inside the sliding 60 s window.
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            agent_token_limit: default_agent_token_limit(),
            session_token_limit: default_session_token_limit(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
        }
    }
}

/// History windowing strategy applied before each worker turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum WindowConfig {
    /// Keep the most recent N messages.
    FixedCount { max_messages: usize },
    /// Keep the newest messages that fit a token budget.
    TokenBudget { max_tokens: usize },
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self::TokenBudget {
            max_tokens: default_window_tokens(),
        }
    }
}

/// Conversation compaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Model reference for the cheap summarization call.
    #[serde(default = "default_compaction_model")]
    pub model: String,
    /// Skip compaction when fewer messages than this were dropped.
    #[serde(default = "default_min_dropped")]
    pub min_dropped_messages: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_compaction_model(),
            min_dropped_messages: default_min_dropped(),
        }
    }
}

/// Engine plumbing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bounded event channel capacity for `stream()`.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Hard wall-clock deadline for chat workers.
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_secs: u64,
    /// Idle timeout for tool workers, reset on forward progress.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Default agent id for dynamic-routing fallback (first agent if unset).
    #[serde(default)]
    pub default_agent: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
            worker_timeout_secs: default_worker_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            default_agent: None,
        }
    }
}

/// Circuit breaker settings for the tool gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Per-call timeout raced against every tool invocation.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

/// Immutable per-session team configuration. Built once per session and
/// rebuilt only when the participant roster changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    #[serde(default)]
    pub mission: String,
    pub agents: Vec<AgentProfile>,
    #[serde(default)]
    pub mode: ConversationMode,
    #[serde(default)]
    pub orchestrator: Option<OrchestratorConfig>,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl TeamConfig {
    /// Validate the configuration. This is the only construction-time
    /// check that is fatal to an invocation.
    pub fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(ConclaveError::ConfigValidation(
                "team has no agents".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.is_empty() {
                return Err(ConclaveError::ConfigValidation(
                    "agent id must not be empty".to_string(),
                ));
            }
            if !agent
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                return Err(ConclaveError::ConfigValidation(format!(
                    "agent id '{}' must be alphanumeric/hyphen",
                    agent.id
                )));
            }
            if !seen.insert(agent.id.to_ascii_lowercase()) {
                return Err(ConclaveError::ConfigValidation(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
        }

        if let Some(ref orch) = self.orchestrator {
            if orch.max_rounds == 0 {
                return Err(ConclaveError::ConfigValidation(
                    "orchestrator max_rounds must be at least 1".to_string(),
                ));
            }
        }

        if self.budget.agent_token_limit == 0 || self.budget.session_token_limit == 0 {
            return Err(ConclaveError::ConfigValidation(
                "token limits must be positive".to_string(),
            ));
        }

        if let Some(ref default_agent) = self.engine.default_agent {
            if !self.agents.iter().any(|a| &a.id == default_agent) {
                return Err(ConclaveError::ConfigValidation(format!(
                    "default agent '{}' is not on the roster",
                    default_agent
                )));
            }
        }

        Ok(())
    }

    pub fn agent(&self, id: &str) -> Option<&AgentProfile> {
        self.agents
            .iter()
            .find(|a| a.id.eq_ignore_ascii_case(id))
    }
}

fn default_orchestrator_id() -> String {
    "orchestrator".to_string()
}

fn default_max_rounds() -> u32 {
    5
}

fn default_agent_token_limit() -> u64 {
    200_000
}

fn default_session_token_limit() -> u64 {
    1_000_000
}

fn default_rate_limit_per_minute() -> u32 {
    20
}

fn default_window_tokens() -> usize {
    16_000
}

fn default_compaction_model() -> String {
    "default".to_string()
}

fn default_min_dropped() -> usize {
    4
}

fn default_event_buffer() -> usize {
    256
}

fn default_worker_timeout() -> u64 {
    120
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_call_timeout() -> u64 {
    30
}
