use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use conclave_core::config::BudgetConfig;
use conclave_core::types::{SessionId, TokenUsage};

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Which limiter tripped, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limiter {
    AgentTokens,
    SessionTokens,
    RatePerMinute,
}

impl std::fmt::Display for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Limiter::AgentTokens => "agent_tokens",
            Limiter::SessionTokens => "session_tokens",
            Limiter::RatePerMinute => "rate_per_minute",
        };
        write!(f, "{}", s)
    }
}

/// Allowed or denied, with the limiter that tripped. A denial is a
/// signal for a `budget_exceeded` event, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetVerdict {
    Allowed,
    Denied(Limiter),
}

impl BudgetVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BudgetVerdict::Allowed)
    }
}

/// Per-session mutable counters. Lives for the session's lifetime; only
/// the invocation driving task writes it.
#[derive(Debug, Default)]
struct BudgetState {
    agent_tokens: HashMap<String, u64>,
    session_tokens: u64,
    /// Sliding window of invocation timestamps per agent, pruned lazily.
    invocations: HashMap<String, VecDeque<Instant>>,
}

/// Point-in-time budget snapshot for `get_budget_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub session_tokens: u64,
    pub session_token_limit: u64,
    pub agent_tokens: HashMap<String, u64>,
    pub agent_token_limit: u64,
    pub recent_invocations: HashMap<String, u32>,
}

/// Token/rate limiting with pre-flight checks and post-hoc usage
/// recording. The tracker never executes anything itself.
pub struct BudgetTracker {
    config: BudgetConfig,
    sessions: Mutex<HashMap<SessionId, BudgetState>>,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate, in order: per-agent token ceiling, per-session token
    /// ceiling, sliding 60 s invocation rate. Records the invocation
    /// timestamp when allowed.
    pub async fn check_budget(&self, session: &SessionId, agent_id: &str) -> BudgetVerdict {
        let mut sessions = self.sessions.lock().await;
        let state = sessions.entry(session.clone()).or_default();

        let agent_total = state.agent_tokens.get(agent_id).copied().unwrap_or(0);
        if agent_total >= self.config.agent_token_limit {
            debug!(agent_id, agent_total, "Budget denied: agent token ceiling");
            return BudgetVerdict::Denied(Limiter::AgentTokens);
        }

        if state.session_tokens >= self.config.session_token_limit {
            debug!(agent_id, session_tokens = state.session_tokens, "Budget denied: session token ceiling");
            return BudgetVerdict::Denied(Limiter::SessionTokens);
        }

        let now = Instant::now();
        let window = state.invocations.entry(agent_id.to_string()).or_default();
        // Lazy pruning: drop timestamps older than the window on each check.
        while window
            .front()
            .map(|t| now.duration_since(*t) > RATE_WINDOW)
            .unwrap_or(false)
        {
            window.pop_front();
        }
        if window.len() as u32 >= self.config.rate_limit_per_minute {
            debug!(agent_id, in_window = window.len(), "Budget denied: rate limit");
            return BudgetVerdict::Denied(Limiter::RatePerMinute);
        }

        window.push_back(now);
        BudgetVerdict::Allowed
    }

    /// Record real token counts after a turn completes.
    pub async fn record_usage(&self, session: &SessionId, agent_id: &str, usage: TokenUsage) {
        let mut sessions = self.sessions.lock().await;
        let state = sessions.entry(session.clone()).or_default();
        *state.agent_tokens.entry(agent_id.to_string()).or_insert(0) += usage.total();
        state.session_tokens += usage.total();
    }

    pub async fn status(&self, session: &SessionId) -> BudgetStatus {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let state = sessions.entry(session.clone()).or_default();

        let recent_invocations = state
            .invocations
            .iter()
            .map(|(id, window)| {
                let n = window
                    .iter()
                    .filter(|t| now.duration_since(**t) <= RATE_WINDOW)
                    .count() as u32;
                (id.clone(), n)
            })
            .collect();

        BudgetStatus {
            session_tokens: state.session_tokens,
            session_token_limit: self.config.session_token_limit,
            agent_tokens: state.agent_tokens.clone(),
            agent_token_limit: self.config.agent_token_limit,
            recent_invocations,
        }
    }

    /// Forget a session's counters (`/reset`).
    pub async fn reset(&self, session: &SessionId) {
        self.sessions.lock().await.remove(session);
    }

    #[cfg(test)]
    async fn backdate_invocations(&self, session: &SessionId, agent_id: &str, n: usize, age: Duration) {
        let mut sessions = self.sessions.lock().await;
        let state = sessions.entry(session.clone()).or_default();
        let window = state.invocations.entry(agent_id.to_string()).or_default();
        let stamp = Instant::now() - age;
        for _ in 0..n {
            window.push_back(stamp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(agent: u64, session: u64, rate: u32) -> BudgetTracker {
        BudgetTracker::new(BudgetConfig {
            agent_token_limit: agent,
            session_token_limit: session,
            rate_limit_per_minute: rate,
        })
    }

    fn usage(tokens: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: 0,
            output_tokens: tokens,
        }
    }

    #[tokio::test]
    async fn allows_under_all_limits() {
        let t = tracker(100, 1000, 5);
        let sid = SessionId::from_str("s");
        assert!(t.check_budget(&sid, "a").await.is_allowed());
    }

    #[tokio::test]
    async fn agent_ceiling_checked_before_session_ceiling() {
        let t = tracker(50, 60, 100);
        let sid = SessionId::from_str("s");
        t.record_usage(&sid, "a", usage(70)).await;
        // Both ceilings are breached; the per-agent one is reported first.
        assert_eq!(
            t.check_budget(&sid, "a").await,
            BudgetVerdict::Denied(Limiter::AgentTokens)
        );
    }

    #[tokio::test]
    async fn session_ceiling_pools_across_agents() {
        let t = tracker(100, 120, 100);
        let sid = SessionId::from_str("s");
        t.record_usage(&sid, "a", usage(80)).await;
        t.record_usage(&sid, "b", usage(50)).await;
        assert_eq!(
            t.check_budget(&sid, "c").await,
            BudgetVerdict::Denied(Limiter::SessionTokens)
        );
    }

    #[tokio::test]
    async fn rate_limit_trips_at_window_capacity() {
        let t = tracker(1000, 10_000, 3);
        let sid = SessionId::from_str("s");
        for _ in 0..3 {
            assert!(t.check_budget(&sid, "a").await.is_allowed());
        }
        assert_eq!(
            t.check_budget(&sid, "a").await,
            BudgetVerdict::Denied(Limiter::RatePerMinute)
        );
        // A different agent has its own window.
        assert!(t.check_budget(&sid, "b").await.is_allowed());
    }

    #[tokio::test]
    async fn stale_timestamps_are_pruned() {
        let t = tracker(1000, 10_000, 3);
        let sid = SessionId::from_str("s");
        t.backdate_invocations(&sid, "a", 3, Duration::from_secs(61)).await;
        // All three are older than 60 s, so the window is effectively empty.
        assert!(t.check_budget(&sid, "a").await.is_allowed());
    }

    #[tokio::test]
    async fn fresh_timestamps_still_count() {
        let t = tracker(1000, 10_000, 3);
        let sid = SessionId::from_str("s");
        t.backdate_invocations(&sid, "a", 3, Duration::from_secs(10)).await;
        assert_eq!(
            t.check_budget(&sid, "a").await,
            BudgetVerdict::Denied(Limiter::RatePerMinute)
        );
    }

    #[tokio::test]
    async fn status_reports_counters() {
        let t = tracker(100, 1000, 5);
        let sid = SessionId::from_str("s");
        t.record_usage(&sid, "a", usage(42)).await;
        t.check_budget(&sid, "a").await;

        let status = t.status(&sid).await;
        assert_eq!(status.session_tokens, 42);
        assert_eq!(status.agent_tokens.get("a"), Some(&42));
        assert_eq!(status.recent_invocations.get("a"), Some(&1));
    }

    #[tokio::test]
    async fn reset_clears_session() {
        let t = tracker(50, 1000, 5);
        let sid = SessionId::from_str("s");
        t.record_usage(&sid, "a", usage(60)).await;
        assert!(!t.check_budget(&sid, "a").await.is_allowed());
        t.reset(&sid).await;
        assert!(t.check_budget(&sid, "a").await.is_allowed());
    }
}
