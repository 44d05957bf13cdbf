use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use conclave_core::config::BreakerConfig;
use conclave_core::traits::ToolServer;

use crate::breaker::{BreakerState, CircuitBreaker};

/// Structured result of one tool invocation. The gateway never propagates
/// tool failures as errors — callers branch on the outcome.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Success(serde_json::Value),
    Error(String),
    Timeout { timeout_secs: u64 },
    CircuitOpen { retry_in_ms: Option<u64> },
}

/// Breaker status for one (agent, server) pair, as reported by `health()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub agent_id: String,
    pub server: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub retry_in_ms: Option<u64>,
}

/// Gateway health snapshot: registered servers plus every breaker that
/// has seen traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpHealth {
    pub servers: Vec<String>,
    pub breakers: Vec<BreakerStatus>,
}

impl McpHealth {
    /// True when no breaker is open.
    pub fn all_clear(&self) -> bool {
        self.breakers
            .iter()
            .all(|b| b.state != BreakerState::Open)
    }
}

/// Failure-isolating front door for all external tool calls.
///
/// One circuit breaker per (agent, tool-server) pair, so a server flapping
/// for one agent never blocks another agent's calls. Every invocation
/// races a per-call timeout.
pub struct ToolGateway {
    servers: HashMap<String, Arc<dyn ToolServer>>,
    breakers: Mutex<HashMap<(String, String), CircuitBreaker>>,
    config: BreakerConfig,
}

impl ToolGateway {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            servers: HashMap::new(),
            breakers: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn register(&mut self, server: Arc<dyn ToolServer>) {
        self.servers.insert(server.name().to_string(), server);
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke `tool` on `server` on behalf of `agent_id`.
    pub async fn invoke(
        &self,
        agent_id: &str,
        server: &str,
        tool: &str,
        args: serde_json::Value,
    ) -> ToolOutcome {
        let Some(backend) = self.servers.get(server) else {
            return ToolOutcome::Error(format!("unknown tool server '{}'", server));
        };

        let key = (agent_id.to_string(), server.to_string());

        // Pre-flight: consult the breaker without holding the lock across
        // the actual call.
        {
            let mut breakers = self.breakers.lock().await;
            let breaker = breakers
                .entry(key.clone())
                .or_insert_with(|| CircuitBreaker::new(self.config.clone()));
            if !breaker.can_execute() {
                warn!(agent_id, server, tool, "Tool call rejected: circuit open");
                return ToolOutcome::CircuitOpen {
                    retry_in_ms: breaker.retry_in_ms(),
                };
            }
        }

        let timeout = Duration::from_secs(self.config.call_timeout_secs);
        let outcome = match tokio::time::timeout(timeout, backend.call(tool, args)).await {
            Ok(Ok(value)) => ToolOutcome::Success(value),
            Ok(Err(e)) => ToolOutcome::Error(e.to_string()),
            Err(_) => ToolOutcome::Timeout {
                timeout_secs: self.config.call_timeout_secs,
            },
        };

        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(key)
            .or_insert_with(|| CircuitBreaker::new(self.config.clone()));
        match &outcome {
            ToolOutcome::Success(_) => breaker.record_success(),
            _ => {
                debug!(agent_id, server, tool, "Tool call failed, recording on breaker");
                breaker.record_failure();
            }
        }

        outcome
    }

    /// Snapshot of server registrations and breaker states.
    pub async fn health(&self) -> McpHealth {
        let breakers = self.breakers.lock().await;
        let mut statuses: Vec<BreakerStatus> = breakers
            .iter()
            .map(|((agent_id, server), b)| BreakerStatus {
                agent_id: agent_id.clone(),
                server: server.clone(),
                state: b.state(),
                failure_count: b.failure_count(),
                retry_in_ms: b.retry_in_ms(),
            })
            .collect();
        statuses.sort_by(|a, b| (&a.agent_id, &a.server).cmp(&(&b.agent_id, &b.server)));

        McpHealth {
            servers: self.server_names(),
            breakers: statuses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::future::BoxFuture;

    use conclave_core::error::{ConclaveError, Result};

    /// Fails the first `fail_first` calls, then succeeds. An optional
    /// delay simulates a slow server.
    struct FlakyServer {
        name: String,
        fail_first: u32,
        calls: AtomicU32,
        delay: Duration,
    }

    impl FlakyServer {
        fn new(name: &str, fail_first: u32) -> Self {
            Self {
                name: name.to_string(),
                fail_first,
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }

        fn slow(name: &str, delay: Duration) -> Self {
            Self {
                name: name.to_string(),
                fail_first: 0,
                calls: AtomicU32::new(0),
                delay,
            }
        }
    }

    impl ToolServer for FlakyServer {
        fn name(&self) -> &str {
            &self.name
        }

        fn call(&self, tool: &str, _args: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
            let tool = tool.to_string();
            Box::pin(async move {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.fail_first {
                    Err(ConclaveError::McpConnection(format!(
                        "simulated failure on {}",
                        tool
                    )))
                } else {
                    Ok(serde_json::json!({ "tool": tool, "ok": true }))
                }
            })
        }
    }

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 2,
            base_backoff_ms: 20,
            max_backoff_ms: 100,
            call_timeout_secs: 1,
        }
    }

    fn gateway_with(server: FlakyServer) -> ToolGateway {
        let mut gw = ToolGateway::new(fast_config());
        gw.register(Arc::new(server));
        gw
    }

    #[tokio::test]
    async fn success_passes_through() {
        let gw = gateway_with(FlakyServer::new("fs", 0));
        let outcome = gw.invoke("coder", "fs", "read", serde_json::json!({})).await;
        assert!(matches!(outcome, ToolOutcome::Success(_)));
    }

    #[tokio::test]
    async fn unknown_server_is_an_error_outcome() {
        let gw = ToolGateway::new(fast_config());
        let outcome = gw.invoke("coder", "ghost", "read", serde_json::json!({})).await;
        assert!(matches!(outcome, ToolOutcome::Error(_)));
    }

    #[tokio::test]
    async fn circuit_opens_after_consecutive_failures() {
        let gw = gateway_with(FlakyServer::new("fs", 10));
        for _ in 0..2 {
            let outcome = gw.invoke("coder", "fs", "read", serde_json::json!({})).await;
            assert!(matches!(outcome, ToolOutcome::Error(_)));
        }
        let outcome = gw.invoke("coder", "fs", "read", serde_json::json!({})).await;
        assert!(matches!(outcome, ToolOutcome::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn breakers_are_isolated_per_agent() {
        let gw = gateway_with(FlakyServer::new("fs", 2));
        for _ in 0..2 {
            gw.invoke("coder", "fs", "read", serde_json::json!({})).await;
        }
        // Coder's breaker is open, but the writer's pair is untouched and
        // the server has recovered.
        let open = gw.invoke("coder", "fs", "read", serde_json::json!({})).await;
        assert!(matches!(open, ToolOutcome::CircuitOpen { .. }));
        let fresh = gw.invoke("writer", "fs", "read", serde_json::json!({})).await;
        assert!(matches!(fresh, ToolOutcome::Success(_)));
    }

    #[tokio::test]
    async fn probe_success_recloses_circuit() {
        let gw = gateway_with(FlakyServer::new("fs", 2));
        for _ in 0..2 {
            gw.invoke("coder", "fs", "read", serde_json::json!({})).await;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Half-open probe hits the now-recovered server.
        let probe = gw.invoke("coder", "fs", "read", serde_json::json!({})).await;
        assert!(matches!(probe, ToolOutcome::Success(_)));
        let next = gw.invoke("coder", "fs", "read", serde_json::json!({})).await;
        assert!(matches!(next, ToolOutcome::Success(_)));
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let mut gw = ToolGateway::new(BreakerConfig {
            call_timeout_secs: 1,
            ..fast_config()
        });
        gw.register(Arc::new(FlakyServer::slow("slow", Duration::from_secs(5))));
        let outcome = gw.invoke("coder", "slow", "read", serde_json::json!({})).await;
        assert!(matches!(outcome, ToolOutcome::Timeout { timeout_secs: 1 }));
    }

    #[tokio::test]
    async fn health_reports_open_breakers() {
        let gw = gateway_with(FlakyServer::new("fs", 10));
        for _ in 0..2 {
            gw.invoke("coder", "fs", "read", serde_json::json!({})).await;
        }
        let health = gw.health().await;
        assert_eq!(health.servers, vec!["fs".to_string()]);
        assert_eq!(health.breakers.len(), 1);
        assert_eq!(health.breakers[0].state, BreakerState::Open);
        assert!(!health.all_clear());
    }
}
