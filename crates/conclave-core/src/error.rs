use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConclaveError {
    // Configuration errors — the only class fatal at construction time
    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Routing errors (strategies themselves never return these; the engine
    // does when an invocation has no viable target at construction)
    #[error("Routing failure: {0}")]
    RoutingFailure(String),

    // Worker errors
    #[error("Worker execution failed for agent '{agent_id}': {message}")]
    WorkerExecution { agent_id: String, message: String },

    #[error("Worker timed out for agent '{agent_id}' after {timeout_secs}s")]
    Timeout { agent_id: String, timeout_secs: u64 },

    #[error("Invocation cancelled")]
    Cancelled,

    // LLM errors (routing/analysis model calls)
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Budget errors (reported as events in the engine; the error form is
    // for callers bypassing the event pipeline)
    #[error("Budget exceeded for '{scope}': {limiter}")]
    BudgetExceeded { scope: String, limiter: String },

    #[error("Rate limited: agent '{agent_id}' exceeded {limit} invocations per minute")]
    RateLimited { agent_id: String, limit: u32 },

    // MCP / tool gateway errors
    #[error("MCP connection error: {0}")]
    McpConnection(String),

    #[error("MCP call timed out after {timeout_secs}s: {server}/{tool}")]
    McpTimeout {
        server: String,
        tool: String,
        timeout_secs: u64,
    },

    #[error("MCP circuit open for server '{server}' (agent '{agent_id}')")]
    McpCircuitOpen { server: String, agent_id: String },

    // Approval errors
    #[error("Approval denied for tool {tool}: {reason}")]
    ApprovalDenied { tool: String, reason: String },

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConclaveError>;
