use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::AgentProfile;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::event::EventSink;
use crate::types::{AgentResponse, ChatMessage, WorkerKind};

/// Minimal chat-model capability — the only LLM surface the engine sees.
/// Routing, analysis, evaluation, compaction, and orchestrator direct
/// replies all go through this; any backend satisfying it is
/// interchangeable.
pub trait ChatModel: Send + Sync + 'static {
    /// One-shot invocation returning the full response text.
    fn invoke(&self, system_prompt: &str, user_message: &str) -> BoxFuture<'_, Result<String>>;

    /// Streaming invocation yielding response text chunks.
    fn stream(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>>;
}

/// Uniform interface executing one agent turn against any backend.
///
/// Contract: emit exactly one `AgentStart`, zero or more `AgentToken`,
/// then exactly one `AgentComplete` or `AgentError` on the sink; honor the
/// context's cancellation token by aborting mid-stream; honor its timeout
/// per the backend's documented semantics (hard deadline or idle).
pub trait WorkerExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        agent: &AgentProfile,
        message: &str,
        history: &[ChatMessage],
        ctx: &ExecutionContext,
        sink: &EventSink,
        trace_id: &str,
    ) -> BoxFuture<'_, Result<AgentResponse>>;

    /// Bring up MCP connections for tool-capable backends. Chat-only
    /// backends may no-op.
    fn initialize_mcp(&self) -> BoxFuture<'_, Result<()>>;

    /// Release backend resources.
    fn dispose(&self) -> BoxFuture<'_, Result<()>>;

    fn kind(&self) -> WorkerKind;
}

/// Checkpoint collaborator for paused invocations (approval gates).
/// Snapshots are opaque JSON; the storage format is the implementor's
/// concern.
pub trait ThreadStore: Send + Sync + 'static {
    fn save(&self, thread_id: &str, snapshot: serde_json::Value) -> BoxFuture<'_, Result<()>>;

    fn load(&self, thread_id: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>>;
}

/// One external MCP tool server as seen by the gateway.
pub trait ToolServer: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn call(
        &self,
        tool: &str,
        args: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}
