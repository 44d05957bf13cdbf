use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, warn};

use conclave_core::config::AgentProfile;
use conclave_core::context::ExecutionContext;
use conclave_core::error::{ConclaveError, Result};
use conclave_core::event::{ErrorCode, EventSink, StreamEvent};
use conclave_core::traits::{ChatModel, WorkerExecutor};
use conclave_core::types::{AgentResponse, ChatMessage, TokenUsage, WorkerKind};
use conclave_mcp::{ToolGateway, ToolOutcome};

use crate::approval::ApprovalBroker;
use crate::orchestrator::extract_json_object;
use crate::window::estimate_tokens;

const MAX_TOOL_STEPS: usize = 8;

/// Tool invocation directive a tool-capable agent embeds in its reply.
#[derive(Debug, Deserialize)]
struct ToolDirective {
    server: String,
    tool: String,
    #[serde(default)]
    args: serde_json::Value,
}

fn build_system_prompt(agent: &AgentProfile, ctx: &ExecutionContext) -> String {
    let mut prompt = format!(
        "You are {} ({}), role: {}.\n{}",
        agent.name, agent.id, agent.role, agent.instructions
    );
    if let Some(guidance) = &ctx.orchestrator_guidance {
        prompt.push_str(&format!("\n\nGuidance for this turn: {}", guidance));
    }
    prompt
}

fn render_history(history: &[ChatMessage], message: &str) -> String {
    let mut rendered = String::new();
    for m in history {
        rendered.push_str(&format!("{}: {}\n", m.speaker(), m.text));
    }
    rendered.push_str(&format!("user: {}", message));
    rendered
}

async fn emit_error(sink: &EventSink, agent_id: &str, code: ErrorCode, message: &str) {
    sink.emit(StreamEvent::AgentError {
        agent_id: agent_id.to_string(),
        code,
        message: message.to_string(),
    })
    .await;
}

/// Chat-only backend: streams tokens from a `ChatModel` under a hard
/// wall-clock deadline (`ctx.timeout` bounds the whole turn).
pub struct ModelWorker {
    model: Arc<dyn ChatModel>,
}

impl ModelWorker {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

impl WorkerExecutor for ModelWorker {
    fn execute(
        &self,
        agent: &AgentProfile,
        message: &str,
        history: &[ChatMessage],
        ctx: &ExecutionContext,
        sink: &EventSink,
        trace_id: &str,
    ) -> BoxFuture<'_, Result<AgentResponse>> {
        let agent = agent.clone();
        let ctx = ctx.clone();
        let sink = sink.clone();
        let trace_id = trace_id.to_string();
        let system = build_system_prompt(&agent, &ctx);
        let user = render_history(history, message);

        Box::pin(async move {
            debug!(agent_id = %agent.id, trace_id = %trace_id, "Model worker starting");
            sink.emit(StreamEvent::AgentStart {
                agent_id: agent.id.clone(),
                reason: ctx.routing_reason.clone(),
            })
            .await;

            let deadline = tokio::time::sleep(ctx.timeout);
            tokio::pin!(deadline);

            let stream_result = tokio::select! {
                result = self.model.stream(&system, &user) => result,
                _ = ctx.cancellation.cancelled() => {
                    emit_error(&sink, &agent.id, ErrorCode::Cancelled, "cancelled before response").await;
                    return Err(ConclaveError::Cancelled);
                }
                _ = &mut deadline => {
                    let timeout_secs = ctx.timeout.as_secs();
                    emit_error(&sink, &agent.id, ErrorCode::Timeout, "deadline elapsed").await;
                    return Err(ConclaveError::Timeout { agent_id: agent.id.clone(), timeout_secs });
                }
            };

            let mut stream = match stream_result {
                Ok(s) => s,
                Err(e) => {
                    emit_error(&sink, &agent.id, ErrorCode::WorkerExecution, &e.to_string()).await;
                    return Err(ConclaveError::WorkerExecution {
                        agent_id: agent.id.clone(),
                        message: e.to_string(),
                    });
                }
            };

            let mut text = String::new();
            loop {
                let chunk = tokio::select! {
                    chunk = stream.next() => chunk,
                    _ = ctx.cancellation.cancelled() => {
                        emit_error(&sink, &agent.id, ErrorCode::Cancelled, "cancelled mid-stream").await;
                        return Err(ConclaveError::Cancelled);
                    }
                    _ = &mut deadline => {
                        let timeout_secs = ctx.timeout.as_secs();
                        emit_error(&sink, &agent.id, ErrorCode::Timeout, "deadline elapsed mid-stream").await;
                        return Err(ConclaveError::Timeout { agent_id: agent.id.clone(), timeout_secs });
                    }
                };

                match chunk {
                    Some(Ok(token)) => {
                        sink.emit(StreamEvent::AgentToken {
                            agent_id: agent.id.clone(),
                            token: token.clone(),
                        })
                        .await;
                        text.push_str(&token);
                    }
                    Some(Err(e)) => {
                        emit_error(&sink, &agent.id, ErrorCode::WorkerExecution, &e.to_string())
                            .await;
                        return Err(ConclaveError::WorkerExecution {
                            agent_id: agent.id.clone(),
                            message: e.to_string(),
                        });
                    }
                    None => break,
                }
            }

            let usage = TokenUsage {
                input_tokens: (estimate_tokens(&system) + estimate_tokens(&user)) as u64,
                output_tokens: estimate_tokens(&text) as u64,
            };
            sink.emit(StreamEvent::AgentComplete {
                agent_id: agent.id.clone(),
                text: text.clone(),
                usage: usage.clone(),
            })
            .await;

            Ok(AgentResponse {
                agent_id: agent.id,
                text,
                usage,
            })
        })
    }

    fn initialize_mcp(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn dispose(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Chat
    }
}

/// Tool-capable backend: alternates model calls with gateway tool calls.
///
/// `ctx.timeout` is an idle timeout here, reset on every completed model
/// or tool step, so long multi-tool turns survive as long as they keep
/// making forward progress. Tool directives are JSON objects in the
/// model's reply (`{"server": ..., "tool": ..., "args": ...}`); a reply
/// without one is the final answer.
pub struct ToolWorker {
    model: Arc<dyn ChatModel>,
    gateway: Arc<ToolGateway>,
    approvals: Arc<ApprovalBroker>,
    approval_required: HashSet<String>,
}

impl ToolWorker {
    pub fn new(
        model: Arc<dyn ChatModel>,
        gateway: Arc<ToolGateway>,
        approvals: Arc<ApprovalBroker>,
    ) -> Self {
        Self {
            model,
            gateway,
            approvals,
            approval_required: HashSet::new(),
        }
    }

    /// Mark tool names whose calls suspend on the approval broker.
    pub fn with_approval_required(
        mut self,
        tools: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.approval_required = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Path-taking args must fall under one of the agent's allowed
    /// prefixes. Empty allowance means unrestricted.
    fn paths_permitted(args: &serde_json::Value, allowed: &[String]) -> bool {
        if allowed.is_empty() {
            return true;
        }
        let Some(map) = args.as_object() else {
            return true;
        };
        for (key, value) in map {
            if !key.contains("path") {
                continue;
            }
            if let Some(path) = value.as_str() {
                if !allowed.iter().any(|prefix| path.starts_with(prefix)) {
                    return false;
                }
            }
        }
        true
    }

    /// Run one tool call end to end, including the approval gate.
    /// Returns the observation text to feed back to the model.
    async fn run_tool(
        &self,
        directive: &ToolDirective,
        ctx: &ExecutionContext,
        sink: &EventSink,
    ) -> String {
        if !ctx.tool_allowed(&directive.tool) {
            return format!("Tool '{}' is not permitted for this agent.", directive.tool);
        }
        if !ctx.unrestricted && !Self::paths_permitted(&directive.args, &ctx.allowed_paths) {
            return format!(
                "Tool '{}' call rejected: path outside the allowed directories.",
                directive.tool
            );
        }

        if self.approval_required.contains(&directive.tool) {
            let summary = directive.args.to_string();
            let rx = self
                .approvals
                .request(&ctx.agent_id, &directive.tool, &summary, sink)
                .await;
            let approved = tokio::select! {
                decision = rx => decision.map(|d| d.approved).unwrap_or(false),
                _ = ctx.cancellation.cancelled() => {
                    return "Tool call cancelled while awaiting approval.".to_string();
                }
            };
            if !approved {
                return format!("Tool '{}' call was denied by the user.", directive.tool);
            }
        }

        let outcome = self
            .gateway
            .invoke(
                &ctx.agent_id,
                &directive.server,
                &directive.tool,
                directive.args.clone(),
            )
            .await;

        match outcome {
            ToolOutcome::Success(value) => format!("Tool '{}' result: {}", directive.tool, value),
            ToolOutcome::Error(message) => {
                warn!(agent_id = %ctx.agent_id, tool = %directive.tool, error = %message, "Tool call failed");
                format!("Tool '{}' failed: {}", directive.tool, message)
            }
            ToolOutcome::Timeout { timeout_secs } => format!(
                "Tool '{}' timed out after {}s.",
                directive.tool, timeout_secs
            ),
            ToolOutcome::CircuitOpen { retry_in_ms } => match retry_in_ms {
                Some(ms) => format!(
                    "Tool server '{}' is unavailable (circuit open, retry in {}ms).",
                    directive.server, ms
                ),
                None => format!(
                    "Tool server '{}' is unavailable (circuit open).",
                    directive.server
                ),
            },
        }
    }
}

impl WorkerExecutor for ToolWorker {
    fn execute(
        &self,
        agent: &AgentProfile,
        message: &str,
        history: &[ChatMessage],
        ctx: &ExecutionContext,
        sink: &EventSink,
        trace_id: &str,
    ) -> BoxFuture<'_, Result<AgentResponse>> {
        let agent = agent.clone();
        let ctx = ctx.clone();
        let sink = sink.clone();
        let trace_id = trace_id.to_string();
        let system = build_system_prompt(&agent, &ctx);
        let mut transcript = render_history(history, message);

        Box::pin(async move {
            debug!(agent_id = %agent.id, trace_id = %trace_id, "Tool worker starting");
            sink.emit(StreamEvent::AgentStart {
                agent_id: agent.id.clone(),
                reason: ctx.routing_reason.clone(),
            })
            .await;

            let mut input_tokens = estimate_tokens(&system) as u64;

            for _step in 0..MAX_TOOL_STEPS {
                input_tokens += estimate_tokens(&transcript) as u64;

                // Idle timeout: the clock restarts on every completed step.
                let reply = tokio::select! {
                    result = self.model.invoke(&system, &transcript) => match result {
                        Ok(reply) => reply,
                        Err(e) => {
                            emit_error(&sink, &agent.id, ErrorCode::WorkerExecution, &e.to_string()).await;
                            return Err(ConclaveError::WorkerExecution {
                                agent_id: agent.id.clone(),
                                message: e.to_string(),
                            });
                        }
                    },
                    _ = ctx.cancellation.cancelled() => {
                        emit_error(&sink, &agent.id, ErrorCode::Cancelled, "cancelled").await;
                        return Err(ConclaveError::Cancelled);
                    }
                    _ = tokio::time::sleep(ctx.timeout) => {
                        let timeout_secs = ctx.timeout.as_secs();
                        emit_error(&sink, &agent.id, ErrorCode::Timeout, "no forward progress").await;
                        return Err(ConclaveError::Timeout { agent_id: agent.id.clone(), timeout_secs });
                    }
                };

                let directive = extract_json_object(&reply)
                    .and_then(|json| serde_json::from_str::<ToolDirective>(json).ok());

                match directive {
                    Some(directive) => {
                        let observation = tokio::select! {
                            obs = self.run_tool(&directive, &ctx, &sink) => obs,
                            _ = ctx.cancellation.cancelled() => {
                                emit_error(&sink, &agent.id, ErrorCode::Cancelled, "cancelled during tool call").await;
                                return Err(ConclaveError::Cancelled);
                            }
                        };
                        transcript.push_str(&format!(
                            "\n{}: {}\nsystem: {}",
                            agent.id, reply, observation
                        ));
                    }
                    None => {
                        sink.emit(StreamEvent::AgentToken {
                            agent_id: agent.id.clone(),
                            token: reply.clone(),
                        })
                        .await;
                        let usage = TokenUsage {
                            input_tokens,
                            output_tokens: estimate_tokens(&reply) as u64,
                        };
                        sink.emit(StreamEvent::AgentComplete {
                            agent_id: agent.id.clone(),
                            text: reply.clone(),
                            usage: usage.clone(),
                        })
                        .await;
                        return Ok(AgentResponse {
                            agent_id: agent.id,
                            text: reply,
                            usage,
                        });
                    }
                }
            }

            let message = format!("exceeded {} tool steps without a final answer", MAX_TOOL_STEPS);
            emit_error(&sink, &agent.id, ErrorCode::WorkerExecution, &message).await;
            Err(ConclaveError::WorkerExecution {
                agent_id: agent.id,
                message,
            })
        })
    }

    fn initialize_mcp(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!(servers = ?self.gateway.server_names(), "Tool gateway ready");
            Ok(())
        })
    }

    fn dispose(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Tool
    }
}
