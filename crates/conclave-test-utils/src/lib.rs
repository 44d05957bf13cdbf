//! Shared mocks and fixtures for Conclave tests. Test-only: nothing here
//! ships in a release binary.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use conclave_core::config::{AgentProfile, TeamConfig};
use conclave_core::context::ExecutionContext;
use conclave_core::error::{ConclaveError, Result};
use conclave_core::event::{ErrorCode, EventSink, StreamEvent};
use conclave_core::traits::{ChatModel, WorkerExecutor};
use conclave_core::types::{AgentResponse, ChatMessage, TokenUsage, WorkerKind};

/// Minimal agent profile for routing/engine tests.
pub fn agent(id: &str) -> AgentProfile {
    AgentProfile {
        id: id.to_string(),
        name: id.to_uppercase(),
        role: format!("{} specialist", id),
        instructions: String::new(),
        model: "mock-model".to_string(),
        allowed_tools: vec![],
        allowed_paths: vec![],
    }
}

/// Agent profile with a tool allowance.
pub fn tool_agent(id: &str, tools: &[&str]) -> AgentProfile {
    AgentProfile {
        allowed_tools: tools.iter().map(|t| t.to_string()).collect(),
        allowed_paths: vec!["/workspace".to_string()],
        ..agent(id)
    }
}

/// A team config over the given agents with default ambient settings.
pub fn team(agents: Vec<AgentProfile>) -> TeamConfig {
    TeamConfig {
        mission: "test mission".to_string(),
        agents,
        mode: Default::default(),
        orchestrator: None,
        budget: Default::default(),
        window: Default::default(),
        compaction: Default::default(),
        engine: Default::default(),
        breaker: Default::default(),
    }
}

/// Scripted chat model: pops one canned reply per call, records prompts.
/// An exhausted script fails loudly so tests notice extra calls.
pub struct MockChatModel {
    replies: Mutex<VecDeque<Result<String>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockChatModel {
    pub fn replying(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails with the given message.
    pub fn failing(message: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::from(vec![
                Err(ConclaveError::LlmRequest(message.to_string())),
                Err(ConclaveError::LlmRequest(message.to_string())),
                Err(ConclaveError::LlmRequest(message.to_string())),
                Err(ConclaveError::LlmRequest(message.to_string())),
            ])),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn sequence(replies: Vec<Result<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(system_prompt, user_message)` pairs seen so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn next_reply(&self) -> Result<String> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ConclaveError::LlmRequest("mock script exhausted".into())))
    }
}

impl ChatModel for MockChatModel {
    fn invoke(&self, system_prompt: &str, user_message: &str) -> BoxFuture<'_, Result<String>> {
        self.calls
            .lock()
            .unwrap()
            .push((system_prompt.to_string(), user_message.to_string()));
        let reply = self.next_reply();
        Box::pin(async move { reply })
    }

    fn stream(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        self.calls
            .lock()
            .unwrap()
            .push((system_prompt.to_string(), user_message.to_string()));
        let reply = self.next_reply();
        Box::pin(async move {
            let text = reply?;
            let chunks: Vec<Result<String>> = chunk_text(&text).into_iter().map(Ok).collect();
            Ok(futures::stream::iter(chunks).boxed())
        })
    }
}

/// Split text into small chunks so streaming paths see multiple tokens.
pub fn chunk_text(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(4)
        .map(|c| c.iter().collect::<String>())
        .collect()
}

/// Worker that replies with a per-agent script, honoring the event
/// contract: one start, tokens, one terminal event.
pub struct ScriptedWorker {
    replies: HashMap<String, String>,
    failing: HashSet<String>,
    delay: Duration,
    kind: WorkerKind,
}

impl ScriptedWorker {
    pub fn new(replies: &[(&str, &str)]) -> Self {
        Self {
            replies: replies
                .iter()
                .map(|(id, text)| (id.to_string(), text.to_string()))
                .collect(),
            failing: HashSet::new(),
            delay: Duration::ZERO,
            kind: WorkerKind::Chat,
        }
    }

    /// Mark an agent as always failing.
    pub fn with_failure(mut self, agent_id: &str) -> Self {
        self.failing.insert(agent_id.to_string());
        self
    }

    /// Insert a pause before replying (for cancellation tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl WorkerExecutor for ScriptedWorker {
    fn execute(
        &self,
        agent: &AgentProfile,
        _message: &str,
        _history: &[ChatMessage],
        ctx: &ExecutionContext,
        sink: &EventSink,
        _trace_id: &str,
    ) -> BoxFuture<'_, Result<AgentResponse>> {
        let agent_id = agent.id.clone();
        let reason = ctx.routing_reason.clone();
        let cancel = ctx.cancellation.clone();
        let sink = sink.clone();
        let text = self
            .replies
            .get(&agent_id)
            .cloned()
            .unwrap_or_else(|| format!("{} reporting in", agent_id));
        let fails = self.failing.contains(&agent_id);
        let delay = self.delay;

        Box::pin(async move {
            sink.emit(StreamEvent::AgentStart {
                agent_id: agent_id.clone(),
                reason,
            })
            .await;

            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        sink.emit(StreamEvent::AgentError {
                            agent_id: agent_id.clone(),
                            code: ErrorCode::Cancelled,
                            message: "cancelled".to_string(),
                        })
                        .await;
                        return Err(ConclaveError::Cancelled);
                    }
                }
            }

            if fails {
                sink.emit(StreamEvent::AgentError {
                    agent_id: agent_id.clone(),
                    code: ErrorCode::WorkerExecution,
                    message: "scripted failure".to_string(),
                })
                .await;
                return Err(ConclaveError::WorkerExecution {
                    agent_id,
                    message: "scripted failure".to_string(),
                });
            }

            for token in chunk_text(&text) {
                if cancel.is_cancelled() {
                    sink.emit(StreamEvent::AgentError {
                        agent_id: agent_id.clone(),
                        code: ErrorCode::Cancelled,
                        message: "cancelled".to_string(),
                    })
                    .await;
                    return Err(ConclaveError::Cancelled);
                }
                sink.emit(StreamEvent::AgentToken {
                    agent_id: agent_id.clone(),
                    token,
                })
                .await;
            }

            let usage = TokenUsage {
                input_tokens: 10,
                output_tokens: text.len() as u64 / 4,
            };
            sink.emit(StreamEvent::AgentComplete {
                agent_id: agent_id.clone(),
                text: text.clone(),
                usage,
            })
            .await;

            Ok(AgentResponse {
                agent_id,
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
        self.kind
    }
}
