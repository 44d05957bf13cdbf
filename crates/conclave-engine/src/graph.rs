use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use conclave_core::config::{ConversationMode, TeamConfig};
use conclave_core::context::ExecutionContext;
use conclave_core::error::Result;
use conclave_core::event::{EventSink, StreamEvent};
use conclave_core::traits::{ChatModel, ThreadStore, ToolServer, WorkerExecutor};
use conclave_core::types::{
    AgentResponse, ChatMessage, OrchestratorAnalysis, RoutingDecision, SessionId, SystemCommand,
};
use conclave_mcp::{McpHealth, ToolGateway};

use crate::approval::{ApprovalBroker, ApprovalDecision, ApprovalRequest};
use crate::budget::{BudgetStatus, BudgetTracker, BudgetVerdict};
use crate::compaction::Compactor;
use crate::context::ContextRegistry;
use crate::orchestrator::{build_completion_summary, Analyzer, Evaluator};
use crate::routing::{
    detect_system_command, extract_mentions, roster_help, DynamicStrategy, FreeChatStrategy,
    RoutingStrategy, SequentialStrategy, TagOnlyStrategy,
};
use crate::state::{BranchOutput, OrchestrationState, StateUpdate};
use crate::window::HistoryWindower;
use crate::worker::{ModelWorker, ToolWorker};

/// One invocation request.
#[derive(Debug, Clone, Default)]
pub struct EngineInput {
    pub message: String,
    pub session_id: SessionId,
    pub trace_id: Option<String>,
    /// Explicit @mention override: replaces the strategy's targets.
    pub directed_to: Option<Vec<String>>,
    /// Externally supplied history; replaces the session's remembered log.
    pub conversation_history: Option<Vec<ChatMessage>>,
    /// Checkpoint key for approval-gated invocations.
    pub thread_id: Option<String>,
    /// Resumes a paused invocation with a human-approved plan.
    pub approved_analysis: Option<OrchestratorAnalysis>,
}

impl EngineInput {
    pub fn new(message: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            message: message.into(),
            session_id,
            ..Default::default()
        }
    }

    pub fn directed_to(mut self, agent_ids: Vec<String>) -> Self {
        self.directed_to = Some(agent_ids);
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.conversation_history = Some(history);
        self
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_approved_analysis(mut self, analysis: OrchestratorAnalysis) -> Self {
        self.approved_analysis = Some(analysis);
        self
    }
}

/// Buffered result of `invoke`: final state plus every event in emission
/// order.
#[derive(Debug)]
pub struct EngineOutput {
    /// One entry per agent turn that completed successfully.
    pub responses: Vec<AgentResponse>,
    /// The last routing decision of the invocation, if any routed.
    pub routing_decision: Option<RoutingDecision>,
    pub trace_id: String,
    pub state: OrchestrationState,
    pub events: Vec<StreamEvent>,
}

struct SessionMemory {
    history: Vec<ChatMessage>,
    last_speaker_index: i64,
}

impl Default for SessionMemory {
    fn default() -> Self {
        Self {
            history: vec![],
            // -1 means nobody has spoken, so round-robin starts at the
            // first agent.
            last_speaker_index: -1,
        }
    }
}

/// The orchestration engine: routes a user message to agent workers,
/// optionally drives the plan/execute/evaluate loop, and streams ordered
/// events with cancellation support.
pub struct GraphEngine {
    config: TeamConfig,
    model: Arc<dyn ChatModel>,
    chat_worker: Arc<dyn WorkerExecutor>,
    tool_worker: Option<Arc<dyn WorkerExecutor>>,
    strategy: Arc<dyn RoutingStrategy>,
    analyzer: Option<Analyzer>,
    evaluator: Option<Evaluator>,
    windower: HistoryWindower,
    compactor: Compactor,
    budget: BudgetTracker,
    approvals: Arc<ApprovalBroker>,
    gateway: Arc<ToolGateway>,
    contexts: ContextRegistry,
    threads: Arc<dyn ThreadStore>,
    sessions: Mutex<HashMap<SessionId, SessionMemory>>,
    // Sink of the invocation currently driving this engine, so external
    // approval responses land on the live stream.
    current_sink: std::sync::Mutex<Option<EventSink>>,
}

impl GraphEngine {
    pub fn new(
        config: TeamConfig,
        model: Arc<dyn ChatModel>,
        threads: Arc<dyn ThreadStore>,
        tool_servers: Vec<Arc<dyn ToolServer>>,
    ) -> Result<Self> {
        config.validate()?;

        let mut gateway = ToolGateway::new(config.breaker.clone());
        for server in tool_servers {
            gateway.register(server);
        }
        let gateway = Arc::new(gateway);
        let approvals = Arc::new(ApprovalBroker::new());

        let strategy: Arc<dyn RoutingStrategy> = match config.mode {
            ConversationMode::Sequential => Arc::new(SequentialStrategy),
            ConversationMode::TagOnly => Arc::new(TagOnlyStrategy),
            ConversationMode::FreeChat => Arc::new(FreeChatStrategy),
            ConversationMode::Dynamic => Arc::new(DynamicStrategy::new(
                Arc::clone(&model),
                config.mission.clone(),
                config.engine.default_agent.clone(),
            )),
        };

        let orchestrated =
            matches!(config.mode, ConversationMode::Dynamic) && config.orchestrator.is_some();
        let (analyzer, evaluator) = if orchestrated {
            (
                Some(Analyzer::new(Arc::clone(&model), config.mission.clone())),
                Some(Evaluator::new(Arc::clone(&model), config.mission.clone())),
            )
        } else {
            (None, None)
        };

        let tool_worker: Option<Arc<dyn WorkerExecutor>> =
            if config.agents.iter().any(|a| !a.is_chat_only()) {
                Some(Arc::new(ToolWorker::new(
                    Arc::clone(&model),
                    Arc::clone(&gateway),
                    Arc::clone(&approvals),
                )))
            } else {
                None
            };

        Ok(Self {
            chat_worker: Arc::new(ModelWorker::new(Arc::clone(&model))),
            tool_worker,
            strategy,
            analyzer,
            evaluator,
            windower: HistoryWindower::new(config.window.clone()),
            compactor: Compactor::new(config.compaction.clone(), Arc::clone(&model)),
            budget: BudgetTracker::new(config.budget.clone()),
            approvals,
            gateway,
            contexts: ContextRegistry::new(),
            threads,
            sessions: Mutex::new(HashMap::new()),
            current_sink: std::sync::Mutex::new(None),
            model,
            config,
        })
    }

    /// Swap the chat worker (tests, alternative backends).
    pub fn with_chat_worker(mut self, worker: Arc<dyn WorkerExecutor>) -> Self {
        self.chat_worker = worker;
        self
    }

    /// Swap the tool worker.
    pub fn with_tool_worker(mut self, worker: Arc<dyn WorkerExecutor>) -> Self {
        self.tool_worker = Some(worker);
        self
    }

    /// Bring up worker backends (MCP connections for tool workers).
    pub async fn initialize(&self) -> Result<()> {
        self.chat_worker.initialize_mcp().await?;
        if let Some(tool_worker) = &self.tool_worker {
            tool_worker.initialize_mcp().await?;
        }
        Ok(())
    }

    pub async fn dispose(&self) -> Result<()> {
        self.chat_worker.dispose().await?;
        if let Some(tool_worker) = &self.tool_worker {
            tool_worker.dispose().await?;
        }
        Ok(())
    }

    /// Run one invocation to completion, buffering every event.
    pub async fn invoke(self: &Arc<Self>, mut input: EngineInput) -> Result<EngineOutput> {
        let trace_id = input
            .trace_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let (sink, mut rx) = EventSink::channel(self.config.engine.event_buffer);
        let engine = Arc::clone(self);
        let run = engine.run(input, sink);
        let drain = async move {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        };
        let (state, events) = tokio::join!(run, drain);
        let state = state?;
        let responses = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::AgentComplete {
                    agent_id,
                    text,
                    usage,
                } => Some(AgentResponse {
                    agent_id: agent_id.clone(),
                    text: text.clone(),
                    usage: *usage,
                }),
                _ => None,
            })
            .collect();
        Ok(EngineOutput {
            responses,
            routing_decision: state.routing_log.last().cloned(),
            trace_id,
            state,
            events,
        })
    }

    /// Run one invocation in the background, returning its event stream.
    /// The channel is bounded, so a slow consumer backpressures the graph
    /// instead of growing an unbounded queue.
    pub fn stream(self: &Arc<Self>, input: EngineInput) -> impl Stream<Item = StreamEvent> {
        let (sink, mut rx) = EventSink::channel(self.config.engine.event_buffer);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.run(input, sink).await {
                error!(error = %e, "Invocation failed");
            }
        });
        futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
    }

    /// Resolve a pending tool approval on the live invocation's stream.
    pub async fn respond_to_approval(&self, approval_id: &str, approved: bool, budget: i32) -> bool {
        let sink = {
            let guard = match self.current_sink.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.clone()
        };
        // No live invocation: resolve against a detached sink so the
        // waiting future still unblocks.
        let sink = sink.unwrap_or_else(|| EventSink::channel(1).0);
        self.approvals
            .respond(approval_id, ApprovalDecision { approved, budget }, &sink)
            .await
    }

    pub async fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.approvals.pending_requests().await
    }

    /// Abort exactly one in-flight agent. Returns false when that agent
    /// is not currently executing.
    pub fn cancel_agent(&self, agent_id: &str) -> bool {
        self.contexts.cancel_agent(agent_id)
    }

    /// Abort every in-flight agent, returning the cancelled ids.
    pub fn cancel_all(&self) -> Vec<String> {
        self.contexts.cancel_all()
    }

    pub async fn get_budget_status(&self, session: &SessionId) -> BudgetStatus {
        self.budget.status(session).await
    }

    pub async fn get_mcp_health(&self) -> McpHealth {
        self.gateway.health().await
    }

    async fn run(
        self: Arc<Self>,
        input: EngineInput,
        sink: EventSink,
    ) -> Result<OrchestrationState> {
        if let Ok(mut guard) = self.current_sink.lock() {
            *guard = Some(sink.clone());
        }
        let result = Arc::clone(&self).run_inner(input, sink).await;
        if let Ok(mut guard) = self.current_sink.lock() {
            *guard = None;
        }
        result
    }

    async fn run_inner(
        self: Arc<Self>,
        input: EngineInput,
        sink: EventSink,
    ) -> Result<OrchestrationState> {
        let trace_id = input
            .trace_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = input.session_id.clone();
        info!(session_id = %session, trace_id = %trace_id, "Invocation started");

        if let Some(command) = detect_system_command(&input.message) {
            return self
                .handle_system_command(command, &session, &trace_id, &sink)
                .await;
        }

        let max_rounds = self
            .config
            .orchestrator
            .as_ref()
            .map(|o| o.max_rounds)
            .unwrap_or(1);

        self.approvals.reset_credits().await;

        // Resume path: a previously paused invocation continues with the
        // approved plan; its snapshot already holds the user message.
        if let Some(analysis) = input.approved_analysis.clone() {
            let mut state = self
                .restore_thread(&input)
                .await?
                .unwrap_or_else(|| OrchestrationState::new(vec![], -1, max_rounds));
            let base_len = state.messages.len();
            state.plan_approved = true;
            state.system_command = None;
            let targets = self.known_agents(&analysis.selected_agents);
            state.analysis = Some(analysis);

            let decision = RoutingDecision::new(targets.clone(), "approved plan", 1.0);
            sink.emit(StreamEvent::Routing {
                decision: decision.clone(),
            })
            .await;
            state.apply(StateUpdate {
                append_routing: vec![decision],
                pending_agents: Some(targets.into_iter().collect()),
                ..Default::default()
            });

            self.clone()
                .execute(&mut state, &input.message, base_len, false, &sink, &trace_id, &session)
                .await;
            return self.finish(state, base_len, None, &session, &trace_id, &sink).await;
        }

        let (history, last_speaker_index) = {
            let mut sessions = self.sessions.lock().await;
            let memory = sessions.entry(session.clone()).or_default();
            if let Some(h) = &input.conversation_history {
                memory.history = h.clone();
            }
            (memory.history.clone(), memory.last_speaker_index)
        };

        let mut state = OrchestrationState::new(history, last_speaker_index, max_rounds);
        let base_len = state.messages.len();
        let user_msg = ChatMessage::user(&input.message);

        // A direct @mention of the orchestrator bypasses routing and never
        // consumes a round.
        if let Some(orch) = &self.config.orchestrator {
            let mentioned = extract_mentions(&input.message)
                .iter()
                .any(|m| m.eq_ignore_ascii_case(&orch.id))
                || input
                    .directed_to
                    .as_ref()
                    .map(|ids| ids.iter().any(|id| id.eq_ignore_ascii_case(&orch.id)))
                    .unwrap_or(false);
            if mentioned {
                match self
                    .orchestrator_direct(&input.message, &state.messages, &sink)
                    .await
                {
                    Ok(text) => state.messages.push(ChatMessage::agent(&orch.id, text)),
                    Err(e) => warn!(error = %e, "Orchestrator direct reply failed"),
                }
                state.is_complete = true;
                return self
                    .finish(state, base_len, Some(user_msg), &session, &trace_id, &sink)
                    .await;
            }
        }

        // Routing: directed override > analyzer > configured strategy.
        let directed = input
            .directed_to
            .as_ref()
            .map(|ids| self.known_agents(ids))
            .unwrap_or_default();
        // Directed turns run with the tool/path allowance lifted.
        let directed_turn = !directed.is_empty();

        let targets = if !directed.is_empty() {
            let decision = RoutingDecision::new(directed.clone(), "directed mention", 1.0);
            sink.emit(StreamEvent::Routing {
                decision: decision.clone(),
            })
            .await;
            state.apply(StateUpdate {
                append_routing: vec![decision],
                ..Default::default()
            });
            directed
        } else if let Some(analyzer) = &self.analyzer {
            let analysis = analyzer
                .analyze(&input.message, &self.config.agents, &state.messages)
                .await;
            sink.emit(StreamEvent::OrchestratorAnalysis {
                intent: analysis.intent.clone(),
                selected_agents: analysis.selected_agents.clone(),
                needs_approval: analysis.needs_approval,
            })
            .await;
            state.analysis = Some(analysis.clone());

            // The orchestrator answers trivial messages itself.
            if analysis.selected_agents.is_empty() {
                if let Some(direct) = &analysis.direct_response {
                    sink.emit(StreamEvent::OrchestratorDirectToken {
                        token: direct.clone(),
                    })
                    .await;
                    if let Some(orch) = &self.config.orchestrator {
                        state.messages.push(ChatMessage::agent(&orch.id, direct));
                    }
                }
                state.is_complete = true;
                return self
                    .finish(state, base_len, Some(user_msg), &session, &trace_id, &sink)
                    .await;
            }

            // A plan needing human sign-off pauses the invocation.
            if analysis.needs_approval && analysis.plan.is_some() && !state.plan_approved {
                state.system_command = Some(SystemCommand::AwaitApproval);
                if let Some(thread_id) = &input.thread_id {
                    let mut snapshot = state.clone();
                    snapshot.messages.insert(base_len, user_msg.clone());
                    self.threads
                        .save(thread_id, serde_json::to_value(&snapshot)?)
                        .await?;
                    info!(thread_id = %thread_id, "Invocation paused awaiting plan approval");
                }
                return self
                    .finish(state, base_len, Some(user_msg), &session, &trace_id, &sink)
                    .await;
            }

            let reason = if analysis.intent.is_empty() {
                "orchestrator analysis".to_string()
            } else {
                format!("orchestrator analysis: {}", analysis.intent)
            };
            let decision = RoutingDecision::new(analysis.selected_agents.clone(), reason, 1.0);
            sink.emit(StreamEvent::Routing {
                decision: decision.clone(),
            })
            .await;
            state.apply(StateUpdate {
                append_routing: vec![decision],
                ..Default::default()
            });
            analysis.selected_agents
        } else {
            let outcome = self
                .strategy
                .route(&input.message, &self.config.agents, &state)
                .await;

            if outcome.is_help_message {
                let help = outcome
                    .help_content
                    .unwrap_or_else(|| roster_help(&self.config.agents));
                sink.emit(StreamEvent::OrchestratorDirectToken { token: help }).await;
                state.apply(StateUpdate {
                    append_routing: vec![RoutingDecision {
                        target_agent_ids: vec![],
                        reason: outcome.reason,
                        confidence: 1.0,
                        fallback_used: false,
                        timestamp: Utc::now(),
                    }],
                    is_complete: Some(true),
                    ..Default::default()
                });
                return self
                    .finish(state, base_len, Some(user_msg), &session, &trace_id, &sink)
                    .await;
            }

            let decision = RoutingDecision {
                target_agent_ids: outcome.target_agent_ids.clone(),
                reason: outcome.reason,
                confidence: outcome.confidence,
                fallback_used: outcome.fallback_used,
                timestamp: Utc::now(),
            };
            sink.emit(StreamEvent::Routing {
                decision: decision.clone(),
            })
            .await;
            state.apply(StateUpdate {
                append_routing: vec![decision],
                ..Default::default()
            });
            outcome.target_agent_ids
        };

        if targets.is_empty() {
            return self
                .finish(state, base_len, Some(user_msg), &session, &trace_id, &sink)
                .await;
        }
        state.pending_agents = targets.into_iter().collect();

        self.clone()
            .execute(
                &mut state,
                &input.message,
                base_len,
                directed_turn,
                &sink,
                &trace_id,
                &session,
            )
            .await;

        self.finish(state, base_len, Some(user_msg), &session, &trace_id, &sink)
            .await
    }

    /// Drive the worker phase: free-chat fan-out or the sequential loop
    /// (with the evaluator when orchestrated).
    async fn execute(
        self: Arc<Self>,
        state: &mut OrchestrationState,
        message: &str,
        base_len: usize,
        directed: bool,
        sink: &EventSink,
        trace_id: &str,
        session: &SessionId,
    ) {
        let free_chat = matches!(self.config.mode, ConversationMode::FreeChat);
        if free_chat && state.pending_agents.len() > 1 {
            self.clone()
                .execute_free_chat(state, message, directed, sink, trace_id, session)
                .await;
        } else {
            self.execute_sequential(state, message, directed, sink, trace_id, session)
                .await;
        }

        if self.evaluator.is_some() {
            state.is_complete = true;
            let summary = build_completion_summary(&state.messages[base_len..]);
            sink.emit(StreamEvent::OrchestratorSummary { summary }).await;
        }
    }

    /// Strict one-at-a-time execution so history stays causally ordered.
    async fn execute_sequential(
        &self,
        state: &mut OrchestrationState,
        message: &str,
        directed: bool,
        sink: &EventSink,
        trace_id: &str,
        session: &SessionId,
    ) {
        let mut guidance: Option<String> = None;

        while let Some(agent_id) = state.activate_next() {
            self.run_worker_turn(
                &agent_id,
                message,
                state,
                guidance.take(),
                directed,
                sink,
                trace_id,
                session,
            )
            .await;

            if let Some(evaluator) = &self.evaluator {
                let verdict = evaluator
                    .evaluate(message, &self.config.agents, state)
                    .await;
                sink.emit(StreamEvent::OrchestratorEvaluation {
                    round: state.round,
                    is_complete: verdict.is_complete,
                    next_agent_id: verdict.next_agent_id.clone(),
                })
                .await;

                if verdict.is_complete {
                    state.is_complete = true;
                    state.pending_agents.clear();
                } else if let Some(next) = verdict.next_agent_id {
                    guidance = verdict.guidance;
                    if state.pending_agents.is_empty() {
                        state.pending_agents.push_back(next);
                    }
                }
            }
        }
    }

    /// Free-chat fan-out: every target runs concurrently on an isolated
    /// branch of the state, merged append-only in target order. Event
    /// ordering is strict per agent only; consumers demultiplex by id.
    async fn execute_free_chat(
        self: Arc<Self>,
        state: &mut OrchestrationState,
        message: &str,
        directed: bool,
        sink: &EventSink,
        trace_id: &str,
        session: &SessionId,
    ) {
        let targets: Vec<String> = state.pending_agents.drain(..).collect();
        let mut handles = Vec::with_capacity(targets.len());

        for agent_id in targets {
            let engine = Arc::clone(&self);
            let mut branch = state.branch();
            let message = message.to_string();
            let sink = sink.clone();
            let trace_id = trace_id.to_string();
            let session = session.clone();
            let id = agent_id.clone();
            handles.push((
                agent_id,
                tokio::spawn(async move {
                    let base = branch.messages.len();
                    engine
                        .run_worker_turn(
                            &id, &message, &mut branch, None, directed, &sink, &trace_id, &session,
                        )
                        .await;
                    branch.messages.split_off(base)
                }),
            ));
        }

        for (agent_id, handle) in handles {
            match handle.await {
                Ok(new_messages) => state.merge_branch(BranchOutput {
                    new_messages,
                    new_routing: vec![],
                }),
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Free-chat branch panicked"),
            }
        }
    }

    /// One agent turn: budget pre-flight, windowing and compaction, then
    /// worker execution. A failed or skipped turn never fails the
    /// invocation; the worker has already emitted its terminal event.
    async fn run_worker_turn(
        &self,
        agent_id: &str,
        message: &str,
        state: &mut OrchestrationState,
        guidance: Option<String>,
        directed: bool,
        sink: &EventSink,
        trace_id: &str,
        session: &SessionId,
    ) -> Option<AgentResponse> {
        let agent = match self.config.agent(agent_id) {
            Some(agent) => agent.clone(),
            None => {
                warn!(agent_id, "Routed to unknown agent, skipping");
                return None;
            }
        };

        if let BudgetVerdict::Denied(limiter) = self.budget.check_budget(session, &agent.id).await {
            warn!(agent_id = %agent.id, limiter = %limiter, "Budget denied, skipping turn");
            sink.emit(StreamEvent::BudgetExceeded {
                agent_id: agent.id.clone(),
                limiter: limiter.to_string(),
            })
            .await;
            return None;
        }

        let windowed = self.windower.window(&state.messages);
        let mut history = windowed.kept;
        if !windowed.dropped.is_empty() {
            if let Some(summary) = self
                .compactor
                .compact(&agent.id, &windowed.dropped, sink)
                .await
            {
                history.insert(0, summary);
            }
        }

        let guidance = guidance.or_else(|| {
            state
                .analysis
                .as_ref()
                .and_then(|a| a.agent_instructions.get(&agent.id).cloned())
        });

        let timeout = if agent.is_chat_only() {
            Duration::from_secs(self.config.engine.worker_timeout_secs)
        } else {
            Duration::from_secs(self.config.engine.idle_timeout_secs)
        };
        let reason = state
            .routing_log
            .last()
            .map(|d| d.reason.clone())
            .unwrap_or_else(|| "routed".to_string());
        let cancel = self.contexts.register(&agent.id);
        let mut ctx = ExecutionContext::new(&agent.id, reason, timeout, cancel);
        ctx = if directed {
            ctx.with_full_access()
        } else {
            ctx.with_tools(agent.allowed_tools.clone(), agent.allowed_paths.clone())
        };
        if let Some(guidance) = guidance {
            ctx = ctx.with_guidance(guidance);
        }

        let worker = if agent.is_chat_only() {
            Arc::clone(&self.chat_worker)
        } else {
            self.tool_worker
                .clone()
                .unwrap_or_else(|| Arc::clone(&self.chat_worker))
        };

        debug!(agent_id = %agent.id, worker = ?worker.kind(), "Dispatching worker turn");
        let result = worker
            .execute(&agent, message, &history, &ctx, sink, trace_id)
            .await;
        self.contexts.deregister(&agent.id);

        match result {
            Ok(response) => {
                state
                    .messages
                    .push(ChatMessage::agent(&agent.id, &response.text));
                if let Some(idx) = self
                    .config
                    .agents
                    .iter()
                    .position(|a| a.id.eq_ignore_ascii_case(&agent.id))
                {
                    state.last_speaker_index = idx as i64;
                }
                self.budget
                    .record_usage(session, &agent.id, response.usage)
                    .await;
                Some(response)
            }
            Err(e) => {
                warn!(agent_id = %agent.id, error = %e, "Worker turn failed, invocation continues");
                None
            }
        }
    }

    /// `/reset` clears session memory and budgets; `/help` streams the
    /// roster. Both bypass routing entirely.
    async fn handle_system_command(
        &self,
        command: SystemCommand,
        session: &SessionId,
        trace_id: &str,
        sink: &EventSink,
    ) -> Result<OrchestrationState> {
        let mut state = OrchestrationState::default();
        match command {
            SystemCommand::Reset => {
                self.sessions.lock().await.remove(session);
                self.budget.reset(session).await;
                info!(session_id = %session, "Session reset");
                state.system_command = Some(SystemCommand::Reset);
                state.messages.push(ChatMessage::system("Conversation reset."));
            }
            SystemCommand::Help | SystemCommand::AwaitApproval => {
                let help = roster_help(&self.config.agents);
                sink.emit(StreamEvent::OrchestratorDirectToken { token: help }).await;
                state.system_command = Some(SystemCommand::Help);
                state.routing_log.push(RoutingDecision {
                    target_agent_ids: vec![],
                    reason: "help command".to_string(),
                    confidence: 1.0,
                    fallback_used: false,
                    timestamp: Utc::now(),
                });
            }
        }
        state.is_complete = true;
        sink.emit(StreamEvent::SessionEnd {
            trace_id: trace_id.to_string(),
        })
        .await;
        Ok(state)
    }

    /// Stream an orchestrator-voiced reply for direct mentions.
    async fn orchestrator_direct(
        &self,
        message: &str,
        history: &[ChatMessage],
        sink: &EventSink,
    ) -> Result<String> {
        let system = format!(
            "You are the orchestrator of a team of AI agents.\nMission: {}\nAnswer the user yourself, concisely.",
            self.config.mission
        );
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

        let mut stream = self.model.stream(&system, &user).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            sink.emit(StreamEvent::OrchestratorDirectToken {
                token: chunk.clone(),
            })
            .await;
            text.push_str(&chunk);
        }
        Ok(text)
    }

    async fn restore_thread(&self, input: &EngineInput) -> Result<Option<OrchestrationState>> {
        let Some(thread_id) = &input.thread_id else {
            return Ok(None);
        };
        let Some(snapshot) = self.threads.load(thread_id).await? else {
            return Ok(None);
        };
        match serde_json::from_value::<OrchestrationState>(snapshot) {
            Ok(state) => {
                info!(thread_id = %thread_id, "Resumed invocation from thread snapshot");
                Ok(Some(state))
            }
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Thread snapshot unreadable, starting fresh");
                Ok(None)
            }
        }
    }

    /// Filter to configured agents, preserving order, canonicalizing case.
    fn known_agents(&self, ids: &[String]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.config.agent(id).map(|a| a.id.clone()))
            .collect()
    }

    /// Seal the invocation: splice the user message into the log at the
    /// invocation boundary, persist session memory, emit `SessionEnd`.
    async fn finish(
        &self,
        mut state: OrchestrationState,
        base_len: usize,
        user_msg: Option<ChatMessage>,
        session: &SessionId,
        trace_id: &str,
        sink: &EventSink,
    ) -> Result<OrchestrationState> {
        if let Some(msg) = user_msg {
            let at = base_len.min(state.messages.len());
            state.messages.insert(at, msg);
        }
        {
            let mut sessions = self.sessions.lock().await;
            let memory = sessions.entry(session.clone()).or_default();
            memory.history = state.messages.clone();
            memory.last_speaker_index = state.last_speaker_index;
        }
        sink.emit(StreamEvent::SessionEnd {
            trace_id: trace_id.to_string(),
        })
        .await;
        info!(
            session_id = %session,
            trace_id = %trace_id,
            messages = state.messages.len(),
            complete = state.is_complete,
            "Invocation finished"
        );
        Ok(state)
    }
}
