//! End-to-end tests for the orchestrated (dynamic) conversation mode:
//! analyzer selection, the evaluator loop, round caps, direct responses,
//! and the plan-approval pause/resume cycle.

use std::sync::Arc;

use conclave_core::config::{ConversationMode, OrchestratorConfig, TeamConfig};
use conclave_core::event::StreamEvent;
use conclave_core::traits::ThreadStore;
use conclave_core::types::{OrchestratorAnalysis, SessionId, SystemCommand};
use conclave_engine::{EngineInput, GraphEngine, InMemoryThreadStore};
use conclave_test_utils::{agent, team, MockChatModel, ScriptedWorker};

fn orchestrated_team(max_rounds: u32) -> TeamConfig {
    let mut config = team(vec![agent("coder"), agent("reviewer")]);
    config.mode = ConversationMode::Dynamic;
    config.orchestrator = Some(OrchestratorConfig {
        id: "orchestrator".to_string(),
        max_rounds,
        model: "mock".to_string(),
    });
    config
}

fn engine(
    config: TeamConfig,
    model: Arc<MockChatModel>,
    worker: ScriptedWorker,
) -> (Arc<GraphEngine>, Arc<InMemoryThreadStore>) {
    let threads = Arc::new(InMemoryThreadStore::new());
    let engine = GraphEngine::new(
        config,
        model,
        Arc::clone(&threads) as Arc<dyn ThreadStore>,
        vec![],
    )
    .unwrap()
    .with_chat_worker(Arc::new(worker));
    (Arc::new(engine), threads)
}

fn speakers(output: &conclave_engine::EngineOutput) -> Vec<String> {
    output
        .state
        .messages
        .iter()
        .filter_map(|m| m.agent_id.clone())
        .collect()
}

#[tokio::test]
async fn evaluator_hands_off_between_agents_until_complete() {
    let model = Arc::new(MockChatModel::replying(vec![
        // Analyzer: send the coder first.
        r#"{"intent": "build feature", "selected_agents": ["coder"],
            "agent_instructions": {"coder": "write the parser"}}"#
            .to_string(),
        // Evaluator after the coder: hand off to the reviewer.
        r#"{"is_complete": false, "next_agent_id": "reviewer",
            "guidance": "check error handling"}"#
            .to_string(),
        // Evaluator after the reviewer: done.
        r#"{"is_complete": true, "reason": "reviewed and approved"}"#.to_string(),
    ]));
    let (engine, _) = engine(
        orchestrated_team(5),
        Arc::clone(&model),
        ScriptedWorker::new(&[("coder", "parser written"), ("reviewer", "looks good")]),
    );

    let output = engine
        .invoke(EngineInput::new("build the parser", SessionId::new()))
        .await
        .unwrap();

    assert_eq!(speakers(&output), vec!["coder", "reviewer"]);
    assert!(output.state.is_complete);
    assert_eq!(output.state.round, 2);
    assert_eq!(model.calls().len(), 3);

    let evaluations: Vec<(u32, bool, Option<String>)> = output
        .events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::OrchestratorEvaluation {
                round,
                is_complete,
                next_agent_id,
            } => Some((*round, *is_complete, next_agent_id.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        evaluations,
        vec![
            (1, false, Some("reviewer".to_string())),
            (2, true, None),
        ]
    );

    // Consecutive distinct speakers share a round in the summary.
    let summary = output
        .events
        .iter()
        .find_map(|e| match e {
            StreamEvent::OrchestratorSummary { summary } => Some(summary.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        summary.participating_agents,
        vec!["coder".to_string(), "reviewer".to_string()]
    );
    let rounds: Vec<u32> = summary.rounds.iter().map(|r| r.round).collect();
    assert_eq!(rounds, vec![1, 1]);
}

#[tokio::test]
async fn round_cap_forces_completion_without_an_evaluator_call() {
    let model = Arc::new(MockChatModel::replying(vec![
        r#"{"intent": "quick task", "selected_agents": ["coder"]}"#.to_string(),
    ]));
    let (engine, _) = engine(
        orchestrated_team(1),
        Arc::clone(&model),
        ScriptedWorker::new(&[("coder", "done")]),
    );

    let output = engine
        .invoke(EngineInput::new("do the thing", SessionId::new()))
        .await
        .unwrap();

    assert!(output.state.is_complete);
    assert_eq!(output.state.round, 1);
    // Only the analyzer hit the model; the cap short-circuits the judge.
    assert_eq!(model.calls().len(), 1);
    assert!(output.events.iter().any(|e| matches!(
        e,
        StreamEvent::OrchestratorEvaluation {
            round: 1,
            is_complete: true,
            ..
        }
    )));
}

#[tokio::test]
async fn trivial_messages_get_a_direct_response_without_workers() {
    let model = Arc::new(MockChatModel::replying(vec![
        r#"{"intent": "greeting", "direct_response": "Hello! What can the team do for you?"}"#
            .to_string(),
    ]));
    let (engine, _) = engine(
        orchestrated_team(5),
        model,
        ScriptedWorker::new(&[]),
    );

    let output = engine
        .invoke(EngineInput::new("hi", SessionId::new()))
        .await
        .unwrap();

    assert!(output.state.is_complete);
    assert!(!output
        .events
        .iter()
        .any(|e| matches!(e, StreamEvent::AgentStart { .. })));
    let direct = output.events.iter().find_map(|e| match e {
        StreamEvent::OrchestratorDirectToken { token } => Some(token.clone()),
        _ => None,
    });
    assert_eq!(direct.as_deref(), Some("Hello! What can the team do for you?"));
    assert_eq!(speakers(&output), vec!["orchestrator"]);
}

#[tokio::test]
async fn plan_needing_approval_pauses_and_resumes() {
    let model = Arc::new(MockChatModel::replying(vec![
        r#"{"intent": "risky deploy", "selected_agents": ["coder"],
            "needs_approval": true,
            "plan": {"steps": [{"agent_id": "coder", "action": "deploy to prod"}]}}"#
            .to_string(),
    ]));
    let (engine, threads) = engine(
        orchestrated_team(1),
        model,
        ScriptedWorker::new(&[("coder", "deployed")]),
    );
    let session = SessionId::new();

    let paused = engine
        .invoke(
            EngineInput::new("deploy it", session.clone()).with_thread("deploy-thread"),
        )
        .await
        .unwrap();

    assert_eq!(
        paused.state.system_command,
        Some(SystemCommand::AwaitApproval)
    );
    assert!(speakers(&paused).is_empty());
    // The checkpoint landed in the thread store.
    assert!(threads.load("deploy-thread").await.unwrap().is_some());

    let approved = OrchestratorAnalysis {
        selected_agents: vec!["coder".to_string()],
        ..paused.state.analysis.clone().unwrap()
    };
    let resumed = engine
        .invoke(
            EngineInput::new("deploy it", session.clone())
                .with_thread("deploy-thread")
                .with_approved_analysis(approved),
        )
        .await
        .unwrap();

    assert!(resumed.state.plan_approved);
    assert!(resumed.state.is_complete);
    assert_eq!(speakers(&resumed).last().map(String::as_str), Some("coder"));
    assert_eq!(
        resumed.state.routing_log.last().unwrap().reason,
        "approved plan"
    );
}

#[tokio::test]
async fn mentioning_the_orchestrator_bypasses_routing() {
    let model = Arc::new(MockChatModel::replying(vec![
        "The coder writes code and the reviewer reviews it.".to_string(),
    ]));
    let (engine, _) = engine(
        orchestrated_team(5),
        Arc::clone(&model),
        ScriptedWorker::new(&[]),
    );

    let output = engine
        .invoke(EngineInput::new(
            "@orchestrator who does what here?",
            SessionId::new(),
        ))
        .await
        .unwrap();

    // No analysis, no workers: the orchestrator streamed its own reply.
    assert!(!output
        .events
        .iter()
        .any(|e| matches!(e, StreamEvent::OrchestratorAnalysis { .. })));
    assert!(!output
        .events
        .iter()
        .any(|e| matches!(e, StreamEvent::AgentStart { .. })));
    let streamed: String = output
        .events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::OrchestratorDirectToken { token } => Some(token.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "The coder writes code and the reviewer reviews it.");
    assert_eq!(speakers(&output), vec!["orchestrator"]);
    // Direct replies never consume an orchestration round.
    assert_eq!(output.state.round, 0);
}
