//! The Conclave orchestration engine: routing strategies, agent workers,
//! the plan/execute/evaluate loop, budgets, history windowing, and the
//! ordered event stream that ties them together.
//!
//! The entry point is [`GraphEngine`]: build one per team config, then
//! drive it with [`GraphEngine::invoke`] (buffered) or
//! [`GraphEngine::stream`] (live events).

pub mod approval;
pub mod budget;
pub mod cache;
pub mod compaction;
pub mod context;
pub mod graph;
pub mod orchestrator;
pub mod routing;
pub mod state;
pub mod thread_store;
pub mod window;
pub mod worker;

pub use approval::{ApprovalBroker, ApprovalDecision, ApprovalRequest};
pub use budget::{BudgetStatus, BudgetTracker, BudgetVerdict};
pub use cache::{config_fingerprint, GraphCache};
pub use compaction::Compactor;
pub use context::ContextRegistry;
pub use graph::{EngineInput, EngineOutput, GraphEngine};
pub use orchestrator::{Analyzer, Evaluator};
pub use routing::{
    DynamicStrategy, FreeChatStrategy, RoutingOutcome, RoutingStrategy, SequentialStrategy,
    TagOnlyStrategy,
};
pub use state::{BranchOutput, OrchestrationState, StateUpdate};
pub use thread_store::InMemoryThreadStore;
pub use window::HistoryWindower;
pub use worker::{ModelWorker, ToolWorker};
