//! `engine` crate — graph model, staged planning, and the workflow
//! execution engine.

pub mod context;
pub mod error;
pub mod executor;
pub mod models;
pub mod plan;
pub mod scheduler;

pub use context::{ContextManager, ExecutionMetrics, ExecutionStatus, NodeState, NodeStatus};
pub use error::{EngineError, NodeFailure};
pub use executor::{
    EngineConfig, GraphSource, InMemoryGraphSource, NodeTrailEntry, WorkflowEngine, WorkflowResult,
};
pub use models::{Edge, NodeDefinition, Workflow};
pub use plan::{validate, ExecutionNode, ExecutionPlan};
pub use scheduler::StageScheduler;

#[cfg(test)]
mod executor_tests;
