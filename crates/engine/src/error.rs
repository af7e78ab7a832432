//! Engine-level error types.

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// One node's terminal failure, as reported inside a [`EngineError::StageFailure`]
/// and in the result's failure list.
#[derive(Debug, Clone, Serialize)]
pub struct NodeFailure {
    pub node_id: String,
    pub error: String,
}

/// Errors produced by the workflow engine (validation + execution).
///
/// Validation variants are raised before any execution context exists and go
/// straight back to the caller; `StageFailure` and `Cancelled` are raised by
/// the scheduler and folded into the failed result so the node trail survives.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the workflow.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    DanglingEdge {
        node_id: String,
        side: &'static str,
    },

    /// Dependency traversal re-entered a node currently being visited.
    #[error("workflow graph contains a cycle through node '{node_id}'")]
    CycleDetected { node_id: String },

    // ------ Lookup errors ------

    /// The graph source has no workflow under this ID.
    #[error("no workflow found with ID {0}")]
    GraphNotFound(Uuid),

    /// A node declares a type tag with no registered implementation.
    #[error("node '{node_id}' declares unknown node type '{node_type}'")]
    UnknownNodeType {
        node_id: String,
        node_type: String,
    },

    // ------ Execution errors ------

    /// One or more nodes in a stage failed terminally and the execution's
    /// policy does not allow continuing. Carries *every* failed node of the
    /// stage, not just the first.
    #[error("stage {stage} failed: {} node(s) failed terminally", failures.len())]
    StageFailure {
        stage: usize,
        failures: Vec<NodeFailure>,
    },

    /// The caller aborted the execution.
    #[error("execution was cancelled")]
    Cancelled,

    /// No execution with this ID is currently in flight.
    #[error("no active execution with ID {0}")]
    ExecutionNotActive(Uuid),
}
