//! The `NodeExecutor` trait — the contract every node must fulfil.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::NodeError;

/// Shared context handed to every node during execution.
///
/// Defined here (in the nodes crate) so both the engine and individual node
/// implementations can import it without a circular dependency. The variable
/// store is shared across all nodes of one execution; the engine snapshots it
/// when assembling stage inputs, so concurrent writers never observe a
/// half-written map.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// ID of the parent workflow definition.
    pub workflow_id: Uuid,
    /// ID of the current execution run.
    pub execution_id: Uuid,
    /// Initial input supplied when the execution was triggered.
    pub input: Value,
    variables: Arc<RwLock<HashMap<String, Value>>>,
    cancelled: watch::Receiver<bool>,
}

impl NodeContext {
    pub fn new(
        workflow_id: Uuid,
        execution_id: Uuid,
        input: Value,
        variables: Arc<RwLock<HashMap<String, Value>>>,
        cancelled: watch::Receiver<bool>,
    ) -> Self {
        Self { workflow_id, execution_id, input, variables, cancelled }
    }

    /// Publish a named value visible to every node in this execution.
    pub async fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.variables.write().await.insert(key.into(), value);
    }

    /// Read a named value previously published by any node.
    pub async fn get_variable(&self, key: &str) -> Option<Value> {
        self.variables.read().await.get(key).cloned()
    }

    /// Whether the whole execution has been cancelled by the caller.
    ///
    /// Long-running nodes should poll this at convenient points; the engine
    /// only signals, it does not forcibly kill an in-flight attempt.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }
}

/// The core node trait.
///
/// `execute` is invoked once per attempt and must tolerate re-invocation with
/// the same input — a retrying node sees the identical payload each time.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Run the node against its assembled input and return its JSON output.
    async fn execute(&self, input: Value, ctx: &NodeContext) -> Result<Value, NodeError>;

    /// Called once before the first attempt.
    async fn on_start(&self, _ctx: &NodeContext) {}

    /// Called once after the node reaches its final per-node outcome,
    /// before the scheduler applies stage-level policy.
    async fn on_end(&self, _ctx: &NodeContext, _result: &Result<Value, NodeError>) {}
}

/// Maps `node_type` tags to boxed [`NodeExecutor`] implementations.
///
/// The engine resolves every node's type against this map once, before the
/// first stage runs; an unknown tag fails the execution up front.
pub type NodeRegistry = HashMap<String, Arc<dyn NodeExecutor>>;
