//! Per-execution mutable state: node statuses, shared variables, metrics.
//!
//! One [`ContextManager`] exists per execution and is the single source of
//! truth for everything that changes while a run is in flight. Node states
//! and the variable map sit behind separate locks so concurrent nodes in a
//! stage never contend on one global lock; writes to node states target
//! disjoint keys by construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle of one node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    TimedOut,
    Skipped,
}

impl NodeStatus {
    /// Terminal statuses admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::TimedOut | NodeStatus::Skipped
        )
    }
}

/// Overall status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

/// Per-node execution record. Mutated by the worker running the node,
/// frozen once the node reaches a terminal status.
#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Number of `execute` invocations so far (1 + retries).
    pub attempts: u32,
}

impl NodeState {
    fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            started_at: None,
            ended_at: None,
            last_input: None,
            output: None,
            error: None,
            attempts: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Aggregated counters for one finished (or aborted) execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionMetrics {
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub retries: u32,
    pub duration_ms: i64,
}

// ---------------------------------------------------------------------------
// ContextManager
// ---------------------------------------------------------------------------

struct RunState {
    status: ExecutionStatus,
    ended_at: Option<DateTime<Utc>>,
    output: Option<Value>,
    error: Option<String>,
}

/// Owns one execution's mutable state for its whole lifetime.
pub struct ContextManager {
    execution_id: Uuid,
    workflow_id: Uuid,
    input: Value,
    started_at: DateTime<Utc>,
    run: RwLock<RunState>,
    node_states: RwLock<HashMap<String, NodeState>>,
    variables: Arc<RwLock<HashMap<String, Value>>>,
    retries: AtomicU32,
}

impl ContextManager {
    pub fn new(execution_id: Uuid, workflow_id: Uuid, input: Value) -> Self {
        Self {
            execution_id,
            workflow_id,
            input,
            started_at: Utc::now(),
            run: RwLock::new(RunState {
                status: ExecutionStatus::Running,
                ended_at: None,
                output: None,
                error: None,
            }),
            node_states: RwLock::new(HashMap::new()),
            variables: Arc::new(RwLock::new(HashMap::new())),
            retries: AtomicU32::new(0),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Handle to the shared variable store, for building the `NodeContext`.
    pub fn variables(&self) -> Arc<RwLock<HashMap<String, Value>>> {
        Arc::clone(&self.variables)
    }

    // -----------------------------------------------------------------------
    // Node state transitions
    // -----------------------------------------------------------------------

    /// Transition a node's state. Ignored once the node is terminal, so a
    /// late writer can never resurrect a finished node.
    async fn transition(&self, node_id: &str, apply: impl FnOnce(&mut NodeState)) {
        let mut states = self.node_states.write().await;
        let state = states
            .entry(node_id.to_string())
            .or_insert_with(NodeState::pending);
        if state.status.is_terminal() {
            debug!(node_id, status = ?state.status, "ignoring transition on terminal node");
            return;
        }
        apply(state);
    }

    /// Record that a node was handed to the admission gate with its
    /// assembled input.
    pub async fn mark_queued(&self, node_id: &str, input: Value) {
        self.transition(node_id, |s| {
            s.status = NodeStatus::Queued;
            s.last_input = Some(input);
        })
        .await;
    }

    /// Record the start of an attempt. The first call stamps `started_at`.
    pub async fn mark_running(&self, node_id: &str) {
        self.transition(node_id, |s| {
            s.status = NodeStatus::Running;
            s.attempts += 1;
            if s.started_at.is_none() {
                s.started_at = Some(Utc::now());
            }
        })
        .await;
    }

    /// Record that a failed attempt will be re-invoked after its delay.
    pub async fn mark_retrying(&self, node_id: &str) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.transition(node_id, |s| s.status = NodeStatus::Retrying).await;
    }

    pub async fn mark_completed(&self, node_id: &str, output: Value) {
        self.transition(node_id, |s| {
            s.status = NodeStatus::Completed;
            s.output = Some(output);
            s.ended_at = Some(Utc::now());
        })
        .await;
    }

    pub async fn mark_failed(&self, node_id: &str, error: String) {
        self.transition(node_id, |s| {
            s.status = NodeStatus::Failed;
            s.error = Some(error);
            s.ended_at = Some(Utc::now());
        })
        .await;
    }

    pub async fn mark_timed_out(&self, node_id: &str, error: String) {
        self.transition(node_id, |s| {
            s.status = NodeStatus::TimedOut;
            s.error = Some(error);
            s.ended_at = Some(Utc::now());
        })
        .await;
    }

    /// Mark a node that will never run because an upstream dependency did
    /// not complete.
    pub async fn mark_skipped(&self, node_id: &str) {
        self.transition(node_id, |s| {
            s.status = NodeStatus::Skipped;
            s.ended_at = Some(Utc::now());
        })
        .await;
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_states.read().await.get(node_id).map(|s| s.status)
    }

    pub async fn node_output(&self, node_id: &str) -> Option<Value> {
        self.node_states
            .read()
            .await
            .get(node_id)
            .and_then(|s| s.output.clone())
    }

    pub async fn node_state(&self, node_id: &str) -> Option<NodeState> {
        self.node_states.read().await.get(node_id).cloned()
    }

    /// Consistent point-in-time copy of the shared variable map, taken at
    /// stage-input-assembly time.
    pub async fn snapshot_variables(&self) -> HashMap<String, Value> {
        self.variables.read().await.clone()
    }

    pub async fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.variables.write().await.insert(key.into(), value);
    }

    pub async fn get_variable(&self, key: &str) -> Option<Value> {
        self.variables.read().await.get(key).cloned()
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    /// Mark the execution completed. The first terminal transition wins;
    /// later calls are ignored.
    pub async fn complete(&self, output: Value) {
        let mut run = self.run.write().await;
        if run.status != ExecutionStatus::Running {
            debug!(execution_id = %self.execution_id, "ignoring complete() on finished execution");
            return;
        }
        run.status = ExecutionStatus::Completed;
        run.output = Some(output);
        run.ended_at = Some(Utc::now());
    }

    /// Mark the execution failed. The first terminal transition wins.
    pub async fn fail(&self, error: String) {
        let mut run = self.run.write().await;
        if run.status != ExecutionStatus::Running {
            debug!(execution_id = %self.execution_id, "ignoring fail() on finished execution");
            return;
        }
        run.status = ExecutionStatus::Failed;
        run.error = Some(error);
        run.ended_at = Some(Utc::now());
    }

    pub async fn status(&self) -> ExecutionStatus {
        self.run.read().await.status
    }

    pub async fn final_output(&self) -> Option<Value> {
        self.run.read().await.output.clone()
    }

    pub async fn run_error(&self) -> Option<String> {
        self.run.read().await.error.clone()
    }

    /// Aggregate terminal counters. Duration is measured up to `ended_at`
    /// when the run is finished, otherwise up to now.
    pub async fn metrics(&self) -> ExecutionMetrics {
        let mut metrics = ExecutionMetrics {
            retries: self.retries.load(Ordering::Relaxed),
            ..Default::default()
        };

        for state in self.node_states.read().await.values() {
            match state.status {
                NodeStatus::Completed => metrics.completed += 1,
                NodeStatus::Failed => metrics.failed += 1,
                NodeStatus::TimedOut => metrics.timed_out += 1,
                NodeStatus::Skipped => metrics.skipped += 1,
                _ => {}
            }
        }

        let end = self.run.read().await.ended_at.unwrap_or_else(Utc::now);
        metrics.duration_ms = (end - self.started_at).num_milliseconds();
        metrics
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> ContextManager {
        ContextManager::new(Uuid::new_v4(), Uuid::new_v4(), json!({ "seed": 1 }))
    }

    #[tokio::test]
    async fn node_transitions_track_attempts_and_timestamps() {
        let ctx = manager();

        ctx.mark_queued("a", json!({ "x": 1 })).await;
        ctx.mark_running("a").await;
        ctx.mark_retrying("a").await;
        ctx.mark_running("a").await;
        ctx.mark_completed("a", json!({ "done": true })).await;

        let state = ctx.node_state("a").await.unwrap();
        assert_eq!(state.status, NodeStatus::Completed);
        assert_eq!(state.attempts, 2);
        assert!(state.started_at.is_some());
        assert!(state.ended_at.is_some());
        assert_eq!(state.output, Some(json!({ "done": true })));
    }

    #[tokio::test]
    async fn terminal_node_state_is_immutable() {
        let ctx = manager();

        ctx.mark_running("a").await;
        ctx.mark_completed("a", json!(1)).await;
        ctx.mark_failed("a", "too late".into()).await;

        let state = ctx.node_state("a").await.unwrap();
        assert_eq!(state.status, NodeStatus::Completed);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn first_terminal_run_transition_wins() {
        let ctx = manager();

        ctx.complete(json!({ "out": 1 })).await;
        ctx.fail("should be ignored".into()).await;

        assert_eq!(ctx.status().await, ExecutionStatus::Completed);
        assert_eq!(ctx.final_output().await, Some(json!({ "out": 1 })));
        assert!(ctx.run_error().await.is_none());
    }

    #[tokio::test]
    async fn variables_are_shared_and_snapshot_is_stable() {
        let ctx = manager();

        ctx.set_variable("k", json!("v1")).await;
        let snapshot = ctx.snapshot_variables().await;
        ctx.set_variable("k", json!("v2")).await;

        assert_eq!(snapshot["k"], json!("v1"));
        assert_eq!(ctx.get_variable("k").await, Some(json!("v2")));
    }

    #[tokio::test]
    async fn metrics_count_terminal_statuses() {
        let ctx = manager();

        ctx.mark_running("ok").await;
        ctx.mark_completed("ok", json!(1)).await;
        ctx.mark_running("bad").await;
        ctx.mark_failed("bad", "boom".into()).await;
        ctx.mark_skipped("down").await;
        ctx.mark_retrying("ok2").await;
        ctx.complete(json!(null)).await;

        let metrics = ctx.metrics().await;
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.skipped, 1);
        assert_eq!(metrics.retries, 1);
    }
}
