//! Workflow engine façade.
//!
//! `WorkflowEngine` is the caller-facing orchestrator:
//! 1. Looks the workflow up in the graph source.
//! 2. Validates it and builds (or reuses a cached) execution plan.
//! 3. Resolves every node's type tag against the registry up front.
//! 4. Creates exactly one execution context and drives the stage scheduler.
//! 5. Folds the outcome into a `WorkflowResult` with a full node trail.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tracing::{info, instrument};
use uuid::Uuid;

use nodes::{NodeContext, NodeRegistry};

use crate::context::{ContextManager, ExecutionMetrics, ExecutionStatus, NodeStatus};
use crate::error::{EngineError, NodeFailure};
use crate::plan::ExecutionPlan;
use crate::scheduler::{DispatchTable, StageScheduler};
use crate::Workflow;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the engine. Deployment-wide, not per node.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of nodes simultaneously in flight within a stage.
    pub max_concurrency: usize,
    /// When true, a stage failure records the failed nodes and the run
    /// continues; downstream nodes with unmet dependencies are skipped.
    pub continue_on_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            continue_on_failure: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Graph source
// ---------------------------------------------------------------------------

/// Read-only lookup supplying workflow definitions. Storage is the
/// caller's concern; the engine only ever reads.
pub trait GraphSource: Send + Sync {
    fn get(&self, workflow_id: Uuid) -> Option<Workflow>;
}

/// In-memory graph source for tests, examples, and embedders that manage
/// definitions themselves.
#[derive(Default)]
pub struct InMemoryGraphSource {
    graphs: std::sync::RwLock<HashMap<Uuid, Workflow>>,
}

impl InMemoryGraphSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, workflow: Workflow) {
        self.graphs
            .write()
            .expect("graph source lock poisoned")
            .insert(workflow.id, workflow);
    }
}

impl GraphSource for InMemoryGraphSource {
    fn get(&self, workflow_id: Uuid) -> Option<Workflow> {
        self.graphs
            .read()
            .expect("graph source lock poisoned")
            .get(&workflow_id)
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// One node's terminal record in the returned trail.
#[derive(Debug, Clone, Serialize)]
pub struct NodeTrailEntry {
    pub node_id: String,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// The result of running a full workflow. Returned for completed *and*
/// failed runs so partial outputs survive for debugging; only errors
/// raised before execution starts surface as `Err` from `execute`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    /// Aggregated leaf output; `null` when the run failed before producing one.
    pub output: Value,
    /// Run-level error detail when `status` is failed.
    pub error: Option<String>,
    /// Terminal failures, in node-ID order. Non-empty on a failed run and on
    /// a completed run under `continue_on_failure`.
    pub failures: Vec<NodeFailure>,
    /// Every planned node's terminal record, in stage order.
    pub node_trail: Vec<NodeTrailEntry>,
    pub metrics: ExecutionMetrics,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Caller-facing entry point. One engine serves many executions; each call
/// to [`WorkflowEngine::execute`] creates exactly one context.
pub struct WorkflowEngine {
    source: Arc<dyn GraphSource>,
    registry: NodeRegistry,
    config: EngineConfig,
    // Plans are deterministic for an unchanged workflow, so they are cached
    // per workflow ID and shared across executions.
    plans: RwLock<HashMap<Uuid, Arc<ExecutionPlan>>>,
    active: RwLock<HashMap<Uuid, watch::Sender<bool>>>,
}

impl WorkflowEngine {
    pub fn new(source: Arc<dyn GraphSource>, registry: NodeRegistry, config: EngineConfig) -> Self {
        Self {
            source,
            registry,
            config,
            plans: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Run the workflow and return the terminal result.
    ///
    /// # Errors
    /// Returns `EngineError` for failures before any node runs: unknown
    /// workflow, validation failure, or an unregistered node type. Runtime
    /// failures come back as an `Ok` result with `status: failed` so the
    /// node trail is preserved.
    pub async fn execute(&self, workflow_id: Uuid, input: Value) -> Result<WorkflowResult, EngineError> {
        self.execute_with_execution_id(Uuid::new_v4(), workflow_id, input)
            .await
    }

    /// Like [`WorkflowEngine::execute`], with a caller-chosen execution ID
    /// so the run can be addressed (e.g. cancelled) while in flight.
    #[instrument(skip(self, input), fields(%workflow_id, %execution_id))]
    pub async fn execute_with_execution_id(
        &self,
        execution_id: Uuid,
        workflow_id: Uuid,
        input: Value,
    ) -> Result<WorkflowResult, EngineError> {
        let workflow = self
            .source
            .get(workflow_id)
            .ok_or(EngineError::GraphNotFound(workflow_id))?;

        // Validation and planning happen before the context exists, so a
        // rejected graph leaves nothing behind.
        let plan = self.plan_for(&workflow).await?;
        let dispatch = self.resolve_dispatch(&workflow)?;

        info!(
            nodes = workflow.nodes.len(),
            stages = plan.stages().len(),
            "starting workflow execution"
        );

        let ctx = Arc::new(ContextManager::new(execution_id, workflow.id, input.clone()));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.active.write().await.insert(execution_id, cancel_tx);

        let node_ctx = NodeContext::new(
            workflow.id,
            execution_id,
            input,
            ctx.variables(),
            cancel_rx.clone(),
        );

        let scheduler = StageScheduler::new(dispatch, self.config.clone());
        let outcome = scheduler.run(&plan, &ctx, &node_ctx, cancel_rx).await;

        self.active.write().await.remove(&execution_id);

        // The context always reaches a terminal status matching the
        // returned outcome; no run is left `running`.
        let result = match outcome {
            Ok(output) => {
                ctx.complete(output).await;
                self.build_result(&plan, &ctx, Vec::new()).await
            }
            Err(EngineError::StageFailure { stage, failures }) => {
                ctx.fail(format!("stage {stage} failed")).await;
                self.build_result(&plan, &ctx, failures).await
            }
            Err(err @ EngineError::Cancelled) => {
                ctx.fail(err.to_string()).await;
                self.build_result(&plan, &ctx, Vec::new()).await
            }
            Err(err) => {
                ctx.fail(err.to_string()).await;
                return Err(err);
            }
        };

        let metrics = &result.metrics;
        info!(
            status = ?result.status,
            completed = metrics.completed,
            failed = metrics.failed,
            timed_out = metrics.timed_out,
            skipped = metrics.skipped,
            retries = metrics.retries,
            duration_ms = metrics.duration_ms,
            "workflow execution finished"
        );

        Ok(result)
    }

    /// Signal cancellation to an in-flight execution: in-flight nodes see
    /// the flag, and no further stage starts.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let active = self.active.read().await;
        match active.get(&execution_id) {
            Some(cancel_tx) => {
                info!(%execution_id, "cancellation requested");
                let _ = cancel_tx.send(true);
                Ok(())
            }
            None => Err(EngineError::ExecutionNotActive(execution_id)),
        }
    }

    /// Validate the workflow and return its cached or freshly built plan.
    async fn plan_for(&self, workflow: &Workflow) -> Result<Arc<ExecutionPlan>, EngineError> {
        if let Some(plan) = self.plans.read().await.get(&workflow.id) {
            return Ok(Arc::clone(plan));
        }
        let plan = Arc::new(ExecutionPlan::build(workflow)?);
        self.plans
            .write()
            .await
            .insert(workflow.id, Arc::clone(&plan));
        Ok(plan)
    }

    /// Resolve every node's type tag once, before anything runs.
    fn resolve_dispatch(&self, workflow: &Workflow) -> Result<DispatchTable, EngineError> {
        let mut dispatch = DispatchTable::with_capacity(workflow.nodes.len());
        for node in &workflow.nodes {
            let executor = self.registry.get(&node.node_type).cloned().ok_or_else(|| {
                EngineError::UnknownNodeType {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                }
            })?;
            dispatch.insert(node.id.clone(), executor);
        }
        Ok(dispatch)
    }

    async fn build_result(
        &self,
        plan: &ExecutionPlan,
        ctx: &ContextManager,
        mut failures: Vec<NodeFailure>,
    ) -> WorkflowResult {
        let mut node_trail = Vec::new();
        for node_id in plan.node_ids() {
            let state = ctx.node_state(node_id).await;
            let (status, started_at, ended_at, attempts, output, error) = match state {
                Some(s) => (s.status, s.started_at, s.ended_at, s.attempts, s.output, s.error),
                None => (NodeStatus::Pending, None, None, 0, None, None),
            };
            node_trail.push(NodeTrailEntry {
                node_id: node_id.clone(),
                status,
                started_at,
                ended_at,
                attempts,
                output,
                error,
            });
        }

        // Under continue_on_failure the scheduler swallows per-stage failure
        // lists, so recover them from the trail.
        if failures.is_empty() {
            failures = node_trail
                .iter()
                .filter(|entry| {
                    matches!(entry.status, NodeStatus::Failed | NodeStatus::TimedOut)
                })
                .map(|entry| NodeFailure {
                    node_id: entry.node_id.clone(),
                    error: entry.error.clone().unwrap_or_default(),
                })
                .collect();
        }
        failures.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        WorkflowResult {
            execution_id: ctx.execution_id(),
            workflow_id: ctx.workflow_id(),
            status: ctx.status().await,
            output: ctx.final_output().await.unwrap_or(Value::Null),
            error: ctx.run_error().await,
            failures,
            node_trail,
            metrics: ctx.metrics().await,
        }
    }
}
