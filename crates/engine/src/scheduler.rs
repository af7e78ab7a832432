//! Stage scheduler — drives one execution plan to completion.
//!
//! Stages run strictly in order; within a stage every runnable node is
//! fanned out onto the runtime, gated by a counting semaphore so at most
//! `max_concurrency` nodes are in flight at once. The stage barrier is
//! hard: stage N+1 never starts before every node of stage N is terminal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use nodes::{ErrorPolicy, NodeContext, NodeError, NodeExecutor};

use crate::context::{ContextManager, NodeStatus};
use crate::error::{EngineError, NodeFailure};
use crate::executor::EngineConfig;
use crate::plan::{ExecutionNode, ExecutionPlan};

/// Executor implementations resolved per node ID, built by the engine
/// before the first stage runs.
pub type DispatchTable = HashMap<String, Arc<dyn NodeExecutor>>;

/// Drives one [`ExecutionPlan`] against one [`ContextManager`].
pub struct StageScheduler {
    dispatch: DispatchTable,
    config: EngineConfig,
}

impl StageScheduler {
    pub fn new(dispatch: DispatchTable, config: EngineConfig) -> Self {
        Self { dispatch, config }
    }

    /// Run every stage and return the aggregated workflow output.
    ///
    /// # Errors
    /// - [`EngineError::StageFailure`] when a stage has terminal failures
    ///   and `continue_on_failure` is off.
    /// - [`EngineError::Cancelled`] when the caller aborted the run.
    pub async fn run(
        &self,
        plan: &ExecutionPlan,
        ctx: &Arc<ContextManager>,
        node_ctx: &NodeContext,
        cancel: watch::Receiver<bool>,
    ) -> Result<Value, EngineError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));

        for (stage_idx, stage) in plan.stages().iter().enumerate() {
            if *cancel.borrow() {
                warn!(stage = stage_idx, "execution cancelled before stage start");
                skip_unfinished(plan, ctx).await;
                return Err(EngineError::Cancelled);
            }

            info!(stage = stage_idx, nodes = stage.len(), "starting stage");
            let mut failures = self.run_stage(stage, plan, ctx, node_ctx, &semaphore).await;

            if !failures.is_empty() {
                if !self.config.continue_on_failure {
                    skip_unfinished(plan, ctx).await;
                    return Err(EngineError::StageFailure { stage: stage_idx, failures });
                }
                failures.sort_by(|a, b| a.node_id.cmp(&b.node_id));
                warn!(
                    stage = stage_idx,
                    failed = failures.len(),
                    "stage had failures; continuing per policy"
                );
            }
        }

        Ok(aggregate_output(plan, ctx).await)
    }

    /// Fan a stage out, wait for the barrier, and collect terminal failures.
    async fn run_stage(
        &self,
        stage: &[String],
        plan: &ExecutionPlan,
        ctx: &Arc<ContextManager>,
        node_ctx: &NodeContext,
        semaphore: &Arc<Semaphore>,
    ) -> Vec<NodeFailure> {
        let mut failures = Vec::new();
        let mut join_set: JoinSet<Option<NodeFailure>> = JoinSet::new();

        for node_id in stage {
            let Some(node) = plan.node(node_id) else {
                continue;
            };

            // Upstream gate: every dependency is terminal by the barrier
            // invariant; anything short of completed means this node is
            // unrunnable and is skipped, not failed.
            let mut runnable = true;
            for dep in &node.dependencies {
                if ctx.node_status(dep).await != Some(NodeStatus::Completed) {
                    runnable = false;
                    break;
                }
            }
            if !runnable {
                info!(%node_id, "skipping node: upstream dependency did not complete");
                ctx.mark_skipped(node_id).await;
                continue;
            }

            let Some(executor) = self.dispatch.get(node_id).cloned() else {
                // The engine resolves the dispatch table up front; a hole
                // here means a plan/registry mismatch.
                let msg = format!("no executor resolved for node '{node_id}'");
                error!(%node_id, "{msg}");
                ctx.mark_failed(node_id, msg.clone()).await;
                failures.push(NodeFailure { node_id: node_id.clone(), error: msg });
                continue;
            };

            let input = assemble_input(node, ctx).await;
            ctx.mark_queued(node_id, input.clone()).await;

            let node = node.clone();
            let ctx = Arc::clone(ctx);
            let node_ctx = node_ctx.clone();
            let semaphore = Arc::clone(semaphore);

            join_set.spawn(async move {
                // Owned permit: released on every exit path when the task
                // body drops it, waking exactly one waiter.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let msg = "admission gate closed".to_string();
                        ctx.mark_failed(&node.id, msg.clone()).await;
                        return Some(NodeFailure { node_id: node.id.clone(), error: msg });
                    }
                };
                run_node(node, executor, input, node_ctx, ctx).await
            });
        }

        // Hard barrier: every dispatched node must reach a terminal state
        // before the next stage may start.
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(failure)) => failures.push(failure),
                Ok(None) => {}
                Err(join_err) => {
                    error!("node task aborted: {join_err}");
                    failures.push(NodeFailure {
                        node_id: "<task>".to_string(),
                        error: format!("node task aborted: {join_err}"),
                    });
                }
            }
        }

        failures
    }
}

/// Run one node to its per-node terminal outcome, applying its declared
/// error policy. Retry is an explicit loop with an attempt counter, never
/// recursive re-invocation.
async fn run_node(
    node: ExecutionNode,
    executor: Arc<dyn NodeExecutor>,
    input: Value,
    node_ctx: NodeContext,
    ctx: Arc<ContextManager>,
) -> Option<NodeFailure> {
    executor.on_start(&node_ctx).await;

    let mut attempt: u32 = 0;
    let result = loop {
        attempt += 1;
        ctx.mark_running(&node.id).await;

        let outcome = match node.timeout_ms {
            Some(ms) => {
                let limit = Duration::from_millis(ms);
                match timeout(limit, executor.execute(input.clone(), &node_ctx)).await {
                    Ok(res) => res,
                    // The in-flight attempt is abandoned; its side effects
                    // may still land out-of-band.
                    Err(_) => Err(NodeError::Timeout(limit)),
                }
            }
            None => executor.execute(input.clone(), &node_ctx).await,
        };

        match outcome {
            Ok(output) => break Ok(output),
            Err(err) => match &node.on_error {
                ErrorPolicy::Propagate => break Err(err),
                ErrorPolicy::Fallback { value } => {
                    warn!(node_id = %node.id, %err, "node failed; substituting fallback output");
                    break Ok(value.clone());
                }
                ErrorPolicy::Retry { max_attempts, delay_ms } => {
                    if attempt > *max_attempts {
                        break Err(err);
                    }
                    warn!(
                        node_id = %node.id,
                        attempt,
                        max_attempts,
                        delay_ms,
                        %err,
                        "attempt failed, retrying"
                    );
                    ctx.mark_retrying(&node.id).await;
                    sleep(Duration::from_millis(*delay_ms)).await;
                }
            },
        }
    };

    executor.on_end(&node_ctx, &result).await;

    match result {
        Ok(output) => {
            info!(node_id = %node.id, attempts = attempt, "node completed");
            ctx.mark_completed(&node.id, output).await;
            None
        }
        Err(NodeError::Timeout(limit)) => {
            let msg = format!("timed out after {limit:?}");
            error!(node_id = %node.id, attempts = attempt, "node {msg}");
            ctx.mark_timed_out(&node.id, msg.clone()).await;
            Some(NodeFailure { node_id: node.id, error: msg })
        }
        Err(err) => {
            let msg = err.to_string();
            error!(node_id = %node.id, attempts = attempt, "node failed: {msg}");
            ctx.mark_failed(&node.id, msg.clone()).await;
            Some(NodeFailure { node_id: node.id, error: msg })
        }
    }
}

/// Build one node's input: the trigger input, a map of upstream outputs,
/// and a snapshot of the shared variables.
async fn assemble_input(node: &ExecutionNode, ctx: &ContextManager) -> Value {
    let mut upstream = Map::new();
    for dep in &node.dependencies {
        if let Some(output) = ctx.node_output(dep).await {
            upstream.insert(dep.clone(), output);
        }
    }

    let vars: Map<String, Value> = ctx.snapshot_variables().await.into_iter().collect();

    json!({
        "trigger": ctx.input().clone(),
        "upstream": Value::Object(upstream),
        "vars": Value::Object(vars),
    })
}

/// Aggregate leaf-node outputs into the workflow output: a single leaf
/// yields its output directly, several leaves yield a map keyed by node ID.
async fn aggregate_output(plan: &ExecutionPlan, ctx: &ContextManager) -> Value {
    let mut outputs: Vec<(String, Value)> = Vec::new();
    for leaf in plan.leaves() {
        if let Some(output) = ctx.node_output(&leaf.id).await {
            outputs.push((leaf.id.clone(), output));
        }
    }

    match outputs.len() {
        0 => Value::Null,
        1 => outputs.remove(0).1,
        _ => Value::Object(outputs.into_iter().collect()),
    }
}

/// Mark every node that has not reached a terminal state as skipped, so an
/// aborted run still leaves a fully terminal node trail.
async fn skip_unfinished(plan: &ExecutionPlan, ctx: &ContextManager) {
    for node_id in plan.node_ids() {
        let terminal = ctx
            .node_status(node_id)
            .await
            .is_some_and(NodeStatus::is_terminal);
        if !terminal {
            ctx.mark_skipped(node_id).await;
        }
    }
}
