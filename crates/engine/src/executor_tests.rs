//! Integration tests for the workflow execution engine.
//!
//! These run whole workflows end to end against `MockNode` doubles — no
//! real node implementations and no external services.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use uuid::Uuid;

use nodes::mock::{MockBehaviour, MockNode};
use nodes::{ErrorPolicy, NodeExecutor, NodeRegistry};

use crate::{
    Edge, EngineConfig, EngineError, ExecutionStatus, InMemoryGraphSource, NodeDefinition,
    NodeStatus, NodeTrailEntry, Workflow, WorkflowEngine, WorkflowResult,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn engine_for(
    workflow: Workflow,
    registry: NodeRegistry,
    config: EngineConfig,
) -> (WorkflowEngine, Uuid) {
    let source = Arc::new(InMemoryGraphSource::new());
    let workflow_id = workflow.id;
    source.insert(workflow);
    (WorkflowEngine::new(source, registry, config), workflow_id)
}

fn registry(entries: Vec<(&str, Arc<MockNode>)>) -> NodeRegistry {
    entries
        .into_iter()
        .map(|(tag, node)| (tag.to_string(), node as Arc<dyn NodeExecutor>))
        .collect()
}

fn trail_entry<'a>(result: &'a WorkflowResult, node_id: &str) -> &'a NodeTrailEntry {
    result
        .node_trail
        .iter()
        .find(|entry| entry.node_id == node_id)
        .unwrap_or_else(|| panic!("no trail entry for '{node_id}'"))
}

// ---------------------------------------------------------------------------
// Happy path + concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn diamond_runs_parallel_stage_and_respects_barrier() {
    // a → b → d, a → c → d. b and c share one sleeping mock so their
    // overlap (and only theirs) is visible on its concurrency gauge.
    let start = MockNode::returning("start", json!({ "seeded": true }));
    let branch = MockNode::sleeping("branch", Duration::from_millis(30));
    let merge = MockNode::returning("merge", json!({ "merged": true }));

    let workflow = Workflow::new(
        "diamond",
        vec![
            NodeDefinition::new("a", "start"),
            NodeDefinition::new("b", "branch"),
            NodeDefinition::new("c", "branch"),
            NodeDefinition::new("d", "merge"),
        ],
        vec![
            Edge::new("a", "b"),
            Edge::new("a", "c"),
            Edge::new("b", "d"),
            Edge::new("c", "d"),
        ],
    );

    let (engine, workflow_id) = engine_for(
        workflow,
        registry(vec![
            ("start", Arc::clone(&start)),
            ("branch", Arc::clone(&branch)),
            ("merge", Arc::clone(&merge)),
        ]),
        EngineConfig { max_concurrency: 2, ..Default::default() },
    );

    let result = engine.execute(workflow_id, json!({ "run": 1 })).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(branch.call_count(), 2);
    // Both branches were dispatched together and slept; they must overlap.
    assert_eq!(branch.max_concurrent(), 2);

    // Stage barrier: the merge node starts only after both branches ended.
    let d = trail_entry(&result, "d");
    for branch_id in ["b", "c"] {
        let entry = trail_entry(&result, branch_id);
        assert!(entry.ended_at.unwrap() <= d.started_at.unwrap());
    }

    // Single leaf: workflow output is d's output.
    assert_eq!(result.output["node"], "merge");
    assert_eq!(result.output["merged"], true);

    // d's input carried both upstream outputs.
    let d_input = &merge.recorded_inputs()[0];
    assert_eq!(d_input["upstream"]["b"]["slept"], true);
    assert_eq!(d_input["upstream"]["c"]["slept"], true);
    assert_eq!(d_input["trigger"]["run"], 1);
}

#[tokio::test]
async fn concurrency_limit_bounds_simultaneous_nodes() {
    let sleepy = MockNode::sleeping("sleepy", Duration::from_millis(30));

    let nodes = (0..6)
        .map(|i| NodeDefinition::new(format!("n{i}"), "sleepy"))
        .collect();
    let workflow = Workflow::new("wide", nodes, vec![]);

    let (engine, workflow_id) = engine_for(
        workflow,
        registry(vec![("sleepy", Arc::clone(&sleepy))]),
        EngineConfig { max_concurrency: 2, ..Default::default() },
    );

    let result = engine.execute(workflow_id, json!({})).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(sleepy.call_count(), 6);
    // At no point were more than two nodes running.
    assert!(sleepy.max_concurrent() <= 2);
}

#[tokio::test]
async fn empty_workflow_completes_with_null_output() {
    let workflow = Workflow::new("empty", vec![], vec![]);
    let (engine, workflow_id) = engine_for(workflow, NodeRegistry::new(), EngineConfig::default());

    let result = engine.execute(workflow_id, json!({})).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output, Value::Null);
    assert!(result.node_trail.is_empty());
}

#[tokio::test]
async fn repeated_executions_reuse_the_cached_plan() {
    let solo = MockNode::returning("solo", json!({ "ok": true }));
    let workflow = Workflow::new("cached", vec![NodeDefinition::new("only", "solo")], vec![]);

    let (engine, workflow_id) = engine_for(
        workflow,
        registry(vec![("solo", Arc::clone(&solo))]),
        EngineConfig::default(),
    );

    let first = engine.execute(workflow_id, json!({})).await.unwrap();
    let second = engine.execute(workflow_id, json!({})).await.unwrap();

    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(second.status, ExecutionStatus::Completed);
    assert_ne!(first.execution_id, second.execution_id);
    assert_eq!(solo.call_count(), 2);
}

// ---------------------------------------------------------------------------
// Retry, fallback, timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_retries_attempt_exactly_max_plus_one_times() {
    let flaky = MockNode::always_failing("flaky", "always down");

    let workflow = Workflow::new(
        "retry-exhaust",
        vec![NodeDefinition::new("retry_me", "flaky")
            .with_policy(ErrorPolicy::Retry { max_attempts: 2, delay_ms: 50 })],
        vec![],
    );

    let (engine, workflow_id) = engine_for(
        workflow,
        registry(vec![("flaky", Arc::clone(&flaky))]),
        EngineConfig::default(),
    );

    let started = Instant::now();
    let result = engine.execute(workflow_id, json!({})).await.unwrap();
    let elapsed = started.elapsed();

    // Initial attempt plus two retries, then terminal failure.
    assert_eq!(flaky.call_count(), 3);
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(elapsed >= Duration::from_millis(100), "two retry delays expected, got {elapsed:?}");

    let entry = trail_entry(&result, "retry_me");
    assert_eq!(entry.status, NodeStatus::Failed);
    assert_eq!(entry.attempts, 3);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].node_id, "retry_me");
    assert_eq!(result.metrics.retries, 2);
}

#[tokio::test]
async fn retry_recovers_when_a_later_attempt_succeeds() {
    let flaky = MockNode::new(
        "flaky",
        MockBehaviour::FailTimes { failures: 1, then: json!({ "recovered": true }) },
    );

    let workflow = Workflow::new(
        "retry-recover",
        vec![NodeDefinition::new("eventually", "flaky")
            .with_policy(ErrorPolicy::Retry { max_attempts: 2, delay_ms: 10 })],
        vec![],
    );

    let (engine, workflow_id) = engine_for(
        workflow,
        registry(vec![("flaky", Arc::clone(&flaky))]),
        EngineConfig::default(),
    );

    let result = engine.execute(workflow_id, json!({})).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(flaky.call_count(), 2);
    assert_eq!(trail_entry(&result, "eventually").attempts, 2);
    assert_eq!(result.output["recovered"], true);
    assert!(result.failures.is_empty());
}

#[tokio::test]
async fn fallback_swallows_failure_and_feeds_downstream() {
    let broken = MockNode::always_failing("broken", "no upstream service");
    let consumer = MockNode::returning("consumer", json!({ "consumed": true }));

    let workflow = Workflow::new(
        "fallback",
        vec![
            NodeDefinition::new("a", "broken")
                .with_policy(ErrorPolicy::Fallback { value: json!({ "stand_in": true }) }),
            NodeDefinition::new("b", "consumer"),
        ],
        vec![Edge::new("a", "b")],
    );

    let (engine, workflow_id) = engine_for(
        workflow,
        registry(vec![
            ("broken", Arc::clone(&broken)),
            ("consumer", Arc::clone(&consumer)),
        ]),
        EngineConfig::default(),
    );

    let result = engine.execute(workflow_id, json!({})).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(trail_entry(&result, "a").status, NodeStatus::Completed);
    assert!(result.failures.is_empty());

    let b_input = &consumer.recorded_inputs()[0];
    assert_eq!(b_input["upstream"]["a"]["stand_in"], true);
}

#[tokio::test]
async fn timeout_is_a_failed_attempt_under_the_node_policy() {
    let stuck = MockNode::new("stuck", MockBehaviour::NeverComplete);

    let workflow = Workflow::new(
        "timeout",
        vec![NodeDefinition::new("slow", "stuck").with_timeout_ms(50)],
        vec![],
    );

    let (engine, workflow_id) = engine_for(
        workflow,
        registry(vec![("stuck", Arc::clone(&stuck))]),
        EngineConfig::default(),
    );

    let result = engine.execute(workflow_id, json!({})).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    let entry = trail_entry(&result, "slow");
    assert_eq!(entry.status, NodeStatus::TimedOut);
    assert!(entry.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(stuck.call_count(), 1);
}

// ---------------------------------------------------------------------------
// Stage failure semantics
// ---------------------------------------------------------------------------

/// Builds the two-branch fixture: stage 0 is {p, q}, r depends on p,
/// s depends on q. p always fails; q takes a little while and succeeds.
fn partial_failure_workflow() -> (Workflow, Arc<MockNode>, Arc<MockNode>) {
    let failing = MockNode::always_failing("failing", "p is down");
    let steady = MockNode::sleeping("steady", Duration::from_millis(20));

    let workflow = Workflow::new(
        "partial",
        vec![
            NodeDefinition::new("p", "failing"),
            NodeDefinition::new("q", "steady"),
            NodeDefinition::new("r", "steady"),
            NodeDefinition::new("s", "steady"),
        ],
        vec![Edge::new("p", "r"), Edge::new("q", "s")],
    );

    (workflow, failing, steady)
}

#[tokio::test]
async fn stage_failure_aborts_run_and_skips_downstream() {
    let (workflow, _failing, steady) = partial_failure_workflow();

    let (engine, workflow_id) = engine_for(
        workflow,
        registry(vec![
            ("failing", MockNode::always_failing("failing", "p is down")),
            ("steady", Arc::clone(&steady)),
        ]),
        EngineConfig::default(),
    );

    let result = engine.execute(workflow_id, json!({})).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("stage 0"));
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].node_id, "p");

    // q was mid-flight when p failed; the barrier let it finish.
    assert_eq!(trail_entry(&result, "q").status, NodeStatus::Completed);
    // Nothing past the failed stage ran.
    assert_eq!(trail_entry(&result, "r").status, NodeStatus::Skipped);
    assert_eq!(trail_entry(&result, "s").status, NodeStatus::Skipped);
    assert_eq!(steady.call_count(), 1);
}

#[tokio::test]
async fn continue_on_failure_skips_only_dependents_of_the_failure() {
    let (workflow, failing, steady) = partial_failure_workflow();

    let (engine, workflow_id) = engine_for(
        workflow,
        registry(vec![
            ("failing", Arc::clone(&failing)),
            ("steady", Arc::clone(&steady)),
        ]),
        EngineConfig { continue_on_failure: true, ..Default::default() },
    );

    let result = engine.execute(workflow_id, json!({})).await.unwrap();

    // The run finished; the failure is recorded, not escalated.
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].node_id, "p");

    assert_eq!(trail_entry(&result, "q").status, NodeStatus::Completed);
    assert_eq!(trail_entry(&result, "r").status, NodeStatus::Skipped);
    assert_eq!(trail_entry(&result, "s").status, NodeStatus::Completed);
    // q and s ran; r never did.
    assert_eq!(steady.call_count(), 2);
}

// ---------------------------------------------------------------------------
// Shared variables
// ---------------------------------------------------------------------------

#[tokio::test]
async fn variables_set_upstream_are_visible_downstream() {
    let publisher = MockNode::new(
        "publisher",
        MockBehaviour::SetVariable {
            key: "token".into(),
            value: json!("secret-123"),
            then: json!({ "published": true }),
        },
    );
    let reader = MockNode::returning("reader", json!({ "read": true }));

    let workflow = Workflow::new(
        "vars",
        vec![
            NodeDefinition::new("setter", "publisher"),
            NodeDefinition::new("getter", "reader"),
        ],
        vec![Edge::new("setter", "getter")],
    );

    let (engine, workflow_id) = engine_for(
        workflow,
        registry(vec![
            ("publisher", Arc::clone(&publisher)),
            ("reader", Arc::clone(&reader)),
        ]),
        EngineConfig::default(),
    );

    let result = engine.execute(workflow_id, json!({})).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    let getter_input = &reader.recorded_inputs()[0];
    assert_eq!(getter_input["vars"]["token"], "secret-123");
}

// ---------------------------------------------------------------------------
// Pre-execution failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_node_type_fails_before_any_node_runs() {
    let known = MockNode::returning("known", json!({}));

    let workflow = Workflow::new(
        "bad-type",
        vec![
            NodeDefinition::new("ok", "known"),
            NodeDefinition::new("mystery", "ghost"),
        ],
        vec![],
    );

    let (engine, workflow_id) = engine_for(
        workflow,
        registry(vec![("known", Arc::clone(&known))]),
        EngineConfig::default(),
    );

    let err = engine.execute(workflow_id, json!({})).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::UnknownNodeType { node_id, node_type }
            if node_id == "mystery" && node_type == "ghost"
    ));
    assert_eq!(known.call_count(), 0);
}

#[tokio::test]
async fn cyclic_workflow_is_rejected_before_execution() {
    let mock = MockNode::returning("mock", json!({}));

    let workflow = Workflow::new(
        "cyclic",
        vec![
            NodeDefinition::new("x", "mock"),
            NodeDefinition::new("y", "mock"),
        ],
        vec![Edge::new("x", "y"), Edge::new("y", "x")],
    );

    let (engine, workflow_id) = engine_for(
        workflow,
        registry(vec![("mock", Arc::clone(&mock))]),
        EngineConfig::default(),
    );

    let err = engine.execute(workflow_id, json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::CycleDetected { .. }));
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn missing_workflow_is_reported() {
    let engine = WorkflowEngine::new(
        Arc::new(InMemoryGraphSource::new()),
        NodeRegistry::new(),
        EngineConfig::default(),
    );

    let missing = Uuid::new_v4();
    let err = engine.execute(missing, json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::GraphNotFound(id) if id == missing));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_prevents_later_stages() {
    let slow = MockNode::sleeping("slow", Duration::from_millis(100));
    let after = MockNode::returning("after", json!({}));

    let workflow = Workflow::new(
        "cancellable",
        vec![
            NodeDefinition::new("first", "slow"),
            NodeDefinition::new("second", "after"),
        ],
        vec![Edge::new("first", "second")],
    );

    let (engine, workflow_id) = engine_for(
        workflow,
        registry(vec![
            ("slow", Arc::clone(&slow)),
            ("after", Arc::clone(&after)),
        ]),
        EngineConfig::default(),
    );
    let engine = Arc::new(engine);

    let execution_id = Uuid::new_v4();
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .execute_with_execution_id(execution_id, workflow_id, json!({}))
                .await
        })
    };

    // Let stage 0 get going, then cancel while 'first' is still sleeping.
    tokio::time::sleep(Duration::from_millis(30)).await;
    engine.cancel(execution_id).await.unwrap();

    let result = runner.await.unwrap().unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("cancelled"));
    // The in-flight node was allowed to finish; the next stage never started.
    assert_eq!(trail_entry(&result, "first").status, NodeStatus::Completed);
    assert_eq!(trail_entry(&result, "second").status, NodeStatus::Skipped);
    assert_eq!(after.call_count(), 0);
}

#[tokio::test]
async fn cancelling_an_unknown_execution_is_an_error() {
    let engine = WorkflowEngine::new(
        Arc::new(InMemoryGraphSource::new()),
        NodeRegistry::new(),
        EngineConfig::default(),
    );

    let unknown = Uuid::new_v4();
    let err = engine.cancel(unknown).await.unwrap_err();
    assert!(matches!(err, EngineError::ExecutionNotActive(id) if id == unknown));
}
