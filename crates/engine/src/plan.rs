//! Graph validation and staged execution planning.
//!
//! Rules enforced before anything runs:
//! 1. Node IDs must be unique within the workflow.
//! 2. Every edge must reference valid node IDs (both `from` and `to`).
//! 3. The directed graph must be acyclic.
//!
//! Planning groups nodes into *stages*: a node's stage index is
//! `1 + max(stage of each dependency)`, dependency-free nodes land in
//! stage 0. Nodes sharing a stage have no path between them and may run
//! in any order, or concurrently.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::{models::Workflow, EngineError};
use nodes::ErrorPolicy;

// ---------------------------------------------------------------------------
// ExecutionNode
// ---------------------------------------------------------------------------

/// The planner's working view of one graph node: its declaration plus the
/// resolved upstream/downstream ID lists.
///
/// Live per-run status is deliberately *not* kept here — plans are immutable
/// and cached across executions of the same workflow; status lives in the
/// execution context's `NodeState`.
#[derive(Debug, Clone)]
pub struct ExecutionNode {
    pub id: String,
    pub node_type: String,
    pub config: Value,
    pub on_error: ErrorPolicy,
    pub timeout_ms: Option<u64>,
    /// IDs this node must wait for.
    pub dependencies: Vec<String>,
    /// IDs that wait for this node.
    pub dependents: Vec<String>,
}

// ---------------------------------------------------------------------------
// ExecutionPlan
// ---------------------------------------------------------------------------

/// An ordered sequence of stages covering every node exactly once, with
/// every dependency in a strictly earlier stage.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    stages: Vec<Vec<String>>,
    nodes: HashMap<String, ExecutionNode>,
}

impl ExecutionPlan {
    /// Build a plan from a workflow definition.
    ///
    /// # Errors
    /// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
    /// - [`EngineError::DanglingEdge`] if an edge references a missing node.
    /// - [`EngineError::CycleDetected`] if the graph is not acyclic.
    ///
    /// No partial plan is ever produced; the first violation aborts.
    pub fn build(workflow: &Workflow) -> Result<Self, EngineError> {
        let stage_index = stage_indices(workflow)?;

        let mut dependents: HashMap<&str, Vec<String>> = HashMap::new();
        let mut dependencies: HashMap<&str, Vec<String>> = HashMap::new();
        for edge in &workflow.edges {
            dependents
                .entry(edge.from.as_str())
                .or_default()
                .push(edge.to.clone());
            dependencies
                .entry(edge.to.as_str())
                .or_default()
                .push(edge.from.clone());
        }

        let stage_count = stage_index.values().copied().max().map_or(0, |m| m + 1);
        let mut stages: Vec<Vec<String>> = vec![Vec::new(); stage_count];
        let mut nodes = HashMap::with_capacity(workflow.nodes.len());

        // Iterate in declaration order so repeated planning of the same
        // workflow yields identical stage vectors.
        for def in &workflow.nodes {
            stages[stage_index[def.id.as_str()]].push(def.id.clone());
            nodes.insert(
                def.id.clone(),
                ExecutionNode {
                    id: def.id.clone(),
                    node_type: def.node_type.clone(),
                    config: def.config.clone(),
                    on_error: def.on_error.clone(),
                    timeout_ms: def.timeout_ms,
                    dependencies: dependencies.remove(def.id.as_str()).unwrap_or_default(),
                    dependents: dependents.remove(def.id.as_str()).unwrap_or_default(),
                },
            );
        }

        Ok(Self { stages, nodes })
    }

    pub fn stages(&self) -> &[Vec<String>] {
        &self.stages
    }

    pub fn node(&self, id: &str) -> Option<&ExecutionNode> {
        self.nodes.get(id)
    }

    /// Node IDs in stage order (stable across runs).
    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.stages.iter().flatten()
    }

    /// Nodes with no dependents; their outputs form the workflow output.
    pub fn leaves(&self) -> impl Iterator<Item = &ExecutionNode> {
        self.node_ids()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.dependents.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate the workflow graph without building a plan.
///
/// Pure check, no side effects. Cycle detection happens here, never
/// mid-execution.
pub fn validate(workflow: &Workflow) -> Result<(), EngineError> {
    stage_indices(workflow).map(|_| ())
}

/// Compute every node's stage index, enforcing all structural rules.
fn stage_indices(workflow: &Workflow) -> Result<HashMap<&str, usize>, EngineError> {
    // Unique IDs.
    let mut node_set: HashSet<&str> = HashSet::with_capacity(workflow.nodes.len());
    for node in &workflow.nodes {
        if !node_set.insert(node.id.as_str()) {
            return Err(EngineError::DuplicateNodeId(node.id.clone()));
        }
    }

    // Edge endpoints must exist; build the reverse adjacency (node → deps).
    let mut deps: HashMap<&str, Vec<&str>> = HashMap::with_capacity(workflow.nodes.len());
    for node in &workflow.nodes {
        deps.insert(node.id.as_str(), Vec::new());
    }
    for edge in &workflow.edges {
        if !node_set.contains(edge.from.as_str()) {
            return Err(EngineError::DanglingEdge {
                node_id: edge.from.clone(),
                side: "from",
            });
        }
        if !node_set.contains(edge.to.as_str()) {
            return Err(EngineError::DanglingEdge {
                node_id: edge.to.clone(),
                side: "to",
            });
        }
        deps.entry(edge.to.as_str())
            .or_default()
            .push(edge.from.as_str());
    }

    // Depth-first stage assignment with a "visiting" marker distinct from
    // the memoized "visited" set; re-entering a visiting node is a cycle.
    let mut memo: HashMap<&str, usize> = HashMap::with_capacity(workflow.nodes.len());
    let mut visiting: HashSet<&str> = HashSet::new();
    for node in &workflow.nodes {
        stage_of(node.id.as_str(), &deps, &mut memo, &mut visiting)?;
    }

    Ok(memo)
}

fn stage_of<'a>(
    id: &'a str,
    deps: &HashMap<&'a str, Vec<&'a str>>,
    memo: &mut HashMap<&'a str, usize>,
    visiting: &mut HashSet<&'a str>,
) -> Result<usize, EngineError> {
    if let Some(&stage) = memo.get(id) {
        return Ok(stage);
    }
    if !visiting.insert(id) {
        return Err(EngineError::CycleDetected { node_id: id.to_string() });
    }

    // Maximum over dependencies: a node is never scheduled earlier than
    // one stage past its latest dependency.
    let mut stage = 0;
    if let Some(upstream) = deps.get(id) {
        for dep in upstream {
            stage = stage.max(stage_of(dep, deps, memo, visiting)? + 1);
        }
    }

    visiting.remove(id);
    memo.insert(id, stage);
    Ok(stage)
}
