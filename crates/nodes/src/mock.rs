//! `MockNode` — a test double for `NodeExecutor`.
//!
//! Useful in unit and integration tests where a real node implementation is
//! either unavailable or irrelevant. Besides programmable outcomes it records
//! every input it receives and tracks how many of its invocations overlap in
//! time, which is what the scheduler tests use to assert the concurrency
//! bound and the stage barrier.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{NodeContext, NodeError, NodeExecutor};

/// Behaviour injected into `MockNode` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail every attempt with the given message.
    AlwaysFail(String),
    /// Fail the first `failures` attempts, then succeed with `then`.
    FailTimes { failures: usize, then: Value },
    /// Sleep for `delay`, then succeed with `value`.
    SleepThenReturn { delay: Duration, value: Value },
    /// Publish a shared variable, then succeed with `then`.
    SetVariable { key: String, value: Value, then: Value },
    /// Never produce a result (for timeout tests).
    NeverComplete,
}

/// A mock node that records every call it receives and returns a
/// programmer-specified result.
pub struct MockNode {
    /// Label used in test assertions.
    pub name: String,
    behaviour: MockBehaviour,
    calls: Mutex<Vec<Value>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl MockNode {
    pub fn new(name: impl Into<String>, behaviour: MockBehaviour) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            behaviour,
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        })
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Arc<Self> {
        Self::new(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that fails every attempt.
    pub fn always_failing(name: impl Into<String>, msg: impl Into<String>) -> Arc<Self> {
        Self::new(name, MockBehaviour::AlwaysFail(msg.into()))
    }

    /// Create a mock that sleeps before succeeding, so invocations overlap.
    pub fn sleeping(name: impl Into<String>, delay: Duration) -> Arc<Self> {
        Self::new(
            name,
            MockBehaviour::SleepThenReturn { delay, value: json!({ "slept": true }) },
        )
    }

    /// Number of times this node has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// All inputs seen by this node, in call order.
    pub fn recorded_inputs(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }

    /// High-water mark of simultaneously running invocations.
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn enter(&self, input: &Value) -> usize {
        let mut calls = self.calls.lock().unwrap();
        calls.push(input.clone());
        let attempt = calls.len();
        drop(calls);

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        attempt
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeExecutor for MockNode {
    async fn execute(&self, input: Value, ctx: &NodeContext) -> Result<Value, NodeError> {
        let attempt = self.enter(&input);

        let result = match &self.behaviour {
            MockBehaviour::ReturnValue(v) => {
                let mut out = json!({ "node": self.name });
                if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
                    for (k, val) in v_obj {
                        out_obj.insert(k.clone(), val.clone());
                    }
                }
                Ok(out)
            }
            MockBehaviour::AlwaysFail(msg) => Err(NodeError::Execution(msg.clone())),
            MockBehaviour::FailTimes { failures, then } => {
                if attempt <= *failures {
                    Err(NodeError::Execution(format!(
                        "{}: induced failure on attempt {attempt}",
                        self.name
                    )))
                } else {
                    Ok(then.clone())
                }
            }
            MockBehaviour::SleepThenReturn { delay, value } => {
                tokio::time::sleep(*delay).await;
                Ok(value.clone())
            }
            MockBehaviour::SetVariable { key, value, then } => {
                ctx.set_variable(key.clone(), value.clone()).await;
                Ok(then.clone())
            }
            MockBehaviour::NeverComplete => loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            },
        };

        self.exit();
        result
    }
}
