//! Per-node error-handling policy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the scheduler does when a node attempt fails (or times out).
///
/// Declared per node in the workflow definition:
///
/// ```json
/// { "on_error": { "type": "retry", "max_attempts": 2, "delay_ms": 100 } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// The failure is terminal for the node and escalates to the stage.
    #[default]
    Propagate,

    /// Re-invoke the node with the same input, up to `max_attempts` retries
    /// after the initial attempt, sleeping `delay_ms` between attempts.
    Retry { max_attempts: u32, delay_ms: u64 },

    /// Swallow the failure and use `value` as the node's output.
    Fallback { value: Value },
}
