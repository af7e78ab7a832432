//! Node-level error type.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by one node attempt.
///
/// The engine never interprets the message; how a failed attempt is handled
/// is decided by the node's declared [`ErrorPolicy`](crate::ErrorPolicy).
/// A timed-out attempt is treated identically to any other failure.
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    /// The node's `execute` call returned an error.
    #[error("node execution failed: {0}")]
    Execution(String),

    /// The attempt exceeded the node's declared timeout. Synthesized by the
    /// scheduler; node implementations never construct this themselves.
    #[error("node timed out after {0:?}")]
    Timeout(Duration),
}
