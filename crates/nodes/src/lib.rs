//! `nodes` crate — the `NodeExecutor` trait and supporting contract types.
//!
//! Every node implementation — built-in and plugin alike — must implement
//! [`NodeExecutor`]. The engine crate dispatches execution through this
//! trait object and never inspects what a node does internally.

pub mod error;
pub mod mock;
pub mod policy;
pub mod traits;

pub use error::NodeError;
pub use policy::ErrorPolicy;
pub use traits::{NodeContext, NodeExecutor, NodeRegistry};
