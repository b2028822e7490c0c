//! Trellis Executor
//!
//! The per-session dashboard scheduler. [`DashboardExecutor`] maps session
//! ids to live [`ExecutionTree`]s; each tree instantiates one node per mod
//! resource, drives runnable nodes concurrently against the shared client
//! pool, applies input changes to the running graph, and streams progress
//! events through the workspace.

mod error;
mod executor;
mod node;
mod tree;

pub use error::ExecutorError;
pub use executor::{DashboardExecutor, ExecutorConfig};
pub use node::{NodeDependency, TreeNode};
pub use tree::ExecutionTree;
