//! Trellis Dashboard
//!
//! This crate provides the declarative resource model for dashboards: the
//! tree of panels, queries, inputs and containers a mod defines, together
//! with the run-state lattices shared by the executor and the event stream.
//!
//! A [`DashboardItem`] is configuration, not runtime state. The executor
//! instantiates one tree node per item and drives it through [`NodeState`];
//! [`RunStatus`] is the join over all node states for one execution.

mod item;
mod status;

pub use item::{ArgValue, DashboardItem, DependencySource, ItemKind, QueryArg};
pub use status::{NodeState, RunStatus};
