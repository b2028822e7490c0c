//! Trellis Workspace
//!
//! A loaded mod: the dashboard resources it defines, the snapshots it
//! names, and the event bus its subscribers listen on. The executor holds
//! an `Arc<Workspace>` per execution for resource lookup and event
//! publication; it never mutates the workspace.

mod workspace;

pub use workspace::{ModDef, Workspace, WorkspaceError};
