//! Executor errors.

use trellis_db::DbError;
use trellis_workspace::WorkspaceError;

/// Errors reported synchronously by executor operations.
///
/// Failures inside a running tree are not represented here; they surface as
/// `ExecutionError` events and in the tree's run status.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
  /// Batch mode only: the caller did not supply every required input.
  #[error("{} '{}' must be provided using '--arg name=value'", pluralize("input", .names.len()), .names.join(","))]
  MissingInputs { names: Vec<String> },

  /// No execution registered for the session.
  #[error("no dashboard running for session {session}")]
  SessionNotFound { session: String },

  /// The caller's deadline elapsed. The message text is fixed.
  #[error("execution timed out")]
  Timeout,

  /// The root resource is not defined in the workspace.
  #[error("resource '{name}' not found in mod '{mod_name}'")]
  ResourceNotFound { name: String, mod_name: String },

  /// Building the execution tree failed.
  #[error("failed to build execution tree: {message}")]
  Construction { message: String },

  #[error("snapshot {name} not found in {mod_name} ({path})")]
  SnapshotNotFound {
    name: String,
    mod_name: String,
    path: String,
  },

  #[error("snapshot {path} does not exist")]
  SnapshotMissing { path: String },

  #[error("failed to read snapshot {path}: {source}")]
  SnapshotRead {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse snapshot {path}: {source}")]
  SnapshotParse {
    path: String,
    #[source]
    source: serde_json::Error,
  },

  #[error(transparent)]
  Workspace(#[from] WorkspaceError),

  #[error(transparent)]
  Db(#[from] DbError),
}

pub(crate) fn pluralize(word: &str, count: usize) -> String {
  if count == 1 {
    word.to_string()
  } else {
    format!("{word}s")
  }
}
