//! The session-scoped dashboard executor facade.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use trellis_db::{ClientPool, ConnectOptions};
use trellis_events::DashboardEvent;
use trellis_workspace::Workspace;

use crate::error::ExecutorError;
use crate::tree::ExecutionTree;

/// Executor construction options.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
  /// Interactive executions accept inputs after start; batch executions
  /// require every input up front.
  pub interactive: bool,
  /// When set, executions exceeding this deadline are cancelled and the
  /// error is normalized to "execution timed out".
  pub request_deadline: Option<Duration>,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      interactive: true,
      request_deadline: None,
    }
  }
}

/// Registry of live executions, keyed by session id.
///
/// At most one execution is registered per session; a new request for a
/// session cancels and replaces the previous tree. The registry mutex is
/// held only across map operations, never while a tree executes.
pub struct DashboardExecutor {
  executions: Mutex<HashMap<String, Arc<ExecutionTree>>>,
  interactive: bool,
  request_deadline: Option<Duration>,
  pool: Arc<ClientPool>,
}

impl DashboardExecutor {
  /// An interactive executor with no request deadline.
  pub fn new(pool: Arc<ClientPool>) -> Self {
    Self::with_config(pool, ExecutorConfig::default())
  }

  pub fn with_config(pool: Arc<ClientPool>, config: ExecutorConfig) -> Self {
    Self {
      executions: Mutex::new(HashMap::new()),
      interactive: config.interactive,
      request_deadline: config.request_deadline,
      pool,
    }
  }

  /// Start executing `root_resource` for `session_id`, cancelling any
  /// execution already registered for the session.
  ///
  /// Returns as soon as the new tree is registered and scheduled; execution
  /// failures after that surface as `ExecutionError` events. Every error
  /// returned from this operation is also published as an event.
  pub async fn execute_dashboard(
    &self,
    session_id: &str,
    root_resource: &str,
    inputs: HashMap<String, serde_json::Value>,
    workspace: &Arc<Workspace>,
    opts: ConnectOptions,
  ) -> Result<(), ExecutorError> {
    let started = tokio::time::Instant::now();

    let mut result = self
      .start_execution(session_id, root_resource, inputs, workspace, opts, started)
      .await;

    // normalize an elapsed deadline, mirroring context expiry semantics
    if result.is_ok()
      && self
        .request_deadline
        .is_some_and(|deadline| started.elapsed() >= deadline)
    {
      result = Err(ExecutorError::Timeout);
    }

    if let Err(e) = &result {
      workspace.publish_event(DashboardEvent::ExecutionError {
        session: session_id.to_string(),
        error: e.to_string(),
        timestamp: Utc::now(),
      });
    }
    result
  }

  async fn start_execution(
    &self,
    session_id: &str,
    root_resource: &str,
    inputs: HashMap<String, serde_json::Value>,
    workspace: &Arc<Workspace>,
    opts: ConnectOptions,
    started: tokio::time::Instant,
  ) -> Result<(), ExecutorError> {
    // reset any existing execution for this session
    self.cancel_execution_for_session(session_id);

    let root = workspace
      .get_resource(root_resource)
      .ok_or_else(|| ExecutorError::ResourceNotFound {
        name: root_resource.to_string(),
        mod_name: workspace.mod_name().to_string(),
      })?;

    let tree = Arc::new(ExecutionTree::new(
      root,
      session_id,
      workspace.clone(),
      self.pool.clone(),
      self.interactive,
      opts,
    )?);

    self.validate_inputs(&tree, &inputs)?;

    self.set_execution(session_id, tree.clone());
    info!(
      session = %session_id,
      execution_id = %tree.id(),
      root = %root_resource,
      "dashboard execution registered"
    );

    if !inputs.is_empty() {
      tree.set_input_values(inputs);
    }

    let drive = tree.clone().execute();
    match self.request_deadline {
      None => {
        tokio::spawn(drive);
      }
      Some(deadline) => {
        let tree = tree.clone();
        tokio::spawn(async move {
          tokio::pin!(drive);
          tokio::select! {
            _ = &mut drive => {}
            _ = tokio::time::sleep_until(started + deadline) => {
              tree.cancel_with_cause("execution timed out");
              drive.await;
            }
          }
        });
      }
    }

    Ok(())
  }

  /// Batch executions must provide every input the tree depends on.
  fn validate_inputs(
    &self,
    tree: &ExecutionTree,
    inputs: &HashMap<String, serde_json::Value>,
  ) -> Result<(), ExecutorError> {
    if self.interactive {
      // inputs may arrive later via on_input_changed
      return Ok(());
    }
    let missing: Vec<String> = tree
      .input_runtime_dependencies()
      .into_iter()
      .filter(|name| !inputs.contains_key(name))
      .collect();
    if missing.is_empty() {
      Ok(())
    } else {
      Err(ExecutorError::MissingInputs { names: missing })
    }
  }

  /// Apply a changed input to the session's execution.
  ///
  /// Inputs declared as depending on the changed input (transitively) are
  /// nulled out first and announced with an `InputValuesCleared` event. The
  /// dashboard re-executes when it already finished or the changed input
  /// previously had a value; otherwise the inputs are applied to the live
  /// tree.
  pub async fn on_input_changed(
    &self,
    session_id: &str,
    mut inputs: HashMap<String, serde_json::Value>,
    changed_input: &str,
  ) -> Result<(), ExecutorError> {
    let tree = self
      .get_execution(session_id)
      .ok_or_else(|| ExecutorError::SessionNotFound {
        session: session_id.to_string(),
      })?;

    let previous_value = tree.input_value(changed_input);

    let cleared = clear_dependent_inputs(&tree, changed_input, &mut inputs);
    if !cleared.is_empty() {
      tree.workspace().publish_event(DashboardEvent::InputValuesCleared {
        session: tree.session_id().to_string(),
        execution_id: tree.id().to_string(),
        cleared_inputs: cleared,
      });
    }

    let had_value = previous_value.is_some_and(|value| !value.is_null());
    if tree.run_status().is_finished() || had_value {
      let workspace = tree.workspace().clone();
      let root_resource = tree.root_resource().to_string();
      let opts = tree.connect_options().clone();
      return self
        .execute_dashboard(session_id, &root_resource, inputs, &workspace, opts)
        .await;
    }

    tree.set_input_values(inputs);
    Ok(())
  }

  /// Cancel and deregister the session's execution. A no-op for unknown
  /// sessions.
  pub fn cancel_execution_for_session(&self, session_id: &str) {
    let tree = {
      let mut executions = self.executions.lock().expect("execution registry poisoned");
      executions.remove(session_id)
    };
    if let Some(tree) = tree {
      info!(
        session = %session_id,
        execution_id = %tree.id(),
        "cancelling dashboard execution"
      );
      tree.cancel();
    }
  }

  /// The registered execution for a session, if any.
  pub fn get_execution(&self, session_id: &str) -> Option<Arc<ExecutionTree>> {
    self
      .executions
      .lock()
      .expect("execution registry poisoned")
      .get(session_id)
      .cloned()
  }

  fn set_execution(&self, session_id: &str, tree: Arc<ExecutionTree>) {
    self
      .executions
      .lock()
      .expect("execution registry poisoned")
      .insert(session_id.to_string(), tree);
  }

  /// Resolve a snapshot by name and return its contents as an open-typed
  /// map. The snapshot schema is not interpreted.
  pub async fn load_snapshot(
    &self,
    session_id: &str,
    snapshot_name: &str,
    workspace: &Workspace,
  ) -> Result<HashMap<String, serde_json::Value>, ExecutorError> {
    debug!(session = %session_id, snapshot = %snapshot_name, "loading snapshot");

    let path = workspace
      .snapshot_path(snapshot_name)
      .ok_or_else(|| ExecutorError::SnapshotNotFound {
        name: snapshot_name.to_string(),
        mod_name: workspace.mod_name().to_string(),
        path: workspace.path().display().to_string(),
      })?;

    if !path.exists() {
      return Err(ExecutorError::SnapshotMissing {
        path: path.display().to_string(),
      });
    }

    let content =
      tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ExecutorError::SnapshotRead {
          path: path.display().to_string(),
          source,
        })?;

    serde_json::from_str(&content).map_err(|source| ExecutorError::SnapshotParse {
      path: path.display().to_string(),
      source,
    })
  }
}

/// Null out every input transitively declared as depending on
/// `changed_input` and return the cleared names.
///
/// The declared graph may be cyclic; the visited set bounds the traversal.
/// Inputs already null are collected into the traversal but not re-cleared.
fn clear_dependent_inputs(
  tree: &ExecutionTree,
  changed_input: &str,
  inputs: &mut HashMap<String, serde_json::Value>,
) -> Vec<String> {
  let mut cleared = Vec::new();
  let mut visited: HashSet<String> = HashSet::new();
  visited.insert(changed_input.to_string());
  let mut queue = VecDeque::from([changed_input.to_string()]);

  while let Some(name) = queue.pop_front() {
    for dependent in tree.inputs_depending_on(&name) {
      if visited.insert(dependent.clone()) {
        if inputs.get(&dependent).is_some_and(|value| !value.is_null()) {
          inputs.insert(dependent.clone(), serde_json::Value::Null);
          cleared.push(dependent.clone());
        }
        queue.push_back(dependent);
      }
    }
  }

  cleared
}
