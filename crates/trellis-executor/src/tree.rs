//! The per-request execution tree.
//!
//! An [`ExecutionTree`] instantiates one [`TreeNode`] per resource reachable
//! from the root dashboard, wires declared dependencies into graph edges,
//! and drives runnable nodes concurrently. Nodes are stored in a tree-wide
//! table keyed by node id; children and dependency edges are id references.
//!
//! The drive loop owns all node state transitions, so events reach the
//! workspace in transition order. Spawned node tasks receive an owned
//! [`NodePlan`] and never touch the tree.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::{Notify, OnceCell};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use trellis_dashboard::{
  ArgValue, DashboardItem, DependencySource, ItemKind, NodeState, RunStatus,
};
use trellis_db::{ClientPool, ConnectOptions, SqlClient};
use trellis_events::DashboardEvent;
use trellis_workspace::Workspace;

use crate::error::ExecutorError;
use crate::node::{NodeArg, NodeDependency, NodeFailure, NodePlan, TreeNode};

type NodeResult = (String, Result<Option<serde_json::Value>, NodeFailure>);

struct TreeState {
  nodes: BTreeMap<String, TreeNode>,
  input_values: HashMap<String, serde_json::Value>,
  status: RunStatus,
  cancel_cause: Option<String>,
}

/// One execution of one dashboard for one session.
pub struct ExecutionTree {
  id: String,
  session_id: String,
  root_resource: String,
  root_id: String,
  workspace: Arc<Workspace>,
  pool: Arc<ClientPool>,
  connect_options: ConnectOptions,
  interactive: bool,
  has_queries: bool,
  /// node id -> ids of nodes whose dependencies include it
  node_dependents: HashMap<String, Vec<String>>,
  /// input name -> ids of nodes depending on it
  input_dependents: HashMap<String, Vec<String>>,
  cancel: CancellationToken,
  state: Mutex<TreeState>,
  input_notify: Notify,
  client: OnceCell<Arc<dyn SqlClient>>,
}

impl ExecutionTree {
  /// Build the tree for `root`, resolving every declared dependency.
  ///
  /// Fails when a sibling reference does not resolve inside the tree or the
  /// node dependency graph is cyclic.
  pub fn new(
    root: &DashboardItem,
    session_id: &str,
    workspace: Arc<Workspace>,
    pool: Arc<ClientPool>,
    interactive: bool,
    opts: ConnectOptions,
  ) -> Result<Self, ExecutorError> {
    let mut nodes = BTreeMap::new();
    let mut resource_ids = HashMap::new();
    let mut pending_deps = Vec::new();
    let root_id = build_node(root, None, &mut nodes, &mut resource_ids, &mut pending_deps)?;

    // second pass: declared dependencies and arg references become id edges
    for (node_id, deps) in pending_deps {
      let mut resolved = Vec::with_capacity(deps.len());
      for dep in deps {
        match dep {
          DependencySource::Input(name) => resolved.push(NodeDependency::Input(name)),
          DependencySource::Item(reference) => {
            let target =
              resource_ids
                .get(&reference)
                .ok_or_else(|| ExecutorError::Construction {
                  message: format!(
                    "node '{node_id}' depends on '{reference}' which is not part of the dashboard"
                  ),
                })?;
            resolved.push(NodeDependency::Node(target.clone()));
          }
        }
      }
      if let Some(node) = nodes.get_mut(&node_id) {
        node.depends_on = resolved;
      }
    }
    for node in nodes.values_mut() {
      for arg in &mut node.args {
        if let NodeArg::Node(reference) = arg {
          match resource_ids.get(reference.as_str()) {
            Some(target) => *reference = target.clone(),
            None => {
              return Err(ExecutorError::Construction {
                message: format!(
                  "node '{}' has an argument referencing '{reference}' which is not part of the dashboard",
                  node.id
                ),
              });
            }
          }
        }
      }
    }

    detect_dependency_cycles(&nodes)?;

    let mut node_dependents: HashMap<String, Vec<String>> = HashMap::new();
    let mut input_dependents: HashMap<String, Vec<String>> = HashMap::new();
    for node in nodes.values() {
      for dep in &node.depends_on {
        match dep {
          NodeDependency::Node(target) => node_dependents
            .entry(target.clone())
            .or_default()
            .push(node.id.clone()),
          NodeDependency::Input(name) => input_dependents
            .entry(name.clone())
            .or_default()
            .push(node.id.clone()),
        }
      }
    }

    let has_queries = nodes.values().any(|node| node.sql.is_some());
    let connect_options = ConnectOptions {
      database: root.database.clone().or(opts.database),
      search_path: root.search_path.clone().or(opts.search_path),
    };

    Ok(Self {
      id: uuid::Uuid::new_v4().to_string(),
      session_id: session_id.to_string(),
      root_resource: root.full_name.clone(),
      root_id,
      workspace,
      pool,
      connect_options,
      interactive,
      has_queries,
      node_dependents,
      input_dependents,
      cancel: CancellationToken::new(),
      state: Mutex::new(TreeState {
        nodes,
        input_values: HashMap::new(),
        status: RunStatus::Initialized,
        cancel_cause: None,
      }),
      input_notify: Notify::new(),
      client: OnceCell::new(),
    })
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn session_id(&self) -> &str {
    &self.session_id
  }

  pub fn root_resource(&self) -> &str {
    &self.root_resource
  }

  pub fn root_id(&self) -> &str {
    &self.root_id
  }

  pub fn workspace(&self) -> &Arc<Workspace> {
    &self.workspace
  }

  pub fn connect_options(&self) -> &ConnectOptions {
    &self.connect_options
  }

  pub fn run_status(&self) -> RunStatus {
    self.lock_state().status
  }

  /// Signal cancellation. The drive loop finishes marking nodes and
  /// publishing events asynchronously.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  /// Cancel with a specific cause for the resulting `ExecutionError` event.
  pub(crate) fn cancel_with_cause(&self, cause: &str) {
    {
      let mut state = self.lock_state();
      if state.cancel_cause.is_none() {
        state.cancel_cause = Some(cause.to_string());
      }
    }
    self.cancel.cancel();
  }

  /// Apply a batch of input updates and wake blocked nodes. Ignored once
  /// the run status is terminal.
  pub fn set_input_values(&self, inputs: HashMap<String, serde_json::Value>) {
    {
      let mut state = self.lock_state();
      if state.status.is_finished() {
        return;
      }
      for (name, value) in inputs {
        state.input_values.insert(name, value);
      }
    }
    self.input_notify.notify_one();
  }

  pub fn input_value(&self, name: &str) -> Option<serde_json::Value> {
    self.lock_state().input_values.get(name).cloned()
  }

  /// Every input name some node in the tree depends on. Batch-mode
  /// validation requires all of these up front.
  pub fn input_runtime_dependencies(&self) -> Vec<String> {
    let mut names: Vec<String> = self.input_dependents.keys().cloned().collect();
    names.sort();
    names
  }

  /// Names of input resources whose declared dependencies include
  /// `input_name`. Used for dependent-input clearing.
  pub fn inputs_depending_on(&self, input_name: &str) -> Vec<String> {
    let state = self.lock_state();
    let mut result: Vec<String> = self
      .input_dependents
      .get(input_name)
      .into_iter()
      .flatten()
      .filter_map(|node_id| state.nodes.get(node_id))
      .filter(|node| node.kind == ItemKind::Input)
      .filter_map(|node| node.input_name.clone())
      .filter(|name| name != input_name)
      .collect();
    result.sort();
    result.dedup();
    result
  }

  /// Ids of nodes depending on `node_id`, from the tree's dependency index.
  pub fn dependents_of(&self, node_id: &str) -> &[String] {
    self
      .node_dependents
      .get(node_id)
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }

  pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
    self.lock_state().nodes.get(node_id).map(|node| node.state)
  }

  pub fn node_output(&self, node_id: &str) -> Option<serde_json::Value> {
    self
      .lock_state()
      .nodes
      .get(node_id)
      .and_then(|node| node.output.clone())
  }

  pub fn node_ids(&self) -> Vec<String> {
    self.lock_state().nodes.keys().cloned().collect()
  }

  /// Drive the tree to a terminal status.
  #[instrument(
    name = "dashboard_execute",
    skip(self),
    fields(
      session = %self.session_id,
      execution_id = %self.id,
    )
  )]
  pub async fn execute(self: Arc<Self>) {
    info!(root = %self.root_resource, "execution_started");
    self.publish(DashboardEvent::ExecutionStarted {
      session: self.session_id.clone(),
      execution_id: self.id.clone(),
      timestamp: Utc::now(),
    });

    let mut running: JoinSet<NodeResult> = JoinSet::new();

    let client = if self.has_queries {
      match self.client().await {
        Ok(client) => Some(client),
        Err(e) => {
          self.finish_error(None, e.to_string(), &mut running).await;
          return;
        }
      }
    } else {
      None
    };

    loop {
      if self.cancel.is_cancelled() {
        self.finish_cancelled(&mut running).await;
        return;
      }

      let (plans, events) = self.schedule(&client);
      self.publish_all(events);
      for plan in plans {
        running.spawn(plan.run(self.cancel.clone()));
      }

      if self.all_terminal() {
        break;
      }

      if running.is_empty() && !self.interactive {
        // no in-flight work and no inputs will ever arrive
        self
          .finish_error(
            None,
            "execution is blocked on unsatisfied runtime dependencies".to_string(),
            &mut running,
          )
          .await;
        return;
      }

      tokio::select! {
        _ = self.cancel.cancelled() => {
          self.finish_cancelled(&mut running).await;
          return;
        }
        Some(joined) = running.join_next(), if !running.is_empty() => {
          match joined {
            Ok((node_id, Ok(output))) => {
              let events = self.apply_complete(&node_id, output);
              self.publish_all(events);
            }
            Ok((node_id, Err(NodeFailure::Cancelled))) => {
              let events = self.apply_node_cancelled(&node_id);
              self.publish_all(events);
            }
            Ok((node_id, Err(NodeFailure::Error(message)))) => {
              self.finish_error(Some(&node_id), message, &mut running).await;
              return;
            }
            Err(join_error) => {
              self
                .finish_error(None, format!("node task failed: {join_error}"), &mut running)
                .await;
              return;
            }
          }
        }
        _ = self.input_notify.notified() => {}
      }
    }

    let status = self.finalize();
    info!(status = %status, "execution_complete");
    self.publish(DashboardEvent::ExecutionComplete {
      session: self.session_id.clone(),
      execution_id: self.id.clone(),
      status,
      timestamp: Utc::now(),
    });
  }

  /// The memoized backend client for this tree.
  async fn client(&self) -> Result<Arc<dyn SqlClient>, ExecutorError> {
    let client = self
      .client
      .get_or_try_init(|| async { self.pool.get(&self.connect_options).await })
      .await?;
    Ok(client.clone())
  }

  /// One scheduling pass: move nodes with unmet dependencies to blocked and
  /// produce plans for every satisfied node, transitioning them to running.
  fn schedule(
    &self,
    client: &Option<Arc<dyn SqlClient>>,
  ) -> (Vec<NodePlan>, Vec<DashboardEvent>) {
    let mut state = self.lock_state();
    if state.status.is_finished() {
      return (Vec::new(), Vec::new());
    }

    let mut plans = Vec::new();
    let mut events = Vec::new();
    let ids: Vec<String> = state.nodes.keys().cloned().collect();

    for id in ids {
      let (current, satisfied) = {
        let node = &state.nodes[&id];
        if node.state.is_terminal() || node.state == NodeState::Running {
          continue;
        }
        (node.state, self.is_satisfied(&state, node))
      };

      if satisfied {
        let plan = self.build_plan(&state, &id, client);
        let node = state.nodes.get_mut(&id).expect("node vanished");
        if node.transition(NodeState::Running) {
          events.push(self.node_updated_event(&id, NodeState::Running));
          plans.push(plan);
        }
      } else if current == NodeState::Ready {
        let node = state.nodes.get_mut(&id).expect("node vanished");
        if node.transition(NodeState::Blocked) {
          events.push(self.node_updated_event(&id, NodeState::Blocked));
        }
      }
    }

    let computed = RunStatus::join(state.nodes.values().map(|node| node.state));
    if !computed.is_finished() {
      state.status = computed;
    }

    (plans, events)
  }

  fn is_satisfied(&self, state: &TreeState, node: &TreeNode) -> bool {
    if node.kind.is_container() {
      return node
        .children
        .iter()
        .all(|child| state.nodes.get(child).is_none_or(|c| c.state.is_terminal()));
    }

    if node.kind == ItemKind::Input {
      if !self.interactive {
        // batch executions have every input up front
        return true;
      }
      return match &node.input_name {
        Some(name) => state.input_values.get(name).is_some_and(|v| !v.is_null()),
        None => true,
      };
    }

    node.depends_on.iter().all(|dep| match dep {
      NodeDependency::Input(name) => state.input_values.get(name).is_some_and(|v| !v.is_null()),
      NodeDependency::Node(id) => state
        .nodes
        .get(id)
        .is_some_and(|n| n.state == NodeState::Complete),
    })
  }

  fn build_plan(
    &self,
    state: &TreeState,
    node_id: &str,
    client: &Option<Arc<dyn SqlClient>>,
  ) -> NodePlan {
    let node = &state.nodes[node_id];

    let args = node
      .args
      .iter()
      .map(|arg| match arg {
        NodeArg::Literal(value) => value.clone(),
        NodeArg::Input(name) => state
          .input_values
          .get(name)
          .cloned()
          .unwrap_or(serde_json::Value::Null),
        NodeArg::Node(id) => state
          .nodes
          .get(id)
          .and_then(|n| n.output.clone())
          .unwrap_or(serde_json::Value::Null),
      })
      .collect();

    let child_failure = if node.kind.is_container() {
      node.children.iter().find_map(|child_id| {
        let child = state.nodes.get(child_id)?;
        match child.state {
          NodeState::Error => Some(NodeFailure::Error(
            child
              .error
              .clone()
              .unwrap_or_else(|| format!("node '{child_id}' failed")),
          )),
          NodeState::Cancelled => Some(NodeFailure::Cancelled),
          _ => None,
        }
      })
    } else {
      None
    };

    let input_value = node.input_name.as_ref().map(|name| {
      state
        .input_values
        .get(name)
        .cloned()
        .unwrap_or(serde_json::Value::Null)
    });

    NodePlan {
      node_id: node.id.clone(),
      kind: node.kind,
      sql: node.sql.clone(),
      args,
      static_value: node.static_value.clone(),
      input_value,
      child_failure,
      client: if node.sql.is_some() {
        client.clone()
      } else {
        None
      },
    }
  }

  fn apply_complete(
    &self,
    node_id: &str,
    output: Option<serde_json::Value>,
  ) -> Vec<DashboardEvent> {
    let mut state = self.lock_state();
    if state.status.is_finished() {
      return Vec::new();
    }
    let Some(node) = state.nodes.get_mut(node_id) else {
      return Vec::new();
    };
    if !node.transition(NodeState::Complete) {
      return Vec::new();
    }
    node.output = output.clone();
    vec![self.node_complete_event(node_id, NodeState::Complete, output)]
  }

  fn apply_node_cancelled(&self, node_id: &str) -> Vec<DashboardEvent> {
    let mut state = self.lock_state();
    if state.status.is_finished() {
      return Vec::new();
    }
    let Some(node) = state.nodes.get_mut(node_id) else {
      return Vec::new();
    };
    if !node.transition(NodeState::Cancelled) {
      return Vec::new();
    }
    vec![self.node_complete_event(node_id, NodeState::Cancelled, None)]
  }

  fn all_terminal(&self) -> bool {
    self
      .lock_state()
      .nodes
      .values()
      .all(|node| node.state.is_terminal())
  }

  /// Set the terminal status from the node-state join, after all terminal
  /// node events are enqueued.
  fn finalize(&self) -> RunStatus {
    let mut state = self.lock_state();
    let status = RunStatus::join(state.nodes.values().map(|node| node.state));
    state.status = status;
    status
  }

  async fn finish_cancelled(&self, running: &mut JoinSet<NodeResult>) {
    running.abort_all();
    while running.join_next().await.is_some() {}

    let (events, cause) = {
      let mut state = self.lock_state();
      let mut events = Vec::new();
      let ids: Vec<String> = state.nodes.keys().cloned().collect();
      for id in ids {
        let node = state.nodes.get_mut(&id).expect("node vanished");
        if !node.state.is_terminal() && node.transition(NodeState::Cancelled) {
          events.push(self.node_complete_event(&id, NodeState::Cancelled, None));
        }
      }
      let cause = state
        .cancel_cause
        .clone()
        .unwrap_or_else(|| "dashboard execution cancelled".to_string());
      (events, cause)
    };
    self.publish_all(events);

    self.lock_state().status = RunStatus::Cancelled;
    warn!(cause = %cause, "execution_cancelled");
    self.publish(DashboardEvent::ExecutionError {
      session: self.session_id.clone(),
      error: cause,
      timestamp: Utc::now(),
    });
  }

  async fn finish_error(
    &self,
    offender: Option<&str>,
    message: String,
    running: &mut JoinSet<NodeResult>,
  ) {
    // halt the remainder of the tree
    self.cancel.cancel();
    running.abort_all();
    while running.join_next().await.is_some() {}

    let events = {
      let mut state = self.lock_state();
      let mut events = Vec::new();
      if let Some(id) = offender {
        if let Some(node) = state.nodes.get_mut(id) {
          if node.transition(NodeState::Error) {
            node.error = Some(message.clone());
            events.push(self.node_error_event(id, message.clone()));
          }
        }
      }
      let ids: Vec<String> = state.nodes.keys().cloned().collect();
      for id in ids {
        let node = state.nodes.get_mut(&id).expect("node vanished");
        if !node.state.is_terminal() && node.transition(NodeState::Cancelled) {
          events.push(self.node_complete_event(&id, NodeState::Cancelled, None));
        }
      }
      events
    };
    self.publish_all(events);

    self.lock_state().status = RunStatus::Error;
    error!(error = %message, "execution_failed");
    self.publish(DashboardEvent::ExecutionError {
      session: self.session_id.clone(),
      error: message,
      timestamp: Utc::now(),
    });
  }

  fn lock_state(&self) -> MutexGuard<'_, TreeState> {
    self.state.lock().expect("tree state poisoned")
  }

  fn publish(&self, event: DashboardEvent) {
    self.workspace.publish_event(event);
  }

  fn publish_all(&self, events: Vec<DashboardEvent>) {
    for event in events {
      self.publish(event);
    }
  }

  fn node_updated_event(&self, node_id: &str, state: NodeState) -> DashboardEvent {
    DashboardEvent::LeafNodeUpdated {
      session: self.session_id.clone(),
      execution_id: self.id.clone(),
      node_id: node_id.to_string(),
      state,
    }
  }

  fn node_complete_event(
    &self,
    node_id: &str,
    state: NodeState,
    output: Option<serde_json::Value>,
  ) -> DashboardEvent {
    DashboardEvent::LeafNodeComplete {
      session: self.session_id.clone(),
      execution_id: self.id.clone(),
      node_id: node_id.to_string(),
      state,
      output,
    }
  }

  fn node_error_event(&self, node_id: &str, error: String) -> DashboardEvent {
    DashboardEvent::LeafNodeError {
      session: self.session_id.clone(),
      execution_id: self.id.clone(),
      node_id: node_id.to_string(),
      state: NodeState::Error,
      error,
    }
  }
}

/// Instantiate `item` and its children, assigning dotted-path node ids.
fn build_node(
  item: &DashboardItem,
  parent_id: Option<&str>,
  nodes: &mut BTreeMap<String, TreeNode>,
  resource_ids: &mut HashMap<String, String>,
  pending_deps: &mut Vec<(String, Vec<DependencySource>)>,
) -> Result<String, ExecutorError> {
  let node_id = match parent_id {
    None => item.short_name.clone(),
    Some(parent) => format!("{parent}.{}.{}", item.kind, item.short_name),
  };
  if nodes.contains_key(&node_id) {
    return Err(ExecutorError::Construction {
      message: format!("duplicate node id '{node_id}'"),
    });
  }
  if resource_ids
    .insert(item.full_name.clone(), node_id.clone())
    .is_some()
  {
    return Err(ExecutorError::Construction {
      message: format!("resource '{}' appears twice in the dashboard", item.full_name),
    });
  }

  let mut deps = item.declared_dependencies();
  let input_name = if item.kind == ItemKind::Input {
    // an input node waits on its own value
    deps.push(DependencySource::Input(item.short_name.clone()));
    Some(item.short_name.clone())
  } else {
    None
  };

  let args = item
    .args
    .iter()
    .map(|arg| match &arg.value {
      ArgValue::Literal(value) => NodeArg::Literal(value.clone()),
      ArgValue::Dependency(DependencySource::Input(name)) => NodeArg::Input(name.clone()),
      // rewritten to a node id once the walk completes
      ArgValue::Dependency(DependencySource::Item(reference)) => NodeArg::Node(reference.clone()),
    })
    .collect();

  let mut children = Vec::with_capacity(item.children.len());
  for child in &item.children {
    children.push(build_node(
      child,
      Some(&node_id),
      nodes,
      resource_ids,
      pending_deps,
    )?);
  }

  nodes.insert(
    node_id.clone(),
    TreeNode {
      id: node_id.clone(),
      resource: item.full_name.clone(),
      kind: item.kind,
      state: NodeState::Ready,
      output: None,
      error: None,
      sql: item.sql.clone(),
      args,
      static_value: item.value.clone(),
      input_name,
      depends_on: Vec::new(),
      children,
    },
  );
  pending_deps.push((node_id.clone(), deps));
  Ok(node_id)
}

/// Reject node dependency graphs with cycles (Kahn's algorithm over the
/// node->node edges; input edges cannot form node cycles).
fn detect_dependency_cycles(nodes: &BTreeMap<String, TreeNode>) -> Result<(), ExecutorError> {
  let mut indegree: HashMap<&str, usize> = nodes.keys().map(|id| (id.as_str(), 0)).collect();
  let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

  for node in nodes.values() {
    for dep in &node.depends_on {
      if let NodeDependency::Node(target) = dep {
        if let Some(count) = indegree.get_mut(node.id.as_str()) {
          *count += 1;
        }
        dependents
          .entry(target.as_str())
          .or_default()
          .push(node.id.as_str());
      }
    }
  }

  let mut queue: VecDeque<&str> = indegree
    .iter()
    .filter(|(_, count)| **count == 0)
    .map(|(id, _)| *id)
    .collect();
  let mut visited = 0usize;

  while let Some(id) = queue.pop_front() {
    visited += 1;
    for dependent in dependents.get(id).into_iter().flatten() {
      let count = indegree.get_mut(dependent).expect("dependent not indexed");
      *count -= 1;
      if *count == 0 {
        queue.push_back(dependent);
      }
    }
  }

  if visited != nodes.len() {
    return Err(ExecutorError::Construction {
      message: "dashboard resources have a dependency cycle".to_string(),
    });
  }
  Ok(())
}
