//! Tree nodes and per-variant execution.
//!
//! A [`TreeNode`] is the runtime instance of one dashboard resource. Nodes
//! live in the tree's node table and are addressed by id (the dotted path
//! from the root); children and dependencies are id references, never owning
//! pointers. Per-variant behavior is dispatched over the closed
//! [`ItemKind`] set in [`NodePlan::run`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use trellis_dashboard::{ItemKind, NodeState};
use trellis_db::SqlClient;

/// A resolved dependency edge from a node to an input value or another
/// node's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeDependency {
  /// A named user input must be present and non-null.
  Input(String),
  /// The referenced node must be complete.
  Node(String),
}

/// A query argument as wired at tree construction: literals pass through,
/// references are resolved against the tree when the node is scheduled.
#[derive(Debug, Clone)]
pub(crate) enum NodeArg {
  Literal(serde_json::Value),
  Input(String),
  Node(String),
}

/// Runtime state of one dashboard resource instance.
#[derive(Debug)]
pub struct TreeNode {
  pub id: String,
  /// Fully-qualified name of the resource this node instantiates.
  pub resource: String,
  pub kind: ItemKind,
  pub(crate) state: NodeState,
  pub(crate) output: Option<serde_json::Value>,
  pub(crate) error: Option<String>,
  pub(crate) sql: Option<String>,
  pub(crate) args: Vec<NodeArg>,
  pub(crate) static_value: Option<serde_json::Value>,
  /// Set for input-kind nodes: the name this node reads from the input map.
  pub(crate) input_name: Option<String>,
  pub(crate) depends_on: Vec<NodeDependency>,
  pub(crate) children: Vec<String>,
}

impl TreeNode {
  pub fn state(&self) -> NodeState {
    self.state
  }

  pub fn output(&self) -> Option<&serde_json::Value> {
    self.output.as_ref()
  }

  pub fn error(&self) -> Option<&str> {
    self.error.as_deref()
  }

  pub fn dependencies(&self) -> &[NodeDependency] {
    &self.depends_on
  }

  pub fn children(&self) -> &[String] {
    &self.children
  }

  /// Apply a state transition, refusing moves that violate the lattice.
  pub(crate) fn transition(&mut self, next: NodeState) -> bool {
    if self.state.can_transition_to(next) {
      self.state = next;
      true
    } else {
      false
    }
  }
}

/// Why a node did not complete.
#[derive(Debug)]
pub(crate) enum NodeFailure {
  Error(String),
  Cancelled,
}

/// Everything one node execution needs, detached from the tree so the
/// spawned task holds no locks across awaits.
pub(crate) struct NodePlan {
  pub node_id: String,
  pub kind: ItemKind,
  pub sql: Option<String>,
  /// Args with input and upstream references already resolved.
  pub args: Vec<serde_json::Value>,
  pub static_value: Option<serde_json::Value>,
  pub input_value: Option<serde_json::Value>,
  /// For container kinds: the first child failure to propagate, if any.
  pub child_failure: Option<NodeFailure>,
  pub client: Option<Arc<dyn SqlClient>>,
}

impl NodePlan {
  /// Execute the node. Query-bearing nodes issue exactly one query; the
  /// query future is raced against the cancellation token.
  pub(crate) async fn run(
    self,
    cancel: CancellationToken,
  ) -> (String, Result<Option<serde_json::Value>, NodeFailure>) {
    let node_id = self.node_id.clone();
    let result = self.run_inner(cancel).await;
    (node_id, result)
  }

  async fn run_inner(
    self,
    cancel: CancellationToken,
  ) -> Result<Option<serde_json::Value>, NodeFailure> {
    if cancel.is_cancelled() {
      return Err(NodeFailure::Cancelled);
    }

    match self.kind {
      ItemKind::Input => Ok(Some(self.input_value.unwrap_or(serde_json::Value::Null))),
      kind if kind.is_container() => match self.child_failure {
        None => Ok(None),
        Some(failure) => Err(failure),
      },
      _ => {
        let Some(sql) = &self.sql else {
          // static panels (text, image without a query) complete with
          // their declared value
          return Ok(self.static_value);
        };
        let client = self
          .client
          .as_ref()
          .ok_or_else(|| NodeFailure::Error("no backend client available".to_string()))?;

        let table = tokio::select! {
          result = client.query(sql, &self.args) => {
            result.map_err(|e| NodeFailure::Error(e.to_string()))?
          }
          _ = cancel.cancelled() => return Err(NodeFailure::Cancelled),
        };
        Ok(Some(table.to_value()))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn plan(kind: ItemKind) -> NodePlan {
    NodePlan {
      node_id: "main.panel.p".to_string(),
      kind,
      sql: None,
      args: vec![],
      static_value: None,
      input_value: None,
      child_failure: None,
      client: None,
    }
  }

  #[tokio::test]
  async fn input_node_outputs_its_value() {
    let mut p = plan(ItemKind::Input);
    p.input_value = Some(json!("us-east-1"));

    let (_, result) = p.run(CancellationToken::new()).await;
    assert_eq!(result.expect("complete"), Some(json!("us-east-1")));
  }

  #[tokio::test]
  async fn static_text_completes_with_declared_value() {
    let mut p = plan(ItemKind::Text);
    p.static_value = Some(json!("hello"));

    let (_, result) = p.run(CancellationToken::new()).await;
    assert_eq!(result.expect("complete"), Some(json!("hello")));
  }

  #[tokio::test]
  async fn container_propagates_child_failure() {
    let mut p = plan(ItemKind::Container);
    p.child_failure = Some(NodeFailure::Error("child query failed".to_string()));

    let (_, result) = p.run(CancellationToken::new()).await;
    assert!(matches!(result, Err(NodeFailure::Error(_))));
  }

  #[tokio::test]
  async fn cancelled_token_short_circuits() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (_, result) = plan(ItemKind::Card).run(cancel).await;
    assert!(matches!(result, Err(NodeFailure::Cancelled)));
  }

  #[tokio::test]
  async fn query_without_client_is_an_error() {
    let mut p = plan(ItemKind::Chart);
    p.sql = Some("select 1".to_string());

    let (_, result) = p.run(CancellationToken::new()).await;
    assert!(matches!(result, Err(NodeFailure::Error(_))));
  }
}
