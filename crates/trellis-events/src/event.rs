use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trellis_dashboard::{NodeState, RunStatus};

/// Events emitted during dashboard execution.
///
/// Serialized with an `event` tag so subscribers can dispatch on kind
/// without knowing the full payload shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DashboardEvent {
  /// An execution tree has been registered and started.
  ExecutionStarted {
    session: String,
    execution_id: String,
    timestamp: DateTime<Utc>,
  },

  /// Every node reached a terminal state.
  ExecutionComplete {
    session: String,
    execution_id: String,
    status: RunStatus,
    timestamp: DateTime<Utc>,
  },

  /// The execution failed, was cancelled, or could not start.
  ExecutionError {
    session: String,
    error: String,
    timestamp: DateTime<Utc>,
  },

  /// A node made a non-terminal state transition.
  LeafNodeUpdated {
    session: String,
    execution_id: String,
    node_id: String,
    state: NodeState,
  },

  /// A node reached `complete` or `cancelled`.
  LeafNodeComplete {
    session: String,
    execution_id: String,
    node_id: String,
    state: NodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<serde_json::Value>,
  },

  /// A node failed.
  LeafNodeError {
    session: String,
    execution_id: String,
    node_id: String,
    state: NodeState,
    error: String,
  },

  /// Inputs invalidated by an input change, before re-execution or re-apply.
  InputValuesCleared {
    session: String,
    execution_id: String,
    cleared_inputs: Vec<String>,
  },
}

impl DashboardEvent {
  /// The session this event belongs to.
  pub fn session(&self) -> &str {
    match self {
      Self::ExecutionStarted { session, .. }
      | Self::ExecutionComplete { session, .. }
      | Self::ExecutionError { session, .. }
      | Self::LeafNodeUpdated { session, .. }
      | Self::LeafNodeComplete { session, .. }
      | Self::LeafNodeError { session, .. }
      | Self::InputValuesCleared { session, .. } => session,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn serializes_with_event_tag() {
    let event = DashboardEvent::ExecutionStarted {
      session: "s1".to_string(),
      execution_id: "e1".to_string(),
      timestamp: Utc::now(),
    };
    let value = serde_json::to_value(&event).expect("serialize");
    assert_eq!(value["event"], "execution_started");
    assert_eq!(value["session"], "s1");
  }

  #[test]
  fn session_accessor_covers_all_variants() {
    let event = DashboardEvent::InputValuesCleared {
      session: "s2".to_string(),
      execution_id: "e2".to_string(),
      cleared_inputs: vec!["region".to_string()],
    };
    assert_eq!(event.session(), "s2");
  }
}
