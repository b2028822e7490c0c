//! Run-state lattices for tree nodes and executions.
//!
//! Node states move monotonically along
//! `ready -> blocked -> running -> complete | error | cancelled`.
//! The run status of an execution is the join over its node states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a single tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
  Ready,
  Blocked,
  Running,
  Complete,
  Error,
  Cancelled,
}

impl NodeState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Complete | Self::Error | Self::Cancelled)
  }

  /// Position along the lattice, used to enforce monotonic transitions.
  pub(crate) fn rank(&self) -> u8 {
    match self {
      Self::Ready => 0,
      Self::Blocked => 1,
      Self::Running => 2,
      Self::Complete | Self::Error | Self::Cancelled => 3,
    }
  }

  /// Whether moving to `next` respects the lattice. Terminal states accept
  /// no further transitions.
  pub fn can_transition_to(&self, next: NodeState) -> bool {
    !self.is_terminal() && next.rank() >= self.rank()
  }
}

impl std::fmt::Display for NodeState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Ready => "ready",
      Self::Blocked => "blocked",
      Self::Running => "running",
      Self::Complete => "complete",
      Self::Error => "error",
      Self::Cancelled => "cancelled",
    };
    f.write_str(s)
  }
}

/// Status of one dashboard execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
  Initialized,
  Blocked,
  Running,
  Complete,
  Error,
  Cancelled,
}

impl RunStatus {
  pub fn is_finished(&self) -> bool {
    matches!(self, Self::Complete | Self::Error | Self::Cancelled)
  }

  /// Join over node states: any error wins, then any cancelled, then
  /// all-complete; otherwise the most advanced non-terminal state.
  pub fn join<I>(states: I) -> RunStatus
  where
    I: IntoIterator<Item = NodeState>,
  {
    let mut any_error = false;
    let mut any_cancelled = false;
    let mut any_running = false;
    let mut any_blocked = false;
    let mut all_complete = true;
    let mut any = false;

    for state in states {
      any = true;
      match state {
        NodeState::Error => any_error = true,
        NodeState::Cancelled => any_cancelled = true,
        NodeState::Running => any_running = true,
        NodeState::Blocked => any_blocked = true,
        NodeState::Ready => {}
        NodeState::Complete => {}
      }
      if state != NodeState::Complete {
        all_complete = false;
      }
    }

    if !any {
      return RunStatus::Initialized;
    }
    if any_error {
      RunStatus::Error
    } else if any_cancelled {
      RunStatus::Cancelled
    } else if all_complete {
      RunStatus::Complete
    } else if any_running {
      RunStatus::Running
    } else if any_blocked {
      RunStatus::Blocked
    } else {
      RunStatus::Initialized
    }
  }
}

impl std::fmt::Display for RunStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Initialized => "initialized",
      Self::Blocked => "blocked",
      Self::Running => "running",
      Self::Complete => "complete",
      Self::Error => "error",
      Self::Cancelled => "cancelled",
    };
    f.write_str(s)
  }
}
