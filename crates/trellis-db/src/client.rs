use serde::{Deserialize, Serialize};

/// Errors from backend connections and queries.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
  /// Connecting to the backend failed.
  #[error("failed to connect to '{database}': {source}")]
  Connect {
    database: String,
    #[source]
    source: sqlx::Error,
  },

  /// A query failed.
  #[error("query failed: {source}")]
  Query {
    #[source]
    source: sqlx::Error,
  },

  /// An argument value could not be bound to the query.
  #[error("unsupported query argument: {message}")]
  UnsupportedArgument { message: String },
}

/// One column of a result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
  pub name: String,
  pub data_type: String,
}

/// A query result set, attached to node output as an opaque table value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableData {
  pub columns: Vec<TableColumn>,
  pub rows: Vec<Vec<serde_json::Value>>,
}

impl TableData {
  /// The result set as a JSON value for event payloads and node output.
  pub fn to_value(&self) -> serde_json::Value {
    serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
  }
}

/// A reusable connection to one SQL backend.
///
/// Clients are shared by all executions; the pool hands out `Arc`s and a
/// query leases an underlying connection only for its own duration.
#[async_trait::async_trait]
pub trait SqlClient: Send + Sync {
  /// Execute one parameterized query and collect the full row set.
  async fn query(&self, sql: &str, args: &[serde_json::Value]) -> Result<TableData, DbError>;

  /// Close the client, releasing its connections.
  async fn close(&self);
}
