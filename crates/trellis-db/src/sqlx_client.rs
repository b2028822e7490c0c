use std::sync::Arc;

use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Executor, Row, TypeInfo};
use tracing::debug;

use crate::client::{DbError, SqlClient, TableColumn, TableData};
use crate::pool::{ClientFactory, ClientKey};

/// A client backed by a sqlx connection pool over the Any driver.
///
/// The pool's `max_connections` bounds how many node queries run against
/// this backend concurrently.
pub struct SqlxClient {
  pool: AnyPool,
}

impl SqlxClient {
  /// Connect to `key.database`, applying the search path to postgres
  /// backends after each connection is established.
  pub async fn connect(key: &ClientKey, max_connections: u32) -> Result<Self, DbError> {
    sqlx::any::install_default_drivers();

    let mut options = AnyPoolOptions::new().max_connections(max_connections);

    if !key.search_path.is_empty() && key.database.starts_with("postgres") {
      let set_search_path = format!(
        "SET search_path = {}",
        key
          .search_path
          .iter()
          .map(|schema| format!("\"{}\"", schema.replace('"', "\"\"")))
          .collect::<Vec<_>>()
          .join(", ")
      );
      options = options.after_connect(move |conn, _meta| {
        let sql = set_search_path.clone();
        Box::pin(async move {
          conn.execute(sql.as_str()).await?;
          Ok(())
        })
      });
    }

    let pool = options
      .connect(&key.database)
      .await
      .map_err(|source| DbError::Connect {
        database: key.database.clone(),
        source,
      })?;

    debug!(database = %key.database, "backend client connected");
    Ok(Self { pool })
  }
}

#[async_trait::async_trait]
impl SqlClient for SqlxClient {
  async fn query(&self, sql: &str, args: &[serde_json::Value]) -> Result<TableData, DbError> {
    let mut query = sqlx::query(sql);
    for arg in args {
      query = match arg {
        serde_json::Value::Null => query.bind(None::<String>),
        serde_json::Value::Bool(b) => query.bind(*b),
        serde_json::Value::Number(n) => {
          if let Some(i) = n.as_i64() {
            query.bind(i)
          } else if let Some(f) = n.as_f64() {
            query.bind(f)
          } else {
            return Err(DbError::UnsupportedArgument {
              message: format!("number out of range: {n}"),
            });
          }
        }
        serde_json::Value::String(s) => query.bind(s.clone()),
        // lists/objects are passed as their JSON text
        other => query.bind(other.to_string()),
      };
    }

    let rows = query
      .fetch_all(&self.pool)
      .await
      .map_err(|source| DbError::Query { source })?;

    Ok(rows_to_table(&rows))
  }

  async fn close(&self) {
    self.pool.close().await;
  }
}

fn rows_to_table(rows: &[AnyRow]) -> TableData {
  let columns = rows
    .first()
    .map(|row| {
      row
        .columns()
        .iter()
        .map(|column| TableColumn {
          name: column.name().to_string(),
          data_type: column.type_info().name().to_string(),
        })
        .collect()
    })
    .unwrap_or_default();

  let rows = rows
    .iter()
    .map(|row| (0..row.columns().len()).map(|idx| decode_column(row, idx)).collect())
    .collect();

  TableData { columns, rows }
}

/// Decode one cell into JSON, trying the Any driver's scalar types in turn.
fn decode_column(row: &AnyRow, idx: usize) -> serde_json::Value {
  if let Ok(value) = row.try_get::<Option<i64>, _>(idx) {
    return value.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null);
  }
  if let Ok(value) = row.try_get::<Option<f64>, _>(idx) {
    return value
      .and_then(|f| serde_json::Number::from_f64(f).map(serde_json::Value::Number))
      .unwrap_or(serde_json::Value::Null);
  }
  if let Ok(value) = row.try_get::<Option<bool>, _>(idx) {
    return value.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null);
  }
  if let Ok(value) = row.try_get::<Option<String>, _>(idx) {
    return value.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null);
  }
  serde_json::Value::Null
}

/// Production [`ClientFactory`] creating [`SqlxClient`]s.
pub struct SqlxClientFactory {
  max_connections: u32,
}

impl SqlxClientFactory {
  pub fn new(max_connections: u32) -> Self {
    Self { max_connections }
  }
}

impl Default for SqlxClientFactory {
  fn default() -> Self {
    Self {
      max_connections: 10,
    }
  }
}

#[async_trait::async_trait]
impl ClientFactory for SqlxClientFactory {
  async fn connect(&self, key: &ClientKey) -> Result<Arc<dyn SqlClient>, DbError> {
    let client = SqlxClient::connect(key, self.max_connections).await?;
    Ok(Arc::new(client))
  }
}
