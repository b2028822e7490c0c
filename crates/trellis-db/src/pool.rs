use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::debug;

use crate::client::{DbError, SqlClient};

/// Backend selection for one execution tree. Unset fields fall back to the
/// pool defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
  pub database: Option<String>,
  pub search_path: Option<Vec<String>>,
}

/// Pool key: backend descriptor plus search path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
  pub database: String,
  pub search_path: Vec<String>,
}

/// Creates clients on pool miss. The production factory is
/// [`crate::SqlxClientFactory`]; tests substitute their own.
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
  async fn connect(&self, key: &ClientKey) -> Result<Arc<dyn SqlClient>, DbError>;
}

/// Keyed mapping from (database, search path) to an established client.
///
/// The default client is created on first use and reused whenever a tree
/// does not override the backend. Creation is single-flight per key: the
/// map mutex only guards the map, and concurrent getters for the same key
/// await one shared `OnceCell` initialization.
pub struct ClientPool {
  factory: Arc<dyn ClientFactory>,
  default_key: ClientKey,
  clients: Mutex<HashMap<ClientKey, Arc<OnceCell<Arc<dyn SqlClient>>>>>,
}

impl ClientPool {
  pub fn new(factory: Arc<dyn ClientFactory>, default_database: impl Into<String>) -> Self {
    Self {
      factory,
      default_key: ClientKey {
        database: default_database.into(),
        search_path: Vec::new(),
      },
      clients: Mutex::new(HashMap::new()),
    }
  }

  /// Resolve options to a concrete pool key.
  pub fn key_for(&self, opts: &ConnectOptions) -> ClientKey {
    ClientKey {
      database: opts
        .database
        .clone()
        .unwrap_or_else(|| self.default_key.database.clone()),
      search_path: opts
        .search_path
        .clone()
        .unwrap_or_else(|| self.default_key.search_path.clone()),
    }
  }

  /// Get the client for `opts`, establishing it on first use.
  pub async fn get(&self, opts: &ConnectOptions) -> Result<Arc<dyn SqlClient>, DbError> {
    let key = self.key_for(opts);
    let cell = {
      let mut clients = self.clients.lock().expect("client map poisoned");
      clients.entry(key.clone()).or_default().clone()
    };

    let client = cell
      .get_or_try_init(|| async {
        debug!(database = %key.database, "creating backend client");
        self.factory.connect(&key).await
      })
      .await?;
    Ok(client.clone())
  }

  /// Close and forget the client for `opts`, if one was established.
  pub async fn close(&self, opts: &ConnectOptions) {
    let key = self.key_for(opts);
    let cell = {
      let mut clients = self.clients.lock().expect("client map poisoned");
      clients.remove(&key)
    };
    if let Some(cell) = cell {
      if let Some(client) = cell.get() {
        client.close().await;
      }
    }
  }

  /// Close every established client.
  pub async fn close_all(&self) {
    let cells: Vec<_> = {
      let mut clients = self.clients.lock().expect("client map poisoned");
      clients.drain().map(|(_, cell)| cell).collect()
    };
    for cell in cells {
      if let Some(client) = cell.get() {
        client.close().await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::client::TableData;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  struct CountingClient;

  #[async_trait::async_trait]
  impl SqlClient for CountingClient {
    async fn query(&self, _sql: &str, _args: &[serde_json::Value]) -> Result<TableData, DbError> {
      Ok(TableData::default())
    }

    async fn close(&self) {}
  }

  struct CountingFactory {
    connects: AtomicUsize,
  }

  #[async_trait::async_trait]
  impl ClientFactory for CountingFactory {
    async fn connect(&self, _key: &ClientKey) -> Result<Arc<dyn SqlClient>, DbError> {
      self.connects.fetch_add(1, Ordering::SeqCst);
      // widen the race window for the single-flight assertion
      tokio::time::sleep(Duration::from_millis(10)).await;
      Ok(Arc::new(CountingClient))
    }
  }

  #[tokio::test]
  async fn default_client_is_created_once() {
    let factory = Arc::new(CountingFactory {
      connects: AtomicUsize::new(0),
    });
    let pool = Arc::new(ClientPool::new(factory.clone(), "sqlite::memory:"));

    let opts = ConnectOptions::default();
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let pool = pool.clone();
        let opts = opts.clone();
        tokio::spawn(async move { pool.get(&opts).await.map(|_| ()) })
      })
      .collect();
    for handle in handles {
      handle.await.expect("join").expect("get client");
    }

    assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn distinct_keys_get_distinct_clients() {
    let factory = Arc::new(CountingFactory {
      connects: AtomicUsize::new(0),
    });
    let pool = ClientPool::new(factory.clone(), "sqlite::memory:");

    pool.get(&ConnectOptions::default()).await.expect("default");
    pool
      .get(&ConnectOptions {
        database: Some("postgres://localhost/other".to_string()),
        search_path: None,
      })
      .await
      .expect("override");
    pool
      .get(&ConnectOptions {
        database: None,
        search_path: Some(vec!["audit".to_string()]),
      })
      .await
      .expect("search path override");

    assert_eq!(factory.connects.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn close_forgets_the_client() {
    let factory = Arc::new(CountingFactory {
      connects: AtomicUsize::new(0),
    });
    let pool = ClientPool::new(factory.clone(), "sqlite::memory:");

    let opts = ConnectOptions::default();
    pool.get(&opts).await.expect("get");
    pool.close(&opts).await;
    pool.get(&opts).await.expect("get again");

    assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
  }
}
