//! Trellis DB
//!
//! Database access for dashboard queries. [`SqlClient`] is the seam the
//! executor talks through; [`SqlxClient`] is the production implementation
//! over sqlx's Any driver (postgres or sqlite URIs). [`ClientPool`] maps
//! (database URI, search path) keys to established clients, creating each
//! at most once per key.

mod client;
mod pool;
mod sqlx_client;

pub use client::{DbError, SqlClient, TableColumn, TableData};
pub use pool::{ClientFactory, ClientKey, ClientPool, ConnectOptions};
pub use sqlx_client::{SqlxClient, SqlxClientFactory};
