//! SQLite persistence layer

pub mod connection;
pub mod schema;
pub mod sqlite;

pub use connection::{PoolStatistics, StoragePool};
pub use sqlite::SqliteBackend;
