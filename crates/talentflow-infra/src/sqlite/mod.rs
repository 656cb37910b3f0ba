//! SQLite storage layer.
//!
//! `InstanceStore` backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod instance;
pub mod pool;

pub use instance::SqliteInstanceStore;
pub use pool::DatabasePool;
