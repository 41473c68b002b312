//! Persistence layer for instances, stages and tasks.
//!
//! - `traits` — `PipelineStore` / `StoreTransaction` interfaces
//! - `memory` — in-process store with buffered transactions
//! - `libsql_backend` — SQLite-backed store via libSQL
//! - `migrations` — versioned schema for the libSQL store

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::InMemoryStore;
pub use traits::{PipelineStore, StoreTransaction};
