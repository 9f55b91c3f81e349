//! askdb storage crate - session persistence.
//!
//! Provides the [`SessionStore`] capability with a WAL-mode SQLite
//! implementation (append-only turn log with migrations) and an in-memory
//! implementation used for tests and degraded mode.

pub mod db;
pub mod memory;
pub mod migrations;
pub mod session_store;

pub use db::Database;
pub use memory::InMemorySessionStore;
pub use session_store::{SessionStore, SqliteSessionStore};
