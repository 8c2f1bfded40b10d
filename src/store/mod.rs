//! Persistence layer: libSQL-backed dedupe records and digest deliveries.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, PriorityCounts};
