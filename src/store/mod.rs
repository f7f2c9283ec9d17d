//! Persistence layer: libSQL-backed storage for feedback, scores and alerts.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{FeedbackStore, StoreTransaction};
