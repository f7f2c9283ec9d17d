//! Error types for the sentiment engine.

use std::time::Duration;

use crate::pipeline::types::EntityType;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Rejections at the ingestion boundary. These never reach the worker.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Feedback for entity type '{0}' is currently disabled")]
    FeatureDisabled(EntityType),
}

/// Job queue errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is closed")]
    Closed,

    #[error("acknowledge() called more times than jobs were dequeued")]
    AcknowledgeWithoutDequeue,
}

/// Failures inside a job's unit of work. Each one aborts the job's transaction.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Classifier {classifier} returned out-of-range score {score}")]
    Classification { classifier: String, score: f64 },

    #[error("Could not lock entity {entity_id} within {waited:?}")]
    AggregationConflict { entity_id: String, waited: Duration },

    #[error("Persistence failure: {0}")]
    Persistence(#[from] DatabaseError),
}

/// Worker lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker did not stop within {grace:?}")]
    ShutdownTimeout { grace: Duration },

    #[error("Worker task panicked: {0}")]
    Panicked(String),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
