//! Error types for the inbox engine.

use std::time::Duration;

use uuid::Uuid;

use crate::tasks::model::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
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

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Messaging surface errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },
}

/// Agent backend errors. Domain failures come back as `AgentRun { success: false }`;
/// these cover the execution path itself.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Failed to spawn agent {command}: {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Agent timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Agent exited with code {code}: {stderr}")]
    ExitStatus { code: i32, stderr: String },

    #[error("Invalid agent output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Artifact snapshot/upload errors.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Failed to scan {path}: {reason}")]
    Scan { path: String, reason: String },

    #[error("Upload of {path} failed: {reason}")]
    Upload { path: String, reason: String },
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
