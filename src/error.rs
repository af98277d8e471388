//! Error types for assist-relay.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Ask error: {0}")]
    Ask(#[from] AskError),

    #[error("Server error: {0}")]
    Server(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// State store errors. Callers treat these as "no data" except during
/// profile registration, where the user is asked to retry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Answering collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum AskError {
    #[error("Assistant {assistant} request failed: {reason}")]
    RequestFailed { assistant: String, reason: String },

    #[error("Invalid response from assistant {assistant}: {reason}")]
    InvalidResponse { assistant: String, reason: String },

    #[error("Assistant run {run_id} ended with status {status}")]
    RunFailed { run_id: String, status: String },

    #[error("Assistant did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Assistant returned an empty reply")]
    EmptyReply,
}

/// Transport errors. A failed delivery is what the relay calls a
/// `DeliveryError`.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("No channel registered under {0}")]
    UnknownChannel(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Channel health check failed: {name}")]
    HealthCheckFailed { name: String },
}

/// Reply delivery failure.
pub type DeliveryError = ChannelError;

/// Why a single task did not complete cleanly. The drain loop logs these and
/// moves on; the task still counts as processed.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Ask failed: {0}")]
    Ask(#[from] AskError),

    #[error("{failed} of {total} reply chunks could not be delivered")]
    Delivery { failed: usize, total: usize },

    #[error("Task panicked: {0}")]
    Panicked(String),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
