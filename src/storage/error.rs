//! Error types for storage operations

use crate::error::AppError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors that can occur while talking to the search engine or aggregating hits
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The engine could not be reached
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The engine did not become healthy within the startup window
    #[error("Could not connect to the search engine, timed out after {0:?}")]
    ConnectionTimeout(std::time::Duration),

    /// The partition does not exist
    #[error("Partition not found: {0}")]
    PartitionNotFound(String),

    /// A filter referenced an attribute the partition has not made filterable yet
    #[error("Attribute is not filterable: {0}")]
    NotFilterable(String),

    /// Settings were submitted but never showed up on read-back
    #[error("Configuration could not be verified after {attempts} attempts")]
    SettingsNotVerified { attempts: u32 },

    /// The engine answered with a non-success status
    #[error("Engine returned status {status}: {message}")]
    Engine { status: u16, message: String },

    /// Transport-level failure (network, timeout, TLS)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The engine answered with a body we could not understand
    #[error("Invalid engine response: {0}")]
    InvalidResponse(String),

    /// The query could not be constructed or was structurally rejected
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A filter expression could not be parsed
    #[error("Invalid filter expression: {0}")]
    InvalidFilter(String),

    /// JSON encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Every retry attempt failed
    #[error("Query failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<StorageError>,
    },

    /// Invalid storage configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl StorageError {
    /// Whether the failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Connection(_)
            | StorageError::Transport(_)
            | StorageError::InvalidResponse(_)
            | StorageError::NotFilterable(_) => true,
            StorageError::Engine { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Whether the failure is the "attribute not filterable" class that a
    /// settings re-application can repair.
    pub fn is_not_filterable(&self) -> bool {
        match self {
            StorageError::NotFilterable(_) => true,
            StorageError::RetriesExhausted { last, .. } => last.is_not_filterable(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            StorageError::Connection(err.to_string())
        } else if err.is_decode() {
            StorageError::InvalidResponse(err.to_string())
        } else {
            StorageError::Transport(err.to_string())
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidQuery(msg) | StorageError::InvalidFilter(msg) => {
                AppError::Validation(msg)
            }
            StorageError::Configuration(msg) => AppError::Configuration(msg),
            StorageError::PartitionNotFound(name) => AppError::NotFound(name),
            StorageError::Connection(msg) | StorageError::Transport(msg) => AppError::Network(msg),
            StorageError::ConnectionTimeout(d) => {
                AppError::Timeout(format!("search engine unreachable for {:?}", d))
            }
            StorageError::Serialization(e) => AppError::Serialization(e.to_string()),
            StorageError::Cancelled => AppError::Timeout("operation cancelled".to_string()),
            other => AppError::Database(other.to_string()),
        }
    }
}
