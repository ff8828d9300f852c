use thiserror::Error;

/// Main error type for the supervisor
#[derive(Error, Debug)]
pub enum VigilError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook delivery failed: {0}")]
    Webhook(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Sampling errors
    #[error("Sampling failed: {0}")]
    Sampling(String),

    // Process lifecycle errors
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Process already managed: {0}")]
    DuplicateProcess(String),

    #[error("Failed to spawn {name}: {reason}")]
    Spawn { name: String, reason: String },

    // Persistence errors
    #[error("Checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("State verification failed: {0}")]
    Verification(String),

    // Call protection
    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for VigilError
pub type Result<T> = std::result::Result<T, VigilError>;
