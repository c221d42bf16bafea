//! Error types for routewatch

use thiserror::Error;

/// Errors that can occur in the monitoring pipeline
#[derive(Debug, Error)]
pub enum WatchError {
    /// A CIDR string could not be parsed
    #[error("Invalid prefix '{0}'")]
    InvalidPrefix(String),

    /// A policy record failed validation
    #[error("Invalid rule for prefix '{prefix}': {reason}")]
    InvalidRule {
        prefix: String,
        reason: String,
    },

    /// No usable rule set could be built
    #[error("Policy error: {0}")]
    Policy(String),

    /// A raw ingress message could not be normalized
    #[error("Failed to normalize message: {0}")]
    Normalize(String),

    /// A detector failed while processing an event
    #[error("Detector '{detector}' failed: {reason}")]
    Detector {
        detector: String,
        reason: String,
    },

    /// Configured detector class is not registered
    #[error("Unknown detector class: {0}")]
    UnknownDetector(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML deserialization failure
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Publish failure
    #[error("Failed to publish to channel '{channel}': {reason}")]
    Publish {
        channel: String,
        reason: String,
    },

    /// A shared lock was poisoned by a panicking holder
    #[error("Lock poisoned: {0}")]
    Lock(String),

    /// The pipeline has been shut down
    #[error("Pipeline is shut down")]
    Shutdown,
}

/// Result type alias for routewatch operations
pub type Result<T> = std::result::Result<T, WatchError>;
