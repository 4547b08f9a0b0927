//! Error types for the ISM operator

use crate::osb::OsbError;
use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Object store gateway error
    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    /// Service broker error
    #[error("Service broker error: {0}")]
    Broker(#[from] OsbError),

    /// Referenced broker does not exist (yet)
    #[error("Broker not found: {namespace}/{name}")]
    BrokerNotFound { namespace: String, name: String },

    /// A catalog advertised the same service id twice
    #[error("Duplicate service id '{0}' in broker catalog")]
    DuplicateService(String),

    /// Resource metadata is missing a field the controller relies on
    #[error("Resource is missing metadata field: {0}")]
    MissingMetadata(&'static str),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Deletion is waiting on dependent resources
    #[error("Deletion blocked: {0}")]
    DeletionBlocked(String),

    /// The operator is shutting down
    #[error("Operator is shutting down")]
    ShuttingDown,
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable.
    ///
    /// The runtime drops keys whose error is not. Broker rejections that
    /// settle a record are written to its status before they get here, so
    /// any broker error reaching the runtime is retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            OperatorError::Store(e) => e.is_retryable(),
            OperatorError::Broker(_)
            | OperatorError::BrokerNotFound { .. }
            | OperatorError::DuplicateService(_)
            | OperatorError::DeletionBlocked(_) => true,
            OperatorError::MissingMetadata(_)
            | OperatorError::InvalidConfig(_)
            | OperatorError::SerializationError(_)
            | OperatorError::YamlError(_)
            | OperatorError::ShuttingDown => false,
        }
    }

    /// Fixed requeue delay for errors that wait on another resource.
    ///
    /// `None` means the runtime applies its exponential backoff.
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            OperatorError::DeletionBlocked(_) => Some(Duration::from_secs(30)),
            _ => None,
        }
    }
}
