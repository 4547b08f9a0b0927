//! Error types for the service broker client

use thiserror::Error;

/// Result type alias for broker operations
pub type OsbResult<T> = std::result::Result<T, OsbError>;

/// Errors that can occur while talking to a service broker
#[derive(Debug, Error)]
pub enum OsbError {
    /// Broker answered with a non-2xx status
    #[error("broker returned {code}: {description}")]
    Status { code: u16, description: String },

    /// Network / transport error (DNS, TCP, TLS)
    #[error("transport error: {0}")]
    Transport(String),

    /// Request exceeded the client timeout
    #[error("request timed out")]
    Timeout,

    /// Response body could not be decoded
    #[error("invalid broker response: {0}")]
    Decode(String),

    /// Client configuration error
    #[error("invalid broker configuration: {0}")]
    InvalidConfig(String),
}

impl OsbError {
    /// Whether retrying the same request cannot succeed.
    ///
    /// Client errors are permanent except request timeout (408) and
    /// throttling (429). Configuration errors are permanent as well.
    pub fn is_permanent(&self) -> bool {
        match self {
            OsbError::Status { code, .. } => {
                (400..500).contains(code) && *code != 408 && *code != 429
            }
            OsbError::InvalidConfig(_) => true,
            OsbError::Transport(_) | OsbError::Timeout | OsbError::Decode(_) => false,
        }
    }

    /// The resource no longer exists on the broker (410 Gone)
    pub fn is_gone(&self) -> bool {
        matches!(self, OsbError::Status { code: 410, .. })
    }

    /// HTTP status code, if the broker answered
    pub fn status_code(&self) -> Option<u16> {
        match self {
            OsbError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for OsbError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            OsbError::Timeout
        } else if e.is_decode() {
            OsbError::Decode(e.to_string())
        } else if e.is_builder() {
            OsbError::InvalidConfig(e.to_string())
        } else {
            OsbError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> OsbError {
        OsbError::Status {
            code,
            description: String::new(),
        }
    }

    #[test]
    fn test_permanent_errors() {
        assert!(status(400).is_permanent());
        assert!(status(401).is_permanent());
        assert!(status(409).is_permanent());
        assert!(status(422).is_permanent());
        assert!(OsbError::InvalidConfig("bad url".to_string()).is_permanent());
    }

    #[test]
    fn test_transient_errors() {
        assert!(!status(408).is_permanent());
        assert!(!status(429).is_permanent());
        assert!(!status(500).is_permanent());
        assert!(!status(503).is_permanent());
        assert!(!OsbError::Timeout.is_permanent());
        assert!(!OsbError::Transport("connection refused".to_string()).is_permanent());
    }

    #[test]
    fn test_gone() {
        assert!(status(410).is_gone());
        assert!(!status(404).is_gone());
        assert_eq!(status(410).status_code(), Some(410));
        assert_eq!(OsbError::Timeout.status_code(), None);
    }
}
