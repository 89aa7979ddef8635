//! Error handling for the printer gateway

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Authentication rejected (bad credentials, expired token)
    #[error("Auth error: {0}")]
    Auth(String),

    /// Transient network failure (timeout, refused, DNS)
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed payload from a device or broker
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// MQTT session error
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// No free relay ports, transcoder spawn failure, and similar
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Transcoder process error
    #[error("Transcoder error: {0}")]
    Transcoder(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a retry with backoff is worthwhile.
    ///
    /// Auth and validation failures need operator action; protocol errors
    /// are dropped per message, not retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Mqtt(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            Error::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_is_retryable() {
        assert!(Error::Network("timeout".into()).is_retryable());
        assert!(Error::Mqtt("connection reset".into()).is_retryable());
    }

    #[test]
    fn test_auth_is_not_retryable() {
        assert!(!Error::Auth("token rejected".into()).is_retryable());
        assert!(!Error::Validation("missing field".into()).is_retryable());
        assert!(!Error::Protocol("bad json".into()).is_retryable());
    }
}
