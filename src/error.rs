use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for proxytrail
#[derive(Error, Debug)]
pub enum TrailError {
    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database connection failed: {0}")]
    DatabaseConnection(String),

    // Forwarding errors
    #[error("Origin unreachable: {0}")]
    OriginUnreachable(String),

    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    // Tunnel errors
    #[error("CONNECT failed: {0}")]
    ConnectFailed(String),

    #[error("Connection cannot be upgraded for tunneling")]
    UpgradeUnavailable,

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    // Snapshot encoding
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for proxytrail operations
pub type Result<T> = std::result::Result<T, TrailError>;

impl TrailError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            TrailError::InvalidRequest(_)
            | TrailError::UnsupportedScheme(_)
            | TrailError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 502 Bad Gateway
            TrailError::OriginUnreachable(_)
            | TrailError::ConnectFailed(_)
            | TrailError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            TrailError::Cancelled | TrailError::DatabaseConnection(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 504 Gateway Timeout
            TrailError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            TrailError::UpgradeUnavailable
            | TrailError::Database(_)
            | TrailError::Serialization(_)
            | TrailError::Io(_)
            | TrailError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for TrailError {
    fn from(err: hyper::Error) -> Self {
        TrailError::UpstreamProtocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            TrailError::InvalidRequest("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TrailError::UnsupportedScheme("https".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TrailError::OriginUnreachable("refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            TrailError::ConnectFailed("refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(TrailError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            TrailError::Cancelled.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            TrailError::UpgradeUnavailable.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_client_server_helpers() {
        assert!(TrailError::InvalidRequest("bad".to_string()).is_client_error());
        assert!(!TrailError::InvalidRequest("bad".to_string()).is_server_error());

        assert!(TrailError::Timeout.is_server_error());
        assert!(!TrailError::Timeout.is_client_error());
    }

    #[test]
    fn test_serialization_errors_are_internal() {
        let err: TrailError = serde_json::from_str::<u16>("not json").unwrap_err().into();
        assert!(matches!(err, TrailError::Serialization(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_io_errors_are_internal() {
        let err: TrailError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
