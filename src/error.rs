use thiserror::Error;

/// Custom error types for the proctoring monitor
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Connection errors
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection timed out after {0}s")]
    ConnectTimeout(u64),

    #[error("Not connected to the proctoring server")]
    NotConnected,

    #[error("Network error: {0}")]
    NetworkError(String),

    /// Protocol errors
    #[error("Invalid proctoring message: {0}")]
    InvalidMessage(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Monitor task errors
    #[error("Monitor task is no longer running")]
    MonitorStopped,

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Convenience type alias for Results using MonitorError
pub type Result<T> = std::result::Result<T, MonitorError>;

impl MonitorError {
    /// Helper to create network errors
    pub fn network(msg: impl Into<String>) -> Self {
        MonitorError::NetworkError(msg.into())
    }

    pub fn invalid_config(key: &str, value: &str) -> Self {
        MonitorError::InvalidConfiguration(format!("{}={:?}", key, value))
    }
}
