use thiserror::Error;

/// Unified error type for the Snova proxy
#[derive(Error, Debug)]
pub enum SnovaError {
    // Upstream errors
    #[error("Dial failed: {0}")]
    DialFailure(String),

    #[error("CONNECT handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("Write to upstream failed: {0}")]
    WriteFailure(String),

    #[error("Read from upstream failed: {0}")]
    ReadFailure(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    // Routing errors
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Snova operations
pub type Result<T> = std::result::Result<T, SnovaError>;

impl SnovaError {
    /// Whether the upstream could not be reached at all
    pub fn is_dial_failure(&self) -> bool {
        matches!(
            self,
            SnovaError::DialFailure(_)
                | SnovaError::HandshakeFailure(_)
                | SnovaError::Timeout
                | SnovaError::Tls(_)
        )
    }

    /// Whether the dispatcher still owes the client a synthesized 500.
    ///
    /// Dial failures are answered by the backend itself before it returns.
    pub fn responds_500(&self) -> bool {
        !self.is_dial_failure()
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for SnovaError {
    fn from(err: url::ParseError) -> Self {
        SnovaError::InvalidProxyAddress(err.to_string())
    }
}

// Convert from SOCKS client errors
impl From<tokio_socks::Error> for SnovaError {
    fn from(err: tokio_socks::Error) -> Self {
        SnovaError::DialFailure(format!("SOCKS connect failed: {}", err))
    }
}
