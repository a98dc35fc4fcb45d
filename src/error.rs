//! Error types for the partytracks client

/// Result type alias using the partytracks Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in partytracks operations
///
/// Every variant carries its context as a `String` so that a single batched
/// failure can be fanned out to all waiters of a coalesced signaling request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// HTTP transport failure talking to the SFU
    #[error("HTTP error: {0}")]
    Http(String),

    /// Error reported by the SFU in a response body
    #[error("SFU error {code}: {description}")]
    Sfu {
        /// Machine-readable error code from the response body
        code: String,
        /// Human-readable description from the response body
        description: String,
    },

    /// The SFU session is no longer valid and must be rebuilt
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Response shape violated the SFU protocol
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// WebRTC platform error (SDP, transceiver, stats)
    #[error("WebRTC error: {0}")]
    Rtc(String),

    /// A bounded wait elapsed
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// WebSocket connection error
    #[error("Socket error: {0}")]
    Socket(String),

    /// The scheduler or dispatcher serving this request has shut down
    #[error("Dispatch error: {0}")]
    Dispatch(String),
}

impl Error {
    /// Check if this error is retryable by resubscribing the failed stream
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Http(_)
                | Error::Sfu { .. }
                | Error::Protocol(_)
                | Error::Rtc(_)
                | Error::Timeout(_)
                | Error::Socket(_)
        )
    }

    /// Check if this error invalidates the whole session rather than the
    /// single operation that produced it
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::SessionExpired(_))
    }

    /// Get a brief error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Http(_) => "HTTP_ERROR",
            Error::Sfu { .. } => "SFU_ERROR",
            Error::SessionExpired(_) => "SESSION_EXPIRED",
            Error::Protocol(_) => "PROTOCOL_VIOLATION",
            Error::Rtc(_) => "WEBRTC_ERROR",
            Error::Timeout(_) => "OPERATION_TIMEOUT",
            Error::Socket(_) => "SOCKET_ERROR",
            Error::Dispatch(_) => "DISPATCH_ERROR",
        }
    }
}
