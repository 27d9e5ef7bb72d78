//! Error types for camrelay

use thiserror::Error;

/// Classification of encoder-level faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum EncoderFaultKind {
    /// Operation attempted while the device state precludes it (non-fatal)
    InvalidState,
    /// Recording denied by policy (fatal)
    Security,
    /// Any other encoder failure (fatal)
    Other,
}

impl EncoderFaultKind {
    /// Whether a fault of this kind ends the recording session
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EncoderFaultKind::InvalidState)
    }
}

impl std::fmt::Display for EncoderFaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EncoderFaultKind::InvalidState => "InvalidStateError",
            EncoderFaultKind::Security => "SecurityError",
            EncoderFaultKind::Other => "EncoderError",
        };
        f.write_str(name)
    }
}

/// Main error type for camrelay sessions
#[derive(Error, Debug)]
pub enum RelayError {
    /// Initialization error
    #[error("Initialization failed: {reason}")]
    Initialization {
        /// Reason for initialization failure
        reason: String,
    },

    /// Configuration rejected during validation
    #[error("Invalid configuration: {message}")]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },

    /// Capture device could not be acquired
    #[error("Could not open webcam: {reason}")]
    CaptureAcquisition {
        /// Reason reported by the device layer
        reason: String,
    },

    /// None of the preferred encoding formats is supported
    #[error("None of the encoding formats is supported: {}", tried.join(", "))]
    UnsupportedFormat {
        /// Formats tried, in preference order
        tried: Vec<String>,
    },

    /// Encoder reported a fault
    #[error("Encoder fault ({kind}): {reason}")]
    EncoderState {
        /// Fault classification
        kind: EncoderFaultKind,
        /// Human-readable reason
        reason: String,
    },

    /// Transport-level connection error
    #[error("Connection to {endpoint} failed: {reason}")]
    Connection {
        /// Endpoint URL
        endpoint: String,
        /// Reason for connection failure
        reason: String,
    },

    /// Outbound queue full; the message was dropped
    #[error("Send queue for {endpoint} is full ({capacity} messages)")]
    Congested {
        /// Endpoint URL
        endpoint: String,
        /// Queue capacity
        capacity: usize,
    },

    /// Connection closed (not an error in itself, but recording must stop)
    #[error("Connection closed (code {code:?}): {reason}")]
    ConnectionClosed {
        /// Close code sent by the peer, if any
        code: Option<u16>,
        /// Close reason
        reason: String,
    },

    /// Invalid state error
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Endpoint URL could not be derived
    #[error("Invalid endpoint {url}: {reason}")]
    InvalidEndpoint {
        /// Offending URL
        url: String,
        /// Why it was rejected
        reason: String,
    },
}

impl RelayError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            RelayError::Initialization { .. } => "INITIALIZATION_FAILED".to_string(),
            RelayError::Configuration { .. } => "INVALID_CONFIGURATION".to_string(),
            RelayError::CaptureAcquisition { .. } => "CAPTURE_ACQUISITION_FAILED".to_string(),
            RelayError::UnsupportedFormat { .. } => "UNSUPPORTED_FORMAT".to_string(),
            RelayError::EncoderState { .. } => "ENCODER_STATE_ERROR".to_string(),
            RelayError::Connection { .. } => "CONNECTION_FAILED".to_string(),
            RelayError::Congested { .. } => "SEND_QUEUE_FULL".to_string(),
            RelayError::ConnectionClosed { .. } => "CONNECTION_CLOSED".to_string(),
            RelayError::InvalidState { .. } => "INVALID_STATE".to_string(),
            RelayError::InvalidEndpoint { .. } => "INVALID_ENDPOINT".to_string(),
        }
    }

    /// Whether the error leaves a needed subsystem unavailable
    pub fn is_fatal(&self) -> bool {
        match self {
            RelayError::EncoderState { kind, .. } => kind.is_fatal(),
            RelayError::Congested { .. } => false,
            RelayError::ConnectionClosed { .. } => false,
            RelayError::InvalidState { .. } => false,
            _ => true,
        }
    }

    /// Title used when the error is surfaced to the user
    pub fn notify_title(&self) -> String {
        match self {
            RelayError::Initialization { .. } | RelayError::Configuration { .. } => {
                "Configuration Error".to_string()
            }
            RelayError::CaptureAcquisition { .. } | RelayError::UnsupportedFormat { .. } => {
                "Media Error".to_string()
            }
            RelayError::EncoderState { kind, .. } => match kind {
                EncoderFaultKind::InvalidState => "Invalid Media State Error".to_string(),
                EncoderFaultKind::Security => "Media Security Error".to_string(),
                EncoderFaultKind::Other => "Media Error".to_string(),
            },
            RelayError::Connection { .. }
            | RelayError::Congested { .. }
            | RelayError::InvalidEndpoint { .. } => "Connection Error".to_string(),
            RelayError::ConnectionClosed { .. } => "Connection Closed".to_string(),
            RelayError::InvalidState { .. } => "Invalid State".to_string(),
        }
    }
}
