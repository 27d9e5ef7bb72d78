//! Media error types and handling
//!
//! Errors raised by the capture source, the chunk encoder, the frame display
//! and the process-backed device implementations.

use camrelay_core::{EncoderFaultKind, RelayError};
use thiserror::Error;

/// Main error type for media operations
#[derive(Error, Debug)]
pub enum MediaError {
    /// I/O operation failed
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Invalid configuration provided
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Error message
        message: String,
    },

    /// None of the candidate encoding formats is supported
    #[error("Unsupported format: none of {} is supported", tried.join(", "))]
    UnsupportedFormat {
        /// Formats tried, in preference order
        tried: Vec<String>,
    },

    /// Encoding format string could not be parsed
    #[error("Invalid format '{format}': {reason}")]
    InvalidFormat {
        /// Offending format string
        format: String,
        /// Why it was rejected
        reason: String,
    },

    /// Capture device could not be acquired
    #[error("Could not open webcam: {reason}")]
    CaptureFailed {
        /// Failure reason
        reason: String,
    },

    /// Decoding an inbound frame failed
    #[error("Decoding failed: {reason}")]
    DecodingFailed {
        /// Failure reason
        reason: String,
    },

    /// Encoder rejected an operation or failed while running
    #[error("Encoder fault ({kind}): {message}")]
    EncoderFault {
        /// Fault classification
        kind: EncoderFaultKind,
        /// Failure message
        message: String,
    },

    /// External helper process failed
    #[error("Process {program} failed: {reason}")]
    ProcessFailed {
        /// Program that was run
        program: String,
        /// Failure reason
        reason: String,
    },

    /// Invalid state for operation
    #[error("Invalid state: {message}")]
    InvalidState {
        /// State error message
        message: String,
    },
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

impl MediaError {
    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            MediaError::Io { .. } => true,
            MediaError::DecodingFailed { .. } => true,
            MediaError::EncoderFault { kind, .. } => !kind.is_fatal(),
            MediaError::InvalidState { .. } => true,
            MediaError::UnsupportedFormat { .. } => false,
            MediaError::CaptureFailed { .. } => false,
            _ => false,
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            MediaError::Io { .. } => ErrorCategory::System,
            MediaError::InvalidConfiguration { .. } => ErrorCategory::Configuration,
            MediaError::UnsupportedFormat { .. } => ErrorCategory::Format,
            MediaError::InvalidFormat { .. } => ErrorCategory::Format,
            MediaError::CaptureFailed { .. } => ErrorCategory::Device,
            MediaError::DecodingFailed { .. } => ErrorCategory::Codec,
            MediaError::EncoderFault { .. } => ErrorCategory::Codec,
            MediaError::ProcessFailed { .. } => ErrorCategory::System,
            MediaError::InvalidState { .. } => ErrorCategory::State,
        }
    }
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// System-level errors (I/O, child processes)
    System,
    /// Configuration and parameter errors
    Configuration,
    /// Codec-related errors
    Codec,
    /// Format negotiation errors
    Format,
    /// Device and hardware errors
    Device,
    /// State management errors
    State,
}

impl From<MediaError> for RelayError {
    fn from(error: MediaError) -> Self {
        match error {
            MediaError::UnsupportedFormat { tried } => RelayError::UnsupportedFormat { tried },
            MediaError::CaptureFailed { reason } => RelayError::CaptureAcquisition { reason },
            MediaError::EncoderFault { kind, message } => RelayError::EncoderState {
                kind,
                reason: message,
            },
            MediaError::InvalidConfiguration { message } => RelayError::Configuration { message },
            MediaError::InvalidState { message } => RelayError::InvalidState {
                expected: "valid media state".to_string(),
                actual: message,
            },
            other => RelayError::Initialization {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let io_error = MediaError::Io {
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "ffmpeg not found"),
        };
        assert_eq!(io_error.category(), ErrorCategory::System);
        assert!(io_error.is_recoverable());

        let format_error = MediaError::UnsupportedFormat {
            tried: vec!["video/webm;codecs=vp9".to_string()],
        };
        assert_eq!(format_error.category(), ErrorCategory::Format);
        assert!(!format_error.is_recoverable());
    }

    #[test]
    fn test_encoder_fault_recoverability() {
        let busy = MediaError::EncoderFault {
            kind: EncoderFaultKind::InvalidState,
            message: "busy".to_string(),
        };
        assert!(busy.is_recoverable());

        let denied = MediaError::EncoderFault {
            kind: EncoderFaultKind::Security,
            message: "policy".to_string(),
        };
        assert!(!denied.is_recoverable());
    }

    #[test]
    fn test_conversion_into_relay_error() {
        let relay: RelayError = MediaError::CaptureFailed {
            reason: "Permission denied".to_string(),
        }
        .into();
        assert_eq!(relay.error_code(), "CAPTURE_ACQUISITION_FAILED");
        assert_eq!(relay.to_string(), "Could not open webcam: Permission denied");
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let media_error = MediaError::from(io_error);

        match media_error {
            MediaError::Io { .. } => (),
            _ => panic!("Expected Io error variant"),
        }
    }
}
