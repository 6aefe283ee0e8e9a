//! Error types for buzzer bridge operations
//!
//! Covers the serial link, the OSC encoder, UDP dispatch and the external
//! configuration and activity-log collaborators. Parse problems inside a
//! recognizable line never surface here; the parser skips the bad field.

use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Serial/Interface Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Serial read error
    #[error("Serial read error: {0}")]
    ReadError(String),

    /// Serial write error
    #[error("Serial write error: {0}")]
    WriteError(String),

    /// Serial port disconnected
    #[error("Serial port disconnected")]
    Disconnected,

    /// Unknown outbound coordinator command
    #[error("Unknown coordinator command: {0}")]
    UnknownCommand(String),

    // ===== OSC Errors =====
    /// OSC address pattern is not usable
    #[error("Invalid OSC address '{0}': must start with '/' and contain no NUL bytes")]
    InvalidOscAddress(String),

    /// OSC packet could not be decoded
    #[error("Malformed OSC packet: {0}")]
    MalformedOsc(String),

    // ===== Dispatch Errors =====
    /// Target host/port could not be resolved to a socket address
    #[error("Cannot resolve target {target}: {reason}")]
    ResolveFailed {
        /// Target key (host:port)
        target: String,
        /// Failure reason
        reason: String,
    },

    /// UDP send failed locally
    #[error("Send to {target} failed: {reason}")]
    SendFailed {
        /// Target key (host:port)
        target: String,
        /// Failure reason
        reason: String,
    },

    /// Sender pool was closed
    #[error("Sender pool is closed")]
    PoolClosed,

    // ===== Collaborator Errors =====
    /// Configuration source query failed
    #[error("Configuration query failed: {0}")]
    ConfigQuery(String),

    /// Activity log append failed
    #[error("Activity log write failed: {0}")]
    ActivityLog(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Check if this error is recoverable by retrying the link
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::Disconnected | BridgeError::ReadError(_) | BridgeError::WriteError(_)
        )
    }

    /// Check if this error concerns the serial transport
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            BridgeError::PortNotFound(_)
                | BridgeError::PortOpenFailed { .. }
                | BridgeError::ReadError(_)
                | BridgeError::WriteError(_)
                | BridgeError::Disconnected
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::PortNotFound(_) => "PORT_NOT_FOUND",
            BridgeError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            BridgeError::ReadError(_) => "READ_ERROR",
            BridgeError::WriteError(_) => "WRITE_ERROR",
            BridgeError::Disconnected => "DISCONNECTED",
            BridgeError::UnknownCommand(_) => "UNKNOWN_COMMAND",
            BridgeError::InvalidOscAddress(_) => "INVALID_OSC_ADDRESS",
            BridgeError::MalformedOsc(_) => "MALFORMED_OSC",
            BridgeError::ResolveFailed { .. } => "RESOLVE_FAILED",
            BridgeError::SendFailed { .. } => "SEND_FAILED",
            BridgeError::PoolClosed => "POOL_CLOSED",
            BridgeError::ConfigQuery(_) => "CONFIG_QUERY",
            BridgeError::ActivityLog(_) => "ACTIVITY_LOG",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::ChannelClosed => "CHANNEL_CLOSED",
            BridgeError::Json(_) => "JSON_ERROR",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for BridgeError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => BridgeError::PortNotFound(err.description),
            serialport::ErrorKind::Io(kind) => {
                BridgeError::Io(std::io::Error::new(kind, err.description))
            }
            _ => BridgeError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BridgeError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BridgeError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = BridgeError::PortNotFound("/dev/ttyUSB0".to_string());
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");
        assert_eq!(BridgeError::PoolClosed.error_code(), "POOL_CLOSED");
    }

    #[test]
    fn test_is_retriable() {
        assert!(BridgeError::Disconnected.is_retriable());
        assert!(BridgeError::ReadError("eof".to_string()).is_retriable());
        assert!(!BridgeError::InvalidOscAddress("x".to_string()).is_retriable());
    }

    #[test]
    fn test_is_transport_error() {
        assert!(BridgeError::PortOpenFailed {
            port: "/dev/ttyACM0".to_string(),
            reason: "busy".to_string(),
        }
        .is_transport_error());
        assert!(!BridgeError::ConfigQuery("db locked".to_string()).is_transport_error());
    }

    #[test]
    fn test_resolve_failed_message() {
        let err = BridgeError::ResolveFailed {
            target: "nowhere.invalid:9000".to_string(),
            reason: "no addresses".to_string(),
        };
        assert!(err.to_string().contains("nowhere.invalid:9000"));
    }
}
