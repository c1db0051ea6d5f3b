//! Error types for voxfuse

use thiserror::Error;

/// Result type alias for voxfuse operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for voxfuse
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Rejected configuration value; the offending feature is disabled
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed point cloud message
    #[error("Failed to decode point cloud: {0}")]
    Decode(String),

    /// Malformed layer or block message
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Container frame failed its integrity check
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// Layer constants of an inbound message do not match the local layer
    #[error("Layer mismatch: {0}")]
    LayerMismatch(String),

    /// Sensor-to-world transform could not be resolved
    #[error("No transform from frame '{frame}' at t={timestamp_ns}ns")]
    TransformUnavailable { frame: String, timestamp_ns: i64 },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}
