//! Unified error handling for the puzzle-walk library.
//!
//! Every reported condition of the walk and admin sessions maps to one
//! variant here. None of them is fatal to a session: callers report the
//! error and keep going with their current local state.

use thiserror::Error;

/// Unified error type for puzzle-walk operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WalkError {
    /// No geolocation capability, or permission denied
    #[error("Position unavailable: {message}")]
    PositionUnavailable { message: String },

    /// Transient failure reading a position
    #[error("Position error: {message}")]
    PositionError { message: String },

    /// A walk was started without a selected route
    #[error("No route selected")]
    NoRouteSelected,

    /// The source image could not be read, or cannot hold the grid
    #[error("Image load failed: {message}")]
    ImageLoadFailed { message: String },

    /// The source image bytes could not be decoded
    #[error("Image decode failed: {message}")]
    ImageDecodeFailed { message: String },

    /// A fragment could not be re-encoded
    #[error("Image encode failed: {message}")]
    ImageEncodeFailed { message: String },

    /// Writing to the remote store failed
    #[error("Remote write failed: {message}")]
    RemoteWriteFailed { message: String },

    /// Reading from the remote store failed
    #[error("Remote read failed: {message}")]
    RemoteReadFailed { message: String },

    /// Malformed import payload
    #[error("Invalid import: {message}")]
    InvalidImport { message: String },

    /// The local device identity could not be read or created
    #[error("Device identity unavailable: {message}")]
    DeviceIdentityUnavailable { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WalkError {
    /// Whether the session can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, WalkError::Internal { .. })
    }

    pub(crate) fn remote_read(err: impl std::fmt::Display) -> Self {
        WalkError::RemoteReadFailed {
            message: err.to_string(),
        }
    }

    pub(crate) fn remote_write(err: impl std::fmt::Display) -> Self {
        WalkError::RemoteWriteFailed {
            message: err.to_string(),
        }
    }
}

/// Result type alias for puzzle-walk operations.
pub type Result<T> = std::result::Result<T, WalkError>;

/// Extension trait for converting Option to WalkError.
pub trait OptionExt<T> {
    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| WalkError::Internal {
            message: message.to_string(),
        })
    }
}
