//! Central error types for the recorder.
//!
//! Every fallible operation in the crate returns [`RecorderResult`]. Errors
//! serialize as their display string so they can ride along in observer events.

use serde::Serialize;
use thiserror::Error;

use crate::camera::CameraErrorCode;

/// Main error type for recorder operations.
#[derive(Error, Debug)]
pub enum RecorderError {
    /// Camera device or capture session failure
    #[error("Camera error ({code}): {message}")]
    Camera {
        code: CameraErrorCode,
        message: String,
    },

    /// Storage operation failed
    #[error("Storage error: {0}")]
    StorageError(#[from] std::io::Error),

    /// Hardware encoder failed (configure, drain, EOS)
    #[error("Encoder error: {0}")]
    EncoderError(String),

    /// Container muxer or platform writer failed
    #[error("Writer error: {0}")]
    WriterError(String),

    /// Render context failure (import, draw, present)
    #[error("Render error: {0}")]
    RenderError(String),

    /// FFmpeg binary not found
    #[error("FFmpeg not found. Please ensure FFmpeg is installed or bundled.")]
    FfmpegNotFound,

    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Image processing error
    #[error("Image error: {0}")]
    ImageError(String),

    /// Operation did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Component was already released
    #[error("{0} already released")]
    Released(&'static str),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl RecorderError {
    /// Shorthand for a camera error with a message.
    pub fn camera(code: CameraErrorCode, message: impl Into<String>) -> Self {
        RecorderError::Camera {
            code,
            message: message.into(),
        }
    }

    /// Camera error code, if this is a camera error.
    pub fn camera_code(&self) -> Option<CameraErrorCode> {
        match self {
            RecorderError::Camera { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Errors are sent to observers as plain strings.
impl Serialize for RecorderError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<image::ImageError> for RecorderError {
    fn from(err: image::ImageError) -> Self {
        RecorderError::ImageError(err.to_string())
    }
}

impl From<String> for RecorderError {
    fn from(msg: String) -> Self {
        RecorderError::Other(msg)
    }
}

impl From<&str> for RecorderError {
    fn from(msg: &str) -> Self {
        RecorderError::Other(msg.to_string())
    }
}

/// Extension trait for adding context to Results.
///
/// # Example
/// ```ignore
/// use crate::error::{ResultExt, RecorderResult};
///
/// fn load() -> RecorderResult<String> {
///     std::fs::read_to_string("config.json").context("failed to read config file")
/// }
/// ```
pub trait ResultExt<T> {
    /// Add context to an error, converting it to RecorderError::Other.
    fn context(self, msg: &str) -> RecorderResult<T>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F: FnOnce() -> String>(self, f: F) -> RecorderResult<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn context(self, msg: &str) -> RecorderResult<T> {
        self.map_err(|e| RecorderError::Other(format!("{}: {}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> RecorderResult<T> {
        self.map_err(|e| RecorderError::Other(format!("{}: {}", f(), e)))
    }
}

/// Extension trait for adding context to Option types.
pub trait OptionExt<T> {
    /// Convert None to RecorderError::Other with the given message.
    fn context(self, msg: &str) -> RecorderResult<T>;

    /// Convert None to RecorderError::Other with a lazily evaluated message.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> RecorderResult<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn context(self, msg: &str) -> RecorderResult<T> {
        self.ok_or_else(|| RecorderError::Other(msg.to_string()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> RecorderResult<T> {
        self.ok_or_else(|| RecorderError::Other(f()))
    }
}

/// Type alias for Results using RecorderError.
pub type RecorderResult<T> = Result<T, RecorderError>;
