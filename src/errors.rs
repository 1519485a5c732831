// SPDX-License-Identifier: MPL-2.0

//! Error types for the capture service

use thiserror::Error;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Result type for hardware operations
pub type HalResult<T> = Result<T, HalError>;

/// Top-level error returned by the command line entry points
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Camera error: {0}")]
    Hal(#[from] HalError),
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Errors raised by a camera device
#[derive(Debug, Error)]
pub enum HalError {
    /// Camera hardware could not be opened
    #[error("Camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    /// Focus did not lock after every attempt
    #[error("Autofocus timed out after {attempts} attempts")]
    AutofocusTimeout { attempts: u32 },
    #[error("Operation not supported by this device: {0}")]
    Unsupported(&'static str),
    #[error("Encoder error: {0}")]
    Encoder(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while pulling frames or driving the clip output
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device produced no frame for this request
    #[error("Frame dropped: {0}")]
    FrameDropped(String),
    #[error("Device is not initialised")]
    NotInitialised,
    #[error("Pre-roll encoder is not running")]
    NotArmed,
    #[error("Clip output already active")]
    AlreadyCapturing,
    #[error("No clip output active")]
    NotCapturing,
}

/// Errors returned synchronously to the caller of a command
#[derive(Debug, Error)]
pub enum CommandError {
    /// Invalid value, nothing was changed
    #[error("Configuration rejected: {0}")]
    ConfigurationRejected(String),
    #[error("Not modified")]
    NotModified,
    #[error("Frame source is not running")]
    SourceStopped,
    #[error("Motion detector is not running")]
    DetectorStopped,
    #[error(transparent)]
    Hal(#[from] HalError),
    #[error("Photo encoding failed: {0}")]
    Encoding(String),
}

/// Errors raised while loading or validating the configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<CaptureError> for CommandError {
    fn from(err: CaptureError) -> Self {
        CommandError::Hal(HalError::Capture(err))
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Other(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Other(msg.to_string())
    }
}

impl HalError {
    /// Whether the fault is cleared by reinitialising the device
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HalError::Capture(CaptureError::FrameDropped(_))
                | HalError::Capture(CaptureError::NotInitialised)
                | HalError::DeviceUnavailable(_)
                | HalError::Encoder(_)
        )
    }
}
