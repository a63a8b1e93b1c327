use crate::device::DeviceError;
use thiserror::Error;

/// Errors raised by the acquisition engine and its workers
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Driver failure during acquisition: {0}")]
    Driver(String),

    #[error("Read returned {actual} samples per channel, expected {expected}")]
    ChunkSizeMismatch { expected: usize, actual: usize },

    #[error("Read returned {actual} channels, expected {expected}")]
    ChannelCountMismatch { expected: usize, actual: usize },

    #[error("Acquisition already running")]
    AlreadyRunning,

    #[error("Acquisition not running")]
    NotRunning,

    #[error("No tokio runtime available: {0}")]
    RuntimeUnavailable(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed output file {path}: {reason}")]
    MalformedFile { path: String, reason: String },
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
