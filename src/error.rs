use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Result type for mining operations
pub type Result<T> = std::result::Result<T, MiningError>;

/// Error types for the mining pipeline
#[derive(thiserror::Error, Debug)]
pub enum MiningError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("No definition found for '{0}'")]
    NotFound(String),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Pairing failed for {path}: {message}")]
    Pairing { path: PathBuf, message: String },

    #[error("Card service error: {0}")]
    Service(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Dictionary backend error: {0}")]
    Backend(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Failures raised while producing screenshots and audio clips
#[derive(thiserror::Error, Debug)]
pub enum ExtractionError {
    #[error("{program} exited with {status}: {stderr}")]
    ProcessFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("no audio track in {0}")]
    MissingAudioTrack(PathBuf),

    #[error("timestamp {timestamp:?} is beyond video duration {duration:?}")]
    OutOfRange {
        timestamp: Duration,
        duration: Duration,
    },

    #[error("{program} timed out after {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("could not probe {path}: {message}")]
    Probe { path: PathBuf, message: String },

    #[error("extraction cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable label for a failure, used in reports and progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ParseError,
    NotFound,
    ExtractionError,
    PairingError,
    ServiceError,
    Cancelled,
    Other,
}

impl MiningError {
    pub fn kind(&self) -> FailureKind {
        match self {
            MiningError::Parse { .. } => FailureKind::ParseError,
            MiningError::NotFound(_) => FailureKind::NotFound,
            MiningError::Extraction(e) => e.kind(),
            MiningError::Pairing { .. } => FailureKind::PairingError,
            MiningError::Service(_) => FailureKind::ServiceError,
            MiningError::Cancelled => FailureKind::Cancelled,
            MiningError::Io(_)
            | MiningError::Config(_)
            | MiningError::Tokenizer(_)
            | MiningError::Backend(_) => FailureKind::Other,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        MiningError::Parse {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl ExtractionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExtractionError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::ExtractionError,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureKind::ParseError => "parse_error",
            FailureKind::NotFound => "not_found",
            FailureKind::ExtractionError => "extraction_error",
            FailureKind::PairingError => "pairing_error",
            FailureKind::ServiceError => "service_error",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Other => "other",
        };
        f.write_str(label)
    }
}
