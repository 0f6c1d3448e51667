//! Error types for asset loading

use std::time::Duration;

use thiserror::Error;

/// Result type for asset decode/parse/build operations
pub type AssetResult<T> = Result<T, AssetError>;

/// Errors that can occur while turning an uploaded asset into render buffers
#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Archive corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("No .ply entry found in archive")]
    NoPlyInArchive,

    #[error("PLY header is not terminated by end_header")]
    HeaderNotTerminated,

    #[error("Invalid PLY header field {field}: {value:?}")]
    HeaderFieldInvalid { field: String, value: String },

    #[error("Malformed vertex row at line {line}")]
    MalformedVertex { line: usize },

    #[error("Malformed PLY payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid instance buffer {attribute}: expected {expected} values, got {actual}")]
    InvalidInstanceBuffer {
        attribute: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Fetch timed out after {0:?}")]
    FetchTimeout(Duration),

    #[error("Load task failed: {0}")]
    LoadTask(String),

    #[error("Load cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for AssetError {
    fn from(err: reqwest::Error) -> Self {
        AssetError::Fetch(err.to_string())
    }
}

impl From<zip::result::ZipError> for AssetError {
    fn from(err: zip::result::ZipError) -> Self {
        AssetError::ArchiveCorrupt(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AssetError {
    fn from(err: tokio::task::JoinError) -> Self {
        AssetError::LoadTask(err.to_string())
    }
}
