//! Error types for ngs-bam

use crate::io::bam::error::BamDecodeError;
use thiserror::Error;

/// Result type alias for ngs-bam operations
pub type Result<T> = std::result::Result<T, NgsBamError>;

/// Error types that can occur in ngs-bam
#[derive(Debug, Error)]
pub enum NgsBamError {
    /// I/O error from the underlying file, propagated unchanged
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structurally invalid file contents (bad magic, negative counts, ...)
    #[error("Invalid format: {0}")]
    Format(String),

    /// Input ended in the middle of a block, header or record
    #[error("Truncated input: {0}")]
    Truncated(String),

    /// The stream does not start with a BGZF block
    #[error("Not a BGZF stream: {0}")]
    NotBgzf(String),

    /// A single alignment record could not be decoded
    #[error("Record decode error: {0}")]
    Decode(#[from] BamDecodeError),

    /// Operation not available for this file or request
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Invalid range, position or region
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// A reference name could not be resolved against the header
    #[error("Unknown reference: {0}")]
    UnknownReference(String),
}

impl NgsBamError {
    /// True for caller-side precondition failures (not data corruption).
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

impl From<NgsBamError> for std::io::Error {
    fn from(e: NgsBamError) -> Self {
        match e {
            NgsBamError::Io(io_err) => io_err,
            truncated @ NgsBamError::Truncated(_) => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, truncated)
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
