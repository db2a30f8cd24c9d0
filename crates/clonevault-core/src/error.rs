//! Error types shared by every vault engine

use thiserror::Error;

/// The main error type for block-cloning vault operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error reported by the host file service
    #[error("Pipeline I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid vault format or corrupted data
    #[error("Invalid vault format: {0}")]
    InvalidVault(String),

    /// Checksum verification failed
    #[error("Checksum verification failed: {0}")]
    ChecksumVerification(String),

    /// Unsupported format version or feature
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A size, block size or sector size outside what the format allows
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Data does not sit on the cluster boundaries block cloning requires
    #[error("Alignment requirement not met: {0}")]
    Misaligned(String),

    /// An address or index no longer fits the format's field width
    #[error("Arithmetic overflow: {0}")]
    Overflow(String),

    /// The volume cannot share extents between files
    #[error("Block cloning unsupported: {0}")]
    CloneUnsupported(String),

    /// The source extent already carries the maximum number of references
    #[error("Too many references to shared extent: {0}")]
    CloneContention(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type alias for vault operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid vault error
    pub fn invalid_vault(msg: impl Into<String>) -> Self {
        Error::InvalidVault(msg.into())
    }

    /// Create a checksum verification error
    pub fn checksum(msg: impl Into<String>) -> Self {
        Error::ChecksumVerification(msg.into())
    }

    /// Create an unsupported error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }

    /// Create a misalignment error
    pub fn misaligned(msg: impl Into<String>) -> Self {
        Error::Misaligned(msg.into())
    }

    /// Create an overflow error
    pub fn overflow(msg: impl Into<String>) -> Self {
        Error::Overflow(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// True for the one failure a caller may recover from locally
    pub fn is_clone_contention(&self) -> bool {
        matches!(self, Error::CloneContention(_))
    }
}
