//! Error types for image conversion

use thiserror::Error;

/// Result type for conversion operations
pub type Result<T> = std::result::Result<T, ConvertError>;

/// Errors that can occur while converting an image
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Destination path is already taken
    #[error("Destination already exists: {0}")]
    DestinationExists(String),

    /// No destination was given and none can be derived from the source name
    #[error("Cannot derive a destination name from {0}; give one explicitly")]
    NoDefaultDestination(String),

    /// Neither block size is a multiple of the other
    #[error("Block sizes {src_block_size} and {dst_block_size} cannot be mapped onto each other")]
    IncompatibleBlockSizes {
        src_block_size: u32,
        dst_block_size: u32,
    },

    /// A clone extent would not sit on cluster boundaries
    #[error("Extent of {len} bytes from {src_offset:#x} to {dst_offset:#x} is not aligned to {alignment} bytes")]
    UnalignedExtent {
        src_offset: u64,
        dst_offset: u64,
        len: u64,
        alignment: u32,
    },

    /// I/O error outside the image engines
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failure reported by an image engine or the host file service
    #[error(transparent)]
    Image(#[from] clonevault_core::Error),
}
