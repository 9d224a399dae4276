//! Error types for the storage subsystem.

use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// An access fell outside the bounds of a region.
    #[error("Out of range: {len} bytes at offset {offset} exceeds region length {limit}")]
    OutOfRange {
        /// Offset of the access within the region.
        offset: u64,
        /// Number of bytes accessed.
        len: u64,
        /// Length of the region.
        limit: u64,
    },

    /// A region does not fit on its device.
    #[error("Invalid region: base {base} length {length} on device of {device_len} bytes")]
    InvalidRegion {
        /// Base offset of the region.
        base: u64,
        /// Length of the region.
        length: u64,
        /// Length of the underlying device.
        device_len: u64,
    },

    /// The configured sector size is unusable.
    #[error("Invalid sector size: {0} is not a power of two")]
    InvalidSectorSize(u32),

    /// An address is not aligned to the block it claims to start.
    #[error("Not aligned: offset {offset} is not aligned to {alignment}")]
    NotAligned {
        /// The offset that is not aligned.
        offset: u64,
        /// The required alignment.
        alignment: u64,
    },

    /// Block allocator internal error.
    #[error("Allocator error: {0}")]
    AllocatorError(String),
}
