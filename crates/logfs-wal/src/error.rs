//! Error types for the write-ahead log.

use logfs_storage::StorageError;
use thiserror::Error;

/// Result type alias for log operations.
pub type WalResult<T> = Result<T, WalError>;

/// Error variants for log operations. Everything except [`WalError::LogFull`]
/// means the log can no longer be trusted.
#[derive(Debug, Error)]
pub enum WalError {
    /// The log region could not be read or written.
    #[error("log I/O: {0}")]
    Storage(#[from] StorageError),

    /// An entry inside a sealed block failed to decode.
    #[error("log entry: {0}")]
    Decode(#[from] DecodeError),

    /// Structural damage found while scanning or reading blocks.
    #[error("log corrupt: {0}")]
    Corrupt(String),

    /// Too few free blocks remain even after compaction.
    #[error("file system log full")]
    LogFull,

    /// The free pool ran dry while appending or compacting.
    #[error("file system log irrevocably full")]
    IrrevocablyFull,

    /// An encoded entry is larger than a block's payload area.
    #[error("log entry of {0} bytes can never fit in a block")]
    EntryTooLarge(usize),

    /// A string field exceeds the codec's length limit.
    #[error("string of {0} bytes is too long for a log entry")]
    StringTooLong(usize),

    /// Block size or region length is unusable.
    #[error("invalid log configuration: {0}")]
    InvalidConfig(String),

    /// The sweep policy rejected an entry.
    #[error("compaction: {0}")]
    Sweep(String),
}

/// Reasons an encoded entry could not be decoded. Decoding never returns a
/// partially filled entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer ends before the entry does.
    #[error("truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// The opcode byte names no known operation.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// A string field is empty, unterminated or not UTF-8.
    #[error("malformed string at offset {0}")]
    BadString(usize),

    /// The length prefix disagrees with the decoded fields.
    #[error("length prefix {declared} but fields end at {consumed}")]
    LengthMismatch {
        /// Length recorded in the prefix.
        declared: usize,
        /// Bytes consumed by the fields.
        consumed: usize,
    },
}
