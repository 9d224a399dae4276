//! Error types for the entry tree and its operations.

use logfs_storage::StorageError;
use logfs_wal::WalError;
use thiserror::Error;

/// Result alias used throughout the metadata layer.
pub type MetaResult<T> = Result<T, MetaError>;

/// Errors returned by filesystem operations.
///
/// Variants fall into three classes: user errors and resource exhaustion,
/// which leave the filesystem unchanged, and fatal errors, after which the
/// process must stop and recover by replay. See [`MetaError::is_fatal`].
#[derive(Debug, Error)]
pub enum MetaError {
    /// The caller lacks the required permission.
    #[error("permission denied")]
    PermissionDenied,

    /// No entry with the given name.
    #[error("file does not exist")]
    NotFound,

    /// An entry with the given name already exists.
    #[error("file exists")]
    Exists,

    /// A file name failed validation.
    #[error("invalid file name: {0}")]
    InvalidName(String),

    /// Create in something that is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Walk from something that is not a directory.
    #[error("walk -- in a non-directory")]
    WalkNonDirectory,

    /// Remove of a directory that still has entries.
    #[error("directory not empty")]
    DirectoryNotEmpty,

    /// The fid is not bound.
    #[error("invalid fid {0}")]
    UnknownFid(u32),

    /// The fid is already bound.
    #[error("fid {0} already in use")]
    FidInUse(u32),

    /// Walk, open or create on a fid that is already open.
    #[error("fid already open")]
    FidOpen,

    /// Read or write on a fid that is not open.
    #[error("read/write -- on non open fid")]
    NotOpen,

    /// Read or write on a fid not open in a suitable mode.
    #[error("read/write -- not open in suitable mode")]
    AccessMode,

    /// Another handle holds the exclusive lock.
    #[error("exclusive lock")]
    Locked,

    /// This handle's exclusive lock expired.
    #[error("exclusive lock broken")]
    LockBroken,

    /// A wstat request was malformed or tried to change a fixed attribute.
    #[error("wstat -- {0}")]
    BadWstat(&'static str),

    /// Attach to an unknown access point.
    #[error("unknown attach name {0:?}")]
    BadAttach(String),

    /// A name did not resolve in the user directory.
    #[error("unknown user {0:?}")]
    UnknownUser(String),

    /// A user directory update was rejected.
    #[error("users: {0}")]
    BadUsers(String),

    /// A control request was not understood.
    #[error("bad control request")]
    BadControl,

    /// A control request exceeded its size limit.
    #[error("control request too long")]
    TooLong,

    /// The entry was removed through another handle.
    #[error("file has been removed")]
    Removed,

    /// The file would need more extents than allowed, or a larger offset.
    #[error("file has too many extents")]
    FileTooLarge,

    /// The data region has no block large enough.
    #[error("file system full")]
    DiskFull,

    /// The log has no room even after a sweep.
    #[error("file system log full")]
    LogFull,

    /// The log failed.
    #[error("log: {0}")]
    Wal(WalError),

    /// The data region failed.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// Tree state or log contents are inconsistent.
    #[error("corrupt: {0}")]
    Corrupt(String),
}

impl MetaError {
    /// Returns true if the process must stop and recover by replay.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MetaError::Wal(_) | MetaError::Storage(_) | MetaError::Corrupt(_)
        )
    }
}

impl From<WalError> for MetaError {
    fn from(e: WalError) -> Self {
        match e {
            WalError::LogFull => MetaError::LogFull,
            other => MetaError::Wal(other),
        }
    }
}
