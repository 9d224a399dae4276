#![warn(missing_docs)]

//! LogFS metadata subsystem: entry tree, file operations, replay and compaction
//!
//! A [`Filesystem`] keeps the whole namespace in memory as a [`Tree`] and
//! records every change in the write-ahead log. Startup rebuilds the tree by
//! replaying the log through a [`Replayer`]; the log stays bounded because
//! each sweep asks a [`Compactor`] which entries the live tree still needs.

pub mod access;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod excl;
pub mod fs;
pub mod pseudo;
pub mod replay;
pub mod strings;
pub mod tree;
pub mod types;
pub mod users;

pub use access::{AccessMode, Requester, NONE_USER};
pub use cli::{Cli, Command};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FsConfig;
pub use error::{MetaError, MetaResult};
pub use excl::{ExclLock, ExclOutcome, DEFAULT_LEASE_SECS};
pub use fs::{check_filename, Filesystem, FsOptions, FsStats, DEFAULT_IOUNIT};
pub use pseudo::{ControlState, CtlFile, PseudoFile, UsersFile};
pub use replay::{Compactor, Replayer};
pub use strings::StringTable;
pub use tree::{Entry, EntryKind, EntryShape, FileData, Tree, ROOT_PATH};
pub use types::{FidId, PathId, Qid, Stat, WstatRequest};
pub use users::{User, UserDirectory, UserTable};
