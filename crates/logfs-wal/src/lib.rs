#![warn(missing_docs)]

//! LogFS write-ahead log: entry codec, block format, segmented log and compaction
//!
//! Every namespace mutation is recorded as a [`LogEntry`] appended to the
//! active segment of a [`LogFile`]. When free blocks run low the log is swept:
//! each entry is offered to a [`SweepPolicy`] that decides, against the live
//! namespace, whether to drop it, copy it, or replace it with a rewritten one.

pub mod block;
pub mod entry;
pub mod error;
pub mod log;

pub use block::{BlockHeader, HEADER_LEN};
pub use entry::{LogEntry, LogOp, MAX_STRING, NEW_EXTENT, UNCHANGED};
pub use error::{DecodeError, WalError, WalResult};
pub use log::{CopyDecision, KeepAll, LogConfig, LogFile, LogStats, SegmentKind, SweepPolicy};
