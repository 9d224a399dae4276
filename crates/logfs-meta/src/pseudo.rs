//! Control pseudo-files.
//!
//! The `ctl` access point holds two files whose contents are computed rather
//! than stored: `ctl`, a write-only command channel, and `users`, a text view
//! of the user directory. They never reach the log.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MetaError, MetaResult};
use crate::users::{tokenize, UserTable};

/// Longest accepted control request.
pub const MAX_CTL_REQUEST: usize = 511;

/// Flags and requests set through the control file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlState {
    /// Skip permission checks.
    pub nopermcheck: bool,
    /// Allow privileged wstat changes.
    pub wstatallow: bool,
    /// The server should stop.
    pub halted: bool,
    /// A flush was requested and not yet performed.
    pub sync_requested: bool,
    /// A sweep was requested and not yet performed.
    pub sweep_requested: bool,
}

/// A file whose reads and writes are served by code.
pub trait PseudoFile: Send + Sync + fmt::Debug {
    /// Read up to `count` bytes at `offset`.
    fn read(&self, users: &UserTable, offset: u64, count: usize) -> MetaResult<Vec<u8>>;

    /// Consume a write, returning the number of bytes accepted.
    fn write(
        &self,
        control: &mut ControlState,
        users: &mut UserTable,
        data: &[u8],
    ) -> MetaResult<usize>;
}

/// The command channel.
#[derive(Debug, Default)]
pub struct CtlFile;

impl PseudoFile for CtlFile {
    fn read(&self, _users: &UserTable, _offset: u64, _count: usize) -> MetaResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn write(
        &self,
        control: &mut ControlState,
        users: &mut UserTable,
        data: &[u8],
    ) -> MetaResult<usize> {
        if data.len() > MAX_CTL_REQUEST {
            return Err(MetaError::TooLong);
        }
        let text = std::str::from_utf8(data).map_err(|_| MetaError::BadControl)?;
        let fields = tokenize(text);
        let f: Vec<&str> = fields.iter().map(String::as_str).collect();
        match f.as_slice() {
            ["halt", ..] => control.halted = true,
            ["sync", ..] => control.sync_requested = true,
            ["sweep", ..] => control.sweep_requested = true,
            ["allow", ..] => control.wstatallow = true,
            ["disallow", ..] => control.wstatallow = false,
            ["permit", ..] => control.nopermcheck = false,
            ["nopermit", ..] => control.nopermcheck = true,
            ["uname", args @ ..] => users.uname(args)?,
            _ => return Err(MetaError::BadControl),
        }
        info!(request = %text.trim_end(), "control request");
        Ok(data.len())
    }
}

/// The user directory in text form.
#[derive(Debug, Default)]
pub struct UsersFile;

impl PseudoFile for UsersFile {
    fn read(&self, users: &UserTable, offset: u64, count: usize) -> MetaResult<Vec<u8>> {
        let text = users.render().into_bytes();
        let start = (offset.min(text.len() as u64)) as usize;
        let end = start.saturating_add(count).min(text.len());
        Ok(text[start..end].to_vec())
    }

    fn write(
        &self,
        _control: &mut ControlState,
        users: &mut UserTable,
        data: &[u8],
    ) -> MetaResult<usize> {
        let text = std::str::from_utf8(data)
            .map_err(|_| MetaError::BadUsers("not utf-8".to_string()))?;
        users.apply_text(text)?;
        Ok(data.len())
    }
}
