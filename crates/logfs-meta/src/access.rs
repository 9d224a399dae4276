//! Permission checking.
//!
//! Owner bits apply when the requester owns the entry, group bits when the
//! requester belongs to or leads the entry's group, world bits otherwise. A check
//! passes if any class grants every requested bit. The user `none` only ever
//! gets world bits.

use crate::error::{MetaError, MetaResult};
use crate::tree::Entry;
use crate::users::UserDirectory;

/// The identity that never matches owner or group.
pub const NONE_USER: &str = "none";

/// Requested permission bits, in world-class position.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AccessMode(pub u32);

impl AccessMode {
    /// Read permission.
    pub const READ: AccessMode = AccessMode(4);
    /// Write permission.
    pub const WRITE: AccessMode = AccessMode(2);
    /// Execute (search) permission.
    pub const EXEC: AccessMode = AccessMode(1);

    /// Both sets of bits.
    pub fn with(self, other: AccessMode) -> AccessMode {
        AccessMode(self.0 | other.0)
    }

    /// Returns true if write is requested.
    pub fn has_write(&self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    /// Permission needed for a 9P open mode.
    pub fn for_open(omode: u8) -> AccessMode {
        let base = match omode & 3 {
            crate::types::OWRITE => Self::WRITE,
            crate::types::ORDWR => Self::READ.with(Self::WRITE),
            crate::types::OEXEC => Self::READ.with(Self::EXEC),
            _ => Self::READ,
        };
        if omode & crate::types::OTRUNC != 0 {
            base.with(Self::WRITE)
        } else {
            base
        }
    }
}

/// A requester together with what is needed to judge its access.
pub struct Requester<'a> {
    /// Requester id.
    pub uid: &'a str,
    /// Group membership source.
    pub users: &'a dyn UserDirectory,
    /// When set, every check passes.
    pub nopermcheck: bool,
}

impl<'a> Requester<'a> {
    /// Check `want` against explicit mode bits and ownership.
    pub fn can(&self, mode: u32, owner: &str, group: &str, want: AccessMode) -> bool {
        let want = want.0;
        if self.uid != NONE_USER {
            if owner == self.uid && (mode >> 6) & want == want {
                return true;
            }
            if (mode >> 3) & want == want
                && (self.users.is_member(self.uid, group) || self.users.leads_group(self.uid, group))
            {
                return true;
            }
        }
        mode & want == want || self.nopermcheck
    }

    /// Check `want` against an entry.
    pub fn can_access(&self, entry: &Entry, want: AccessMode) -> bool {
        self.can(entry.mode, &entry.uid, &entry.gid, want)
    }

    /// Like [`Requester::can_access`], failing with permission denied.
    pub fn check(&self, entry: &Entry, want: AccessMode) -> MetaResult<()> {
        if self.can_access(entry, want) {
            Ok(())
        } else {
            Err(MetaError::PermissionDenied)
        }
    }

    /// Returns true if the requester owns the entry.
    pub fn owns(&self, entry: &Entry) -> bool {
        *entry.uid == *self.uid
    }

    /// Returns true if the requester leads the entry's group `gid` or the
    /// group `other` it is being moved to.
    pub fn leads_either(&self, gid: &str, other: Option<&str>) -> bool {
        self.users.leads_group(self.uid, gid)
            || other.is_some_and(|g| self.users.leads_group(self.uid, g))
    }
}
