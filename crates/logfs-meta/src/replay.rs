//! Rebuilding the tree from the log, and deciding what compaction keeps.
//!
//! Replay applies the swept segment and then the active segment to a fresh
//! tree. A high-water sequence number makes every entry at or below it a
//! no-op, so entries present in both segments after an interrupted sweep are
//! applied once.
//!
//! Compaction asks, for every logged entry, whether the live tree still
//! needs it. A Create is rewritten with the entry's current attributes, which
//! is what lets Trunc and Wstat entries be dropped.

use logfs_storage::BuddyAllocator;
use logfs_wal::{CopyDecision, LogEntry, LogOp, SweepPolicy, WalError, WalResult, UNCHANGED};
use tracing::{debug, warn};

use crate::error::{MetaError, MetaResult};
use crate::tree::{is_reserved, IdField, NewEntry, Tree};
use crate::types::{qid_type, DMDIR};

/// Applies logged entries to a tree.
#[derive(Debug, Default)]
pub struct Replayer {
    high: Option<u64>,
    lenient: bool,
    applied: u64,
    skipped: u64,
}

impl Replayer {
    /// A replayer. When `lenient`, entries that an unfinished sweep made
    /// stale are skipped with a warning instead of failing.
    pub fn new(lenient: bool) -> Self {
        Self {
            lenient,
            ..Self::default()
        }
    }

    /// Highest sequence number applied or skipped so far.
    pub fn high_water(&self) -> Option<u64> {
        self.high
    }

    /// Entries applied.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Entries skipped as duplicates or stale.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Apply one entry.
    pub fn apply(
        &mut self,
        tree: &mut Tree,
        alloc: &mut BuddyAllocator,
        entry: &LogEntry,
    ) -> MetaResult<()> {
        if self.high.is_some_and(|h| entry.seq <= h) {
            debug!(seq = entry.seq, op = entry.op.name(), "skipping replayed entry");
            self.skipped += 1;
            return Ok(());
        }
        self.high = Some(entry.seq);
        if is_reserved(entry.path) {
            return Err(MetaError::Corrupt(format!(
                "seq {}: reserved path {:#x} in log",
                entry.seq, entry.path
            )));
        }
        debug!(seq = entry.seq, op = entry.op.name(), path = entry.path, "replaying");
        match &entry.op {
            LogOp::Create {
                new_path,
                perm,
                mtime,
                cvers,
                name,
                uid,
                gid,
            } => {
                if is_reserved(*new_path) {
                    return Err(MetaError::Corrupt(format!(
                        "seq {}: reserved path {:#x} created",
                        entry.seq, new_path
                    )));
                }
                if tree.lookup(entry.path).is_none() {
                    return self.stale(entry, "parent missing");
                }
                tree.create(
                    entry.path,
                    &NewEntry {
                        path: *new_path,
                        name,
                        mode: *perm,
                        uid,
                        gid,
                        mtime: *mtime,
                        cvers: *cvers,
                    },
                )
                .map_err(|e| match e {
                    MetaError::NotDirectory => MetaError::Corrupt(format!(
                        "seq {}: create under non-directory {:#x}",
                        entry.seq, entry.path
                    )),
                    other => other,
                })?;
                tree.observe_path(entry.path);
            }
            LogOp::Trunc { mtime, cvers, muid } => {
                if tree.lookup(entry.path).is_none() {
                    return self.stale(entry, "path missing");
                }
                if tree.entry(entry.path)?.file().is_none() {
                    return Err(not_a_file(entry));
                }
                tree.truncate(entry.path, alloc)?;
                let e = tree.entry_mut(entry.path)?;
                e.mtime = *mtime;
                if let Some(file) = e.file_mut() {
                    file.cvers = *cvers;
                }
                tree.set_id(entry.path, IdField::Muid, muid)?;
            }
            LogOp::Remove { mtime, muid } => {
                if tree.lookup(entry.path).is_none() {
                    return self.stale(entry, "path missing");
                }
                if !tree.entry(entry.path)?.children().is_empty() {
                    return Err(MetaError::Corrupt(format!(
                        "seq {}: remove of non-empty directory {:#x}",
                        entry.seq, entry.path
                    )));
                }
                tree.remove(entry.path, alloc, *mtime, muid)?;
            }
            LogOp::Write {
                mtime,
                offset,
                count,
                vers,
                cvers,
                extent,
                index,
                new_extent,
                muid,
                ..
            } => {
                let Some(target) = tree.lookup_mut(entry.path) else {
                    return self.stale(entry, "path missing");
                };
                let Some(file) = target.file_mut() else {
                    return Err(not_a_file(entry));
                };
                if file.cvers != *cvers {
                    let why = format!("content version {} is now {}", cvers, file.cvers);
                    return self.stale(entry, &why);
                }
                let index = *index as usize;
                let nd = file.extents.len();
                if *new_extent {
                    if index != nd {
                        return Err(MetaError::Corrupt(format!(
                            "seq {}: new extent at index {} of {}",
                            entry.seq, index, nd
                        )));
                    }
                    match alloc.allocate_at(extent.base, extent.length as u64) {
                        Some(got) if got == *extent => file.extents.push(got),
                        got => {
                            if let Some(got) = got {
                                alloc.free(got)?;
                            }
                            return Err(MetaError::Corrupt(format!(
                                "seq {}: cannot reallocate extent {:?}",
                                entry.seq, extent
                            )));
                        }
                    }
                } else if file.extents.get(index) != Some(extent) {
                    return Err(MetaError::Corrupt(format!(
                        "seq {}: extent {} does not match {:?}",
                        entry.seq, index, extent
                    )));
                }
                let end = offset.saturating_add(*count);
                if end > file.length {
                    file.length = end;
                }
                target.qid.vers = *vers;
                target.mtime = *mtime;
                tree.set_id(entry.path, IdField::Muid, muid)?;
            }
            LogOp::Wstat {
                perm,
                mtime,
                atime,
                name,
                uid,
                gid,
                muid,
            } => {
                let Some(target) = tree.lookup_mut(entry.path) else {
                    return self.stale(entry, "path missing");
                };
                if *perm != UNCHANGED {
                    if (*perm ^ target.mode) & DMDIR != 0 {
                        return Err(MetaError::Corrupt(format!(
                            "seq {}: wstat changes directory bit of {:#x}",
                            entry.seq, entry.path
                        )));
                    }
                    target.mode = *perm;
                    target.qid.qtype = qid_type(*perm);
                }
                if *mtime != UNCHANGED {
                    target.mtime = *mtime;
                }
                if *atime != UNCHANGED {
                    target.atime = *atime;
                }
                if !name.is_empty() {
                    target.name = name.clone();
                }
                target.qid.vers = target.qid.vers.wrapping_add(1);
                if !uid.is_empty() {
                    tree.set_id(entry.path, IdField::Uid, uid)?;
                }
                if !gid.is_empty() {
                    tree.set_id(entry.path, IdField::Gid, gid)?;
                }
                tree.set_id(entry.path, IdField::Muid, muid)?;
            }
            LogOp::Sync => {}
        }
        tree.observe_path(entry.path);
        self.applied += 1;
        Ok(())
    }

    fn stale(&mut self, entry: &LogEntry, why: &str) -> MetaResult<()> {
        if self.lenient {
            warn!(seq = entry.seq, op = entry.op.name(), path = entry.path, why, "skipping stale entry");
            self.skipped += 1;
            Ok(())
        } else {
            Err(MetaError::Corrupt(format!(
                "seq {}: {} on {:#x}: {}",
                entry.seq,
                entry.op.name(),
                entry.path,
                why
            )))
        }
    }
}

fn not_a_file(entry: &LogEntry) -> MetaError {
    MetaError::Corrupt(format!(
        "seq {}: {} on non-file {:#x}",
        entry.seq,
        entry.op.name(),
        entry.path
    ))
}

/// Compaction policy driven by the live tree.
pub struct Compactor<'a> {
    tree: &'a Tree,
}

impl<'a> Compactor<'a> {
    /// A policy judging entries against `tree`.
    pub fn new(tree: &'a Tree) -> Self {
        Self { tree }
    }
}

impl SweepPolicy for Compactor<'_> {
    fn decide(&mut self, entry: &LogEntry) -> WalResult<CopyDecision> {
        match &entry.op {
            LogOp::Create { new_path, perm, .. } => {
                let Some(node) = self.tree.lookup(*new_path) else {
                    return Ok(CopyDecision::Discard);
                };
                if node.parent != Some(entry.path) || self.tree.lookup(entry.path).is_none() {
                    return Err(WalError::Sweep(format!(
                        "seq {}: parent of {:#x} is not {:#x}",
                        entry.seq, new_path, entry.path
                    )));
                }
                if (perm & DMDIR != 0) != node.is_dir() {
                    return Err(WalError::Sweep(format!(
                        "seq {}: type of {:#x} changed",
                        entry.seq, new_path
                    )));
                }
                let current = LogOp::Create {
                    new_path: *new_path,
                    perm: node.mode,
                    mtime: node.mtime,
                    cvers: node.file().map_or(0, |f| f.cvers),
                    name: node.name.clone(),
                    uid: node.uid.to_string(),
                    gid: node.gid.to_string(),
                };
                if current == entry.op {
                    Ok(CopyDecision::Keep)
                } else {
                    Ok(CopyDecision::Repack(LogEntry::new(
                        entry.seq, entry.path, current,
                    )))
                }
            }
            LogOp::Remove { .. } => {
                if self.tree.lookup(entry.path).is_some() {
                    return Err(WalError::Sweep(format!(
                        "seq {}: removed path {:#x} still present",
                        entry.seq, entry.path
                    )));
                }
                Ok(CopyDecision::Discard)
            }
            LogOp::Write {
                mtime,
                vers,
                cvers,
                extent,
                index,
                muid,
                ..
            } => {
                let Some(node) = self.tree.lookup(entry.path) else {
                    return Ok(CopyDecision::Discard);
                };
                let Some(file) = node.file() else {
                    return Err(WalError::Sweep(format!(
                        "seq {}: write to non-file {:#x}",
                        entry.seq, entry.path
                    )));
                };
                if file.cvers != *cvers {
                    return Ok(CopyDecision::Discard);
                }
                match file.extents.get(*index as usize) {
                    None => Err(WalError::Sweep(format!(
                        "seq {}: extent index {} past {} extents of {:#x}",
                        entry.seq,
                        index,
                        file.extents.len(),
                        entry.path
                    ))),
                    Some(current) if current != extent => Ok(CopyDecision::Discard),
                    Some(_) => {
                        if *mtime == node.mtime && *vers == node.qid.vers && **muid == *node.muid {
                            return Ok(CopyDecision::Keep);
                        }
                        // the replayed file ends with the attributes it has now
                        let mut op = entry.op.clone();
                        if let LogOp::Write {
                            mtime, vers, muid, ..
                        } = &mut op
                        {
                            *mtime = node.mtime;
                            *vers = node.qid.vers;
                            *muid = node.muid.to_string();
                        }
                        Ok(CopyDecision::Repack(LogEntry::new(entry.seq, entry.path, op)))
                    }
                }
            }
            LogOp::Trunc { .. } | LogOp::Wstat { .. } | LogOp::Sync => Ok(CopyDecision::Discard),
        }
    }
}
