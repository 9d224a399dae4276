//! The filesystem: client handles and the operations on them.
//!
//! Every mutating operation follows the same order. It validates fully, makes
//! sure the log has room, changes the tree, then appends its log entries and
//! flushes them. A failure before the tree changes leaves everything as it
//! was. A failure after is fatal (see [`MetaError::is_fatal`]), since the
//! change cannot be rolled back and the log no longer describes the tree.

use std::collections::HashMap;
use std::sync::Arc;

use logfs_storage::{AllocatorConfig, AllocatorStats, BuddyAllocator, Extent, Region};
use logfs_wal::{
    LogConfig, LogEntry, LogFile, LogOp, LogStats, SegmentKind, MAX_STRING, UNCHANGED,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::access::{AccessMode, Requester, NONE_USER};
use crate::clock::Clock;
use crate::error::{MetaError, MetaResult};
use crate::excl::{self, ExclOutcome, DEFAULT_LEASE_SECS};
use crate::pseudo::ControlState;
use crate::replay::{Compactor, Replayer};
use crate::tree::{
    is_reserved, Entry, EntryKind, IdField, NewEntry, Tree, ALT_ROOT_PATH, ROOT_PATH,
};
use crate::types::{
    FidId, PathId, Qid, Stat, WstatRequest, DMAPPEND, DMDIR, DMEXCL, DM_VALID, ORCLOSE, ORDWR,
    OTRUNC, OWRITE,
};
use crate::users::{UserDirectory, UserTable};

/// Largest read or write a client should issue.
pub const DEFAULT_IOUNIT: u32 = 8192 - 24;

/// Settings fixed when the filesystem is formatted or opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsOptions {
    /// Allocation unit of the data region.
    pub sector_size: u32,
    /// Log layout.
    pub log: LogConfig,
    /// Owner of the root directory.
    pub owner: String,
    /// Exclusive lock lease in seconds.
    pub lease_secs: u32,
    /// Flush the log after every mutating operation.
    pub commit_flush: bool,
    /// Reported to clients as the largest useful transfer.
    pub iounit: u32,
    /// Initial control flags.
    pub control: ControlState,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            sector_size: 512,
            log: LogConfig::default(),
            owner: "adm".to_string(),
            lease_secs: DEFAULT_LEASE_SECS,
            commit_flush: true,
            iounit: DEFAULT_IOUNIT,
            control: ControlState::default(),
        }
    }
}

/// Filesystem statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsStats {
    /// Entries in the path table, the root included.
    pub entries: usize,
    /// Bound fids.
    pub fids: usize,
    /// Distinct interned strings.
    pub strings: usize,
    /// Sequence number of the last logged entry.
    pub last_seq: u64,
    /// Most recently issued path id.
    pub last_path: PathId,
    /// Entries applied at startup.
    pub replayed: u64,
    /// Entries skipped at startup.
    pub replay_skipped: u64,
    /// Data region allocator.
    pub allocator: AllocatorStats,
    /// Log.
    pub log: LogStats,
}

#[derive(Debug)]
struct Fid {
    path: PathId,
    open: Option<u8>,
    uid: Arc<str>,
}

/// A mounted filesystem.
pub struct Filesystem {
    tree: Tree,
    users: UserTable,
    control: ControlState,
    alloc: BuddyAllocator,
    data: Region,
    log: LogFile,
    fids: HashMap<FidId, Fid>,
    cmdseq: u64,
    data_dirty: bool,
    replayed: u64,
    replay_skipped: u64,
    clock: Box<dyn Clock>,
    options: FsOptions,
}

/// Reject names that cannot be stored or walked to.
pub fn check_filename(name: &str) -> MetaResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(MetaError::InvalidName(name.to_string()));
    }
    if name.len() > MAX_STRING {
        let head: String = name.chars().take(16).collect();
        return Err(MetaError::InvalidName(format!("{}...", head)));
    }
    if name.chars().any(|c| c == '/' || c < ' ' || c == '\u{7f}') {
        return Err(MetaError::InvalidName(name.escape_default().to_string()));
    }
    Ok(())
}

impl Filesystem {
    /// Create an empty filesystem over the two regions.
    pub fn format(
        data: Region,
        log: Region,
        options: FsOptions,
        users: UserTable,
        clock: Box<dyn Clock>,
    ) -> MetaResult<Self> {
        let log = LogFile::format(log, options.log.clone())?;
        let alloc = Self::allocator(&data, &options)?;
        let tree = Tree::new(&options.owner, clock.now());
        info!(
            data_bytes = data.length(),
            log_blocks = log.stats().total_blocks,
            owner = %options.owner,
            "formatted filesystem"
        );
        Ok(Self::assemble(tree, alloc, data, log, users, clock, options))
    }

    /// Recover a filesystem from its log. An interrupted sweep is finished
    /// before this returns.
    pub fn recover(
        data: Region,
        log: Region,
        options: FsOptions,
        users: UserTable,
        clock: Box<dyn Clock>,
    ) -> MetaResult<Self> {
        let mut log = LogFile::open(log, options.log.clone())?;
        let mut alloc = Self::allocator(&data, &options)?;
        let mut tree = Tree::new(&options.owner, clock.now());
        let resuming = log.segment_blocks(SegmentKind::Swept) > 0;
        let mut replayer = Replayer::new(resuming);
        for kind in [SegmentKind::Swept, SegmentKind::Active] {
            log.replay(kind, |e: &LogEntry| replayer.apply(&mut tree, &mut alloc, e))?;
        }
        log.complete(&mut Compactor::new(&tree))?;
        let mut fs = Self::assemble(tree, alloc, data, log, users, clock, options);
        fs.cmdseq = replayer.high_water().unwrap_or(0);
        fs.replayed = replayer.applied();
        fs.replay_skipped = replayer.skipped();
        info!(
            entries = fs.tree.len(),
            applied = fs.replayed,
            skipped = fs.replay_skipped,
            last_seq = fs.cmdseq,
            resumed_sweep = resuming,
            "recovered filesystem"
        );
        Ok(fs)
    }

    fn allocator(data: &Region, options: &FsOptions) -> MetaResult<BuddyAllocator> {
        Ok(BuddyAllocator::new(AllocatorConfig {
            sector_size: options.sector_size,
            length: data.length(),
        })?)
    }

    fn assemble(
        tree: Tree,
        alloc: BuddyAllocator,
        data: Region,
        log: LogFile,
        users: UserTable,
        clock: Box<dyn Clock>,
        options: FsOptions,
    ) -> Self {
        Self {
            tree,
            users,
            control: options.control.clone(),
            alloc,
            data,
            log,
            fids: HashMap::new(),
            cmdseq: 0,
            data_dirty: false,
            replayed: 0,
            replay_skipped: 0,
            clock,
            options,
        }
    }

    fn fid(&self, fid: FidId) -> MetaResult<&Fid> {
        self.fids.get(&fid).ok_or(MetaError::UnknownFid(fid))
    }

    fn requester<'a>(&'a self, uid: &'a str) -> Requester<'a> {
        Requester {
            uid,
            users: &self.users,
            nopermcheck: self.control.nopermcheck,
        }
    }

    fn name_of(&self, id: &str) -> String {
        self.users.lookup_by_id(id).unwrap_or(id).to_string()
    }

    fn stat_of(&self, entry: &Entry) -> Stat {
        Stat {
            qid: entry.qid(),
            mode: entry.mode,
            atime: entry.atime,
            mtime: entry.mtime,
            length: entry.length(),
            name: entry.name.clone(),
            uid: self.name_of(&entry.uid),
            gid: self.name_of(&entry.gid),
            muid: self.name_of(&entry.muid),
        }
    }

    /// Make sure the log can take this operation's entries.
    fn reserve(&mut self) -> MetaResult<()> {
        self.log.ensure_space(&mut Compactor::new(&self.tree))?;
        Ok(())
    }

    /// Append one entry. The tree already reflects it, so failure is fatal.
    fn record(&mut self, path: PathId, op: LogOp) -> MetaResult<()> {
        self.cmdseq += 1;
        let entry = LogEntry::new(self.cmdseq, path, op);
        self.log
            .append(&entry, &mut Compactor::new(&self.tree))
            .map_err(MetaError::Wal)
    }

    fn commit(&mut self) -> MetaResult<()> {
        if self.options.commit_flush {
            self.flush()?;
        }
        Ok(())
    }

    /// Bind `fid` to the root of an access point: `""` for the namespace,
    /// `"ctl"` for the control files.
    pub fn attach(&mut self, fid: FidId, uname: &str, aname: &str) -> MetaResult<Qid> {
        if self.fids.contains_key(&fid) {
            return Err(MetaError::FidInUse(fid));
        }
        let uid = match self.users.lookup_by_name(uname) {
            Some(uid) => uid.to_string(),
            None if uname == NONE_USER || self.control.nopermcheck => uname.to_string(),
            None => return Err(MetaError::UnknownUser(uname.to_string())),
        };
        let path = match aname {
            "" => ROOT_PATH,
            "ctl" => ALT_ROOT_PATH,
            other => return Err(MetaError::BadAttach(other.to_string())),
        };
        let uid = self.tree.intern(&uid);
        self.tree.incref(path);
        self.fids.insert(
            fid,
            Fid {
                path,
                open: None,
                uid,
            },
        );
        debug!(fid, uname, aname, "attached");
        Ok(self.tree.entry(path)?.qid())
    }

    /// Walk `names` from `fid`, binding the result to `newfid` (which may be
    /// `fid` itself). A walk that stops early returns the qids of the steps
    /// that succeeded and binds nothing.
    pub fn walk(&mut self, fid: FidId, newfid: FidId, names: &[&str]) -> MetaResult<Vec<Qid>> {
        let f = self.fid(fid)?;
        if f.open.is_some() {
            return Err(MetaError::FidOpen);
        }
        if newfid != fid && self.fids.contains_key(&newfid) {
            return Err(MetaError::FidInUse(newfid));
        }
        let mut cur = f.path;
        let mut qids = Vec::with_capacity(names.len());
        let req = self.requester(&f.uid);
        for (i, name) in names.iter().enumerate() {
            let dir = self.tree.entry(cur)?;
            let step = if !dir.is_dir() {
                Err(MetaError::WalkNonDirectory)
            } else if !req.can_access(dir, AccessMode::EXEC) {
                Err(MetaError::PermissionDenied)
            } else {
                match *name {
                    "." => Ok(cur),
                    ".." => Ok(dir.parent.unwrap_or(cur)),
                    _ => self.tree.child(cur, name).ok_or(MetaError::NotFound),
                }
            };
            match step {
                Ok(next) => {
                    qids.push(self.tree.entry(next)?.qid());
                    cur = next;
                }
                Err(e) if i == 0 => return Err(e),
                Err(_) => break,
            }
        }
        if qids.len() < names.len() {
            return Ok(qids);
        }
        if newfid == fid {
            let old = f.path;
            self.tree.incref(cur);
            self.tree.decref(old);
            if let Some(f) = self.fids.get_mut(&fid) {
                f.path = cur;
            }
        } else {
            let uid = Arc::clone(&f.uid);
            self.tree.incref(cur);
            self.fids.insert(
                newfid,
                Fid {
                    path: cur,
                    open: None,
                    uid,
                },
            );
        }
        Ok(qids)
    }

    /// Open `fid` for I/O.
    pub fn open(&mut self, fid: FidId, mode: u8) -> MetaResult<(Qid, u32)> {
        let now = self.clock.now();
        let f = self.fid(fid)?;
        if f.open.is_some() {
            return Err(MetaError::FidOpen);
        }
        let path = f.path;
        let uid = Arc::clone(&f.uid);
        let entry = self.tree.entry(path)?;
        if entry.removed {
            return Err(MetaError::Removed);
        }
        let writing = matches!(mode & 3, OWRITE | ORDWR) || mode & OTRUNC != 0;
        if entry.is_dir() && writing {
            return Err(MetaError::PermissionDenied);
        }
        let req = self.requester(&uid);
        req.check(entry, AccessMode::for_open(mode))?;
        if mode & ORCLOSE != 0 {
            let parent = entry.parent.ok_or(MetaError::PermissionDenied)?;
            req.check(self.tree.entry(parent)?, AccessMode::WRITE)?;
        }
        let truncate = mode & OTRUNC != 0
            && entry.mode & DMAPPEND == 0
            && entry
                .file()
                .is_some_and(|f| f.length > 0 || !f.extents.is_empty());
        let exclusive = entry.mode & DMEXCL != 0;

        if truncate {
            self.reserve()?;
        }
        if exclusive {
            let lease = self.options.lease_secs;
            let entry = self.tree.entry_mut(path)?;
            match excl::acquire(&mut entry.excl, fid, now, lease) {
                ExclOutcome::Granted => {}
                ExclOutcome::Held => return Err(MetaError::Locked),
                ExclOutcome::Broken => return Err(MetaError::LockBroken),
            }
        }
        if truncate {
            self.truncate(path, &uid, now)?;
            self.commit()?;
        }
        if let Some(f) = self.fids.get_mut(&fid) {
            f.open = Some(mode);
        }
        debug!(fid, path, mode, truncate, "opened");
        Ok((self.tree.entry(path)?.qid(), self.options.iounit))
    }

    fn truncate(&mut self, path: PathId, uid: &str, now: u32) -> MetaResult<()> {
        self.tree.truncate(path, &mut self.alloc)?;
        let entry = self.tree.entry_mut(path)?;
        entry.mtime = now;
        let cvers = entry.file().map_or(0, |f| f.cvers);
        self.tree.set_id(path, IdField::Muid, uid)?;
        self.record(
            path,
            LogOp::Trunc {
                mtime: now,
                cvers,
                muid: uid.to_string(),
            },
        )
    }

    /// Create `name` in the directory bound to `fid` and open it. The fid is
    /// rebound to the new entry.
    pub fn create(
        &mut self,
        fid: FidId,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> MetaResult<(Qid, u32)> {
        let now = self.clock.now();
        let f = self.fid(fid)?;
        if f.open.is_some() {
            return Err(MetaError::FidOpen);
        }
        let dir_path = f.path;
        let uid = Arc::clone(&f.uid);
        let dir = self.tree.entry(dir_path)?;
        if !dir.is_dir() {
            return Err(MetaError::NotDirectory);
        }
        if dir.removed {
            return Err(MetaError::Removed);
        }
        if is_reserved(dir_path) {
            return Err(MetaError::PermissionDenied);
        }
        check_filename(name)?;
        self.requester(&uid).check(dir, AccessMode::WRITE)?;
        if self.tree.child(dir_path, name).is_some() {
            return Err(MetaError::Exists);
        }
        if perm & !DM_VALID != 0 {
            return Err(MetaError::BadWstat("unknown bits in mode"));
        }
        if perm & DMDIR != 0 && (matches!(mode & 3, OWRITE | ORDWR) || mode & OTRUNC != 0) {
            return Err(MetaError::PermissionDenied);
        }
        let perm = if perm & DMDIR != 0 {
            perm & (!0o777 | (dir.mode & 0o777))
        } else {
            perm & (!0o666 | (dir.mode & 0o666))
        };
        let gid = dir.gid.to_string();

        self.reserve()?;
        let path = self.tree.next_path();
        self.tree.create(
            dir_path,
            &NewEntry {
                path,
                name,
                mode: perm,
                uid: &uid,
                gid: &gid,
                mtime: now,
                cvers: 0,
            },
        )?;
        if perm & DMEXCL != 0 {
            let lease = self.options.lease_secs;
            let entry = self.tree.entry_mut(path)?;
            excl::acquire(&mut entry.excl, fid, now, lease);
        }
        self.tree.incref(path);
        self.tree.decref(dir_path);
        if let Some(f) = self.fids.get_mut(&fid) {
            f.path = path;
            f.open = Some(mode);
        }
        self.record(
            dir_path,
            LogOp::Create {
                new_path: path,
                perm,
                mtime: now,
                cvers: 0,
                name: name.to_string(),
                uid: uid.to_string(),
                gid,
            },
        )?;
        self.commit()?;
        debug!(fid, path, parent = dir_path, name, perm, "created");
        Ok((self.tree.entry(path)?.qid(), self.options.iounit))
    }

    /// Renew the exclusive lease of an open exclusive-use file.
    fn touch_lock(&mut self, fid: FidId, path: PathId) -> MetaResult<()> {
        let now = self.clock.now();
        let lease = self.options.lease_secs;
        let entry = self.tree.entry_mut(path)?;
        if entry.mode & DMEXCL == 0 {
            return Ok(());
        }
        match excl::acquire(&mut entry.excl, fid, now, lease) {
            ExclOutcome::Granted => Ok(()),
            ExclOutcome::Held => Err(MetaError::Locked),
            ExclOutcome::Broken => Err(MetaError::LockBroken),
        }
    }

    /// Read up to `count` bytes at `offset`. Directories yield whole packed
    /// stat records.
    pub fn read(&mut self, fid: FidId, offset: u64, count: u32) -> MetaResult<Vec<u8>> {
        let f = self.fid(fid)?;
        let path = f.path;
        match f.open {
            None => return Err(MetaError::NotOpen),
            Some(m) if m & 3 == OWRITE => return Err(MetaError::AccessMode),
            Some(_) => {}
        }
        self.touch_lock(fid, path)?;
        let entry = self.tree.entry(path)?;
        let out = match &entry.kind {
            EntryKind::Pseudo(p) => p.read(&self.users, offset, count as usize)?,
            EntryKind::Dir(children) => {
                let mut out = Vec::new();
                let mut pos = 0u64;
                for child in children {
                    let rec = self.stat_of(self.tree.entry(*child)?).encode();
                    let len = rec.len() as u64;
                    if pos >= offset {
                        if out.len() + rec.len() > count as usize {
                            break;
                        }
                        out.extend_from_slice(&rec);
                    }
                    pos += len;
                }
                out
            }
            EntryKind::File(file) => {
                let length = file.length as u64;
                if offset >= length {
                    Vec::new()
                } else {
                    let n = (count as u64).min(length - offset) as usize;
                    let mut out = vec![0u8; n];
                    let mut done = 0;
                    while done < n {
                        let (i, rel, _) = file.locate(offset + done as u64);
                        let ext = file.extents.get(i).ok_or_else(|| {
                            MetaError::Corrupt(format!("path {:#x}: length past extents", path))
                        })?;
                        let chunk = (ext.length as u64 - rel).min((n - done) as u64) as usize;
                        self.data.read(ext.base + rel, &mut out[done..done + chunk])?;
                        done += chunk;
                    }
                    out
                }
            }
        };
        let now = self.clock.now();
        if let Some(e) = self.tree.get_mut(path) {
            e.atime = now;
        }
        Ok(out)
    }

    /// Write `data` at `offset`, returning the byte count. Append-only files
    /// always write at their end.
    pub fn write(&mut self, fid: FidId, offset: u64, data: &[u8]) -> MetaResult<u32> {
        let f = self.fid(fid)?;
        let path = f.path;
        let uid = Arc::clone(&f.uid);
        match f.open {
            None => return Err(MetaError::NotOpen),
            Some(m) if !matches!(m & 3, OWRITE | ORDWR) => return Err(MetaError::AccessMode),
            Some(_) => {}
        }
        if let EntryKind::Pseudo(p) = &self.tree.entry(path)?.kind {
            let n = p.write(&mut self.control, &mut self.users, data)?;
            self.run_requests()?;
            return Ok(n as u32);
        }
        let entry = self.tree.entry(path)?;
        if entry.removed {
            return Err(MetaError::Removed);
        }
        let Some(file) = entry.file() else {
            return Err(MetaError::AccessMode);
        };
        let offset = if entry.mode & DMAPPEND != 0 {
            file.length as u64
        } else {
            offset
        };
        if data.is_empty() {
            return Ok(0);
        }
        let length = file.length as u64;
        let end = offset + data.len() as u64;
        if end > u32::MAX as u64 {
            return Err(MetaError::FileTooLarge);
        }
        // a write past the end fills the gap with zeros
        let start = offset.min(length);
        let mut layout = file.clone();
        self.touch_lock(fid, path)?;
        self.reserve()?;

        let first_new = layout.extents.len();
        let mut cap = layout.capacity();
        while cap < end {
            let grown = self
                .alloc
                .extent_growth(end - cap, cap, layout.extents.len());
            let ext = grown.map_or(Extent::EMPTY, |size| self.alloc.allocate(size));
            if ext.is_empty() {
                for ext in layout.extents.drain(first_new..) {
                    self.alloc.free(ext)?;
                }
                let err = if grown.is_none() {
                    MetaError::FileTooLarge
                } else {
                    MetaError::DiskFull
                };
                warn!(path, end, extents = first_new, error = %err, "write cannot grow file");
                return Err(err);
            }
            cap += ext.length as u64;
            layout.extents.push(ext);
        }

        let now = self.clock.now();
        let entry = self.tree.entry_mut(path)?;
        let mut vers = entry.qid.vers;
        let mut ops = Vec::new();
        let mut pos = start;
        while pos < end {
            let (i, rel, _) = layout.locate(pos);
            let ext = layout.extents[i];
            let n = (ext.length as u64 - rel).min(end - pos);
            let gap = offset.clamp(pos, pos + n) - pos;
            if gap > 0 {
                self.data.zero(ext.base + rel, gap)?;
            }
            if gap < n {
                let from = (pos + gap - offset) as usize;
                self.data
                    .write(ext.base + rel + gap, &data[from..from + (n - gap) as usize])?;
            }
            vers = vers.wrapping_add(1);
            ops.push(LogOp::Write {
                mtime: now,
                offset: pos as u32,
                count: n as u32,
                vers,
                cvers: layout.cvers,
                extent_offset: rel as u32,
                extent: ext,
                index: i as u8,
                new_extent: i >= first_new,
                muid: uid.to_string(),
            });
            pos += n;
        }
        layout.length = layout.length.max(end as u32);
        entry.qid.vers = vers;
        entry.mtime = now;
        if let EntryKind::File(file) = &mut entry.kind {
            *file = layout;
        }
        self.tree.set_id(path, IdField::Muid, &uid)?;
        self.data_dirty = true;
        for op in ops {
            self.record(path, op)?;
        }
        self.commit()?;
        debug!(fid, path, offset = start, count = end - start, "wrote");
        Ok(data.len() as u32)
    }

    /// Act on flush or sweep requests made through the control file.
    fn run_requests(&mut self) -> MetaResult<()> {
        if std::mem::take(&mut self.control.sweep_requested) {
            self.sweep()?;
        }
        if std::mem::take(&mut self.control.sync_requested) {
            self.flush()?;
        }
        Ok(())
    }

    /// Remove the entry bound to `fid`. The fid is clunked even when the
    /// removal fails.
    pub fn remove(&mut self, fid: FidId) -> MetaResult<()> {
        let res = self.remove_entry(fid);
        let clunked = self.release_fid(fid);
        res.and(clunked)
    }

    fn remove_entry(&mut self, fid: FidId) -> MetaResult<()> {
        let now = self.clock.now();
        let f = self.fid(fid)?;
        let path = f.path;
        let uid = Arc::clone(&f.uid);
        if is_reserved(path) || path == ROOT_PATH {
            return Err(MetaError::PermissionDenied);
        }
        let entry = self.tree.entry(path)?;
        if entry.removed {
            return Err(MetaError::Removed);
        }
        let parent = entry
            .parent
            .ok_or_else(|| MetaError::Corrupt(format!("path {:#x} has no parent", path)))?;
        self.requester(&uid)
            .check(self.tree.entry(parent)?, AccessMode::WRITE)?;
        if !entry.children().is_empty() {
            return Err(MetaError::DirectoryNotEmpty);
        }

        self.reserve()?;
        // logged first so a sweep during the append still sees the entry
        self.record(
            path,
            LogOp::Remove {
                mtime: now,
                muid: uid.to_string(),
            },
        )?;
        self.tree.remove(path, &mut self.alloc, now, &uid)?;
        self.commit()?;
        debug!(fid, path, parent, "removed");
        Ok(())
    }

    /// Forget `fid`. A fid opened remove-on-close removes its entry first.
    pub fn clunk(&mut self, fid: FidId) -> MetaResult<()> {
        let f = self.fid(fid)?;
        if f.open.is_some_and(|m| m & ORCLOSE != 0) {
            if let Err(e) = self.remove_entry(fid) {
                if e.is_fatal() {
                    return Err(e);
                }
                debug!(fid, error = %e, "remove on close failed");
            }
        }
        self.release_fid(fid)
    }

    fn release_fid(&mut self, fid: FidId) -> MetaResult<()> {
        let f = self.fids.remove(&fid).ok_or(MetaError::UnknownFid(fid))?;
        if let Some(entry) = self.tree.get_mut(f.path) {
            excl::release(&mut entry.excl, fid);
        }
        self.tree.decref(f.path);
        self.tree.release(f.uid);
        Ok(())
    }

    /// Attributes of the entry bound to `fid`.
    pub fn stat(&self, fid: FidId) -> MetaResult<Stat> {
        let f = self.fid(fid)?;
        Ok(self.stat_of(self.tree.entry(f.path)?))
    }

    /// Change attributes. Each requested change is checked on its own; a
    /// request that changes nothing logs only a sync marker.
    pub fn wstat(&mut self, fid: FidId, req: &WstatRequest) -> MetaResult<()> {
        let now = self.clock.now();
        let f = self.fid(fid)?;
        let path = f.path;
        let uid = Arc::clone(&f.uid);
        if &*uid == NONE_USER {
            return Err(MetaError::PermissionDenied);
        }
        let entry = self.tree.entry(path)?;
        if entry.removed {
            return Err(MetaError::Removed);
        }
        let who = self.requester(&uid);
        let privileged = self.control.wstatallow || self.control.nopermcheck;
        let owner = who.owns(entry);
        // leading the requested group also allows mode and time changes
        let wanted_gid = req
            .gid
            .as_deref()
            .filter(|g| !g.is_empty())
            .and_then(|g| self.users.lookup_by_name(g));
        let leader = who.leads_either(&entry.gid, wanted_gid);

        let mut truncate = false;
        if let Some(len) = req.length {
            if len != entry.length() {
                if entry.is_dir() {
                    return Err(MetaError::BadWstat("cannot change directory length"));
                }
                if len != 0 {
                    return Err(MetaError::BadWstat("length can only be set to zero"));
                }
                who.check(entry, AccessMode::WRITE)?;
                truncate = true;
            }
        }

        let mut new_mode = None;
        if let Some(mode) = req.mode.filter(|m| *m != entry.mode) {
            if mode & !DM_VALID != 0 {
                return Err(MetaError::BadWstat("unknown bits in mode"));
            }
            if (mode ^ entry.mode) & DMDIR != 0 {
                return Err(MetaError::BadWstat("attempt to change directory bit"));
            }
            if !(owner || privileged || leader) {
                return Err(MetaError::PermissionDenied);
            }
            new_mode = Some(mode);
        }

        let mut new_mtime = None;
        if let Some(mtime) = req.mtime.filter(|t| *t != entry.mtime) {
            if !(owner || privileged || leader) {
                return Err(MetaError::PermissionDenied);
            }
            new_mtime = Some(mtime);
        }

        let mut new_name = None;
        if let Some(name) = req.name.as_deref().filter(|n| !n.is_empty() && *n != entry.name) {
            check_filename(name)?;
            let parent = entry.parent.ok_or(MetaError::PermissionDenied)?;
            if !privileged {
                who.check(self.tree.entry(parent)?, AccessMode::WRITE)?;
            }
            if self.tree.child(parent, name).is_some() {
                return Err(MetaError::Exists);
            }
            new_name = Some(name.to_string());
        }

        let mut new_uid = None;
        if let Some(uname) = req.uid.as_deref().filter(|u| !u.is_empty()) {
            let id = self
                .users
                .lookup_by_name(uname)
                .ok_or_else(|| MetaError::UnknownUser(uname.to_string()))?;
            if id != &*entry.uid {
                if !privileged {
                    return Err(MetaError::PermissionDenied);
                }
                new_uid = Some(id.to_string());
            }
        }

        let mut new_gid = None;
        if let Some(gname) = req.gid.as_deref().filter(|g| !g.is_empty()) {
            let id = self
                .users
                .lookup_by_name(gname)
                .ok_or_else(|| MetaError::UnknownUser(gname.to_string()))?;
            if id != &*entry.gid {
                let allowed = privileged
                    || (owner && self.users.is_member(&uid, id))
                    || (self.users.leads_group(&uid, &entry.gid) && self.users.leads_group(&uid, id));
                if !allowed {
                    return Err(MetaError::PermissionDenied);
                }
                new_gid = Some(id.to_string());
            }
        }

        let changed = new_mode.is_some()
            || new_mtime.is_some()
            || new_name.is_some()
            || new_uid.is_some()
            || new_gid.is_some();
        if (changed || truncate) && is_reserved(path) {
            return Err(MetaError::PermissionDenied);
        }

        self.reserve()?;
        if !changed && !truncate {
            self.record(path, LogOp::Sync)?;
            return self.commit();
        }
        if truncate {
            self.truncate(path, &uid, now)?;
        }
        if changed {
            let entry = self.tree.entry_mut(path)?;
            if let Some(mode) = new_mode {
                entry.mode = mode;
                entry.qid.qtype = crate::types::qid_type(mode);
            }
            if let Some(mtime) = new_mtime {
                entry.mtime = mtime;
            }
            if let Some(name) = &new_name {
                entry.name = name.clone();
            }
            entry.qid.vers = entry.qid.vers.wrapping_add(1);
            if let Some(id) = &new_uid {
                self.tree.set_id(path, IdField::Uid, id)?;
            }
            if let Some(id) = &new_gid {
                self.tree.set_id(path, IdField::Gid, id)?;
            }
            self.tree.set_id(path, IdField::Muid, &uid)?;
            self.record(
                path,
                LogOp::Wstat {
                    perm: new_mode.unwrap_or(UNCHANGED),
                    mtime: new_mtime.unwrap_or(UNCHANGED),
                    atime: UNCHANGED,
                    name: new_name.unwrap_or_default(),
                    uid: new_uid.unwrap_or_default(),
                    gid: new_gid.unwrap_or_default(),
                    muid: uid.to_string(),
                },
            )?;
        }
        self.commit()?;
        debug!(fid, path, truncate, changed, "wstat");
        Ok(())
    }

    /// Make every completed operation durable.
    pub fn flush(&mut self) -> MetaResult<()> {
        if std::mem::take(&mut self.data_dirty) {
            self.data.sync()?;
        }
        self.log.flush().map_err(MetaError::Wal)
    }

    /// Compact the log now.
    pub fn sweep(&mut self) -> MetaResult<()> {
        self.flush()?;
        self.log
            .sweep(&mut Compactor::new(&self.tree))
            .map_err(MetaError::Wal)?;
        info!(blocks = self.log.segment_blocks(SegmentKind::Active), "swept log");
        Ok(())
    }

    /// Every entry of one log segment, after a flush.
    pub fn log_entries(&mut self, kind: SegmentKind) -> MetaResult<Vec<LogEntry>> {
        self.log.entries(kind).map_err(MetaError::Wal)
    }

    /// Returns true once a halt was requested through the control file.
    pub fn halted(&self) -> bool {
        self.control.halted
    }

    /// Current control flags.
    pub fn control(&self) -> &ControlState {
        &self.control
    }

    /// The user directory.
    pub fn users(&self) -> &UserTable {
        &self.users
    }

    /// Mutable access to the user directory.
    pub fn users_mut(&mut self) -> &mut UserTable {
        &mut self.users
    }

    /// The entry tree.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Every entry under the root in depth-first order, with its depth.
    pub fn list(&self) -> MetaResult<Vec<(usize, Stat)>> {
        self.tree
            .walk_from(ROOT_PATH)
            .into_iter()
            .map(|(depth, path)| Ok((depth, self.stat_of(self.tree.entry(path)?))))
            .collect()
    }

    /// Returns current statistics.
    pub fn stats(&self) -> FsStats {
        FsStats {
            entries: self.tree.len(),
            fids: self.fids.len(),
            strings: self.tree.strings().len(),
            last_seq: self.cmdseq,
            last_path: self.tree.last_path(),
            replayed: self.replayed,
            replay_skipped: self.replay_skipped,
            allocator: self.alloc.stats(),
            log: self.log.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{OREAD, QTDIR};
    use logfs_storage::{BlockDevice, MemDevice};

    const DATA_LEN: usize = 256 * 1024;
    const LOG_LEN: usize = 64 * 1024;

    struct Disks {
        data: MemDevice,
        log: MemDevice,
        clock: ManualClock,
    }

    impl Disks {
        fn new() -> Self {
            Self {
                data: MemDevice::new(DATA_LEN),
                log: MemDevice::new(LOG_LEN),
                clock: ManualClock::new(1000),
            }
        }

        fn regions(&self) -> (Region, Region) {
            let data: Arc<dyn BlockDevice> = Arc::new(self.data.clone());
            let log: Arc<dyn BlockDevice> = Arc::new(self.log.clone());
            (Region::whole(data), Region::whole(log))
        }

        fn options() -> FsOptions {
            FsOptions {
                log: LogConfig {
                    block_size: 1024,
                    reserve_blocks: 3,
                },
                ..FsOptions::default()
            }
        }

        fn users() -> UserTable {
            let mut users = UserTable::new();
            users
                .apply_text("adm adm\nglenda glenda\nbob bob\nsys sys glenda glenda\n")
                .unwrap();
            users
        }

        fn format(&self) -> Filesystem {
            let (data, log) = self.regions();
            Filesystem::format(
                data,
                log,
                Self::options(),
                Self::users(),
                Box::new(self.clock.clone()),
            )
            .unwrap()
        }

        fn open(&self) -> Filesystem {
            let (data, log) = self.regions();
            Filesystem::recover(
                data,
                log,
                Self::options(),
                Self::users(),
                Box::new(self.clock.clone()),
            )
            .unwrap()
        }
    }

    fn open_root(fs: &mut Filesystem, fid: FidId, user: &str) {
        fs.attach(fid, user, "").unwrap();
    }

    #[test]
    fn test_attach_points() {
        let disks = Disks::new();
        let mut fs = disks.format();
        let q = fs.attach(1, "adm", "").unwrap();
        assert_eq!(q.path, ROOT_PATH);
        assert_eq!(q.qtype, QTDIR);
        assert_eq!(fs.attach(2, "adm", "ctl").unwrap().path, ALT_ROOT_PATH);
        assert!(matches!(
            fs.attach(3, "adm", "other").unwrap_err(),
            MetaError::BadAttach(_)
        ));
        assert!(matches!(
            fs.attach(1, "adm", "").unwrap_err(),
            MetaError::FidInUse(1)
        ));
        assert!(matches!(
            fs.attach(4, "mallory", "").unwrap_err(),
            MetaError::UnknownUser(_)
        ));
        fs.attach(5, NONE_USER, "").unwrap();
    }

    #[test]
    fn test_create_write_read() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        let (qid, iounit) = fs.create(1, "f1", 0o666, ORDWR).unwrap();
        assert_eq!(iounit, DEFAULT_IOUNIT);
        assert_eq!(qid.path, 1);
        assert_eq!(fs.write(1, 0, b"hello, world").unwrap(), 12);
        assert_eq!(fs.write(1, 12, b"goodbye\n").unwrap(), 8);
        assert_eq!(fs.stat(1).unwrap().length, 20);
        assert_eq!(fs.read(1, 0, 100).unwrap(), b"hello, worldgoodbye\n");
        assert_eq!(fs.read(1, 7, 5).unwrap(), b"world");
        assert!(fs.read(1, 20, 10).unwrap().is_empty());
    }

    #[test]
    fn test_create_masks_perm_by_parent() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.walk(1, 2, &[]).unwrap();
        fs.create(1, "d", DMDIR | 0o777, OREAD).unwrap();
        assert_eq!(fs.stat(1).unwrap().mode, DMDIR | 0o775);
        fs.create(2, "f", 0o666, OWRITE).unwrap();
        assert_eq!(fs.stat(2).unwrap().mode, 0o664);
        assert_eq!(fs.stat(2).unwrap().gid, "adm");
    }

    #[test]
    fn test_create_rejects_bad_names() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        for name in ["", ".", "..", "a/b", "tab\there"] {
            assert!(matches!(
                fs.create(1, name, 0o644, OREAD).unwrap_err(),
                MetaError::InvalidName(_)
            ));
        }
        fs.walk(1, 2, &[]).unwrap();
        fs.create(1, "x", 0o644, OREAD).unwrap();
        assert!(matches!(
            fs.create(2, "x", 0o644, OREAD).unwrap_err(),
            MetaError::Exists
        ));
    }

    #[test]
    fn test_walk_partial_binds_nothing() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.walk(1, 2, &[]).unwrap();
        fs.create(2, "d", DMDIR | 0o755, OREAD).unwrap();
        let qids = fs.walk(1, 3, &["d", "missing"]).unwrap();
        assert_eq!(qids.len(), 1);
        assert!(matches!(fs.stat(3).unwrap_err(), MetaError::UnknownFid(3)));
        assert!(matches!(
            fs.walk(1, 3, &["missing"]).unwrap_err(),
            MetaError::NotFound
        ));
        let qids = fs.walk(1, 3, &["d", "..", ".", "d"]).unwrap();
        assert_eq!(qids.len(), 4);
        assert_eq!(fs.stat(3).unwrap().name, "d");
        // the parent of the root is the root
        assert_eq!(fs.walk(1, 4, &[".."]).unwrap()[0].path, ROOT_PATH);
    }

    #[test]
    fn test_walk_needs_exec() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.create(1, "priv", DMDIR | 0o700, OREAD).unwrap();
        fs.clunk(1).unwrap();
        open_root(&mut fs, 2, "glenda");
        assert_eq!(fs.walk(2, 3, &["priv", "x"]).unwrap().len(), 1);
        fs.walk(2, 3, &["priv"]).unwrap();
        assert!(matches!(
            fs.walk(3, 4, &["x"]).unwrap_err(),
            MetaError::PermissionDenied
        ));
    }

    #[test]
    fn test_open_checks_permission() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.create(1, "f", 0o644, OWRITE).unwrap();
        fs.clunk(1).unwrap();
        open_root(&mut fs, 2, "glenda");
        fs.walk(2, 3, &["f"]).unwrap();
        assert!(matches!(
            fs.open(3, OWRITE).unwrap_err(),
            MetaError::PermissionDenied
        ));
        fs.open(3, OREAD).unwrap();
        assert!(matches!(fs.open(3, OREAD).unwrap_err(), MetaError::FidOpen));
        assert!(matches!(
            fs.write(3, 0, b"x").unwrap_err(),
            MetaError::AccessMode
        ));
        assert!(matches!(
            fs.open(2, OWRITE).unwrap_err(),
            MetaError::PermissionDenied
        ));
    }

    #[test]
    fn test_truncate_on_open() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.walk(1, 2, &[]).unwrap();
        fs.create(1, "f", 0o644, OWRITE).unwrap();
        fs.write(1, 0, &[7u8; 3000]).unwrap();
        let before = fs.stat(1).unwrap().qid.vers;
        fs.walk(2, 3, &["f"]).unwrap();
        fs.open(3, OWRITE | OTRUNC).unwrap();
        let st = fs.stat(3).unwrap();
        assert_eq!(st.length, 0);
        assert_eq!(st.qid.vers >> 16, 1);
        assert_ne!(st.qid.vers, before);
        assert_eq!(fs.stats().allocator.free_bytes, DATA_LEN as u64);
    }

    #[test]
    fn test_write_past_end_zero_fills() {
        let disks = Disks::new();
        // stale bytes where the file's first extent will land
        disks.data.restore(&vec![0xEE; DATA_LEN]);
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.create(1, "sparse", 0o644, ORDWR).unwrap();
        fs.write(1, 100, b"tail").unwrap();
        let data = fs.read(1, 0, 200).unwrap();
        assert_eq!(data.len(), 104);
        assert!(data[..100].iter().all(|b| *b == 0));
        assert_eq!(&data[100..], b"tail");

        // a gap running past the end of the first extent
        fs.write(1, 5000, b"end").unwrap();
        assert_eq!(fs.stat(1).unwrap().length, 5003);
        let mut pos = 0;
        while pos < 5000 {
            let got = fs.read(1, pos, 1000).unwrap();
            let want = (5000 - pos).min(1000) as usize;
            let zeros = if pos == 0 { &got[104..] } else { &got[..want] };
            assert!(zeros.iter().all(|b| *b == 0), "stale bytes near {}", pos);
            pos += 1000;
        }
        assert_eq!(fs.read(1, 5000, 10).unwrap(), b"end");
    }

    #[test]
    fn test_append_only_writes_at_end() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.create(1, "log", DMAPPEND | 0o644, ORDWR).unwrap();
        fs.write(1, 0, b"one ").unwrap();
        fs.write(1, 0, b"two").unwrap();
        assert_eq!(fs.read(1, 0, 100).unwrap(), b"one two");
    }

    #[test]
    fn test_disk_full_leaves_file_unchanged() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.create(1, "big", 0o644, OWRITE).unwrap();
        fs.write(1, 0, b"keep").unwrap();
        let free = fs.stats().allocator.free_bytes;
        let err = fs.write(1, 4, &vec![1u8; DATA_LEN]).unwrap_err();
        assert!(matches!(err, MetaError::DiskFull));
        assert_eq!(fs.stats().allocator.free_bytes, free);
        assert_eq!(fs.stat(1).unwrap().length, 4);
    }

    #[test]
    fn test_far_sparse_write_fails_before_filling() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.create(1, "far", 0o644, OWRITE).unwrap();
        fs.write(1, 0, b"head").unwrap();
        let free = fs.stats().allocator.free_bytes;
        let seq = fs.stats().last_seq;
        let err = fs.write(1, 4_000_000_000, b"x").unwrap_err();
        assert!(matches!(err, MetaError::DiskFull | MetaError::FileTooLarge));
        assert_eq!(fs.stats().allocator.free_bytes, free);
        assert_eq!(fs.stats().last_seq, seq);
        assert_eq!(fs.stat(1).unwrap().length, 4);
    }

    #[test]
    fn test_remove_rules() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.walk(1, 2, &[]).unwrap();
        fs.create(2, "d", DMDIR | 0o777, OREAD).unwrap();
        fs.walk(1, 3, &["d"]).unwrap();
        fs.create(3, "f", 0o666, OWRITE).unwrap();
        fs.write(3, 0, b"data").unwrap();
        assert!(matches!(
            fs.remove(2).unwrap_err(),
            MetaError::DirectoryNotEmpty
        ));
        // the failed remove still clunked the fid
        assert!(matches!(fs.stat(2).unwrap_err(), MetaError::UnknownFid(2)));
        fs.remove(3).unwrap();
        assert_eq!(fs.stats().allocator.free_bytes, DATA_LEN as u64);
        fs.walk(1, 4, &["d"]).unwrap();
        fs.remove(4).unwrap();
        assert_eq!(fs.tree().len(), 1);
    }

    #[test]
    fn test_removed_through_other_fid() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.walk(1, 2, &[]).unwrap();
        fs.create(2, "f", 0o666, OWRITE).unwrap();
        fs.walk(1, 3, &["f"]).unwrap();
        fs.remove(3).unwrap();
        assert!(matches!(
            fs.write(2, 0, b"x").unwrap_err(),
            MetaError::Removed
        ));
        assert!(fs.stat(2).is_ok());
        fs.clunk(2).unwrap();
        assert!(fs.tree().get(1).is_none());
    }

    #[test]
    fn test_rclose_removes() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.walk(1, 2, &[]).unwrap();
        fs.create(2, "tmp", 0o666, OWRITE | ORCLOSE).unwrap();
        assert!(fs.tree().child(ROOT_PATH, "tmp").is_some());
        fs.clunk(2).unwrap();
        assert!(fs.tree().child(ROOT_PATH, "tmp").is_none());
    }

    #[test]
    fn test_directory_read_packs_stats() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        for name in ["b", "a", "c"] {
            fs.walk(1, 2, &[]).unwrap();
            fs.create(2, name, 0o644, OREAD).unwrap();
            fs.clunk(2).unwrap();
        }
        fs.open(1, OREAD).unwrap();
        let buf = fs.read(1, 0, 8192).unwrap();
        let mut names = Vec::new();
        let mut pos = 0;
        while pos < buf.len() {
            let (st, n) = Stat::decode(&buf[pos..]).unwrap();
            names.push(st.name);
            pos += n;
        }
        assert_eq!(names, vec!["b", "a", "c"]);
        // a short read returns whole records only, resumable by offset
        let first = fs.read(1, 0, (pos / 3 + 1) as u32).unwrap();
        let (st, n) = Stat::decode(&first).unwrap();
        assert_eq!(st.name, "b");
        assert_eq!(first.len(), n);
        let rest = fs.read(1, n as u64, 8192).unwrap();
        assert_eq!(rest.len(), buf.len() - n);
    }

    #[test]
    fn test_wstat_noop_logs_sync() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.create(1, "f", 0o644, OREAD).unwrap();
        let seq = fs.stats().last_seq;
        let vers = fs.stat(1).unwrap().qid.vers;
        fs.wstat(
            1,
            &WstatRequest {
                name: Some("f".into()),
                mode: Some(0o644),
                ..WstatRequest::default()
            },
        )
        .unwrap();
        assert_eq!(fs.stats().last_seq, seq + 1);
        assert_eq!(fs.stat(1).unwrap().qid.vers, vers);
    }

    #[test]
    fn test_wstat_permissions() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.create(1, "f", 0o666, OREAD).unwrap();
        open_root(&mut fs, 2, "glenda");
        fs.walk(2, 3, &["f"]).unwrap();
        let chmod = WstatRequest {
            mode: Some(0o600),
            ..WstatRequest::default()
        };
        assert!(matches!(
            fs.wstat(3, &chmod).unwrap_err(),
            MetaError::PermissionDenied
        ));
        let chown = WstatRequest {
            uid: Some("glenda".into()),
            ..WstatRequest::default()
        };
        assert!(matches!(
            fs.wstat(1, &chown).unwrap_err(),
            MetaError::PermissionDenied
        ));
        fs.wstat(1, &chmod).unwrap();
        assert_eq!(fs.stat(1).unwrap().mode, 0o600);
        assert!(matches!(
            fs.wstat(
                1,
                &WstatRequest {
                    mode: Some(DMDIR | 0o600),
                    ..WstatRequest::default()
                }
            )
            .unwrap_err(),
            MetaError::BadWstat(_)
        ));
        // renaming needs write permission in the parent, which glenda lacks
        let rename = WstatRequest {
            name: Some("g".into()),
            ..WstatRequest::default()
        };
        assert!(matches!(
            fs.wstat(3, &rename).unwrap_err(),
            MetaError::PermissionDenied
        ));
        fs.wstat(1, &rename).unwrap();
        assert_eq!(fs.stat(3).unwrap().name, "g");
    }

    #[test]
    fn test_wstat_refuses_none() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.wstat(
            1,
            &WstatRequest {
                mode: Some(DMDIR | 0o777),
                ..WstatRequest::default()
            },
        )
        .unwrap();
        fs.attach(2, NONE_USER, "").unwrap();
        fs.create(2, "x", 0o666, OREAD).unwrap();
        assert_eq!(fs.stat(2).unwrap().uid, NONE_USER);
        let seq = fs.stats().last_seq;
        for req in [
            WstatRequest {
                mode: Some(0o600),
                ..WstatRequest::default()
            },
            WstatRequest::default(),
        ] {
            assert!(matches!(
                fs.wstat(2, &req).unwrap_err(),
                MetaError::PermissionDenied
            ));
        }
        assert_eq!(fs.stat(2).unwrap().mode, 0o666);
        assert_eq!(fs.stats().last_seq, seq);
    }

    #[test]
    fn test_wstatallow_permits_rename() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.create(1, "f", 0o666, OREAD).unwrap();
        open_root(&mut fs, 2, "glenda");
        fs.walk(2, 3, &["f"]).unwrap();
        let rename = WstatRequest {
            name: Some("g".into()),
            ..WstatRequest::default()
        };
        assert!(matches!(
            fs.wstat(3, &rename).unwrap_err(),
            MetaError::PermissionDenied
        ));
        fs.control.wstatallow = true;
        fs.wstat(3, &rename).unwrap();
        assert_eq!(fs.stat(1).unwrap().name, "g");
    }

    #[test]
    fn test_wstat_group_change() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.create(1, "f", 0o666, OREAD).unwrap();
        let chown = WstatRequest {
            uid: Some("glenda".into()),
            ..WstatRequest::default()
        };
        fs.control.wstatallow = true;
        fs.wstat(1, &chown).unwrap();
        fs.control.wstatallow = false;
        open_root(&mut fs, 2, "glenda");
        fs.walk(2, 3, &["f"]).unwrap();
        // glenda owns the file and is a member of sys
        fs.wstat(
            3,
            &WstatRequest {
                gid: Some("sys".into()),
                ..WstatRequest::default()
            },
        )
        .unwrap();
        let st = fs.stat(3).unwrap();
        assert_eq!((st.uid.as_str(), st.gid.as_str()), ("glenda", "sys"));
        assert!(matches!(
            fs.wstat(
                3,
                &WstatRequest {
                    gid: Some("bob".into()),
                    ..WstatRequest::default()
                }
            )
            .unwrap_err(),
            MetaError::PermissionDenied
        ));
    }

    #[test]
    fn test_exclusive_lock() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "adm");
        fs.walk(1, 2, &[]).unwrap();
        fs.walk(1, 3, &[]).unwrap();
        fs.create(2, "x", DMEXCL | 0o666, ORDWR).unwrap();
        fs.walk(3, 4, &["x"]).unwrap();
        assert!(matches!(fs.open(4, OREAD).unwrap_err(), MetaError::Locked));

        // the holder's lease lapses; its next use reports the broken lock
        disks.clock.advance(DEFAULT_LEASE_SECS + 1);
        assert!(matches!(
            fs.write(2, 0, b"late").unwrap_err(),
            MetaError::LockBroken
        ));
        fs.open(4, OREAD).unwrap();
        fs.clunk(4).unwrap();
        fs.walk(3, 5, &["x"]).unwrap();
        fs.open(5, OREAD).unwrap();
    }

    #[test]
    fn test_ctl_commands() {
        let disks = Disks::new();
        let mut fs = disks.format();
        fs.attach(1, "adm", "ctl").unwrap();
        fs.walk(1, 2, &["ctl"]).unwrap();
        fs.open(2, OWRITE).unwrap();
        fs.write(2, 0, b"allow\n").unwrap();
        assert!(fs.control().wstatallow);
        fs.write(2, 0, b"sweep").unwrap();
        assert_eq!(fs.stats().log.sweeps, 1);
        assert!(!fs.control().sweep_requested);
        fs.write(2, 0, b"uname alice u42").unwrap();
        assert_eq!(fs.users().lookup_by_name("alice"), Some("u42"));
        fs.write(2, 0, b"halt").unwrap();
        assert!(fs.halted());

        fs.walk(1, 3, &["users"]).unwrap();
        fs.open(3, OREAD).unwrap();
        let text = String::from_utf8(fs.read(3, 0, 4096).unwrap()).unwrap();
        assert!(text.contains("u42 alice\n"));
        // control files cannot be removed
        assert!(matches!(
            fs.remove(3).unwrap_err(),
            MetaError::PermissionDenied
        ));
    }

    #[test]
    fn test_crash_before_flush_loses_nothing_committed() {
        let disks = Disks::new();
        {
            let mut fs = disks.format();
            open_root(&mut fs, 1, "adm");
            fs.create(1, "f1", 0o666, ORDWR).unwrap();
            fs.write(1, 0, b"hello, world").unwrap();
            fs.write(1, 12, b"goodbye\n").unwrap();
        }
        let mut fs = disks.open();
        open_root(&mut fs, 1, "adm");
        fs.walk(1, 2, &["f1"]).unwrap();
        assert_eq!(fs.stat(2).unwrap().length, 20);
        fs.open(2, OREAD).unwrap();
        assert_eq!(fs.read(2, 0, 20).unwrap(), b"hello, worldgoodbye\n");
        // new path ids continue past the recovered ones
        fs.create(1, "f2", 0o666, OREAD).unwrap();
        assert_eq!(fs.stat(1).unwrap().qid.path, 2);
    }

    #[test]
    fn test_stat_names_unknown_ids() {
        let disks = Disks::new();
        let mut fs = disks.format();
        open_root(&mut fs, 1, "glenda");
        fs.walk(1, 2, &[]).unwrap();
        fs.control.nopermcheck = true;
        fs.create(1, "f", 0o644, OREAD).unwrap();
        fs.users_mut().apply_text("- glenda\n").unwrap();
        assert_eq!(fs.stat(1).unwrap().uid, "glenda");
        assert_eq!(fs.stat(2).unwrap().uid, "adm");
    }
}
