//! The in-memory namespace.
//!
//! Entries live in one table keyed by path id. A directory lists its
//! children by path id in creation order; a child names its parent the same
//! way, so there are no owning cycles. An entry stays in the table while it
//! is linked into the namespace or while any fid still refers to it. Removed
//! entries that fids still hold are marked `removed` and dropped on the last
//! clunk.
//!
//! The root of the `ctl` access point and its two pseudo-files use reserved
//! path ids at the top of the range. They are never logged and never seen by
//! replay or compaction.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;

use logfs_storage::{BuddyAllocator, Extent};
use tracing::debug;

use crate::error::{MetaError, MetaResult};
use crate::excl::ExclLock;
use crate::pseudo::{CtlFile, PseudoFile, UsersFile};
use crate::strings::StringTable;
use crate::types::{qid_type, PathId, Qid, DMDIR};

/// Path id of the namespace root.
pub const ROOT_PATH: PathId = 0;
/// Path id of the `ctl` access point root.
pub const ALT_ROOT_PATH: PathId = u32::MAX;
/// Path id of the `ctl` pseudo-file.
pub const CTL_PATH: PathId = u32::MAX - 1;
/// Path id of the `users` pseudo-file.
pub const USERS_PATH: PathId = u32::MAX - 2;
/// Lowest reserved path id.
pub const FIRST_RESERVED_PATH: PathId = USERS_PATH;

/// Returns true for path ids that are never assigned to real entries.
pub fn is_reserved(path: PathId) -> bool {
    path >= FIRST_RESERVED_PATH
}

/// Contents of a regular file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileData {
    /// Content version, bumped by each truncation.
    pub cvers: u32,
    /// Length in bytes.
    pub length: u32,
    /// Extents in file order.
    pub extents: Vec<Extent>,
}

impl FileData {
    /// Sum of extent lengths.
    pub fn capacity(&self) -> u64 {
        self.extents.iter().map(|e| e.length as u64).sum()
    }

    /// Find the extent holding byte `offset`: returns its index, the offset
    /// within it, and the capacity of the extents before it. The index equals
    /// the extent count when `offset` is at or past capacity.
    pub fn locate(&self, offset: u64) -> (usize, u64, u64) {
        let mut rel = offset;
        let mut before = 0;
        for (i, ext) in self.extents.iter().enumerate() {
            if rel < ext.length as u64 {
                return (i, rel, before);
            }
            rel -= ext.length as u64;
            before += ext.length as u64;
        }
        (self.extents.len(), rel, before)
    }
}

/// What an entry holds.
#[derive(Debug)]
pub enum EntryKind {
    /// A directory and its children, in creation order.
    Dir(Vec<PathId>),
    /// A regular file.
    File(FileData),
    /// A file served by code.
    Pseudo(Box<dyn PseudoFile>),
}

/// A namespace node.
#[derive(Debug)]
pub struct Entry {
    /// Identity; `vers` counts changes.
    pub qid: Qid,
    /// Parent directory; None for roots.
    pub parent: Option<PathId>,
    /// Name within the parent.
    pub name: String,
    /// Owner id.
    pub uid: Arc<str>,
    /// Group id.
    pub gid: Arc<str>,
    /// Id of the last modifier.
    pub muid: Arc<str>,
    /// Last access time.
    pub atime: u32,
    /// Last modification time.
    pub mtime: u32,
    /// Mode and permission bits.
    pub mode: u32,
    /// Exclusive-use lock, if taken.
    pub excl: Option<ExclLock>,
    /// Set once the entry is removed from the namespace.
    pub removed: bool,
    /// Contents.
    pub kind: EntryKind,
}

impl Entry {
    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Dir(_))
    }

    /// Returns true for pseudo-files.
    pub fn is_pseudo(&self) -> bool {
        matches!(self.kind, EntryKind::Pseudo(_))
    }

    /// File contents, if a regular file.
    pub fn file(&self) -> Option<&FileData> {
        match &self.kind {
            EntryKind::File(f) => Some(f),
            _ => None,
        }
    }

    /// Mutable file contents, if a regular file.
    pub fn file_mut(&mut self) -> Option<&mut FileData> {
        match &mut self.kind {
            EntryKind::File(f) => Some(f),
            _ => None,
        }
    }

    /// Children, empty for anything but a directory.
    pub fn children(&self) -> &[PathId] {
        match &self.kind {
            EntryKind::Dir(c) => c,
            _ => &[],
        }
    }

    /// Qid as reported to clients: a file's version carries its content
    /// version in the high half.
    pub fn qid(&self) -> Qid {
        match &self.kind {
            EntryKind::File(f) => Qid {
                vers: self.qid.vers | f.cvers << 16,
                ..self.qid
            },
            _ => self.qid,
        }
    }

    /// Length in bytes; zero for directories and pseudo-files.
    pub fn length(&self) -> u64 {
        self.file().map_or(0, |f| f.length as u64)
    }
}

/// Identity fields of an entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IdField {
    /// Owner.
    Uid,
    /// Group.
    Gid,
    /// Last modifier.
    Muid,
}

/// Fields of an entry being created or re-created.
#[derive(Clone, Debug)]
pub struct NewEntry<'a> {
    /// Path id to assign.
    pub path: PathId,
    /// Name within the parent.
    pub name: &'a str,
    /// Mode and permission bits.
    pub mode: u32,
    /// Owner id; also the first modifier.
    pub uid: &'a str,
    /// Group id.
    pub gid: &'a str,
    /// Creation time.
    pub mtime: u32,
    /// Initial content version.
    pub cvers: u32,
}

/// View of an entry holding everything the log can reproduce. Directory
/// times and versions follow from child history and are left out, as are
/// the version and modifier of a file without data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryShape {
    /// Parent directory.
    pub parent: Option<PathId>,
    /// Name.
    pub name: String,
    /// Mode bits.
    pub mode: u32,
    /// Owner id.
    pub uid: String,
    /// Group id.
    pub gid: String,
    /// File contents, for regular files.
    pub file: Option<FileData>,
    /// Modification time, for regular files.
    pub mtime: Option<u32>,
    /// Qid version and last modifier, for regular files holding data.
    pub modified: Option<(u32, String)>,
    /// Children, for directories.
    pub children: Vec<PathId>,
}

#[derive(Debug)]
struct Slot {
    entry: Entry,
    refs: usize,
    linked: bool,
}

/// The entry table.
#[derive(Debug)]
pub struct Tree {
    slots: HashMap<PathId, Slot>,
    strings: StringTable,
    last_path: PathId,
}

impl Tree {
    /// A tree holding an empty root owned by `owner`, plus the `ctl` access
    /// point with its pseudo-files.
    pub fn new(owner: &str, now: u32) -> Self {
        let mut tree = Self {
            slots: HashMap::new(),
            strings: StringTable::new(),
            last_path: ROOT_PATH,
        };
        let fixed = |path, name, mode| NewEntry {
            path,
            name,
            mode,
            uid: owner,
            gid: owner,
            mtime: now,
            cvers: 0,
        };
        tree.insert_slot(
            None,
            &fixed(ROOT_PATH, "", DMDIR | 0o775),
            EntryKind::Dir(Vec::new()),
        );
        tree.insert_slot(
            None,
            &fixed(ALT_ROOT_PATH, "", DMDIR | 0o555),
            EntryKind::Dir(vec![CTL_PATH, USERS_PATH]),
        );
        tree.insert_slot(
            Some(ALT_ROOT_PATH),
            &fixed(CTL_PATH, "ctl", 0o664),
            EntryKind::Pseudo(Box::new(CtlFile)),
        );
        tree.insert_slot(
            Some(ALT_ROOT_PATH),
            &fixed(USERS_PATH, "users", 0o664),
            EntryKind::Pseudo(Box::new(UsersFile)),
        );
        tree
    }

    fn insert_slot(&mut self, parent: Option<PathId>, new: &NewEntry<'_>, kind: EntryKind) {
        let uid = self.strings.intern(new.uid);
        let entry = Entry {
            qid: Qid {
                path: new.path,
                vers: 0,
                qtype: qid_type(new.mode),
            },
            parent,
            name: new.name.to_string(),
            gid: self.strings.intern(new.gid),
            muid: self.strings.intern(new.uid),
            uid,
            atime: new.mtime,
            mtime: new.mtime,
            mode: new.mode,
            excl: None,
            removed: false,
            kind,
        };
        self.slots.insert(
            new.path,
            Slot {
                entry,
                refs: 0,
                linked: true,
            },
        );
    }

    /// Add a new entry at the end of `parent`'s children.
    pub fn create(&mut self, parent: PathId, new: &NewEntry<'_>) -> MetaResult<()> {
        if is_reserved(new.path) || self.slots.contains_key(&new.path) {
            return Err(MetaError::Corrupt(format!(
                "path {:#x} already in use",
                new.path
            )));
        }
        match self.get(parent).map(|p| &p.kind) {
            Some(EntryKind::Dir(_)) => {}
            Some(_) => return Err(MetaError::NotDirectory),
            None => {
                return Err(MetaError::Corrupt(format!(
                    "parent {:#x} missing",
                    parent
                )))
            }
        }
        let kind = if new.mode & DMDIR != 0 {
            EntryKind::Dir(Vec::new())
        } else {
            EntryKind::File(FileData {
                cvers: new.cvers,
                ..FileData::default()
            })
        };
        self.insert_slot(Some(parent), new, kind);

        let dir = self.entry_mut(parent)?;
        dir.qid.vers = dir.qid.vers.wrapping_add(1);
        dir.mtime = new.mtime;
        if let EntryKind::Dir(children) = &mut dir.kind {
            children.push(new.path);
        }
        self.observe_path(new.path);
        debug!(path = new.path, parent, name = new.name, mode = new.mode, "created entry");
        Ok(())
    }

    /// Any entry still in the table, including removed and reserved ones.
    pub fn get(&self, path: PathId) -> Option<&Entry> {
        self.slots.get(&path).map(|s| &s.entry)
    }

    /// Mutable access to any entry still in the table.
    pub fn get_mut(&mut self, path: PathId) -> Option<&mut Entry> {
        self.slots.get_mut(&path).map(|s| &mut s.entry)
    }

    /// Like [`Tree::get`], treating absence as corruption.
    pub fn entry(&self, path: PathId) -> MetaResult<&Entry> {
        self.get(path)
            .ok_or_else(|| MetaError::Corrupt(format!("no entry for path {:#x}", path)))
    }

    /// Like [`Tree::get_mut`], treating absence as corruption.
    pub fn entry_mut(&mut self, path: PathId) -> MetaResult<&mut Entry> {
        self.get_mut(path)
            .ok_or_else(|| MetaError::Corrupt(format!("no entry for path {:#x}", path)))
    }

    /// Path table lookup: linked entries with logged path ids only.
    pub fn lookup(&self, path: PathId) -> Option<&Entry> {
        match self.slots.get(&path) {
            Some(s) if s.linked && !is_reserved(path) => Some(&s.entry),
            _ => None,
        }
    }

    /// Mutable path table lookup.
    pub fn lookup_mut(&mut self, path: PathId) -> Option<&mut Entry> {
        match self.slots.get_mut(&path) {
            Some(s) if s.linked && !is_reserved(path) => Some(&mut s.entry),
            _ => None,
        }
    }

    /// The child of `dir` called `name`.
    pub fn child(&self, dir: PathId, name: &str) -> Option<PathId> {
        let entry = self.get(dir)?;
        entry
            .children()
            .iter()
            .copied()
            .find(|c| self.get(*c).is_some_and(|e| e.name == name))
    }

    /// Take an entry out of its parent's child list.
    pub fn detach(&mut self, path: PathId) -> MetaResult<PathId> {
        let parent = self
            .entry(path)?
            .parent
            .ok_or_else(|| MetaError::Corrupt(format!("path {:#x} has no parent", path)))?;
        let dir = self.entry_mut(parent)?;
        let EntryKind::Dir(children) = &mut dir.kind else {
            return Err(MetaError::Corrupt(format!(
                "parent {:#x} is not a directory",
                parent
            )));
        };
        let pos = children.iter().position(|c| *c == path).ok_or_else(|| {
            MetaError::Corrupt(format!("path {:#x} lost from {:#x}", path, parent))
        })?;
        children.remove(pos);
        Ok(parent)
    }

    /// Drop an entry from the path table. It stays reachable through fids
    /// that still hold it.
    pub fn unlink(&mut self, path: PathId) {
        let drop_now = match self.slots.get_mut(&path) {
            Some(slot) => {
                slot.linked = false;
                slot.entry.removed = true;
                slot.refs == 0
            }
            None => false,
        };
        if drop_now {
            self.drop_slot(path);
        }
    }

    /// A fid now refers to `path`.
    pub fn incref(&mut self, path: PathId) {
        if let Some(slot) = self.slots.get_mut(&path) {
            slot.refs += 1;
        }
    }

    /// A fid no longer refers to `path`.
    pub fn decref(&mut self, path: PathId) {
        let drop_now = match self.slots.get_mut(&path) {
            Some(slot) => {
                slot.refs = slot.refs.saturating_sub(1);
                slot.refs == 0 && !slot.linked
            }
            None => false,
        };
        if drop_now {
            self.drop_slot(path);
        }
    }

    /// Number of fids referring to `path`.
    pub fn refs(&self, path: PathId) -> usize {
        self.slots.get(&path).map_or(0, |s| s.refs)
    }

    fn drop_slot(&mut self, path: PathId) {
        if let Some(slot) = self.slots.remove(&path) {
            let e = slot.entry;
            self.strings.release(e.uid);
            self.strings.release(e.gid);
            self.strings.release(e.muid);
            debug!(path, "dropped entry");
        }
    }

    /// Issue a fresh path id.
    pub fn next_path(&mut self) -> PathId {
        self.last_path += 1;
        self.last_path
    }

    /// Make sure later path ids are above `path`.
    pub fn observe_path(&mut self, path: PathId) {
        if !is_reserved(path) && path > self.last_path {
            self.last_path = path;
        }
    }

    /// The most recently issued or observed path id.
    pub fn last_path(&self) -> PathId {
        self.last_path
    }

    /// Set an identity field of an entry.
    pub fn set_id(&mut self, path: PathId, field: IdField, value: &str) -> MetaResult<()> {
        let value = self.strings.intern(value);
        let entry = self
            .slots
            .get_mut(&path)
            .map(|s| &mut s.entry)
            .ok_or_else(|| MetaError::Corrupt(format!("no entry for path {:#x}", path)))?;
        let slot = match field {
            IdField::Uid => &mut entry.uid,
            IdField::Gid => &mut entry.gid,
            IdField::Muid => &mut entry.muid,
        };
        let old = mem::replace(slot, value);
        self.strings.release(old);
        Ok(())
    }

    /// Shared copy of an identity string.
    pub fn intern(&mut self, s: &str) -> Arc<str> {
        self.strings.intern(s)
    }

    /// Give back a string obtained from [`Tree::intern`].
    pub fn release(&mut self, s: Arc<str>) {
        self.strings.release(s);
    }

    /// The string table.
    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    /// Discard a file's contents: free every extent, zero the length and
    /// move to a new content version.
    pub fn truncate(&mut self, path: PathId, alloc: &mut BuddyAllocator) -> MetaResult<()> {
        let entry = self.entry_mut(path)?;
        entry.qid.vers = entry.qid.vers.wrapping_add(1);
        let Some(file) = entry.file_mut() else {
            return Ok(());
        };
        for ext in file.extents.drain(..) {
            alloc.free(ext)?;
        }
        file.length = 0;
        file.cvers = file.cvers.wrapping_add(1);
        debug!(path, cvers = file.cvers, "truncated file");
        Ok(())
    }

    /// Take an entry out of the namespace: detach it from its parent, free a
    /// file's extents and drop it from the path table. Returns the parent.
    pub fn remove(
        &mut self,
        path: PathId,
        alloc: &mut BuddyAllocator,
        mtime: u32,
        muid: &str,
    ) -> MetaResult<PathId> {
        let parent = self.detach(path)?;
        if let Some(file) = self.entry_mut(path)?.file_mut() {
            for ext in file.extents.drain(..) {
                alloc.free(ext)?;
            }
            file.length = 0;
        }
        self.unlink(path);
        let dir = self.entry_mut(parent)?;
        dir.qid.vers = dir.qid.vers.wrapping_add(1);
        dir.mtime = mtime;
        self.set_id(parent, IdField::Muid, muid)?;
        debug!(path, parent, "removed entry");
        Ok(parent)
    }

    /// Number of entries in the path table.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|(p, s)| s.linked && !is_reserved(**p))
            .count()
    }

    /// Returns true if only the root remains.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Every linked entry under `root` in depth-first order, with its depth.
    pub fn walk_from(&self, root: PathId) -> Vec<(usize, PathId)> {
        let mut out = Vec::new();
        let mut stack = vec![(0usize, root)];
        while let Some((depth, path)) = stack.pop() {
            let Some(entry) = self.get(path) else {
                continue;
            };
            out.push((depth, path));
            for c in entry.children().iter().rev() {
                stack.push((depth + 1, *c));
            }
        }
        out
    }

    /// Structural snapshot of the namespace, for comparing two trees.
    pub fn shape(&self) -> BTreeMap<PathId, EntryShape> {
        self.slots
            .iter()
            .filter(|(p, s)| s.linked && !is_reserved(**p))
            .map(|(p, s)| {
                let e = &s.entry;
                (
                    *p,
                    EntryShape {
                        parent: e.parent,
                        name: e.name.clone(),
                        mode: e.mode,
                        uid: e.uid.to_string(),
                        gid: e.gid.to_string(),
                        file: e.file().cloned(),
                        mtime: e.file().map(|_| e.mtime),
                        modified: e
                            .file()
                            .filter(|f| !f.extents.is_empty())
                            .map(|_| (e.qid.vers, e.muid.to_string())),
                        children: e.children().to_vec(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logfs_storage::AllocatorConfig;

    fn new_file<'a>(path: PathId, name: &'a str) -> NewEntry<'a> {
        NewEntry {
            path,
            name,
            mode: 0o644,
            uid: "glenda",
            gid: "sys",
            mtime: 50,
            cvers: 0,
        }
    }

    #[test]
    fn test_new_tree() {
        let tree = Tree::new("adm", 10);
        assert_eq!(tree.len(), 1);
        assert!(tree.lookup(ROOT_PATH).unwrap().is_dir());
        assert!(tree.lookup(CTL_PATH).is_none());
        assert!(tree.get(CTL_PATH).unwrap().is_pseudo());
        assert_eq!(tree.child(ALT_ROOT_PATH, "users"), Some(USERS_PATH));
    }

    #[test]
    fn test_create_appends_in_order() {
        let mut tree = Tree::new("adm", 10);
        for (i, name) in ["b", "a", "c"].iter().enumerate() {
            let path = tree.next_path();
            assert_eq!(path, i as u32 + 1);
            tree.create(ROOT_PATH, &new_file(path, name)).unwrap();
        }
        let names: Vec<&str> = tree
            .get(ROOT_PATH)
            .unwrap()
            .children()
            .iter()
            .map(|p| tree.get(*p).unwrap().name.as_str())
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(tree.get(ROOT_PATH).unwrap().qid.vers, 3);
        assert_eq!(tree.get(ROOT_PATH).unwrap().mtime, 50);
    }

    #[test]
    fn test_create_rejects_reused_path() {
        let mut tree = Tree::new("adm", 10);
        tree.create(ROOT_PATH, &new_file(5, "x")).unwrap();
        assert!(tree.create(ROOT_PATH, &new_file(5, "y")).unwrap_err().is_fatal());
        assert!(matches!(
            tree.create(5, &new_file(6, "z")).unwrap_err(),
            MetaError::NotDirectory
        ));
        assert_eq!(tree.next_path(), 6);
    }

    #[test]
    fn test_unlink_waits_for_last_reference() {
        let mut tree = Tree::new("adm", 10);
        tree.create(ROOT_PATH, &new_file(1, "f")).unwrap();
        tree.incref(1);
        tree.detach(1).unwrap();
        tree.unlink(1);
        assert!(tree.lookup(1).is_none());
        assert!(tree.get(1).unwrap().removed);
        tree.decref(1);
        assert!(tree.get(1).is_none());
    }

    #[test]
    fn test_strings_released_with_entry() {
        let mut tree = Tree::new("adm", 10);
        tree.create(ROOT_PATH, &new_file(1, "f")).unwrap();
        assert!(tree.strings().contains("glenda"));
        tree.detach(1).unwrap();
        tree.unlink(1);
        assert!(!tree.strings().contains("glenda"));
        assert!(tree.strings().contains("adm"));
    }

    #[test]
    fn test_set_id_swaps_strings() {
        let mut tree = Tree::new("adm", 10);
        tree.create(ROOT_PATH, &new_file(1, "f")).unwrap();
        tree.set_id(1, IdField::Gid, "bob").unwrap();
        assert_eq!(&*tree.get(1).unwrap().gid, "bob");
        assert!(!tree.strings().contains("sys"));
    }

    #[test]
    fn test_truncate_frees_extents() {
        let mut alloc = BuddyAllocator::new(AllocatorConfig {
            sector_size: 1024,
            length: 64 * 1024,
        })
        .unwrap();
        let mut tree = Tree::new("adm", 10);
        tree.create(ROOT_PATH, &new_file(1, "f")).unwrap();
        let ext = alloc.allocate(4096);
        {
            let file = tree.get_mut(1).unwrap().file_mut().unwrap();
            file.extents.push(ext);
            file.length = 4000;
        }
        tree.truncate(1, &mut alloc).unwrap();
        let file = tree.get(1).unwrap().file().unwrap();
        assert_eq!(file.cvers, 1);
        assert_eq!(file.length, 0);
        assert!(file.extents.is_empty());
        assert_eq!(alloc.free_bytes(), 64 * 1024);
    }

    #[test]
    fn test_locate() {
        let file = FileData {
            cvers: 0,
            length: 3072,
            extents: vec![Extent::new(0, 1024), Extent::new(4096, 2048)],
        };
        assert_eq!(file.locate(0), (0, 0, 0));
        assert_eq!(file.locate(1500), (1, 476, 1024));
        assert_eq!(file.locate(3072), (2, 0, 3072));
        assert_eq!(file.capacity(), 3072);
    }

    #[test]
    fn test_file_qid_carries_cvers() {
        let mut tree = Tree::new("adm", 10);
        tree.create(ROOT_PATH, &new_file(1, "f")).unwrap();
        let e = tree.get_mut(1).unwrap();
        e.qid.vers = 3;
        e.file_mut().unwrap().cvers = 2;
        assert_eq!(e.qid().vers, 3 | 2 << 16);
    }
}
