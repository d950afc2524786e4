//! Dentry tree, extents and index metadata.
//!
//! Ownership follows the on-tape model: the index owns the root dentry, a
//! directory owns its children through its child table, and the parent and
//! volume references dentries carry are weak. A dentry disappears when its
//! link count and handle count both reach zero.

use crate::error::{LtfsError, Result};
use crate::lock::Mrsw;
use crate::util::path;
use crate::util::time::LtfsTime;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use parking_lot::Mutex;

/// Current index schema version written by this implementation.
pub const INDEX_VERSION: &str = "2.4.0";
pub const INDEX_CREATOR: &str = "ltfs-core 0.1.0";

/// Longest accepted commit message, in bytes.
pub const MAX_COMMIT_MESSAGE: usize = 4096;

/// On-tape pointer: a label partition id (`'a'`/`'b'`) and a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapePtr {
    pub partition: char,
    pub block: u64,
}

impl TapePtr {
    pub fn new(partition: char, block: u64) -> Self {
        TapePtr { partition, block }
    }
}

/// One contiguous run of file bytes on the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub partition: char,
    pub start_block: u64,
    /// Offset of the first byte within the start block.
    pub byte_offset: u64,
    pub byte_count: u64,
    pub file_offset: u64,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.file_offset + self.byte_count
    }

    /// Number of the block just past this extent's last byte.
    pub fn last_block(&self, blocksize: u64) -> u64 {
        let span = self.byte_offset + self.byte_count;
        self.start_block + span / blocksize + u64::from(span % blocksize > 0)
    }

    /// Blocks this extent touches, for quota accounting.
    pub fn block_span(&self, blocksize: u64) -> u64 {
        self.last_block(blocksize) - self.start_block
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XAttr {
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DentryTimes {
    pub creation: LtfsTime,
    pub modify: LtfsTime,
    pub access: LtfsTime,
    pub change: LtfsTime,
    pub backup: LtfsTime,
}

impl DentryTimes {
    pub fn all(t: LtfsTime) -> Self {
        DentryTimes {
            creation: t,
            modify: t,
            access: t,
            change: t,
            backup: t,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DentryMeta {
    /// NFC-normalized name; empty for the root.
    pub name: String,
    /// Percent-encoded form, the key in the parent's child table.
    pub platform_safe_name: String,
    pub readonly: bool,
    pub immutable: bool,
    pub appendonly: bool,
    pub times: DentryTimes,
    /// Logical size; bytes past the last extent read as zeros.
    pub size: u64,
    /// Sum of extent byte counts.
    pub realsize: u64,
    pub used_blocks: u64,
    pub link_count: u32,
    pub xattrs: Vec<XAttr>,
    /// Whether the name matches the index placement criteria.
    pub matches_criteria: bool,
    pub dirty: bool,
    pub extents_dirty: bool,
    pub need_update_time: bool,
    pub deleted: bool,
}

impl DentryMeta {
    fn new(name: &str, readonly: bool, now: LtfsTime) -> Self {
        let nfc = path::normalize_name(name);
        DentryMeta {
            platform_safe_name: path::platform_safe_name(&nfc),
            name: nfc,
            readonly,
            immutable: false,
            appendonly: false,
            times: DentryTimes::all(now),
            size: 0,
            realsize: 0,
            used_blocks: 0,
            link_count: 1,
            xattrs: Vec::new(),
            matches_criteria: false,
            dirty: true,
            extents_dirty: false,
            need_update_time: false,
            deleted: false,
        }
    }

    pub fn xattr(&self, name: &str) -> Option<&XAttr> {
        self.xattrs.iter().find(|x| x.name == name)
    }

    pub fn set_xattr(&mut self, name: &str, value: &[u8]) {
        match self.xattrs.iter_mut().find(|x| x.name == name) {
            Some(x) => x.value = value.to_vec(),
            None => self.xattrs.push(XAttr {
                name: name.to_string(),
                value: value.to_vec(),
            }),
        }
        self.dirty = true;
    }

    pub fn remove_xattr(&mut self, name: &str) -> bool {
        let before = self.xattrs.len();
        self.xattrs.retain(|x| x.name != name);
        let removed = self.xattrs.len() != before;
        if removed {
            self.dirty = true;
        }
        removed
    }
}

#[derive(Debug)]
pub enum DentryData {
    Dir {
        /// Children keyed by platform-safe name.
        children: HashMap<String, Arc<Dentry>>,
    },
    File {
        /// Sorted by file offset, non-overlapping.
        extents: Vec<Extent>,
    },
    Symlink {
        target: String,
    },
}

pub struct Dentry {
    pub uid: u64,
    pub ino: u64,
    pub isdir: bool,
    pub isslink: bool,
    pub meta: Mrsw<DentryMeta>,
    pub contents: Mrsw<DentryData>,
    parent: Mutex<Weak<Dentry>>,
    numhandles: AtomicU32,
}

impl std::fmt::Debug for Dentry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dentry")
            .field("uid", &self.uid)
            .field("isdir", &self.isdir)
            .finish()
    }
}

impl Dentry {
    pub fn new_dir(uid: u64, name: &str, now: LtfsTime) -> Arc<Dentry> {
        Arc::new(Dentry {
            uid,
            ino: uid,
            isdir: true,
            isslink: false,
            meta: Mrsw::new(DentryMeta::new(name, false, now)),
            contents: Mrsw::new(DentryData::Dir {
                children: HashMap::new(),
            }),
            parent: Mutex::new(Weak::new()),
            numhandles: AtomicU32::new(0),
        })
    }

    pub fn new_file(uid: u64, name: &str, readonly: bool, now: LtfsTime) -> Arc<Dentry> {
        Arc::new(Dentry {
            uid,
            ino: uid,
            isdir: false,
            isslink: false,
            meta: Mrsw::new(DentryMeta::new(name, readonly, now)),
            contents: Mrsw::new(DentryData::File {
                extents: Vec::new(),
            }),
            parent: Mutex::new(Weak::new()),
            numhandles: AtomicU32::new(0),
        })
    }

    pub fn new_symlink(uid: u64, name: &str, target: &str, now: LtfsTime) -> Arc<Dentry> {
        Arc::new(Dentry {
            uid,
            ino: uid,
            isdir: false,
            isslink: true,
            meta: Mrsw::new(DentryMeta::new(name, true, now)),
            contents: Mrsw::new(DentryData::Symlink {
                target: target.to_string(),
            }),
            parent: Mutex::new(Weak::new()),
            numhandles: AtomicU32::new(0),
        })
    }

    pub fn parent(&self) -> Option<Arc<Dentry>> {
        self.parent.lock().upgrade()
    }

    pub fn set_parent(&self, parent: &Arc<Dentry>) {
        *self.parent.lock() = Arc::downgrade(parent);
    }

    pub fn clear_parent(&self) {
        *self.parent.lock() = Weak::new();
    }

    pub fn open_handle(&self) {
        self.numhandles.fetch_add(1, Ordering::SeqCst);
    }

    pub fn close_handle(&self) -> u32 {
        self.numhandles.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn handle_count(&self) -> u32 {
        self.numhandles.load(Ordering::SeqCst)
    }

    /// Look up a child by its platform-safe name.
    pub fn lookup(&self, platform_safe: &str) -> Option<Arc<Dentry>> {
        match &*self.contents.read() {
            DentryData::Dir { children } => children.get(platform_safe).cloned(),
            _ => None,
        }
    }

    /// Attach `child` under this directory. The caller already holds
    /// whatever operation-level locks apply; attachment itself takes the
    /// contents lock.
    pub fn attach_child(self: &Arc<Self>, child: &Arc<Dentry>) -> Result<()> {
        let key = child.meta.read().platform_safe_name.clone();
        match &mut *self.contents.write() {
            DentryData::Dir { children } => {
                if children.contains_key(&key) {
                    return Err(LtfsError::DentryExists(key));
                }
                children.insert(key, Arc::clone(child));
                child.set_parent(self);
                Ok(())
            }
            _ => Err(LtfsError::IsFile),
        }
    }

    /// Remove a child by platform-safe name; returns the detached dentry.
    pub fn detach_child(&self, platform_safe: &str) -> Result<Arc<Dentry>> {
        match &mut *self.contents.write() {
            DentryData::Dir { children } => match children.remove(platform_safe) {
                Some(child) => {
                    child.clear_parent();
                    Ok(child)
                }
                None => Err(LtfsError::NoDentry(platform_safe.to_string())),
            },
            _ => Err(LtfsError::IsFile),
        }
    }

    /// Children in stable uid order, the readdir ordering.
    pub fn children_by_uid(&self) -> Vec<Arc<Dentry>> {
        match &*self.contents.read() {
            DentryData::Dir { children } => {
                let mut list: Vec<_> = children.values().cloned().collect();
                list.sort_by_key(|d| d.uid);
                list
            }
            _ => Vec::new(),
        }
    }

    pub fn child_count(&self) -> usize {
        match &*self.contents.read() {
            DentryData::Dir { children } => children.len(),
            _ => 0,
        }
    }

    /// Snapshot of the extent list.
    pub fn extents(&self) -> Vec<Extent> {
        match &*self.contents.read() {
            DentryData::File { extents } => extents.clone(),
            _ => Vec::new(),
        }
    }

    pub fn symlink_target(&self) -> Option<String> {
        match &*self.contents.read() {
            DentryData::Symlink { target } => Some(target.clone()),
            _ => None,
        }
    }
}

// --- extent list maintenance ---------------------------------------------

/// Insert `ext` into a sorted extent list, truncating, splitting or
/// deleting whatever it overlaps. Returns the new realsize.
pub fn insert_extent(extents: &mut Vec<Extent>, ext: Extent, blocksize: u64) -> u64 {
    let new_start = ext.file_offset;
    let new_end = ext.end();

    let mut replacement: Vec<Extent> = Vec::with_capacity(extents.len() + 2);
    for old in extents.iter().copied() {
        let old_start = old.file_offset;
        let old_end = old.end();
        if old_end <= new_start || old_start >= new_end {
            replacement.push(old);
            continue;
        }
        // Head survives when the old extent starts before the new one.
        if old_start < new_start {
            let mut head = old;
            head.byte_count = new_start - old_start;
            replacement.push(head);
        }
        // Tail survives when the old extent ends past the new one.
        if old_end > new_end {
            let delta = new_end - old_start;
            let mut tail = old;
            let shifted = tail.byte_offset + delta;
            tail.start_block += shifted / blocksize;
            tail.byte_offset = shifted % blocksize;
            tail.file_offset = new_end;
            tail.byte_count = old_end - new_end;
            replacement.push(tail);
        }
    }

    // Insert in file-offset order, then try to merge with the predecessor.
    let pos = replacement
        .iter()
        .position(|e| e.file_offset > new_start)
        .unwrap_or(replacement.len());
    replacement.insert(pos, ext);

    if pos > 0 {
        let prev = replacement[pos - 1];
        let cur = replacement[pos];
        let prev_tail = prev.byte_offset + prev.byte_count;
        let contiguous_on_tape = cur.partition == prev.partition
            && cur.byte_offset == 0
            && prev_tail % blocksize == 0
            && cur.start_block == prev.start_block + prev_tail / blocksize;
        if contiguous_on_tape && prev.end() == cur.file_offset {
            replacement[pos - 1].byte_count += cur.byte_count;
            replacement.remove(pos);
        }
    }

    *extents = replacement;
    extents.iter().map(|e| e.byte_count).sum()
}

/// Shrink the extent list to `length` logical bytes; returns the new
/// realsize. Growing is the caller's concern (sparse tail, no extent work).
pub fn truncate_extents(extents: &mut Vec<Extent>, length: u64) -> u64 {
    extents.retain(|e| e.file_offset < length);
    if let Some(last) = extents.last_mut() {
        if last.end() > length {
            last.byte_count = length - last.file_offset;
        }
    }
    extents.iter().map(|e| e.byte_count).sum()
}

/// Index placement criteria: which files belong on the index partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCriteria {
    pub max_filesize: u64,
    pub glob_patterns: Vec<String>,
    pub allow_update: bool,
}

impl Default for IndexCriteria {
    fn default() -> Self {
        IndexCriteria {
            max_filesize: 0,
            glob_patterns: Vec::new(),
            allow_update: true,
        }
    }
}

impl IndexCriteria {
    /// Does a file name match any placement pattern?
    pub fn matches_name(&self, name: &str) -> bool {
        self.glob_patterns.iter().any(|p| glob_match(p, name))
    }
}

/// Minimal glob: `*` and `?` wildcards, case-sensitive, no classes.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[char], n: &[char]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some('?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    inner(&p, &n)
}

/// A point-in-time snapshot of the namespace plus its chain metadata.
pub struct Index {
    pub version: String,
    pub creator: String,
    pub vol_uuid: String,
    pub generation: u64,
    pub mod_time: LtfsTime,
    /// Where this index was read from or last written to.
    pub selfptr: Option<TapePtr>,
    /// Previous index in the chain; `None` for the first generation.
    pub backptr: Option<TapePtr>,
    pub volume_name: Option<String>,
    pub commit_message: Option<String>,
    pub criteria: IndexCriteria,
    /// Unrecognized index-level elements, round-tripped verbatim.
    pub preserved_tags: Vec<String>,
    pub root: Arc<Dentry>,
    pub highest_uid: u64,
    pub file_count: u64,
    pub dirty: bool,
}

impl Index {
    /// Fresh empty index for a newly labeled volume. Generation zero; the
    /// first sync assigns one.
    pub fn new_empty(vol_uuid: &str, now: LtfsTime) -> Index {
        let root = Dentry::new_dir(1, "", now);
        root.meta.write().dirty = false;
        Index {
            version: INDEX_VERSION.to_string(),
            creator: INDEX_CREATOR.to_string(),
            vol_uuid: vol_uuid.to_string(),
            generation: 0,
            mod_time: now,
            selfptr: None,
            backptr: None,
            volume_name: None,
            commit_message: None,
            criteria: IndexCriteria::default(),
            preserved_tags: Vec::new(),
            root,
            highest_uid: 1,
            file_count: 0,
            dirty: false,
        }
    }

    pub fn alloc_uid(&mut self) -> u64 {
        self.highest_uid += 1;
        self.highest_uid
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Check the schema version is one we can parse.
    pub fn check_version(version: &str) -> Result<()> {
        if version.starts_with("2.") {
            Ok(())
        } else {
            Err(LtfsError::UnsupportedIndexVersion(version.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u64 = 512 * 1024;

    fn ext(partition: char, start_block: u64, byte_offset: u64, byte_count: u64, file_offset: u64) -> Extent {
        Extent {
            partition,
            start_block,
            byte_offset,
            byte_count,
            file_offset,
        }
    }

    #[test]
    fn tree_attach_detach() {
        let now = LtfsTime::now();
        let root = Dentry::new_dir(1, "", now);
        let file = Dentry::new_file(2, "a.txt", false, now);
        root.attach_child(&file).unwrap();
        assert!(Arc::ptr_eq(&file.parent().unwrap(), &root));
        assert!(root.lookup("a.txt").is_some());
        assert!(matches!(
            root.attach_child(&file),
            Err(LtfsError::DentryExists(_))
        ));
        root.detach_child("a.txt").unwrap();
        assert!(file.parent().is_none());
        assert_eq!(root.child_count(), 0);
    }

    #[test]
    fn readdir_order_is_uid_order() {
        let now = LtfsTime::now();
        let root = Dentry::new_dir(1, "", now);
        for (uid, name) in [(5, "zzz"), (3, "aaa"), (9, "mmm")] {
            root.attach_child(&Dentry::new_file(uid, name, false, now)).unwrap();
        }
        let uids: Vec<u64> = root.children_by_uid().iter().map(|d| d.uid).collect();
        assert_eq!(uids, vec![3, 5, 9]);
    }

    #[test]
    fn append_and_coalesce() {
        let mut list = Vec::new();
        // One full block then a continuation starting on the next block.
        insert_extent(&mut list, ext('b', 4, 0, BS, 0), BS);
        let realsize = insert_extent(&mut list, ext('b', 5, 0, 100, BS), BS);
        assert_eq!(list.len(), 1);
        assert_eq!(realsize, BS + 100);
        assert_eq!(list[0].byte_count, BS + 100);
    }

    #[test]
    fn no_coalesce_across_partition_or_gap() {
        let mut list = Vec::new();
        insert_extent(&mut list, ext('b', 4, 0, BS, 0), BS);
        insert_extent(&mut list, ext('a', 5, 0, 100, BS), BS);
        assert_eq!(list.len(), 2);

        let mut list2 = Vec::new();
        insert_extent(&mut list2, ext('b', 4, 0, 100, 0), BS);
        // Previous extent does not end on a block boundary.
        insert_extent(&mut list2, ext('b', 5, 0, 100, 100), BS);
        assert_eq!(list2.len(), 2);
    }

    #[test]
    fn overwrite_splits_spanning_extent() {
        let mut list = Vec::new();
        insert_extent(&mut list, ext('b', 4, 0, 3000, 0), BS);
        // Overwrite bytes 1000..2000.
        insert_extent(&mut list, ext('b', 10, 0, 1000, 1000), BS);
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].byte_count, 1000);
        assert_eq!(list[1].file_offset, 1000);
        assert_eq!(list[2].file_offset, 2000);
        assert_eq!(list[2].byte_count, 1000);
        // The tail keeps pointing into the original block.
        assert_eq!(list[2].start_block, 4);
        assert_eq!(list[2].byte_offset, 2000);
        // Invariant: non-overlapping and sorted.
        for pair in list.windows(2) {
            assert!(pair[0].end() <= pair[1].file_offset);
        }
    }

    #[test]
    fn overwrite_deletes_covered_extents() {
        let mut list = Vec::new();
        insert_extent(&mut list, ext('b', 4, 0, 100, 0), BS);
        insert_extent(&mut list, ext('b', 5, 0, 100, 100), BS);
        let realsize = insert_extent(&mut list, ext('b', 6, 0, 200, 0), BS);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].start_block, 6);
        assert_eq!(realsize, 200);
    }

    #[test]
    fn truncate_shrinks_and_drops() {
        let mut list = Vec::new();
        insert_extent(&mut list, ext('b', 4, 0, 1000, 0), BS);
        insert_extent(&mut list, ext('b', 5, 0, 1000, 1000), BS);
        let realsize = truncate_extents(&mut list, 1500);
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].byte_count, 500);
        assert_eq!(realsize, 1500);
        let realsize = truncate_extents(&mut list, 0);
        assert!(list.is_empty());
        assert_eq!(realsize, 0);
    }

    #[test]
    fn glob_basics() {
        assert!(glob_match("*.txt", "a.txt"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("*.txt", "a.txt.bak"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn criteria_name_match() {
        let criteria = IndexCriteria {
            max_filesize: 1024,
            glob_patterns: vec!["*.xml".into(), "readme*".into()],
            allow_update: true,
        };
        assert!(criteria.matches_name("index.xml"));
        assert!(criteria.matches_name("readme.md"));
        assert!(!criteria.matches_name("data.bin"));
    }

    #[test]
    fn fresh_index_shape() {
        let idx = Index::new_empty("u-u-i-d", LtfsTime::now());
        assert_eq!(idx.generation, 0);
        assert!(!idx.dirty);
        assert_eq!(idx.root.meta.read().link_count, 1);
        assert!(idx.selfptr.is_none());
        assert!(idx.backptr.is_none());
    }
}
