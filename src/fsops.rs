//! Public path-level filesystem operations.
//!
//! Every operation normalizes its paths, takes the volume lock (shared for
//! ordinary file operations, exclusive for namespace surgery like rename),
//! honors the WORM flags, and mirrors namespace changes through the dentry
//! cache when one is installed. An external adapter maps these calls and
//! their error codes onto OS filesystem entry points.

use crate::error::{LtfsError, Result};
use crate::fsraw;
use crate::index::types::{Dentry, DentryTimes};
use crate::util::path;
use crate::util::time::LtfsTime;
use crate::volume::{SyncReason, Volume};
use crate::xattr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// An open file or directory handle.
pub struct FileHandle {
    pub dentry: Arc<Dentry>,
    pub open_write: bool,
    /// Snapshot of the dentry's readonly flag at open time.
    pub readonly: bool,
    pub use_iosched: bool,
}

/// One readdir entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub uid: u64,
    pub isdir: bool,
    pub isslink: bool,
    pub size: u64,
    pub modify_time: LtfsTime,
}

/// Attribute snapshot returned by `getattr`.
#[derive(Debug, Clone)]
pub struct Attributes {
    pub uid: u64,
    pub ino: u64,
    pub isdir: bool,
    pub isslink: bool,
    pub readonly: bool,
    pub immutable: bool,
    pub appendonly: bool,
    pub size: u64,
    pub realsize: u64,
    pub used_blocks: u64,
    pub link_count: u32,
    pub times: DentryTimes,
}

// --- lookup ----------------------------------------------------------------

/// Walk the in-memory tree to a dentry. Components compare in NFC through
/// their platform-safe form.
pub fn lookup_path(vol: &Volume, path_str: &str) -> Result<Arc<Dentry>> {
    let components = path::split(path_str)?;
    let mut current = vol.index.read().root.clone();
    for component in &components {
        if !current.isdir {
            return Err(LtfsError::IsFile);
        }
        let key = path::platform_safe_name(&path::normalize_name(component));
        current = current
            .lookup(&key)
            .ok_or_else(|| LtfsError::NoDentry(component.clone()))?;
    }
    Ok(current)
}

fn lookup_parent(vol: &Volume, path_str: &str) -> Result<(Arc<Dentry>, String)> {
    let mut components = path::split(path_str)?;
    let name = components.pop().ok_or(LtfsError::UnlinkRoot)?;
    let mut current = vol.index.read().root.clone();
    for component in &components {
        let key = path::platform_safe_name(&path::normalize_name(component));
        current = current
            .lookup(&key)
            .ok_or_else(|| LtfsError::NoDentry(component.clone()))?;
        if !current.isdir {
            return Err(LtfsError::IsFile);
        }
    }
    Ok((current, path::normalize_name(&name)))
}

fn dcache_notify<F>(vol: &Volume, f: F)
where
    F: FnOnce(&mut dyn crate::dcache::DentryCache) -> Result<()>,
{
    if let Some(dcache) = vol.dcache.lock().as_mut() {
        if let Err(e) = f(dcache.as_mut()) {
            tracing::warn!("dentry cache update failed: {}", e);
        }
    }
}

// --- open / close ----------------------------------------------------------

pub fn open(vol: &Arc<Volume>, path_str: &str, open_write: bool, use_iosched: bool) -> Result<FileHandle> {
    let _vol_read = vol.lock.read();

    // A dentry cache, when installed, is the authority on name presence.
    if let Some(dcache) = vol.dcache.lock().as_mut() {
        dcache.open(path_str)?;
    }
    let dentry = lookup_path(vol, path_str)?;

    if open_write && dentry.isslink {
        return Err(LtfsError::RdonlyVolume);
    }
    if open_write && vol.is_readonly_mount() {
        return Err(LtfsError::RdonlyVolume);
    }

    let readonly = dentry.meta.read().readonly;
    dentry.open_handle();
    vol.file_open_count.fetch_add(1, Ordering::SeqCst);

    if use_iosched {
        if let Some(sched) = vol.iosched.lock().as_mut() {
            sched.open(&dentry, open_write)?;
        }
    }
    debug!("open '{}' (write={})", path_str, open_write);
    Ok(FileHandle {
        dentry,
        open_write,
        readonly,
        use_iosched,
    })
}

pub fn close(vol: &Arc<Volume>, handle: FileHandle) -> Result<()> {
    let FileHandle {
        dentry,
        open_write,
        use_iosched,
        ..
    } = handle;

    if use_iosched {
        if let Some(sched) = vol.iosched.lock().as_mut() {
            sched.close(&dentry, open_write)?;
        }
    }

    {
        let mut meta = dentry.meta.write();
        if meta.need_update_time {
            meta.times.change = LtfsTime::now();
            meta.need_update_time = false;
            meta.dirty = true;
        }
    }

    dentry.close_handle();
    vol.file_open_count.fetch_sub(1, Ordering::SeqCst);
    Ok(())
}

// --- create / unlink -------------------------------------------------------

pub fn create(
    vol: &Arc<Volume>,
    path_str: &str,
    isdir: bool,
    readonly: bool,
    overwrite: bool,
) -> Result<Arc<Dentry>> {
    if vol.is_readonly_mount() || vol.is_write_locked() {
        return Err(LtfsError::RdonlyVolume);
    }
    {
        let mut dev = vol.device.lock();
        dev.test_unit_ready()?;
    }

    let _vol_read = vol.lock.read();
    let (parent, name) = lookup_parent(vol, path_str)?;
    path::validate_name(&name)?;

    let parent_meta = parent.meta.read().clone();
    if parent_meta.immutable {
        return Err(LtfsError::WormEnabled);
    }
    if overwrite && parent_meta.appendonly {
        return Err(LtfsError::WormEnabled);
    }

    let key = path::platform_safe_name(&name);
    if let Some(existing) = parent.lookup(&key) {
        if !overwrite || existing.isdir || isdir {
            return Err(LtfsError::DentryExists(name));
        }
        // Overwrite of an existing file reuses the dentry, emptied.
        fsraw::truncate(vol, &existing, 0)?;
        return Ok(existing);
    }

    let now = LtfsTime::now();
    let (uid, matches) = {
        let mut index = vol.index.write();
        let uid = index.alloc_uid();
        (uid, index.criteria.matches_name(&name))
    };
    let dentry = if isdir {
        Dentry::new_dir(uid, &name, now)
    } else {
        Dentry::new_file(uid, &name, readonly, now)
    };
    {
        let mut meta = dentry.meta.write();
        meta.matches_criteria = matches;
        // Entries born into an append-only directory inherit the flag.
        if parent_meta.appendonly {
            meta.appendonly = true;
            meta.set_xattr(xattr::APPENDONLY_EA, b"1");
        }
    }
    parent.attach_child(&dentry)?;
    {
        let mut parent_meta = parent.meta.write();
        parent_meta.times.modify = now;
        parent_meta.times.change = now;
        parent_meta.dirty = true;
    }
    {
        let mut index = vol.index.write();
        if !isdir {
            index.file_count += 1;
        }
        index.mark_dirty();
    }

    dcache_notify(vol, |d| d.create(path_str, isdir));
    debug!("created {} '{}' (uid {})", if isdir { "dir" } else { "file" }, path_str, uid);
    Ok(dentry)
}

pub fn unlink(vol: &Arc<Volume>, path_str: &str) -> Result<()> {
    if vol.is_readonly_mount() || vol.is_write_locked() {
        return Err(LtfsError::RdonlyVolume);
    }
    let _vol_read = vol.lock.read();
    let (parent, name) = lookup_parent(vol, path_str)?;
    let key = path::platform_safe_name(&name);
    let dentry = parent
        .lookup(&key)
        .ok_or_else(|| LtfsError::NoDentry(name.clone()))?;

    {
        let parent_meta = parent.meta.read();
        if parent_meta.immutable || parent_meta.appendonly {
            return Err(LtfsError::WormEnabled);
        }
    }
    {
        let meta = dentry.meta.read();
        if meta.immutable || meta.appendonly {
            return Err(LtfsError::WormEnabled);
        }
    }
    if dentry.isdir && dentry.child_count() > 0 {
        return Err(LtfsError::DirNotEmpty);
    }

    parent.detach_child(&key)?;
    let used = {
        let mut meta = dentry.meta.write();
        meta.link_count = meta.link_count.saturating_sub(1);
        meta.deleted = true;
        meta.used_blocks
    };
    vol.valid_block_count.fetch_sub(used, Ordering::SeqCst);

    let now = LtfsTime::now();
    {
        let mut parent_meta = parent.meta.write();
        parent_meta.times.modify = now;
        parent_meta.times.change = now;
        parent_meta.dirty = true;
    }
    {
        let mut index = vol.index.write();
        if !dentry.isdir {
            index.file_count = index.file_count.saturating_sub(1);
        }
        index.mark_dirty();
    }

    if let Some(sched) = vol.iosched.lock().as_mut() {
        let _ = sched.drop_placement(&dentry);
    }
    dcache_notify(vol, |d| d.unlink(path_str));
    debug!("unlinked '{}'", path_str);
    Ok(())
}

// --- rename ----------------------------------------------------------------

/// True when `candidate` is `node` or lies underneath it.
fn is_self_or_descendant(node: &Arc<Dentry>, candidate: &Arc<Dentry>) -> bool {
    let mut cursor = Some(candidate.clone());
    while let Some(current) = cursor {
        if Arc::ptr_eq(&current, node) {
            return true;
        }
        cursor = current.parent();
    }
    false
}

pub fn rename(vol: &Arc<Volume>, from: &str, to: &str) -> Result<()> {
    if vol.is_readonly_mount() || vol.is_write_locked() {
        return Err(LtfsError::RdonlyVolume);
    }

    // Renames serialize against each other and exclude every other
    // operation: the whole tree shape is in motion.
    let _rename = vol.rename_lock.lock();
    let _vol_write = vol.lock.write();

    let (src_parent, src_name) =
        lookup_parent(vol, from).map_err(|_| LtfsError::InvalidSrcPath(from.to_string()))?;
    let src_key = path::platform_safe_name(&src_name);
    let dentry = src_parent
        .lookup(&src_key)
        .ok_or_else(|| LtfsError::InvalidSrcPath(from.to_string()))?;

    let (dst_parent, dst_name) = lookup_parent(vol, to)?;
    path::validate_name(&dst_name)?;
    let dst_key = path::platform_safe_name(&dst_name);

    // A directory cannot move into its own subtree.
    if dentry.isdir && is_self_or_descendant(&dentry, &dst_parent) {
        return Err(LtfsError::RenameLoop);
    }

    let cross_directory = !Arc::ptr_eq(&src_parent, &dst_parent);
    {
        let meta = dentry.meta.read();
        if cross_directory && (meta.immutable || meta.appendonly) {
            return Err(LtfsError::WormEnabled);
        }
    }
    for parent in [&src_parent, &dst_parent] {
        let meta = parent.meta.read();
        if meta.immutable || meta.appendonly {
            return Err(LtfsError::WormEnabled);
        }
    }

    // An existing, distinct target is unlinked first.
    if let Some(existing) = dst_parent.lookup(&dst_key) {
        if Arc::ptr_eq(&existing, &dentry) {
            return Ok(());
        }
        if existing.isdir && !dentry.isdir {
            return Err(LtfsError::IsDirectory);
        }
        if !existing.isdir && dentry.isdir {
            return Err(LtfsError::IsFile);
        }
        if existing.isdir && existing.child_count() > 0 {
            return Err(LtfsError::DirNotEmpty);
        }
        dst_parent.detach_child(&dst_key)?;
        let used = {
            let mut meta = existing.meta.write();
            meta.link_count = meta.link_count.saturating_sub(1);
            meta.deleted = true;
            meta.used_blocks
        };
        vol.valid_block_count.fetch_sub(used, Ordering::SeqCst);
        let mut index = vol.index.write();
        if !existing.isdir {
            index.file_count = index.file_count.saturating_sub(1);
        }
    }

    src_parent.detach_child(&src_key)?;
    let now = LtfsTime::now();
    let old_name = {
        let mut meta = dentry.meta.write();
        let old_name = meta.name.clone();
        let nfc = path::normalize_name(&dst_name);
        meta.platform_safe_name = path::platform_safe_name(&nfc);
        meta.name = nfc;
        meta.times.change = now;
        meta.dirty = true;
        meta.matches_criteria = vol.index.read().criteria.matches_name(&meta.name);
        old_name
    };
    if let Err(e) = dst_parent.attach_child(&dentry) {
        // Put the entry back where it was; the tree must never lose it.
        {
            let mut meta = dentry.meta.write();
            meta.platform_safe_name = path::platform_safe_name(&old_name);
            meta.name = old_name;
        }
        let _ = src_parent.attach_child(&dentry);
        return Err(e);
    }

    for parent in [&src_parent, &dst_parent] {
        let mut meta = parent.meta.write();
        meta.times.modify = now;
        meta.times.change = now;
        meta.dirty = true;
    }
    vol.index.write().mark_dirty();

    dcache_notify(vol, |d| d.rename(from, to));
    info!("renamed '{}' -> '{}'", from, to);
    Ok(())
}

// --- attributes ------------------------------------------------------------

pub fn getattr(vol: &Volume, path_str: &str) -> Result<Attributes> {
    let _vol_read = vol.lock.read();
    let dentry = lookup_path(vol, path_str)?;
    let meta = dentry.meta.read();
    Ok(Attributes {
        uid: dentry.uid,
        ino: dentry.ino,
        isdir: dentry.isdir,
        isslink: dentry.isslink,
        readonly: meta.readonly,
        immutable: meta.immutable,
        appendonly: meta.appendonly,
        size: meta.size,
        realsize: meta.realsize,
        used_blocks: meta.used_blocks,
        link_count: meta.link_count,
        times: meta.times,
    })
}

pub fn utimens(vol: &Volume, path_str: &str, times: DentryTimes) -> Result<()> {
    if vol.is_readonly_mount() {
        return Err(LtfsError::RdonlyVolume);
    }
    let _vol_read = vol.lock.read();
    let dentry = lookup_path(vol, path_str)?;
    {
        let mut meta = dentry.meta.write();
        if meta.immutable {
            return Err(LtfsError::WormEnabled);
        }
        meta.times = times;
        meta.dirty = true;
    }
    vol.index.write().mark_dirty();
    Ok(())
}

pub fn set_readonly(vol: &Volume, path_str: &str, readonly: bool) -> Result<()> {
    if vol.is_readonly_mount() {
        return Err(LtfsError::RdonlyVolume);
    }
    let _vol_read = vol.lock.read();
    let dentry = lookup_path(vol, path_str)?;
    {
        let mut meta = dentry.meta.write();
        if meta.immutable {
            return Err(LtfsError::WormEnabled);
        }
        meta.readonly = readonly;
        meta.times.change = LtfsTime::now();
        meta.dirty = true;
    }
    vol.index.write().mark_dirty();
    Ok(())
}

// --- data path -------------------------------------------------------------

fn check_write_allowed(vol: &Volume, handle: &FileHandle, offset: u64) -> Result<()> {
    if !handle.open_write {
        return Err(LtfsError::RdonlyVolume);
    }
    let meta = handle.dentry.meta.read();
    if meta.immutable {
        return Err(LtfsError::WormEnabled);
    }
    if meta.appendonly && offset != meta.size {
        return Err(LtfsError::WormEnabled);
    }
    drop(meta);
    if vol.is_readonly_mount() || vol.is_write_locked() {
        return Err(LtfsError::RdonlyVolume);
    }
    Ok(())
}

/// Pick the partition a write lands on: small files matching the placement
/// criteria go to the index partition.
fn placement(vol: &Volume, handle: &FileHandle, end: u64) -> char {
    let index = vol.index.read();
    let meta = handle.dentry.meta.read();
    if meta.matches_criteria
        && index.criteria.max_filesize > 0
        && end <= index.criteria.max_filesize
    {
        vol.partid_ip()
    } else {
        vol.partid_dp()
    }
}

pub fn write(vol: &Arc<Volume>, handle: &FileHandle, buf: &[u8], offset: u64) -> Result<()> {
    check_write_allowed(vol, handle, offset)?;
    if handle.use_iosched {
        if let Some(sched) = vol.iosched.lock().as_mut() {
            let _vol_read = vol.lock.read();
            return sched.write(&handle.dentry, buf, offset);
        }
    }
    // The raw path manages the volume lock itself (write for positioning,
    // downgraded for the transfer).
    let partition = placement(vol, handle, offset + buf.len() as u64);
    fsraw::write(vol, &handle.dentry, buf, offset, partition)
}

pub fn read(vol: &Arc<Volume>, handle: &FileHandle, buf: &mut [u8], offset: u64) -> Result<usize> {
    let _vol_read = vol.lock.read();
    {
        let mut meta = handle.dentry.meta.write();
        meta.times.access = LtfsTime::now();
        meta.need_update_time = true;
    }
    if handle.use_iosched {
        if let Some(sched) = vol.iosched.lock().as_mut() {
            return sched.read(&handle.dentry, buf, offset);
        }
    }
    fsraw::read(vol, &handle.dentry, buf, offset)
}

pub fn truncate(vol: &Arc<Volume>, handle: &FileHandle, length: u64) -> Result<()> {
    check_write_allowed(vol, handle, length)?;
    let _vol_read = vol.lock.read();
    if handle.use_iosched {
        if let Some(sched) = vol.iosched.lock().as_mut() {
            return sched.truncate(&handle.dentry, length);
        }
    }
    fsraw::truncate(vol, &handle.dentry, length)
}

/// Flush one handle (or everything) out of the scheduler.
pub fn flush(vol: &Arc<Volume>, handle: Option<&FileHandle>) -> Result<()> {
    if let Some(sched) = vol.iosched.lock().as_mut() {
        return sched.flush(handle.map(|h| &h.dentry));
    }
    Ok(())
}

// --- directory listing -----------------------------------------------------

pub fn readdir<F>(vol: &Volume, path_str: &str, mut filler: F) -> Result<()>
where
    F: FnMut(&DirEntry),
{
    let _vol_read = vol.lock.read();
    let dentry = lookup_path(vol, path_str)?;
    if !dentry.isdir {
        return Err(LtfsError::IsFile);
    }
    for child in dentry.children_by_uid() {
        let meta = child.meta.read();
        filler(&DirEntry {
            name: meta.name.clone(),
            uid: child.uid,
            isdir: child.isdir,
            isslink: child.isslink,
            size: meta.size,
            modify_time: meta.times.modify,
        });
    }
    Ok(())
}

// --- symlinks --------------------------------------------------------------

pub fn symlink_path(vol: &Arc<Volume>, target: &str, linkpath: &str) -> Result<Arc<Dentry>> {
    if vol.is_readonly_mount() || vol.is_write_locked() {
        return Err(LtfsError::RdonlyVolume);
    }
    let _vol_read = vol.lock.read();
    let (parent, name) = lookup_parent(vol, linkpath)?;
    path::validate_name(&name)?;
    if parent.meta.read().immutable {
        return Err(LtfsError::WormEnabled);
    }
    let key = path::platform_safe_name(&name);
    if parent.lookup(&key).is_some() {
        return Err(LtfsError::DentryExists(name));
    }

    let now = LtfsTime::now();
    let uid = vol.index.write().alloc_uid();
    let dentry = Dentry::new_symlink(uid, &name, target, now);

    // LiveLink: an absolute target under the mountpoint is stored with its
    // prefix length, so a future mount at a different point can re-prefix.
    if vol.opts.livelink {
        if let Some(mountpoint) = &vol.opts.mountpoint {
            if target.starts_with(mountpoint.as_str()) {
                dentry
                    .meta
                    .write()
                    .set_xattr(xattr::LIVELINK_EA, mountpoint.len().to_string().as_bytes());
            }
        }
    }

    parent.attach_child(&dentry)?;
    {
        let mut parent_meta = parent.meta.write();
        parent_meta.times.modify = now;
        parent_meta.times.change = now;
        parent_meta.dirty = true;
    }
    {
        let mut index = vol.index.write();
        index.file_count += 1;
        index.mark_dirty();
    }
    dcache_notify(vol, |d| d.create(linkpath, false));
    Ok(dentry)
}

pub fn readlink_path(vol: &Volume, path_str: &str) -> Result<String> {
    let _vol_read = vol.lock.read();
    let dentry = lookup_path(vol, path_str)?;
    let target = dentry.symlink_target().ok_or(LtfsError::IsFile)?;

    if vol.opts.livelink {
        let prefix_len = dentry
            .meta
            .read()
            .xattr(xattr::LIVELINK_EA)
            .and_then(|x| std::str::from_utf8(&x.value).ok()?.parse::<usize>().ok())
            .unwrap_or(0);
        if prefix_len > 0 && prefix_len <= target.len() {
            if let Some(mountpoint) = &vol.opts.mountpoint {
                return Ok(format!("{}{}", mountpoint, &target[prefix_len..]));
            }
        }
    }
    Ok(target)
}

// --- sync ------------------------------------------------------------------

/// Flush everything, then write a new index generation.
pub fn volume_sync(vol: &Arc<Volume>, reason: SyncReason) -> Result<()> {
    flush(vol, None)?;
    vol.sync_index(reason, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::sim::SimTape;
    use crate::tape::TapeDevice;
    use crate::volume::{MountOptions, MountType};

    fn mounted() -> Arc<Volume> {
        let dev = TapeDevice::open(Box::new(SimTape::new())).unwrap();
        let mut opts = MountOptions::default();
        opts.enable_lbp = false;
        opts.sync_period = None;
        let vol = Volume::new(dev, opts);
        vol.format_volume("ABC123", 1024).unwrap();
        vol.mount(MountType::ReadWrite).unwrap();
        vol
    }

    #[test]
    fn create_open_write_read_close() {
        let vol = mounted();
        create(&vol, "/a.txt", false, false, false).unwrap();
        let handle = open(&vol, "/a.txt", true, false).unwrap();
        assert!(!handle.readonly);
        write(&vol, &handle, b"hello", 0).unwrap();
        let mut buf = [0u8; 16];
        let n = read(&vol, &handle, &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello");
        close(&vol, handle).unwrap();
        assert_eq!(vol.file_open_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn open_handle_reflects_readonly_flag() {
        let vol = mounted();
        create(&vol, "/ro.txt", false, true, false).unwrap();
        let handle = open(&vol, "/ro.txt", true, false).unwrap();
        assert!(handle.readonly);
    }

    #[test]
    fn create_rejects_duplicate() {
        let vol = mounted();
        create(&vol, "/x", false, false, false).unwrap();
        assert!(matches!(
            create(&vol, "/x", false, false, false),
            Err(LtfsError::DentryExists(_))
        ));
    }

    #[test]
    fn unlink_root_rejected() {
        let vol = mounted();
        assert!(matches!(unlink(&vol, "/"), Err(LtfsError::UnlinkRoot)));
    }

    #[test]
    fn unlink_nonempty_dir_rejected() {
        let vol = mounted();
        create(&vol, "/d", true, false, false).unwrap();
        create(&vol, "/d/f", false, false, false).unwrap();
        assert!(matches!(unlink(&vol, "/d"), Err(LtfsError::DirNotEmpty)));
        unlink(&vol, "/d/f").unwrap();
        unlink(&vol, "/d").unwrap();
        assert!(matches!(
            lookup_path(&vol, "/d"),
            Err(LtfsError::NoDentry(_))
        ));
    }

    #[test]
    fn rename_into_own_subtree_rejected() {
        let vol = mounted();
        create(&vol, "/a", true, false, false).unwrap();
        create(&vol, "/a/b", true, false, false).unwrap();
        let err = rename(&vol, "/a", "/a/b/a2");
        assert!(matches!(err, Err(LtfsError::RenameLoop)));
        // Tree unchanged.
        assert!(lookup_path(&vol, "/a/b").is_ok());
    }

    #[test]
    fn rename_replaces_existing_target() {
        let vol = mounted();
        create(&vol, "/dir1", true, false, false).unwrap();
        create(&vol, "/dir2", true, false, false).unwrap();
        create(&vol, "/dir1/x", false, false, false).unwrap();
        create(&vol, "/dir2/x", false, false, false).unwrap();
        let count_before = vol.index.read().file_count;

        rename(&vol, "/dir1/x", "/dir2/x").unwrap();
        assert!(matches!(
            lookup_path(&vol, "/dir1/x"),
            Err(LtfsError::NoDentry(_))
        ));
        assert!(lookup_path(&vol, "/dir2/x").is_ok());
        // The replaced target was unlinked: net file count down by one.
        assert_eq!(vol.index.read().file_count, count_before - 1);
    }

    #[test]
    fn worm_flags_block_writes() {
        let vol = mounted();
        create(&vol, "/w", false, false, false).unwrap();
        let handle = open(&vol, "/w", true, false).unwrap();
        write(&vol, &handle, b"1234", 0).unwrap();

        handle.dentry.meta.write().immutable = true;
        assert!(matches!(
            write(&vol, &handle, b"x", 0),
            Err(LtfsError::WormEnabled)
        ));

        {
            let mut meta = handle.dentry.meta.write();
            meta.immutable = false;
            meta.appendonly = true;
        }
        // Non-appending write refused, appending allowed.
        assert!(matches!(
            write(&vol, &handle, b"x", 0),
            Err(LtfsError::WormEnabled)
        ));
        write(&vol, &handle, b"x", 4).unwrap();
    }

    #[test]
    fn append_only_dir_propagates_flag() {
        let vol = mounted();
        create(&vol, "/ao", true, false, false).unwrap();
        lookup_path(&vol, "/ao").unwrap().meta.write().appendonly = true;
        let child = create(&vol, "/ao/new", false, false, false).unwrap();
        let meta = child.meta.read();
        assert!(meta.appendonly);
        assert_eq!(meta.xattr(xattr::APPENDONLY_EA).unwrap().value, b"1");
    }

    #[test]
    fn readdir_in_uid_order() {
        let vol = mounted();
        create(&vol, "/z", false, false, false).unwrap();
        create(&vol, "/a", false, false, false).unwrap();
        create(&vol, "/m", true, false, false).unwrap();
        let mut names = Vec::new();
        readdir(&vol, "/", |e| names.push(e.name.clone())).unwrap();
        assert_eq!(names, vec!["z", "a", "m"]);
    }

    #[test]
    fn symlink_and_readlink() {
        let vol = mounted();
        create(&vol, "/real", false, false, false).unwrap();
        symlink_path(&vol, "/real", "/link").unwrap();
        assert_eq!(readlink_path(&vol, "/link").unwrap(), "/real");
        // Write-open of a symlink is refused.
        assert!(matches!(
            open(&vol, "/link", true, false),
            Err(LtfsError::RdonlyVolume)
        ));
    }

    #[test]
    fn livelink_reprefixes_target() {
        let dev = TapeDevice::open(Box::new(SimTape::new())).unwrap();
        let mut opts = MountOptions::default();
        opts.enable_lbp = false;
        opts.sync_period = None;
        opts.livelink = true;
        opts.mountpoint = Some("/mnt/ltfs".to_string());
        let vol = Volume::new(dev, opts);
        vol.format_volume("ABC123", 1024).unwrap();
        vol.mount(MountType::ReadWrite).unwrap();

        symlink_path(&vol, "/mnt/ltfs/data/file", "/link").unwrap();
        assert_eq!(
            readlink_path(&vol, "/link").unwrap(),
            "/mnt/ltfs/data/file"
        );
    }

    #[test]
    fn volume_sync_then_clean() {
        let vol = mounted();
        create(&vol, "/f", false, false, false).unwrap();
        volume_sync(&vol, SyncReason::RequestedByUser).unwrap();
        assert!(!vol.index.read().dirty);
        let generation = vol.index.read().generation;
        // Nothing changed: no new index.
        volume_sync(&vol, SyncReason::RequestedByUser).unwrap();
        assert_eq!(vol.index.read().generation, generation);
    }
}
