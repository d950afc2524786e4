//! Flat-file dentry cache backend.
//!
//! Mirrors the namespace under a workdir: directories map to directories,
//! files and symlinks to one JSON record each, and the volume identity
//! (uuid, generation, dirty marker) to a `volume.json` at the top. An
//! advisory lock file keeps two mounts from sharing a workdir.

use crate::dcache::{CachedEntry, DentryCache, FlushFlags};
use crate::error::{LtfsError, Result};
use crate::util::path;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

const VOLUME_FILE: &str = "volume.json";
const LOCK_FILE: &str = "cache.lock";
const TREE_DIR: &str = "tree";
const DISKIMAGE_FILE: &str = "cache.img";
const RECORD_SUFFIX: &str = ".dentry.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct VolumeRecord {
    uuid: String,
    generation: u64,
    dirty: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EntryRecord {
    name: String,
    uid: u64,
    isdir: bool,
    size: u64,
    #[serde(default)]
    xattrs: BTreeMap<String, Vec<u8>>,
}

pub struct FlatfileDcache {
    workdir: PathBuf,
    locked: bool,
    image_size: u64,
}

impl FlatfileDcache {
    pub fn new<P: Into<PathBuf>>(workdir: P) -> Self {
        FlatfileDcache {
            workdir: workdir.into(),
            locked: false,
            image_size: 0,
        }
    }

    fn tree_root(&self) -> PathBuf {
        self.workdir.join(TREE_DIR)
    }

    /// Map a volume path to its on-disk location, percent-encoding each
    /// component so any name is representable.
    fn entry_path(&self, vol_path: &str) -> Result<PathBuf> {
        let components = path::split(vol_path)?;
        let mut p = self.tree_root();
        for c in &components {
            p.push(path::platform_safe_name(&path::normalize_name(c)));
        }
        Ok(p)
    }

    fn record_path(&self, vol_path: &str) -> Result<PathBuf> {
        let base = self.entry_path(vol_path)?;
        if base.is_dir() {
            Ok(base.join("_self").with_extension("dentry.json"))
        } else {
            let mut name = base
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            name.push_str(RECORD_SUFFIX);
            Ok(base.with_file_name(name))
        }
    }

    fn load_record(&self, vol_path: &str) -> Result<EntryRecord> {
        let record_path = self.record_path(vol_path)?;
        let data = fs::read(&record_path)
            .map_err(|_| LtfsError::NoDentry(vol_path.to_string()))?;
        serde_json::from_slice(&data).map_err(|e| LtfsError::parse(e.to_string()))
    }

    fn store_record(&self, vol_path: &str, record: &EntryRecord) -> Result<()> {
        let record_path = self.record_path(vol_path)?;
        if let Some(parent) = record_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data =
            serde_json::to_vec_pretty(record).map_err(|e| LtfsError::parse(e.to_string()))?;
        fs::write(&record_path, data)?;
        Ok(())
    }

    fn load_volume(&self) -> Result<VolumeRecord> {
        let data = fs::read(self.workdir.join(VOLUME_FILE))?;
        serde_json::from_slice(&data).map_err(|e| LtfsError::parse(e.to_string()))
    }

    fn store_volume(&self, record: &VolumeRecord) -> Result<()> {
        let data =
            serde_json::to_vec_pretty(record).map_err(|e| LtfsError::parse(e.to_string()))?;
        fs::write(self.workdir.join(VOLUME_FILE), data)?;
        Ok(())
    }

    fn entry_from_path(&self, p: &Path) -> Option<CachedEntry> {
        if p.is_dir() {
            let record = fs::read(p.join("_self.dentry.json")).ok()?;
            let record: EntryRecord = serde_json::from_slice(&record).ok()?;
            Some(CachedEntry {
                name: record.name,
                uid: record.uid,
                isdir: true,
                size: 0,
            })
        } else {
            let name = p.file_name()?.to_string_lossy();
            if !name.ends_with(RECORD_SUFFIX) || name.starts_with("_self") {
                return None;
            }
            let record: EntryRecord = serde_json::from_slice(&fs::read(p).ok()?).ok()?;
            Some(CachedEntry {
                name: record.name,
                uid: record.uid,
                isdir: false,
                size: record.size,
            })
        }
    }
}

impl DentryCache for FlatfileDcache {
    fn mkcache(&mut self) -> Result<()> {
        fs::create_dir_all(self.tree_root())?;
        self.store_volume(&VolumeRecord::default())?;
        debug!("created dentry cache at {}", self.workdir.display());
        Ok(())
    }

    fn rmcache(&mut self) -> Result<()> {
        if self.workdir.exists() {
            fs::remove_dir_all(&self.workdir)?;
        }
        Ok(())
    }

    fn cache_exists(&self) -> bool {
        self.workdir.join(VOLUME_FILE).exists()
    }

    fn set_workdir(&mut self, workdir: &str) -> Result<()> {
        self.workdir = PathBuf::from(workdir);
        Ok(())
    }

    fn get_workdir(&self) -> Result<String> {
        Ok(self.workdir.to_string_lossy().into_owned())
    }

    fn assign_name(&mut self, vol_path: &str) -> Result<()> {
        // Presence of the record is the assignment.
        if self.load_record(vol_path).is_err() {
            self.store_record(
                vol_path,
                &EntryRecord {
                    name: path::split(vol_path)?.pop().unwrap_or_default(),
                    ..Default::default()
                },
            )?;
        }
        Ok(())
    }

    fn unassign_name(&mut self, vol_path: &str) -> Result<()> {
        let record_path = self.record_path(vol_path)?;
        if record_path.exists() {
            fs::remove_file(record_path)?;
        }
        Ok(())
    }

    fn is_name_assigned(&self, vol_path: &str) -> Result<bool> {
        Ok(self.record_path(vol_path)?.exists())
    }

    fn wipe_dentry_tree(&mut self) -> Result<()> {
        let tree = self.tree_root();
        if tree.exists() {
            fs::remove_dir_all(&tree)?;
        }
        fs::create_dir_all(&tree)?;
        Ok(())
    }

    fn set_vol_uuid(&mut self, uuid: &str) -> Result<()> {
        let mut record = self.load_volume().unwrap_or_default();
        record.uuid = uuid.to_string();
        self.store_volume(&record)
    }

    fn get_vol_uuid(&self) -> Result<String> {
        Ok(self.load_volume()?.uuid)
    }

    fn set_generation(&mut self, generation: u64) -> Result<()> {
        let mut record = self.load_volume().unwrap_or_default();
        record.generation = generation;
        self.store_volume(&record)
    }

    fn get_generation(&self) -> Result<u64> {
        Ok(self.load_volume()?.generation)
    }

    fn set_dirty(&mut self, dirty: bool) -> Result<()> {
        let mut record = self.load_volume().unwrap_or_default();
        record.dirty = dirty;
        self.store_volume(&record)
    }

    fn get_dirty(&self) -> Result<bool> {
        Ok(self.load_volume()?.dirty)
    }

    fn diskimage_create(&mut self, size: u64) -> Result<()> {
        let file = fs::File::create(self.workdir.join(DISKIMAGE_FILE))?;
        file.set_len(size)?;
        self.image_size = size;
        Ok(())
    }

    fn diskimage_remove(&mut self) -> Result<()> {
        let image = self.workdir.join(DISKIMAGE_FILE);
        if image.exists() {
            fs::remove_file(image)?;
        }
        self.image_size = 0;
        Ok(())
    }

    fn diskimage_mount(&mut self) -> Result<()> {
        if !self.workdir.join(DISKIMAGE_FILE).exists() {
            return Err(LtfsError::NoDentry(DISKIMAGE_FILE.to_string()));
        }
        Ok(())
    }

    fn diskimage_unmount(&mut self) -> Result<()> {
        Ok(())
    }

    fn diskimage_is_full(&self) -> Result<bool> {
        // The flat-file tree shares the image file's budget: full when the
        // mirrored records outgrow the declared image size.
        if self.image_size == 0 {
            return Ok(false);
        }
        let mut used = 0u64;
        for entry in WalkDir::new(self.tree_root()).into_iter().flatten() {
            if entry.file_type().is_file() {
                used += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(used >= self.image_size)
    }

    fn get_advisory_lock(&mut self) -> Result<()> {
        let lock_path = self.workdir.join(LOCK_FILE);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(_) => {
                self.locked = true;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!("dentry cache already locked: {}", lock_path.display());
                Err(LtfsError::RestartOperation)
            }
            Err(e) => Err(LtfsError::Io(e)),
        }
    }

    fn put_advisory_lock(&mut self) -> Result<()> {
        if self.locked {
            let _ = fs::remove_file(self.workdir.join(LOCK_FILE));
            self.locked = false;
        }
        Ok(())
    }

    fn open(&mut self, vol_path: &str) -> Result<()> {
        if vol_path == "/" {
            return Ok(());
        }
        self.load_record(vol_path).map(|_| ())
    }

    fn openat(&mut self, parent: &str, name: &str) -> Result<()> {
        let joined = if parent.ends_with('/') {
            format!("{}{}", parent, name)
        } else {
            format!("{}/{}", parent, name)
        };
        self.open(&joined)
    }

    fn close(&mut self, _vol_path: &str) -> Result<()> {
        Ok(())
    }

    fn create(&mut self, vol_path: &str, isdir: bool) -> Result<()> {
        let name = path::split(vol_path)?.pop().unwrap_or_default();
        if isdir {
            fs::create_dir_all(self.entry_path(vol_path)?)?;
        }
        self.store_record(
            vol_path,
            &EntryRecord {
                name,
                isdir,
                ..Default::default()
            },
        )
    }

    fn unlink(&mut self, vol_path: &str) -> Result<()> {
        let entry = self.entry_path(vol_path)?;
        if entry.is_dir() {
            fs::remove_dir_all(&entry)?;
        } else {
            let record_path = self.record_path(vol_path)?;
            if record_path.exists() {
                fs::remove_file(record_path)?;
            }
        }
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let mut record = self.load_record(from)?;
        record.name = path::split(to)?.pop().unwrap_or_default();
        let from_entry = self.entry_path(from)?;
        if from_entry.is_dir() {
            let to_entry = self.entry_path(to)?;
            fs::rename(&from_entry, &to_entry)?;
            self.store_record(to, &record)
        } else {
            self.unlink(from)?;
            self.store_record(to, &record)
        }
    }

    fn flush(&mut self, _vol_path: &str, _flags: FlushFlags) -> Result<()> {
        // Records are written through; nothing is buffered.
        Ok(())
    }

    fn readdir(&self, vol_path: &str) -> Result<Vec<CachedEntry>> {
        let dir = self.entry_path(vol_path)?;
        let mut entries = Vec::new();
        for item in fs::read_dir(&dir)? {
            let item = item?;
            if let Some(entry) = self.entry_from_path(&item.path()) {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| e.uid);
        Ok(entries)
    }

    fn read_direntry(&self, vol_path: &str) -> Result<Option<CachedEntry>> {
        match self.load_record(vol_path) {
            Ok(record) => Ok(Some(CachedEntry {
                name: record.name,
                uid: record.uid,
                isdir: record.isdir,
                size: record.size,
            })),
            Err(_) => Ok(None),
        }
    }

    fn setxattr(&mut self, vol_path: &str, name: &str, value: &[u8]) -> Result<()> {
        let mut record = self.load_record(vol_path)?;
        record.xattrs.insert(name.to_string(), value.to_vec());
        self.store_record(vol_path, &record)
    }

    fn removexattr(&mut self, vol_path: &str, name: &str) -> Result<()> {
        let mut record = self.load_record(vol_path)?;
        if record.xattrs.remove(name).is_none() {
            return Err(LtfsError::NoXattr(name.to_string()));
        }
        self.store_record(vol_path, &record)
    }

    fn listxattr(&self, vol_path: &str) -> Result<Vec<String>> {
        Ok(self.load_record(vol_path)?.xattrs.keys().cloned().collect())
    }

    fn getxattr(&self, vol_path: &str, name: &str) -> Result<Vec<u8>> {
        self.load_record(vol_path)?
            .xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| LtfsError::NoXattr(name.to_string()))
    }

    fn get_dentry(&self, vol_path: &str) -> Result<CachedEntry> {
        self.read_direntry(vol_path)?
            .ok_or_else(|| LtfsError::NoDentry(vol_path.to_string()))
    }

    fn put_dentry(&mut self, vol_path: &str, entry: &CachedEntry) -> Result<()> {
        let mut record = self
            .load_record(vol_path)
            .unwrap_or_default();
        record.name = entry.name.clone();
        record.uid = entry.uid;
        record.isdir = entry.isdir;
        record.size = entry.size;
        self.store_record(vol_path, &record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, FlatfileDcache) {
        let dir = tempfile::tempdir().unwrap();
        let mut dcache = FlatfileDcache::new(dir.path().join("cache"));
        dcache.mkcache().unwrap();
        (dir, dcache)
    }

    #[test]
    fn volume_identity_round_trip() {
        let (_dir, mut dcache) = cache();
        assert!(dcache.cache_exists());
        dcache.set_vol_uuid("uuid-1").unwrap();
        dcache.set_generation(9).unwrap();
        dcache.set_dirty(true).unwrap();
        assert_eq!(dcache.get_vol_uuid().unwrap(), "uuid-1");
        assert_eq!(dcache.get_generation().unwrap(), 9);
        assert!(dcache.get_dirty().unwrap());
    }

    #[test]
    fn create_readdir_unlink() {
        let (_dir, mut dcache) = cache();
        dcache.create("/docs", true).unwrap();
        dcache.create("/docs/a.txt", false).unwrap();
        dcache.create("/docs/b.txt", false).unwrap();

        let entries = dcache.readdir("/docs").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        assert!(names.contains(&"a.txt".to_string()));
        assert!(names.contains(&"b.txt".to_string()));

        dcache.unlink("/docs/a.txt").unwrap();
        assert!(dcache.read_direntry("/docs/a.txt").unwrap().is_none());
    }

    #[test]
    fn rename_moves_record() {
        let (_dir, mut dcache) = cache();
        dcache.create("/x", false).unwrap();
        dcache.rename("/x", "/y").unwrap();
        assert!(dcache.read_direntry("/x").unwrap().is_none());
        let entry = dcache.read_direntry("/y").unwrap().unwrap();
        assert_eq!(entry.name, "y");
    }

    #[test]
    fn xattr_mirror_round_trip() {
        let (_dir, mut dcache) = cache();
        dcache.create("/f", false).unwrap();
        dcache.setxattr("/f", "user.k", b"v").unwrap();
        assert_eq!(dcache.getxattr("/f", "user.k").unwrap(), b"v");
        assert_eq!(dcache.listxattr("/f").unwrap(), vec!["user.k"]);
        dcache.removexattr("/f", "user.k").unwrap();
        assert!(dcache.getxattr("/f", "user.k").is_err());
    }

    #[test]
    fn advisory_lock_excludes_second_holder() {
        let (_dir, mut dcache) = cache();
        let workdir = dcache.get_workdir().unwrap();
        dcache.get_advisory_lock().unwrap();
        let mut second = FlatfileDcache::new(workdir);
        assert!(second.get_advisory_lock().is_err());
        dcache.put_advisory_lock().unwrap();
        assert!(second.get_advisory_lock().is_ok());
    }

    #[test]
    fn names_with_reserved_characters() {
        let (_dir, mut dcache) = cache();
        dcache.create("/we:ird*name", false).unwrap();
        assert!(dcache.is_name_assigned("/we:ird*name").unwrap());
        let entry = dcache.read_direntry("/we:ird*name").unwrap().unwrap();
        assert_eq!(entry.name, "we:ird*name");
    }

    #[test]
    fn diskimage_budget() {
        let (_dir, mut dcache) = cache();
        dcache.diskimage_create(64).unwrap();
        dcache.diskimage_mount().unwrap();
        assert!(!dcache.diskimage_is_full().unwrap());
        // A couple of records overflow a 64-byte budget.
        dcache.create("/a", false).unwrap();
        dcache.create("/b", false).unwrap();
        assert!(dcache.diskimage_is_full().unwrap());
        dcache.diskimage_remove().unwrap();
    }
}
