//! Dentry cache plugin interface.
//!
//! A dentry cache mirrors the volume namespace onto local disk so huge
//! indexes do not have to live in memory and survive between mounts. The
//! core drives the cache through this named operation set; the `flatfile`
//! backend ships with the crate.

pub mod flatfile;

use crate::error::Result;
use bitflags::bitflags;

bitflags! {
    /// What to push out on `flush`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlushFlags: u32 {
        const XATTRS = 1;
        const EXTENT_LIST = 2;
        const METADATA = 4;
        const RECURSIVE = 8;
        const ALL = Self::XATTRS.bits() | Self::EXTENT_LIST.bits() | Self::METADATA.bits();
    }
}

/// One mirrored directory entry.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub name: String,
    pub uid: u64,
    pub isdir: bool,
    pub size: u64,
}

pub trait DentryCache: Send {
    // Cache lifecycle.
    fn mkcache(&mut self) -> Result<()>;
    fn rmcache(&mut self) -> Result<()>;
    fn cache_exists(&self) -> bool;
    fn set_workdir(&mut self, workdir: &str) -> Result<()>;
    fn get_workdir(&self) -> Result<String>;

    // Name assignment tracks which paths the mirror currently covers.
    fn assign_name(&mut self, path: &str) -> Result<()>;
    fn unassign_name(&mut self, path: &str) -> Result<()>;
    fn is_name_assigned(&self, path: &str) -> Result<bool>;
    fn wipe_dentry_tree(&mut self) -> Result<()>;

    // Volume identity and coherency markers.
    fn set_vol_uuid(&mut self, uuid: &str) -> Result<()>;
    fn get_vol_uuid(&self) -> Result<String>;
    fn set_generation(&mut self, generation: u64) -> Result<()>;
    fn get_generation(&self) -> Result<u64>;
    fn set_dirty(&mut self, dirty: bool) -> Result<()>;
    fn get_dirty(&self) -> Result<bool>;

    // Backing disk image management.
    fn diskimage_create(&mut self, size: u64) -> Result<()>;
    fn diskimage_remove(&mut self) -> Result<()>;
    fn diskimage_mount(&mut self) -> Result<()>;
    fn diskimage_unmount(&mut self) -> Result<()>;
    fn diskimage_is_full(&self) -> Result<bool>;

    // One mount holds the advisory lock at a time.
    fn get_advisory_lock(&mut self) -> Result<()>;
    fn put_advisory_lock(&mut self) -> Result<()>;

    // Namespace operations, mirroring the public filesystem ops.
    fn open(&mut self, path: &str) -> Result<()>;
    fn openat(&mut self, parent: &str, name: &str) -> Result<()>;
    fn close(&mut self, path: &str) -> Result<()>;
    fn create(&mut self, path: &str, isdir: bool) -> Result<()>;
    fn unlink(&mut self, path: &str) -> Result<()>;
    fn rename(&mut self, from: &str, to: &str) -> Result<()>;
    fn flush(&mut self, path: &str, flags: FlushFlags) -> Result<()>;
    fn readdir(&self, path: &str) -> Result<Vec<CachedEntry>>;
    fn read_direntry(&self, path: &str) -> Result<Option<CachedEntry>>;

    // Mirrored extended attributes.
    fn setxattr(&mut self, path: &str, name: &str, value: &[u8]) -> Result<()>;
    fn removexattr(&mut self, path: &str, name: &str) -> Result<()>;
    fn listxattr(&self, path: &str) -> Result<Vec<String>>;
    fn getxattr(&self, path: &str, name: &str) -> Result<Vec<u8>>;

    // Entry metadata push/pull.
    fn get_dentry(&self, path: &str) -> Result<CachedEntry>;
    fn put_dentry(&mut self, path: &str, entry: &CachedEntry) -> Result<()>;
}
