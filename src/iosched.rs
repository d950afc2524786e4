//! I/O scheduler plugin interface.
//!
//! A scheduler buffers and reorders file I/O before it reaches the raw
//! operations (write gathering, index/data partition placement). The core
//! ships the contract only; when no scheduler is installed the public
//! operations call straight into [`crate::fsraw`].

use crate::error::Result;
use crate::index::types::Dentry;
use std::sync::Arc;

pub trait IoScheduler: Send {
    fn open(&mut self, dentry: &Arc<Dentry>, open_write: bool) -> Result<()>;

    /// Close a handle; `flush` forces buffered data out before returning.
    fn close(&mut self, dentry: &Arc<Dentry>, flush: bool) -> Result<()>;

    fn read(&mut self, dentry: &Arc<Dentry>, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn write(&mut self, dentry: &Arc<Dentry>, buf: &[u8], offset: u64) -> Result<()>;

    /// Flush one dentry, or everything when `dentry` is `None`.
    fn flush(&mut self, dentry: Option<&Arc<Dentry>>) -> Result<()>;

    fn truncate(&mut self, dentry: &Arc<Dentry>, length: u64) -> Result<()>;

    /// Forget queued placement decisions for an unlinked dentry.
    fn drop_placement(&mut self, dentry: &Arc<Dentry>) -> Result<()>;
}
