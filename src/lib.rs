//! LTFS core library
//!
//! A Rust implementation of the Linear Tape File System core: the
//! two-partition on-tape data model, the index chain with rollback and
//! recovery, filesystem semantics over the dentry tree, and the SCSI tape
//! command layer the rest sits on.

pub mod chain;
pub mod cli;
pub mod crc;
pub mod dcache;
pub mod error;
pub mod fsops;
pub mod fsraw;
pub mod index;
pub mod iosched;
pub mod kmi;
pub mod lock;
pub mod logger;
pub mod periodic_sync;
pub mod scsi;
pub mod tape;
pub mod util;
pub mod volume;
pub mod xattr;

// Re-export key types for easier use
pub use error::{LtfsError, Result};
pub use fsops::FileHandle;
pub use index::{Dentry, Extent, Index, TapePtr, XAttr};
pub use scsi::sense::DeviceError;
pub use tape::TapeDevice;
pub use volume::{MountOptions, MountType, Volume};

#[cfg(test)]
mod tests;
