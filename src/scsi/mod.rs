//! SCSI tape command layer.
//!
//! `transport` is the pass-through seam (one function: issue a CDB, move
//! data, report status and sense). Everything above it is portable: CDB
//! builders, sense decoding into the closed [`sense::DeviceError`] set,
//! per-opcode timeouts, persistent-reservation key handling, drive dump
//! capture, and an in-memory simulated cartridge used by the test suite.

pub mod cdb;
pub mod dump;
pub mod reservation;
pub mod sense;
pub mod sim;
pub mod timeout;
pub mod transport;

pub use sense::{DeviceError, ErrorClass, SenseData};
pub use transport::{CmdStatus, DataDir, DriverStatus, ScsiTransport};

/// Default transfer block size used by the format and by dump capture.
pub const LTFS_BLOCKSIZE: u32 = 512 * 1024;

/// Fixed sense buffer length requested from the host.
pub const SENSE_LEN: usize = 96;
