//! Drive dump capture.
//!
//! On a medium or hardware error (and on operator request) the drive's
//! diagnostic buffer is read out with READ BUFFER and written to a
//! timestamped file under the dump directory. Mode 0x03 fetches the buffer
//! capacity, mode 0x02 the data, 512 KiB per command.

use crate::error::Result;
use crate::scsi::cdb;
use crate::scsi::transport::{DataDir, ScsiTransport};
use chrono::Utc;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Drive diagnostic buffer id.
const DUMP_BUFFER_ID: u8 = 0x00;
const DUMP_CHUNK: usize = 512 * 1024;

pub fn default_dump_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Read the drive dump and store it under `dir`. Returns the file path, or
/// `None` when the drive reports an empty buffer.
pub fn capture(
    transport: &mut dyn ScsiTransport,
    serial: &str,
    dir: &Path,
) -> Result<Option<PathBuf>> {
    // Capacity first.
    let mut header = [0u8; 4];
    let cdb_bytes = cdb::read_buffer(0x03, DUMP_BUFFER_ID, 0, header.len() as u32);
    let st = transport.issue(&cdb_bytes, DataDir::In(&mut header), 300)?;
    if st.status != 0 {
        warn!("dump capacity query failed, skipping dump");
        return Ok(None);
    }
    let capacity =
        ((header[1] as usize) << 16) | ((header[2] as usize) << 8) | header[3] as usize;
    if capacity == 0 {
        return Ok(None);
    }

    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("ltfs_{}_{}.dmp", serial, stamp));
    let mut file = File::create(&path)?;

    let mut offset = 0usize;
    let mut chunk = vec![0u8; DUMP_CHUNK];
    while offset < capacity {
        let want = DUMP_CHUNK.min(capacity - offset);
        let cdb_bytes = cdb::read_buffer(0x02, DUMP_BUFFER_ID, offset as u32, want as u32);
        let st = transport.issue(&cdb_bytes, DataDir::In(&mut chunk[..want]), 300)?;
        if st.status != 0 || st.transferred == 0 {
            warn!("dump read stopped at offset {}", offset);
            break;
        }
        file.write_all(&chunk[..st.transferred])?;
        offset += st.transferred;
    }

    info!("captured drive dump: {} ({} bytes)", path.display(), offset);
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::sim::SimTape;

    #[test]
    fn capture_writes_dump_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sim = SimTape::new();
        let path = capture(&mut sim, "SIM0000001", dir.path())
            .unwrap()
            .expect("dump expected");
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 4096);
        assert!(data.iter().all(|&b| b == 0xD5));
    }
}
