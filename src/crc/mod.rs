//! Per-block integrity codecs for SCSI Logical Block Protection.
//!
//! Two interchangeable codecs produce the 4-byte trailing CRC appended to
//! every protected block: the Reed-Solomon GF(256) code LTO drives compute in
//! hardware, and standard CRC32C. Which one a drive accepts is decided during
//! LBP setup in the tape layer.

pub mod crc32c;
pub mod rs_gf256;

use crate::error::{LtfsError, Result};
use crate::scsi::sense::DeviceError;

pub const CRC_SIZE: usize = 4;

/// LBP method codes as written to the control data protection mode page.
pub const LBP_METHOD_RS_GF256: u8 = 0x01;
pub const LBP_METHOD_CRC32C: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    RsGf256,
    Crc32c,
}

impl Codec {
    pub fn method_code(&self) -> u8 {
        match self {
            Codec::RsGf256 => LBP_METHOD_RS_GF256,
            Codec::Crc32c => LBP_METHOD_CRC32C,
        }
    }

    pub fn crc(&self, buf: &[u8]) -> u32 {
        match self {
            Codec::RsGf256 => rs_gf256::crc(buf),
            Codec::Crc32c => crc32c::crc(buf),
        }
    }

    /// Append the big-endian CRC of `buf` in place.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let crc = self.crc(buf);
        buf.extend_from_slice(&crc.to_be_bytes());
    }

    /// Verify a buffer carrying a trailing CRC; returns the payload length.
    ///
    /// A mismatch is surfaced as an LBP read error so the caller can trigger
    /// dump capture like any other medium-side failure.
    pub fn check(&self, buf: &[u8]) -> Result<usize> {
        if buf.len() < CRC_SIZE {
            return Err(LtfsError::SmallBuffer);
        }
        let payload = buf.len() - CRC_SIZE;
        let stored = u32::from_be_bytes([
            buf[payload],
            buf[payload + 1],
            buf[payload + 2],
            buf[payload + 3],
        ]);
        let computed = self.crc(&buf[..payload]);
        if stored != computed {
            tracing::error!(
                "LBP check failed over {} bytes: computed {:#010x}, stored {:#010x}",
                payload,
                computed,
                stored
            );
            return Err(LtfsError::Device(DeviceError::LbpReadError));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(codec: Codec, payload: &[u8]) {
        let mut buf = payload.to_vec();
        codec.encode(&mut buf);
        assert_eq!(buf.len(), payload.len() + CRC_SIZE);
        assert_eq!(codec.check(&buf).unwrap(), payload.len());
    }

    #[test]
    fn both_codecs_round_trip() {
        for codec in [Codec::RsGf256, Codec::Crc32c] {
            round_trip(codec, b"");
            round_trip(codec, b"\x00");
            round_trip(codec, b"LTFS index payload");
            let block: Vec<u8> = (0..8192u32).map(|i| (i * 31 % 251) as u8).collect();
            round_trip(codec, &block);
        }
    }

    #[test]
    fn corruption_detected() {
        for codec in [Codec::RsGf256, Codec::Crc32c] {
            let mut buf = b"some protected block".to_vec();
            codec.encode(&mut buf);
            buf[3] ^= 0x40;
            assert!(matches!(
                codec.check(&buf),
                Err(LtfsError::Device(DeviceError::LbpReadError))
            ));
        }
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(matches!(
            Codec::Crc32c.check(&[1, 2, 3]),
            Err(LtfsError::SmallBuffer)
        ));
    }
}
