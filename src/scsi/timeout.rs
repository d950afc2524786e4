//! Per-opcode command timeouts.
//!
//! Preferred source is the drive's own REPORT SUPPORTED OPERATION CODES
//! timeout descriptor; when the drive does not implement it the table falls
//! back to vendor/generation defaults. Values are seconds.

use crate::scsi::cdb::op;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveFamily {
    Lto5,
    Lto6,
    Lto7,
    Lto8,
    Lto9,
    /// Enterprise 3592 generations.
    Jag4,
    Jag5,
    Jag6,
    Jag7,
    Unknown,
}

impl DriveFamily {
    /// Map an INQUIRY product id to a family. IBM LTO products read
    /// `ULT3580-TDn` (or `ULTRIUM-TDn` for half height), enterprise drives
    /// `0359n`.
    pub fn from_product_id(product: &str) -> DriveFamily {
        let p = product.trim();
        if p.contains("TD5") || p.contains("HH5") {
            DriveFamily::Lto5
        } else if p.contains("TD6") || p.contains("HH6") {
            DriveFamily::Lto6
        } else if p.contains("TD7") || p.contains("HH7") {
            DriveFamily::Lto7
        } else if p.contains("TD8") || p.contains("HH8") {
            DriveFamily::Lto8
        } else if p.contains("TD9") || p.contains("HH9") {
            DriveFamily::Lto9
        } else if p.contains("E07") {
            DriveFamily::Jag4
        } else if p.contains("E08") {
            DriveFamily::Jag5
        } else if p.contains("55F") || p.contains("J5A") {
            DriveFamily::Jag6
        } else if p.contains("60F") || p.contains("J6A") {
            DriveFamily::Jag7
        } else {
            DriveFamily::Unknown
        }
    }

    /// LTO generation number when the family is an LTO drive.
    pub fn lto_generation(&self) -> Option<u8> {
        match self {
            DriveFamily::Lto5 => Some(5),
            DriveFamily::Lto6 => Some(6),
            DriveFamily::Lto7 => Some(7),
            DriveFamily::Lto8 => Some(8),
            DriveFamily::Lto9 => Some(9),
            _ => None,
        }
    }

    pub fn is_enterprise(&self) -> bool {
        matches!(
            self,
            DriveFamily::Jag4 | DriveFamily::Jag5 | DriveFamily::Jag6 | DriveFamily::Jag7
        )
    }
}

pub struct TimeoutTable {
    family: DriveFamily,
    overrides: HashMap<u8, u32>,
}

impl TimeoutTable {
    pub fn new(family: DriveFamily) -> Self {
        TimeoutTable {
            family,
            overrides: HashMap::new(),
        }
    }

    /// Install a timeout learned from REPORT SUPPORTED OPERATION CODES.
    pub fn learn(&mut self, opcode: u8, secs: u32) {
        if secs > 0 {
            self.overrides.insert(opcode, secs);
        }
    }

    pub fn get(&self, opcode: u8) -> u32 {
        if let Some(&secs) = self.overrides.get(&opcode) {
            return secs;
        }
        self.default_for(opcode)
    }

    fn default_for(&self, opcode: u8) -> u32 {
        // Motion commands scale with generation: longer tape, longer seeks.
        let locate = match self.family {
            DriveFamily::Lto5 | DriveFamily::Lto6 => 1000,
            DriveFamily::Lto7 | DriveFamily::Lto8 => 1200,
            DriveFamily::Lto9 => 1380,
            f if f.is_enterprise() => 1200,
            _ => 1200,
        };
        let erase_long = match self.family {
            DriveFamily::Lto9 => 64800,
            f if f.is_enterprise() => 36000,
            _ => 46800,
        };
        match opcode {
            op::TEST_UNIT_READY => 60,
            op::INQUIRY | op::MODE_SENSE10 | op::MODE_SELECT10 | op::LOG_SENSE => 60,
            op::READ_POSITION => 60,
            op::READ_ATTRIBUTE | op::WRITE_ATTRIBUTE => 60,
            op::PERSISTENT_RESERVE_IN | op::PERSISTENT_RESERVE_OUT => 60,
            op::READ | op::WRITE => 1500,
            op::WRITE_FILEMARKS => 1500,
            op::REWIND => locate,
            op::SPACE | op::LOCATE16 => locate,
            op::LOAD_UNLOAD => 900,
            op::FORMAT_MEDIUM => 3000,
            op::ERASE => erase_long,
            op::READ_BUFFER => 300,
            op::ALLOW_OVERWRITE => 60,
            op::SECURITY_PROTOCOL_IN | op::SECURITY_PROTOCOL_OUT => 60,
            _ => 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_id_mapping() {
        assert_eq!(
            DriveFamily::from_product_id("ULT3580-TD9 "),
            DriveFamily::Lto9
        );
        assert_eq!(
            DriveFamily::from_product_id("ULTRIUM-HH7 "),
            DriveFamily::Lto7
        );
        assert_eq!(DriveFamily::from_product_id("03592E08"), DriveFamily::Jag5);
        assert_eq!(DriveFamily::from_product_id("banana"), DriveFamily::Unknown);
    }

    #[test]
    fn learned_timeout_wins() {
        let mut table = TimeoutTable::new(DriveFamily::Lto8);
        assert_eq!(table.get(op::TEST_UNIT_READY), 60);
        table.learn(op::TEST_UNIT_READY, 42);
        assert_eq!(table.get(op::TEST_UNIT_READY), 42);
    }

    #[test]
    fn motion_scales_with_generation() {
        let lto5 = TimeoutTable::new(DriveFamily::Lto5);
        let lto9 = TimeoutTable::new(DriveFamily::Lto9);
        assert!(lto9.get(op::LOCATE16) > lto5.get(op::LOCATE16));
    }
}
