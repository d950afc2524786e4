//! Opcode constants and CDB builders.
//!
//! Builders keep the big-endian byte layout explicit; nothing here issues a
//! command. Field meanings follow SPC-4/SSC-4.

use crate::util::endian;

pub mod op {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REWIND: u8 = 0x01;
    pub const FORMAT_MEDIUM: u8 = 0x04;
    pub const READ: u8 = 0x08;
    pub const WRITE: u8 = 0x0A;
    pub const WRITE_FILEMARKS: u8 = 0x10;
    pub const SPACE: u8 = 0x11;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SELECT10: u8 = 0x55;
    pub const MODE_SENSE10: u8 = 0x5A;
    pub const SET_CAPACITY: u8 = 0x0B;
    pub const ERASE: u8 = 0x19;
    pub const LOAD_UNLOAD: u8 = 0x1B;
    pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
    pub const READ_POSITION: u8 = 0x34;
    pub const READ_BUFFER: u8 = 0x3C;
    pub const LOG_SENSE: u8 = 0x4D;
    pub const PERSISTENT_RESERVE_IN: u8 = 0x5E;
    pub const PERSISTENT_RESERVE_OUT: u8 = 0x5F;
    pub const ALLOW_OVERWRITE: u8 = 0x82;
    pub const READ_ATTRIBUTE: u8 = 0x8C;
    pub const WRITE_ATTRIBUTE: u8 = 0x8D;
    pub const LOCATE16: u8 = 0x92;
    pub const REPORT_DENSITY_SUPPORT: u8 = 0x44;
    pub const SECURITY_PROTOCOL_IN: u8 = 0xA2;
    pub const SECURITY_PROTOCOL_OUT: u8 = 0xB5;
    pub const MAINTENANCE_IN: u8 = 0xA3;
}

/// SPACE code field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCode {
    Blocks = 0x00,
    Filemarks = 0x01,
    EndOfData = 0x03,
}

/// Mode page / subpage numbers used by the tape layer.
pub mod modepage {
    /// Control extension page carrying LBP capability bits.
    pub const CONTROL_DATA_PROTECTION: u8 = 0x0A;
    pub const CONTROL_DP_SUBPAGE: u8 = 0xF0;
    pub const MEDIUM_CONFIGURATION: u8 = 0x1D;
    pub const DEVICE_CONFIGURATION: u8 = 0x10;
    pub const INIT_EXT: u8 = 0x24;
    pub const PC_CURRENT: u8 = 0x00;
}

/// MAM attribute identifiers written by the format and volume code.
pub mod mam {
    pub const APP_VENDOR: u16 = 0x0800;
    pub const APP_NAME: u16 = 0x0801;
    pub const APP_VERSION: u16 = 0x0802;
    pub const USER_MEDIUM_LABEL: u16 = 0x0803;
    pub const BARCODE: u16 = 0x0806;
    pub const APP_FORMAT_VERSION: u16 = 0x080B;
    pub const VOL_COHERENCY: u16 = 0x080A;
    pub const LOCKED_MAM: u16 = 0x1623;

    pub const FORMAT_BINARY: u8 = 0x00;
    pub const FORMAT_ASCII: u8 = 0x01;
    pub const FORMAT_TEXT: u8 = 0x02;
}

pub fn test_unit_ready() -> [u8; 6] {
    [op::TEST_UNIT_READY, 0, 0, 0, 0, 0]
}

pub fn rewind(immed: bool) -> [u8; 6] {
    [op::REWIND, immed as u8, 0, 0, 0, 0]
}

pub fn inquiry(page: Option<u8>, alloc: u16) -> [u8; 6] {
    let mut cdb = [op::INQUIRY, 0, 0, 0, 0, 0];
    if let Some(page) = page {
        cdb[1] = 0x01; // EVPD
        cdb[2] = page;
    }
    endian::put_u16(&mut cdb[3..5], alloc);
    cdb
}

/// Variable-length READ. `sili` suppresses the incorrect-length indication
/// when the block on tape is shorter than the transfer length.
pub fn read(count: u32, sili: bool) -> [u8; 6] {
    let mut cdb = [op::READ, 0, 0, 0, 0, 0];
    if sili {
        cdb[1] = 0x02;
    }
    cdb[2] = (count >> 16) as u8;
    cdb[3] = (count >> 8) as u8;
    cdb[4] = count as u8;
    cdb
}

/// Variable-length WRITE of exactly `count` bytes as one tape block.
pub fn write(count: u32) -> [u8; 6] {
    let mut cdb = [op::WRITE, 0, 0, 0, 0, 0];
    cdb[2] = (count >> 16) as u8;
    cdb[3] = (count >> 8) as u8;
    cdb[4] = count as u8;
    cdb
}

pub fn write_filemarks(count: u32, immed: bool) -> [u8; 6] {
    let mut cdb = [op::WRITE_FILEMARKS, immed as u8, 0, 0, 0, 0];
    cdb[2] = (count >> 16) as u8;
    cdb[3] = (count >> 8) as u8;
    cdb[4] = count as u8;
    cdb
}

/// SPACE over blocks/filemarks (signed count; negative spaces backward) or
/// to end-of-data.
pub fn space(code: SpaceCode, count: i32) -> [u8; 6] {
    let mut cdb = [op::SPACE, code as u8, 0, 0, 0, 0];
    cdb[2] = (count >> 16) as u8;
    cdb[3] = (count >> 8) as u8;
    cdb[4] = count as u8;
    cdb
}

/// LOCATE(16) with explicit partition change.
pub fn locate16(partition: u8, block: u64) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = op::LOCATE16;
    cdb[1] = 0x02; // CP: change partition
    cdb[3] = partition;
    endian::put_u64(&mut cdb[4..12], block);
    cdb
}

/// SET CAPACITY: restrict the usable medium to `proportion`/65535 of the
/// full length.
pub fn set_capacity(proportion: u16) -> [u8; 6] {
    let mut cdb = [0u8; 6];
    cdb[0] = op::SET_CAPACITY;
    endian::put_u16(&mut cdb[3..5], proportion);
    cdb
}

pub fn erase(long: bool, immed: bool) -> [u8; 6] {
    let mut cdb = [op::ERASE, 0, 0, 0, 0, 0];
    cdb[1] = (long as u8) | ((immed as u8) << 1);
    cdb
}

pub fn load_unload(load: bool, immed: bool) -> [u8; 6] {
    let mut cdb = [op::LOAD_UNLOAD, immed as u8, 0, 0, 0, 0];
    cdb[4] = load as u8;
    cdb
}

pub fn prevent_allow_medium_removal(prevent: bool) -> [u8; 6] {
    [op::PREVENT_ALLOW_MEDIUM_REMOVAL, 0, 0, 0, prevent as u8, 0]
}

/// READ POSITION, long form (service action 0x06).
pub fn read_position() -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = op::READ_POSITION;
    cdb[1] = 0x06;
    cdb
}

pub fn format_medium(format_type: u8) -> [u8; 6] {
    let mut cdb = [op::FORMAT_MEDIUM, 0, 0, 0, 0, 0];
    cdb[2] = format_type & 0x0F;
    cdb
}

pub fn mode_sense10(page: u8, pc: u8, subpage: u8, alloc: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = op::MODE_SENSE10;
    cdb[2] = (pc << 6) | (page & 0x3F);
    cdb[3] = subpage;
    endian::put_u16(&mut cdb[7..9], alloc);
    cdb
}

pub fn mode_select10(param_len: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = op::MODE_SELECT10;
    cdb[1] = 0x10; // PF
    endian::put_u16(&mut cdb[7..9], param_len);
    cdb
}

pub fn log_sense(page: u8, subpage: u8, alloc: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = op::LOG_SENSE;
    cdb[2] = 0x40 | (page & 0x3F); // PC=01 (current cumulative)
    cdb[3] = subpage;
    endian::put_u16(&mut cdb[7..9], alloc);
    cdb
}

pub fn read_attribute(partition: u8, id: u16, alloc: u32) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = op::READ_ATTRIBUTE;
    cdb[1] = 0x00; // service action: attribute values
    cdb[7] = partition;
    endian::put_u16(&mut cdb[8..10], id);
    endian::put_u32(&mut cdb[10..14], alloc);
    cdb
}

pub fn write_attribute(partition: u8, param_len: u32) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = op::WRITE_ATTRIBUTE;
    cdb[7] = partition;
    endian::put_u32(&mut cdb[10..14], param_len);
    cdb
}

pub fn allow_overwrite(partition: u8, block: u64) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = op::ALLOW_OVERWRITE;
    cdb[2] = 0x01; // allow overwrite of current position
    cdb[3] = partition;
    endian::put_u64(&mut cdb[4..12], block);
    cdb
}

pub fn persistent_reserve_in(action: u8, alloc: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = op::PERSISTENT_RESERVE_IN;
    cdb[1] = action & 0x1F;
    endian::put_u16(&mut cdb[7..9], alloc);
    cdb
}

pub fn persistent_reserve_out(action: u8, res_type: u8, param_len: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = op::PERSISTENT_RESERVE_OUT;
    cdb[1] = action & 0x1F;
    cdb[2] = res_type;
    endian::put_u16(&mut cdb[7..9], param_len);
    cdb
}

/// READ BUFFER, used for drive dump capture.
pub fn read_buffer(mode: u8, buffer_id: u8, offset: u32, alloc: u32) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = op::READ_BUFFER;
    cdb[1] = mode & 0x1F;
    cdb[2] = buffer_id;
    cdb[3] = (offset >> 16) as u8;
    cdb[4] = (offset >> 8) as u8;
    cdb[5] = offset as u8;
    cdb[6] = (alloc >> 16) as u8;
    cdb[7] = (alloc >> 8) as u8;
    cdb[8] = alloc as u8;
    cdb
}

/// REPORT SUPPORTED OPERATION CODES (MAINTENANCE IN, service action 0x0C),
/// one-command format, used to fetch the drive's recommended timeout.
pub fn report_supported_opcode(opcode: u8, alloc: u32) -> [u8; 12] {
    let mut cdb = [0u8; 12];
    cdb[0] = op::MAINTENANCE_IN;
    cdb[1] = 0x0C;
    cdb[2] = 0x02; // reporting options: one command, timeout descriptor
    cdb[3] = opcode;
    endian::put_u32(&mut cdb[6..10], alloc);
    cdb
}

/// SECURITY PROTOCOL OUT page for setting a data key (tape encryption).
pub fn security_protocol_out(param_len: u32) -> [u8; 12] {
    let mut cdb = [0u8; 12];
    cdb[0] = op::SECURITY_PROTOCOL_OUT;
    cdb[1] = 0x20; // tape data encryption protocol
    endian::put_u16(&mut cdb[2..4], 0x0010); // set data encryption page
    endian::put_u32(&mut cdb[6..10], param_len);
    cdb
}

pub fn security_protocol_in(page: u16, alloc: u32) -> [u8; 12] {
    let mut cdb = [0u8; 12];
    cdb[0] = op::SECURITY_PROTOCOL_IN;
    cdb[1] = 0x20;
    endian::put_u16(&mut cdb[2..4], page);
    endian::put_u32(&mut cdb[6..10], alloc);
    cdb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_cdb_layout() {
        let cdb = read(0x080000, true);
        assert_eq!(cdb[0], 0x08);
        assert_eq!(cdb[1], 0x02);
        assert_eq!(&cdb[2..5], &[0x08, 0x00, 0x00]);
    }

    #[test]
    fn locate_carries_partition_and_block() {
        let cdb = locate16(1, 0x1_0000_0005);
        assert_eq!(cdb[0], op::LOCATE16);
        assert_eq!(cdb[1], 0x02);
        assert_eq!(cdb[3], 1);
        assert_eq!(crate::util::endian::get_u64(&cdb[4..12]), 0x1_0000_0005);
    }

    #[test]
    fn space_backward_is_twos_complement() {
        let cdb = space(SpaceCode::Filemarks, -1);
        assert_eq!(&cdb[2..5], &[0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn mode_sense_packs_pc_and_page() {
        let cdb = mode_sense10(modepage::CONTROL_DATA_PROTECTION, 0x00, 0xF0, 512);
        assert_eq!(cdb[2], 0x0A);
        assert_eq!(cdb[3], 0xF0);
        assert_eq!(crate::util::endian::get_u16(&cdb[7..9]), 512);
    }
}
