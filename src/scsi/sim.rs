//! In-memory simulated cartridge.
//!
//! Implements [`ScsiTransport`] by interpreting CDBs against a two-partition
//! record model, so every layer above the pass-through seam (CDB builders,
//! sense decode, retries, positioning, index chain recovery) runs unmodified
//! in tests and in the `ltfstool` dry-run mode. Logical object positions
//! count filemarks as well as blocks, exactly like a drive.

use crate::crc::Codec;
use crate::error::Result;
use crate::scsi::cdb::{self, op};
use crate::scsi::transport::{CmdStatus, DataDir, DriverStatus, ScsiTransport};
use crate::util::endian;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Block(Vec<u8>),
    Filemark,
}

#[derive(Debug, Clone, Default)]
struct Partition {
    records: Vec<Record>,
}

/// Simulated drive plus mounted cartridge.
pub struct SimTape {
    partitions: Vec<Partition>,
    /// Current partition number.
    part: u8,
    /// Current logical object position within the partition.
    pos: u64,
    loaded: bool,
    /// Per-partition object budget; crossing `budget - ew_margin` raises
    /// early warning on writes.
    capacity: u64,
    ew_margin: u64,
    /// MAM attribute store keyed by (partition, attribute id).
    mam: HashMap<(u8, u16), Vec<u8>>,
    /// Registered persistent reservation keys.
    registrations: Vec<[u8; 8]>,
    /// Holder of the exclusive reservation, if any.
    reservation: Option<[u8; 8]>,
    /// Key presented by this initiator (the one talking to us).
    our_key: Option<[u8; 8]>,
    lbp: Option<Codec>,
    serial: String,
    /// Synthetic dump payload returned by READ BUFFER.
    dump_payload: Vec<u8>,
}

impl SimTape {
    pub fn new() -> Self {
        SimTape::with_capacity(100_000)
    }

    pub fn with_capacity(capacity: u64) -> Self {
        SimTape {
            partitions: vec![Partition::default(), Partition::default()],
            part: 0,
            pos: 0,
            loaded: true,
            capacity,
            ew_margin: 64,
            mam: HashMap::new(),
            registrations: Vec::new(),
            reservation: None,
            our_key: None,
            lbp: None,
            serial: "SIM0000001".to_string(),
            dump_payload: vec![0xD5; 4096],
        }
    }

    fn partition(&self, p: u8) -> &Partition {
        &self.partitions[p as usize]
    }

    fn partition_mut(&mut self, p: u8) -> &mut Partition {
        &mut self.partitions[p as usize]
    }

    fn eod(&self, p: u8) -> u64 {
        self.partition(p).records.len() as u64
    }

    // --- test and diagnostic access -------------------------------------

    /// Direct record access for consistency tests (dropping a trailing
    /// filemark, chopping blocks after an index and the like).
    pub fn records_mut(&mut self, p: u8) -> &mut Vec<Record> {
        &mut self.partitions[p as usize].records
    }

    pub fn records(&self, p: u8) -> &[Record] {
        &self.partitions[p as usize].records
    }

    pub fn position(&self) -> (u8, u64) {
        (self.part, self.pos)
    }

    pub fn set_serial(&mut self, serial: &str) {
        self.serial = serial.to_string();
    }

    // --- sense builders --------------------------------------------------

    fn sense(key: u8, asc: u8, ascq: u8, flags: u8, info: i32) -> CmdStatus {
        let mut buf = [0u8; 18];
        buf[0] = 0x70;
        buf[2] = key | flags;
        buf[3..7].copy_from_slice(&info.to_be_bytes());
        buf[7] = 10;
        buf[12] = asc;
        buf[13] = ascq;
        CmdStatus::check_condition(&buf, 0)
    }

    fn sense_xfer(key: u8, asc: u8, ascq: u8, flags: u8, info: i32, xfer: usize) -> CmdStatus {
        let mut st = Self::sense(key, asc, ascq, flags, info);
        st.transferred = xfer;
        st
    }

    fn good(xfer: usize) -> CmdStatus {
        CmdStatus::good(xfer)
    }

    fn check_reservation(&self, cdb0: u8) -> Option<CmdStatus> {
        // INQUIRY, TUR, PR-IN/OUT and READ POSITION pass through a foreign
        // reservation; media access conflicts.
        let exempt = matches!(
            cdb0,
            op::INQUIRY
                | op::TEST_UNIT_READY
                | op::PERSISTENT_RESERVE_IN
                | op::PERSISTENT_RESERVE_OUT
                | op::READ_POSITION
        );
        match (&self.reservation, &self.our_key) {
            (Some(holder), Some(ours)) if holder != ours && !exempt => Some(CmdStatus {
                status: 0x18,
                driver: DriverStatus::Ok,
                transferred: 0,
                sense: None,
            }),
            (Some(_), None) if !exempt => Some(CmdStatus {
                status: 0x18,
                driver: DriverStatus::Ok,
                transferred: 0,
                sense: None,
            }),
            _ => None,
        }
    }

    // --- command handlers ------------------------------------------------

    fn do_read(&mut self, count: usize, sili: bool, buf: &mut [u8]) -> CmdStatus {
        let eod = self.eod(self.part);
        if self.pos >= eod {
            // Blank check: end of data.
            return Self::sense(0x08, 0x00, 0x05, 0, count as i32);
        }
        let record = self.partition(self.part).records[self.pos as usize].clone();
        match record {
            Record::Filemark => {
                self.pos += 1;
                Self::sense(0x00, 0x00, 0x01, 0x80, count as i32)
            }
            Record::Block(data) => {
                self.pos += 1;
                let payload = match self.lbp {
                    Some(codec) => {
                        let mut protected = data.clone();
                        codec.encode(&mut protected);
                        protected
                    }
                    None => data,
                };
                if payload.len() > count {
                    // Overrun: block longer than the transfer length.
                    buf[..count].copy_from_slice(&payload[..count]);
                    Self::sense_xfer(
                        0x00,
                        0x00,
                        0x00,
                        0x20,
                        count as i32 - payload.len() as i32,
                        count,
                    )
                } else if payload.len() < count {
                    buf[..payload.len()].copy_from_slice(&payload);
                    if sili {
                        Self::good(payload.len())
                    } else {
                        // Underrun: positive residual.
                        Self::sense_xfer(
                            0x00,
                            0x00,
                            0x00,
                            0x20,
                            (count - payload.len()) as i32,
                            payload.len(),
                        )
                    }
                } else {
                    buf[..count].copy_from_slice(&payload);
                    Self::good(count)
                }
            }
        }
    }

    fn append_record(&mut self, record: Record) -> CmdStatus {
        if self.pos >= self.capacity {
            return Self::sense(0x0D, 0x00, 0x02, 0x40, 0);
        }
        let pos = self.pos as usize;
        let part = self.partition_mut(self.part);
        // Writing truncates everything downstream.
        part.records.truncate(pos);
        part.records.push(record);
        self.pos += 1;
        if self.pos >= self.capacity - self.ew_margin {
            // Early warning, reported as noise sense with EOM set.
            return Self::sense(0x00, 0x00, 0x00, 0x40, 0);
        }
        Self::good(0)
    }

    fn do_write(&mut self, count: usize, buf: &[u8]) -> CmdStatus {
        let data = match self.lbp {
            Some(codec) => match codec.check(&buf[..count]) {
                Ok(payload) => buf[..payload].to_vec(),
                Err(_) => return Self::sense(0x0B, 0x10, 0x01, 0, 0), // LBP write error
            },
            None => buf[..count].to_vec(),
        };
        let mut st = self.append_record(Record::Block(data));
        if st.status == 0 || st.sense.is_some() {
            st.transferred = count;
        }
        st
    }

    fn do_space(&mut self, code: u8, count: i32) -> CmdStatus {
        match code {
            0x00 => {
                // Blocks.
                let target = self.pos as i64 + count as i64;
                if target < 0 {
                    self.pos = 0;
                    return Self::sense(0x00, 0x00, 0x04, 0, 0); // BOP
                }
                let eod = self.eod(self.part) as i64;
                if target > eod {
                    self.pos = eod as u64;
                    return Self::sense(0x08, 0x00, 0x05, 0, (target - eod) as i32);
                }
                self.pos = target as u64;
                Self::good(0)
            }
            0x01 => self.space_filemarks(count),
            0x03 => {
                self.pos = self.eod(self.part);
                Self::good(0)
            }
            _ => Self::sense(0x05, 0x24, 0x00, 0, 0),
        }
    }

    fn space_filemarks(&mut self, count: i32) -> CmdStatus {
        if count >= 0 {
            let mut remaining = count;
            while remaining > 0 {
                let eod = self.eod(self.part);
                if self.pos >= eod {
                    return Self::sense(0x08, 0x00, 0x05, 0, remaining);
                }
                if matches!(
                    self.partition(self.part).records[self.pos as usize],
                    Record::Filemark
                ) {
                    remaining -= 1;
                }
                self.pos += 1;
            }
            Self::good(0)
        } else {
            // Space backward: end up on the BOP side of the Nth filemark.
            let mut remaining = -count;
            while remaining > 0 {
                if self.pos == 0 {
                    return Self::sense(0x00, 0x00, 0x04, 0, remaining);
                }
                self.pos -= 1;
                if matches!(
                    self.partition(self.part).records[self.pos as usize],
                    Record::Filemark
                ) {
                    remaining -= 1;
                }
            }
            Self::good(0)
        }
    }

    fn do_read_position(&self, buf: &mut [u8]) -> CmdStatus {
        // Long form: flags, partition at 4..8, object at 8..16, filemarks
        // at 16..24.
        let len = buf.len().min(32);
        for b in buf[..len].iter_mut() {
            *b = 0;
        }
        if buf.len() < 24 {
            return Self::sense(0x05, 0x24, 0x00, 0, 0);
        }
        let mut flags = 0u8;
        if self.pos == 0 {
            flags |= 0x80; // BOP
        }
        if self.pos >= self.eod(self.part) {
            flags |= 0x04; // at EOD
        }
        if self.pos >= self.capacity - self.ew_margin {
            flags |= 0x40; // past early warning
        }
        buf[0] = flags;
        endian::put_u32(&mut buf[4..8], self.part as u32);
        endian::put_u64(&mut buf[8..16], self.pos);
        let filemarks = self.partition(self.part).records[..self.pos.min(self.eod(self.part)) as usize]
            .iter()
            .filter(|r| matches!(r, Record::Filemark))
            .count() as u64;
        endian::put_u64(&mut buf[16..24], filemarks);
        Self::good(32)
    }

    fn do_mode_sense(&self, page: u8, subpage: u8, buf: &mut [u8]) -> CmdStatus {
        for b in buf.iter_mut() {
            *b = 0;
        }
        if buf.len() < 16 {
            return Self::sense(0x05, 0x24, 0x00, 0, 0);
        }
        // 8-byte mode parameter header, then the page.
        let body: Vec<u8> = match (page, subpage) {
            (cdb::modepage::CONTROL_DATA_PROTECTION, cdb::modepage::CONTROL_DP_SUBPAGE) => {
                let method = self.lbp.map(|c| c.method_code()).unwrap_or(0);
                let mut p = vec![0u8; 12];
                p[0] = 0x40 | cdb::modepage::CONTROL_DATA_PROTECTION; // SPF
                p[1] = cdb::modepage::CONTROL_DP_SUBPAGE;
                endian::put_u16(&mut p[2..4], 8);
                p[4] = method;
                p[5] = 4; // protection information length
                if method != 0 {
                    p[6] = 0xC0; // LBP_W | LBP_R
                }
                p
            }
            (cdb::modepage::INIT_EXT, _) => {
                // Capability byte advertises CRC32C support.
                let mut p = vec![0u8; 8];
                p[0] = cdb::modepage::INIT_EXT;
                p[1] = 6;
                p[2] = 0x20; // LBP_CRC32C capable
                p
            }
            (cdb::modepage::MEDIUM_CONFIGURATION, _) => {
                let mut p = vec![0u8; 32];
                p[0] = cdb::modepage::MEDIUM_CONFIGURATION;
                p[1] = 30;
                p[2] = 1; // two partitions
                p
            }
            (cdb::modepage::DEVICE_CONFIGURATION, _) => {
                let mut p = vec![0u8; 16];
                p[0] = cdb::modepage::DEVICE_CONFIGURATION;
                p[1] = 14;
                p[8] = 0x40; // compression enabled
                p
            }
            _ => return Self::sense(0x05, 0x24, 0x00, 0, 0),
        };
        let total = 8 + body.len();
        if buf.len() < total {
            return Self::sense(0x05, 0x24, 0x00, 0, 0);
        }
        endian::put_u16(&mut buf[0..2], (total - 2) as u16);
        buf[8..total].copy_from_slice(&body);
        Self::good(total)
    }

    fn do_mode_select(&mut self, buf: &[u8]) -> CmdStatus {
        if buf.len() < 10 {
            return Self::sense(0x05, 0x1A, 0x00, 0, 0);
        }
        let page = buf[8] & 0x3F;
        let spf = buf[8] & 0x40 != 0;
        if page == cdb::modepage::CONTROL_DATA_PROTECTION && spf {
            let method = buf[12];
            self.lbp = match method {
                0 => None,
                crate::crc::LBP_METHOD_RS_GF256 => Some(Codec::RsGf256),
                crate::crc::LBP_METHOD_CRC32C => Some(Codec::Crc32c),
                _ => return Self::sense(0x05, 0x26, 0x00, 0, 0),
            };
            return Self::good(buf.len());
        }
        Self::good(buf.len())
    }

    fn do_log_sense(&self, page: u8, buf: &mut [u8]) -> CmdStatus {
        for b in buf.iter_mut() {
            *b = 0;
        }
        match page {
            0x31 => {
                // Tape capacity page: four 4-byte parameters, values in
                // megabytes; parameters 1/2 are remaining (p0/p1), 3/4 max.
                if buf.len() < 40 {
                    return Self::sense(0x05, 0x24, 0x00, 0, 0);
                }
                buf[0] = 0x31;
                endian::put_u16(&mut buf[2..4], 32);
                let mut off = 4;
                for (code, value) in [
                    (1u16, (self.capacity - self.eod(0).min(self.capacity)) / 2),
                    (2, self.capacity - self.eod(1).min(self.capacity)),
                    (3, self.capacity / 2),
                    (4, self.capacity),
                ] {
                    endian::put_u16(&mut buf[off..off + 2], code);
                    buf[off + 2] = 0x40;
                    buf[off + 3] = 4;
                    endian::put_u32(&mut buf[off + 4..off + 8], value as u32);
                    off += 8;
                }
                Self::good(off)
            }
            0x2E => {
                // Tape alert page: 64 one-byte flags, all clear.
                if buf.len() < 4 + 64 * 5 {
                    return Self::sense(0x05, 0x24, 0x00, 0, 0);
                }
                buf[0] = 0x2E;
                endian::put_u16(&mut buf[2..4], (64 * 5) as u16);
                let mut off = 4;
                for flag in 1..=64u16 {
                    endian::put_u16(&mut buf[off..off + 2], flag);
                    buf[off + 2] = 0x40;
                    buf[off + 3] = 1;
                    buf[off + 4] = 0;
                    off += 5;
                }
                Self::good(off)
            }
            0x17 => {
                // Volume statistics (health): empty page.
                buf[0] = 0x17;
                endian::put_u16(&mut buf[2..4], 0);
                Self::good(4)
            }
            _ => Self::sense(0x05, 0x24, 0x00, 0, 0),
        }
    }

    fn do_read_attribute(&self, cdb_bytes: &[u8], buf: &mut [u8]) -> CmdStatus {
        let partition = cdb_bytes[7];
        let id = endian::get_u16(&cdb_bytes[8..10]);
        match self.mam.get(&(partition, id)) {
            Some(value) => {
                // 4-byte available-data header, then one attribute entry:
                // id(2), format(1), length(2), value.
                let entry_len = 5 + value.len();
                let total = 4 + entry_len;
                if buf.len() < total {
                    return Self::sense(0x05, 0x24, 0x00, 0, 0);
                }
                endian::put_u32(&mut buf[0..4], entry_len as u32);
                endian::put_u16(&mut buf[4..6], id);
                buf[6] = cdb::mam::FORMAT_BINARY;
                endian::put_u16(&mut buf[7..9], value.len() as u16);
                buf[9..9 + value.len()].copy_from_slice(value);
                Self::good(total)
            }
            None => Self::sense(0x05, 0x24, 0x00, 0, 0),
        }
    }

    fn do_write_attribute(&mut self, cdb_bytes: &[u8], buf: &[u8]) -> CmdStatus {
        let partition = cdb_bytes[7];
        if buf.len() < 4 {
            return Self::sense(0x05, 0x1A, 0x00, 0, 0);
        }
        let mut off = 4;
        while off + 5 <= buf.len() {
            let id = endian::get_u16(&buf[off..off + 2]);
            let len = endian::get_u16(&buf[off + 3..off + 5]) as usize;
            if off + 5 + len > buf.len() {
                return Self::sense(0x05, 0x26, 0x00, 0, 0);
            }
            let value = buf[off + 5..off + 5 + len].to_vec();
            if len == 0 {
                self.mam.remove(&(partition, id));
            } else {
                self.mam.insert((partition, id), value);
            }
            off += 5 + len;
        }
        Self::good(buf.len())
    }

    fn do_pr_out(&mut self, cdb_bytes: &[u8], buf: &[u8]) -> CmdStatus {
        if buf.len() < 24 {
            return Self::sense(0x05, 0x1A, 0x00, 0, 0);
        }
        let action = cdb_bytes[1] & 0x1F;
        let mut res_key = [0u8; 8];
        res_key.copy_from_slice(&buf[0..8]);
        let mut svc_key = [0u8; 8];
        svc_key.copy_from_slice(&buf[8..16]);
        match action {
            0x06 => {
                // Register and ignore existing key.
                if !self.registrations.contains(&svc_key) {
                    self.registrations.push(svc_key);
                }
                self.our_key = Some(svc_key);
                Self::good(buf.len())
            }
            0x01 => {
                // Reserve (exclusive access).
                if let Some(holder) = self.reservation {
                    if Some(holder) != self.our_key {
                        return CmdStatus {
                            status: 0x18,
                            driver: DriverStatus::Ok,
                            transferred: 0,
                            sense: None,
                        };
                    }
                }
                self.reservation = self.our_key;
                Self::good(buf.len())
            }
            0x02 => {
                // Release.
                if self.reservation == self.our_key {
                    self.reservation = None;
                }
                Self::good(buf.len())
            }
            0x05 => {
                // Preempt and abort: take over from svc_key's holder.
                self.registrations.retain(|k| *k != svc_key);
                if self.reservation == Some(svc_key) {
                    self.reservation = None;
                }
                self.reservation = self.our_key;
                Self::good(buf.len())
            }
            _ => Self::sense(0x05, 0x24, 0x00, 0, 0),
        }
    }

    fn do_pr_in(&self, cdb_bytes: &[u8], buf: &mut [u8]) -> CmdStatus {
        let action = cdb_bytes[1] & 0x1F;
        for b in buf.iter_mut() {
            *b = 0;
        }
        match action {
            0x00 => {
                // Read keys.
                let needed = 8 + self.registrations.len() * 8;
                if buf.len() < needed {
                    return Self::sense(0x05, 0x24, 0x00, 0, 0);
                }
                endian::put_u32(&mut buf[4..8], (self.registrations.len() * 8) as u32);
                let mut off = 8;
                for key in &self.registrations {
                    buf[off..off + 8].copy_from_slice(key);
                    off += 8;
                }
                Self::good(needed)
            }
            0x03 => {
                // Full status: one descriptor per registration.
                let mut off = 8;
                for key in &self.registrations {
                    if buf.len() < off + 32 {
                        break;
                    }
                    buf[off..off + 8].copy_from_slice(key);
                    if self.reservation == Some(*key) {
                        buf[off + 12] = 0x01; // R_HOLDER
                    }
                    off += 32;
                }
                endian::put_u32(&mut buf[4..8], (off - 8) as u32);
                Self::good(off)
            }
            _ => Self::sense(0x05, 0x24, 0x00, 0, 0),
        }
    }

    fn do_inquiry(&self, cdb_bytes: &[u8], buf: &mut [u8]) -> CmdStatus {
        for b in buf.iter_mut() {
            *b = 0;
        }
        let evpd = cdb_bytes[1] & 0x01 != 0;
        if !evpd {
            if buf.len() < 36 {
                return Self::sense(0x05, 0x24, 0x00, 0, 0);
            }
            buf[0] = 0x01; // sequential-access device
            buf[2] = 0x06; // SPC-4
            buf[4] = 31;
            buf[8..16].copy_from_slice(b"LTFSCORE");
            // Product id carries the generation the LBP selection rule
            // keys on.
            buf[16..32].copy_from_slice(b"ULT3580-TD9     ");
            buf[32..36].copy_from_slice(b"0001");
            Self::good(36)
        } else if cdb_bytes[2] == 0x80 {
            let serial = self.serial.as_bytes();
            let total = 4 + serial.len();
            if buf.len() < total {
                return Self::sense(0x05, 0x24, 0x00, 0, 0);
            }
            buf[1] = 0x80;
            buf[3] = serial.len() as u8;
            buf[4..total].copy_from_slice(serial);
            Self::good(total)
        } else {
            Self::sense(0x05, 0x24, 0x00, 0, 0)
        }
    }

    fn do_format(&mut self, _format_type: u8) -> CmdStatus {
        // Every format type wipes the medium; the record model always keeps
        // two partitions so the capacity pages stay well-defined.
        self.partitions = vec![Partition::default(), Partition::default()];
        self.part = 0;
        self.pos = 0;
        self.mam.clear();
        Self::good(0)
    }

    fn do_read_buffer(&self, cdb_bytes: &[u8], buf: &mut [u8]) -> CmdStatus {
        let mode = cdb_bytes[1] & 0x1F;
        match mode {
            0x03 => {
                // Buffer capacity descriptor.
                if buf.len() < 4 {
                    return Self::sense(0x05, 0x24, 0x00, 0, 0);
                }
                buf[0] = 0;
                buf[1] = (self.dump_payload.len() >> 16) as u8;
                buf[2] = (self.dump_payload.len() >> 8) as u8;
                buf[3] = self.dump_payload.len() as u8;
                Self::good(4)
            }
            0x02 => {
                let offset = ((cdb_bytes[3] as usize) << 16)
                    | ((cdb_bytes[4] as usize) << 8)
                    | cdb_bytes[5] as usize;
                if offset >= self.dump_payload.len() {
                    return Self::good(0);
                }
                let n = buf.len().min(self.dump_payload.len() - offset);
                buf[..n].copy_from_slice(&self.dump_payload[offset..offset + n]);
                Self::good(n)
            }
            _ => Self::sense(0x05, 0x24, 0x00, 0, 0),
        }
    }
}

impl Default for SimTape {
    fn default() -> Self {
        SimTape::new()
    }
}

impl ScsiTransport for SimTape {
    fn issue(&mut self, cdb_bytes: &[u8], data: DataDir<'_>, _timeout_secs: u32) -> Result<CmdStatus> {
        if cdb_bytes.is_empty() {
            return Ok(Self::sense(0x05, 0x20, 0x00, 0, 0));
        }
        let opcode = cdb_bytes[0];

        if let Some(conflict) = self.check_reservation(opcode) {
            return Ok(conflict);
        }

        if !self.loaded
            && !matches!(
                opcode,
                op::TEST_UNIT_READY | op::INQUIRY | op::LOAD_UNLOAD | op::MODE_SENSE10
            )
        {
            return Ok(Self::sense(0x02, 0x3A, 0x00, 0, 0));
        }

        let status = match (opcode, data) {
            (op::TEST_UNIT_READY, _) => {
                if self.loaded {
                    Self::good(0)
                } else {
                    Self::sense(0x02, 0x3A, 0x00, 0, 0)
                }
            }
            (op::REWIND, _) => {
                self.pos = 0;
                Self::good(0)
            }
            (op::READ, DataDir::In(buf)) => {
                let count = ((cdb_bytes[2] as usize) << 16)
                    | ((cdb_bytes[3] as usize) << 8)
                    | cdb_bytes[4] as usize;
                let sili = cdb_bytes[1] & 0x02 != 0;
                self.do_read(count.min(buf.len()), sili, buf)
            }
            (op::WRITE, DataDir::Out(buf)) => {
                let count = ((cdb_bytes[2] as usize) << 16)
                    | ((cdb_bytes[3] as usize) << 8)
                    | cdb_bytes[4] as usize;
                self.do_write(count.min(buf.len()), buf)
            }
            (op::WRITE_FILEMARKS, _) => {
                let count = ((cdb_bytes[2] as u32) << 16)
                    | ((cdb_bytes[3] as u32) << 8)
                    | cdb_bytes[4] as u32;
                let mut last = Self::good(0);
                for _ in 0..count {
                    last = self.append_record(Record::Filemark);
                    if last.status != 0 {
                        break;
                    }
                }
                last
            }
            (op::SPACE, _) => {
                let mut count = ((cdb_bytes[2] as i32) << 16)
                    | ((cdb_bytes[3] as i32) << 8)
                    | cdb_bytes[4] as i32;
                // Sign-extend the 24-bit field.
                if count & 0x0080_0000 != 0 {
                    count |= -16_777_216; // 0xFF00_0000
                }
                self.do_space(cdb_bytes[1] & 0x0F, count)
            }
            (op::LOCATE16, _) => {
                let change_partition = cdb_bytes[1] & 0x02 != 0;
                if change_partition {
                    let p = cdb_bytes[3];
                    if p as usize >= self.partitions.len() {
                        return Ok(Self::sense(0x05, 0x24, 0x00, 0, 0));
                    }
                    self.part = p;
                }
                let block = endian::get_u64(&cdb_bytes[4..12]);
                let eod = self.eod(self.part);
                if block > eod {
                    self.pos = eod;
                    Self::sense(0x08, 0x00, 0x05, 0, 0)
                } else {
                    self.pos = block;
                    Self::good(0)
                }
            }
            (op::READ_POSITION, DataDir::In(buf)) => self.do_read_position(buf),
            (op::ERASE, _) => {
                let pos = self.pos as usize;
                self.partition_mut(self.part).records.truncate(pos);
                Self::good(0)
            }
            (op::LOAD_UNLOAD, _) => {
                self.loaded = cdb_bytes[4] & 0x01 != 0;
                self.pos = 0;
                self.part = 0;
                Self::good(0)
            }
            (op::PREVENT_ALLOW_MEDIUM_REMOVAL, _) => Self::good(0),
            (op::SET_CAPACITY, _) => {
                let proportion = endian::get_u16(&cdb_bytes[3..5]) as u64;
                self.capacity = (self.capacity * proportion.max(1)) / 65535;
                Self::good(0)
            }
            (op::FORMAT_MEDIUM, _) => self.do_format(cdb_bytes[2] & 0x0F),
            (op::MODE_SENSE10, DataDir::In(buf)) => {
                self.do_mode_sense(cdb_bytes[2] & 0x3F, cdb_bytes[3], buf)
            }
            (op::MODE_SELECT10, DataDir::Out(buf)) => self.do_mode_select(buf),
            (op::LOG_SENSE, DataDir::In(buf)) => self.do_log_sense(cdb_bytes[2] & 0x3F, buf),
            (op::READ_ATTRIBUTE, DataDir::In(buf)) => self.do_read_attribute(cdb_bytes, buf),
            (op::WRITE_ATTRIBUTE, DataDir::Out(buf)) => self.do_write_attribute(cdb_bytes, buf),
            (op::PERSISTENT_RESERVE_OUT, DataDir::Out(buf)) => self.do_pr_out(cdb_bytes, buf),
            (op::PERSISTENT_RESERVE_IN, DataDir::In(buf)) => self.do_pr_in(cdb_bytes, buf),
            (op::INQUIRY, DataDir::In(buf)) => self.do_inquiry(cdb_bytes, buf),
            (op::ALLOW_OVERWRITE, _) => Self::good(0),
            (op::READ_BUFFER, DataDir::In(buf)) => self.do_read_buffer(cdb_bytes, buf),
            (op::SECURITY_PROTOCOL_OUT, DataDir::Out(buf)) => Self::good(buf.len()),
            (op::SECURITY_PROTOCOL_IN, DataDir::In(_)) => Self::sense(0x05, 0x24, 0x00, 0, 0),
            (op::MAINTENANCE_IN, DataDir::In(_)) => {
                // No REPORT SUPPORTED OPCODES; callers fall back to the
                // static timeout table.
                Self::sense(0x05, 0x20, 0x00, 0, 0)
            }
            _ => Self::sense(0x05, 0x20, 0x00, 0, 0),
        };
        Ok(status)
    }

    fn reconnect(&mut self) -> Result<()> {
        Ok(())
    }

    fn identifier(&self) -> String {
        format!("sim:{}", self.serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(sim: &mut SimTape, cdb_bytes: &[u8], data: DataDir<'_>) -> CmdStatus {
        sim.issue(cdb_bytes, data, 60).unwrap()
    }

    #[test]
    fn write_read_round_trip() {
        let mut sim = SimTape::new();
        let payload = vec![7u8; 100];
        let st = issue(&mut sim, &cdb::write(100), DataDir::Out(&payload));
        assert_eq!(st.status, 0);

        issue(&mut sim, &cdb::rewind(false), DataDir::None);
        let mut buf = vec![0u8; 512];
        let st = issue(&mut sim, &cdb::read(512, true), DataDir::In(&mut buf));
        assert_eq!(st.status, 0);
        assert_eq!(st.transferred, 100);
        assert_eq!(&buf[..100], &payload[..]);
    }

    #[test]
    fn filemark_read_sets_fm_bit() {
        let mut sim = SimTape::new();
        issue(&mut sim, &cdb::write_filemarks(1, false), DataDir::None);
        issue(&mut sim, &cdb::rewind(false), DataDir::None);
        let mut buf = vec![0u8; 16];
        let st = issue(&mut sim, &cdb::read(16, false), DataDir::In(&mut buf));
        let sense = crate::scsi::sense::SenseData::parse(st.sense.as_ref().unwrap());
        assert!(sense.filemark);
    }

    #[test]
    fn position_counts_filemarks() {
        let mut sim = SimTape::new();
        let payload = vec![1u8; 10];
        issue(&mut sim, &cdb::write(10), DataDir::Out(&payload));
        issue(&mut sim, &cdb::write_filemarks(1, false), DataDir::None);
        issue(&mut sim, &cdb::write(10), DataDir::Out(&payload));
        assert_eq!(sim.position(), (0, 3));
    }

    #[test]
    fn write_truncates_downstream() {
        let mut sim = SimTape::new();
        let payload = vec![1u8; 10];
        for _ in 0..5 {
            issue(&mut sim, &cdb::write(10), DataDir::Out(&payload));
        }
        issue(&mut sim, &cdb::locate16(0, 2), DataDir::None);
        issue(&mut sim, &cdb::write(10), DataDir::Out(&payload));
        assert_eq!(sim.records(0).len(), 3);
    }

    #[test]
    fn reservation_conflict_reported() {
        let mut sim = SimTape::new();
        // A foreign initiator holds the reservation.
        sim.registrations.push([9u8; 8]);
        sim.reservation = Some([9u8; 8]);
        let payload = vec![1u8; 10];
        let st = issue(&mut sim, &cdb::write(10), DataDir::Out(&payload));
        assert_eq!(st.status, 0x18);
    }

    #[test]
    fn mam_attribute_round_trip() {
        let mut sim = SimTape::new();
        let mut param = vec![0u8; 4 + 5 + 6];
        endian::put_u32(&mut param[0..4], 11);
        endian::put_u16(&mut param[4..6], cdb::mam::BARCODE);
        param[6] = cdb::mam::FORMAT_ASCII;
        endian::put_u16(&mut param[7..9], 6);
        param[9..15].copy_from_slice(b"ABC123");
        let st = issue(
            &mut sim,
            &cdb::write_attribute(0, param.len() as u32),
            DataDir::Out(&param),
        );
        assert_eq!(st.status, 0);

        let mut buf = vec![0u8; 64];
        let st = issue(
            &mut sim,
            &cdb::read_attribute(0, cdb::mam::BARCODE, 64),
            DataDir::In(&mut buf),
        );
        assert_eq!(st.status, 0);
        assert_eq!(&buf[9..15], b"ABC123");
    }

    #[test]
    fn lbp_strips_and_restores_crc() {
        let mut sim = SimTape::new();
        sim.lbp = Some(Codec::Crc32c);
        let mut protected = b"data".to_vec();
        Codec::Crc32c.encode(&mut protected);
        let st = issue(
            &mut sim,
            &cdb::write(protected.len() as u32),
            DataDir::Out(&protected),
        );
        assert_eq!(st.status, 0);
        assert_eq!(sim.records(0)[0], Record::Block(b"data".to_vec()));

        issue(&mut sim, &cdb::rewind(false), DataDir::None);
        let mut buf = vec![0u8; 64];
        let st = issue(&mut sim, &cdb::read(64, true), DataDir::In(&mut buf));
        assert_eq!(st.transferred, 8);
        assert_eq!(Codec::Crc32c.check(&buf[..8]).unwrap(), 4);
    }
}
