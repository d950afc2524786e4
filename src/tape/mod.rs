//! The tape device: the abstract operation set the filesystem layers
//! consume, implemented over any [`ScsiTransport`].
//!
//! This layer owns CDB issue with the retry policy, sense translation
//! outcomes, the reconnect/fence cycle, Logical Block Protection setup, the
//! reservation lifecycle, and dump capture on serious errors. Callers above
//! it (fsraw, the index chain, the volume) never touch CDBs or sense.

use crate::crc::Codec;
use crate::error::{LtfsError, Result};
use crate::scsi::cdb::{self, op, SpaceCode};
use crate::scsi::reservation::{self, action};
use crate::scsi::sense::{self, DeviceError, ErrorClass, SenseData};
use crate::scsi::timeout::{DriveFamily, TimeoutTable};
use crate::scsi::transport::{CmdStatus, DataDir, DriverStatus, ScsiTransport};
use crate::scsi::{dump, LTFS_BLOCKSIZE};
use crate::util::endian;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Physical position as reported by READ POSITION (long form).
#[derive(Debug, Clone, Copy, Default)]
pub struct Position {
    pub partition: u8,
    pub block: u64,
    pub filemarks: u64,
    pub bop: bool,
    pub at_eod: bool,
    pub ew: bool,
    pub pew: bool,
}

/// Outcome of a block write; early-warning conditions are reported, not
/// failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteStatus {
    pub ew: bool,
    pub pew: bool,
}

/// Outcome of a block read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes landed in the caller's buffer.
    Data(usize),
    Filemark,
    EndOfData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceOp {
    Blocks,
    BlocksBack,
    Filemarks,
    FilemarksBack,
    EndOfData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mountable {
    ReadWrite,
    ReadOnly,
    No,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Capacity {
    pub remaining_ip: u64,
    pub remaining_dp: u64,
    pub max_ip: u64,
    pub max_dp: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CartridgeHealth {
    pub tape_alerts: Vec<u8>,
    pub permanent_read_errors: u64,
    pub datasets_written: u64,
}

/// Synthetic permanent-error injection, armed through the debug xattrs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForceError {
    pub remaining: u64,
    pub armed: bool,
}

impl ForceError {
    /// Count down one operation; fires when the counter reaches zero.
    fn fire(&mut self) -> bool {
        if !self.armed {
            return false;
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            return false;
        }
        true
    }
}

pub struct TapeDevice {
    transport: Box<dyn ScsiTransport>,
    timeouts: TimeoutTable,
    pub family: DriveFamily,
    pub vendor: String,
    pub product: String,
    pub serial: String,
    lbp: Option<Codec>,
    fenced: bool,
    auto_dump: bool,
    dump_dir: PathBuf,
    reservation_key: Option<[u8; 8]>,
    pub force_write_perm: ForceError,
    pub force_read_perm: ForceError,
}

impl TapeDevice {
    /// Open a device over a transport: identify it, build the timeout
    /// table, and try to learn per-opcode timeouts from the drive.
    pub fn open(transport: Box<dyn ScsiTransport>) -> Result<TapeDevice> {
        let mut dev = TapeDevice {
            transport,
            timeouts: TimeoutTable::new(DriveFamily::Unknown),
            family: DriveFamily::Unknown,
            vendor: String::new(),
            product: String::new(),
            serial: String::new(),
            lbp: None,
            fenced: false,
            auto_dump: true,
            dump_dir: dump::default_dump_dir(),
            reservation_key: None,
            force_write_perm: ForceError::default(),
            force_read_perm: ForceError::default(),
        };

        let std_inquiry = dev.inquiry(None)?;
        if std_inquiry.len() >= 36 {
            dev.vendor = String::from_utf8_lossy(&std_inquiry[8..16]).trim().to_string();
            dev.product = String::from_utf8_lossy(&std_inquiry[16..32]).trim().to_string();
        }
        dev.family = DriveFamily::from_product_id(&dev.product);
        dev.timeouts = TimeoutTable::new(dev.family);

        if let Ok(page) = dev.inquiry(Some(0x80)) {
            if page.len() > 4 {
                let len = (page[3] as usize).min(page.len() - 4);
                dev.serial = String::from_utf8_lossy(&page[4..4 + len]).trim().to_string();
            }
        }

        dev.learn_timeouts();
        info!(
            "opened tape device {} {} (serial {})",
            dev.vendor, dev.product, dev.serial
        );
        Ok(dev)
    }

    pub fn set_auto_dump(&mut self, enabled: bool) {
        self.auto_dump = enabled;
    }

    pub fn set_dump_dir(&mut self, dir: PathBuf) {
        self.dump_dir = dir;
    }

    pub fn lbp_codec(&self) -> Option<Codec> {
        self.lbp
    }

    pub fn is_fenced(&self) -> bool {
        self.fenced
    }

    fn learn_timeouts(&mut self) {
        // Best effort: drives without REPORT SUPPORTED OPERATION CODES keep
        // the static table.
        for opcode in [op::READ, op::WRITE, op::LOCATE16, op::SPACE, op::ERASE] {
            let cdb_bytes = cdb::report_supported_opcode(opcode, 64);
            let mut buf = [0u8; 64];
            match self.transport.issue(&cdb_bytes, DataDir::In(&mut buf), 60) {
                Ok(st) if st.status == 0 && st.transferred >= 12 => {
                    // Timeout descriptor: recommended timeout at bytes 8..12
                    // of the one-command response when present.
                    let secs = endian::get_u32(&buf[8..12]);
                    self.timeouts.learn(opcode, secs);
                }
                _ => {}
            }
        }
    }

    // --- core issue path -------------------------------------------------

    /// Issue one CDB with the standard retry policy. Returns the raw status
    /// plus parsed sense for commands that want flag details.
    fn issue(
        &mut self,
        cdb_bytes: &[u8],
        mut data: DataDir<'_>,
    ) -> Result<(CmdStatus, Option<SenseData>)> {
        if self.fenced {
            return Err(LtfsError::DeviceFenced);
        }
        let timeout = self.timeouts.get(cdb_bytes[0]);
        let mut soft_retries = 0u8;
        loop {
            let borrowed = match &mut data {
                DataDir::None => DataDir::None,
                DataDir::In(buf) => DataDir::In(&mut **buf),
                DataDir::Out(buf) => DataDir::Out(*buf),
            };
            let st = self.transport.issue(cdb_bytes, borrowed, timeout)?;

            match st.driver {
                DriverStatus::Ok => {}
                DriverStatus::ImmediateRetry | DriverStatus::Requeue => continue,
                DriverStatus::Busy | DriverStatus::SoftError => {
                    if soft_retries == 0 {
                        soft_retries += 1;
                        continue;
                    }
                    return Err(DeviceError::Timeout.into());
                }
                DriverStatus::Timeout => return Err(DeviceError::Timeout.into()),
                DriverStatus::ConnectionLost => {
                    self.reconnect()?;
                    if soft_retries == 0 {
                        soft_retries += 1;
                        continue;
                    }
                    return Err(DeviceError::ConnectionLost.into());
                }
            }

            match st.status {
                0x00 => return Ok((st, None)),
                0x02 => {
                    let sense = SenseData::parse(st.sense.as_ref().map(|s| &s[..]).unwrap_or(&[]));
                    return Ok((st, Some(sense)));
                }
                0x08 => {
                    // Device busy.
                    if soft_retries == 0 {
                        soft_retries += 1;
                        continue;
                    }
                    return Err(DeviceError::Timeout.into());
                }
                0x18 => return Err(DeviceError::ReservationConflict.into()),
                other => {
                    warn!("unexpected SCSI status {:#04x}", other);
                    return Err(DeviceError::HardwareError.into());
                }
            }
        }
    }

    /// Issue a CDB expecting a clean completion; noise-class sense is
    /// swallowed, error-class sense becomes the translated error after dump
    /// capture and fencing side effects.
    fn issue_clean(&mut self, cdb_bytes: &[u8], data: DataDir<'_>) -> Result<usize> {
        let (st, sense) = self.issue(cdb_bytes, data)?;
        match sense {
            None => Ok(st.transferred),
            Some(s) => {
                let err = sense::decode(&s);
                match err.class() {
                    ErrorClass::Clean | ErrorClass::Noise => Ok(st.transferred),
                    ErrorClass::Error => Err(self.raise(err, &s)),
                }
            }
        }
    }

    /// Apply dump/fence side effects and produce the final error value.
    fn raise(&mut self, err: DeviceError, s: &SenseData) -> LtfsError {
        warn!("device error {:?} ({})", err, s);
        if err.wants_dump() && self.auto_dump {
            let serial = self.serial.clone();
            let dir = self.dump_dir.clone();
            if let Err(e) = dump::capture(self.transport.as_mut(), &serial, &dir) {
                warn!("dump capture failed: {}", e);
            }
        }
        if err.wants_fence() {
            debug!("fencing device after {:?}", err);
            self.fenced = true;
        }
        err.into()
    }

    /// Reconnect after a lost connection: reopen the device node, then
    /// re-register the reservation key and check whether another initiator
    /// preempted us while we were away.
    fn reconnect(&mut self) -> Result<()> {
        warn!("connection to {} lost, reconnecting", self.transport.identifier());
        self.transport.reconnect()?;
        if let Some(key) = self.reservation_key {
            let param = reservation::param_list([0u8; 8], key);
            let cdb_bytes =
                cdb::persistent_reserve_out(action::REGISTER_IGNORE_EXISTING, 0, param.len() as u16);
            let st = self.transport.issue(&cdb_bytes, DataDir::Out(&param), 60)?;
            if st.status != 0 {
                self.fenced = true;
                return Err(DeviceError::PowerOnReset.into());
            }
            // If someone else holds the reservation now, we must fail over.
            let holders = self.reservation_holders()?;
            if holders.iter().any(|(k, held)| *held && *k != key) {
                self.fenced = true;
                return Err(DeviceError::NeedFailover.into());
            }
        }
        Ok(())
    }

    /// Clear the fence: the caller decides when to revalidate, typically at
    /// the public-operation boundary before a single retry.
    pub fn revalidate(&mut self) -> Result<()> {
        self.fenced = false;
        match self.test_unit_ready() {
            Ok(()) => {
                debug!("device revalidated");
                Ok(())
            }
            Err(e) => {
                self.fenced = true;
                Err(e)
            }
        }
    }

    // --- identification and readiness ------------------------------------

    pub fn inquiry(&mut self, page: Option<u8>) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 255];
        let cdb_bytes = cdb::inquiry(page, buf.len() as u16);
        let n = self.issue_clean(&cdb_bytes, DataDir::In(&mut buf))?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn test_unit_ready(&mut self) -> Result<()> {
        let (_, sense) = self.issue(&cdb::test_unit_ready(), DataDir::None)?;
        match sense {
            None => Ok(()),
            Some(s) => {
                let err = sense::decode(&s);
                match err {
                    DeviceError::NoSense | DeviceError::RecoveredError => Ok(()),
                    DeviceError::NoMedium | DeviceError::NotReady | DeviceError::BecomingReady => {
                        Err(LtfsError::DeviceUnready)
                    }
                    other => Err(self.raise(other, &s)),
                }
            }
        }
    }

    // --- motion ----------------------------------------------------------

    pub fn rewind(&mut self) -> Result<()> {
        self.issue_clean(&cdb::rewind(false), DataDir::None)?;
        Ok(())
    }

    pub fn locate(&mut self, partition: u8, block: u64) -> Result<()> {
        debug!("locate p{} b{}", partition, block);
        self.issue_clean(&cdb::locate16(partition, block), DataDir::None)?;
        Ok(())
    }

    pub fn space(&mut self, sp_op: SpaceOp, count: u64) -> Result<()> {
        let (code, signed) = match sp_op {
            SpaceOp::Blocks => (SpaceCode::Blocks, count as i32),
            SpaceOp::BlocksBack => (SpaceCode::Blocks, -(count as i32)),
            SpaceOp::Filemarks => (SpaceCode::Filemarks, count as i32),
            SpaceOp::FilemarksBack => (SpaceCode::Filemarks, -(count as i32)),
            SpaceOp::EndOfData => (SpaceCode::EndOfData, 0),
        };
        let (st, sense) = self.issue(&cdb::space(code, signed), DataDir::None)?;
        let _ = st;
        match sense {
            None => Ok(()),
            Some(s) => {
                let err = sense::decode(&s);
                match err {
                    DeviceError::NoSense | DeviceError::RecoveredError | DeviceError::BopDetected => {
                        Ok(())
                    }
                    DeviceError::EodDetected => Err(LtfsError::UnexpectedEod),
                    DeviceError::FilemarkDetected => Err(LtfsError::UnexpectedFilemark),
                    other => Err(self.raise(other, &s)),
                }
            }
        }
    }

    pub fn read_position(&mut self) -> Result<Position> {
        let mut buf = [0u8; 32];
        let cdb_bytes = cdb::read_position();
        self.issue_clean(&cdb_bytes, DataDir::In(&mut buf))?;
        Ok(Position {
            partition: endian::get_u32(&buf[4..8]) as u8,
            block: endian::get_u64(&buf[8..16]),
            filemarks: endian::get_u64(&buf[16..24]),
            bop: buf[0] & 0x80 != 0,
            at_eod: buf[0] & 0x04 != 0,
            ew: buf[0] & 0x40 != 0,
            pew: buf[0] & 0x02 != 0,
        })
    }

    /// Restrict the usable capacity to `proportion`/65535 of the medium.
    pub fn set_capacity(&mut self, proportion: u16) -> Result<()> {
        self.issue_clean(&cdb::set_capacity(proportion), DataDir::None)?;
        Ok(())
    }

    // --- data transfer ---------------------------------------------------

    /// Read one block of up to `buf.len()` bytes. With `sili`, short blocks
    /// return their actual length without length-mismatch sense.
    pub fn read_block(&mut self, buf: &mut [u8], sili: bool) -> Result<ReadOutcome> {
        if self.force_read_perm.fire() {
            let s = SenseData {
                key: 0x03,
                asc: 0x11,
                ascq: 0x00,
                ..Default::default()
            };
            return Err(self.raise(DeviceError::ReadPerm, &s));
        }
        let requested = buf.len();
        let lbp = self.lbp;
        let (st, sense) = match lbp {
            None => {
                let cdb_bytes = cdb::read(requested as u32, sili);
                self.issue(&cdb_bytes, DataDir::In(buf))?
            }
            Some(_) => {
                // Protected read: the block arrives with 4 CRC bytes.
                let mut protected = vec![0u8; requested + crate::crc::CRC_SIZE];
                let cdb_bytes = cdb::read(protected.len() as u32, sili);
                let out = self.issue(&cdb_bytes, DataDir::In(&mut protected))?;
                let codec = lbp.unwrap();
                if out.0.transferred >= crate::crc::CRC_SIZE && out.1.as_ref().map_or(true, |s| !s.filemark)
                {
                    let payload = codec
                        .check(&protected[..out.0.transferred])
                        .map_err(|e| match e {
                            LtfsError::Device(err) => {
                                let s = SenseData::default();
                                self.raise(err, &s)
                            }
                            other => other,
                        })?;
                    buf[..payload.min(requested)]
                        .copy_from_slice(&protected[..payload.min(requested)]);
                    let mut fixed = out.0;
                    fixed.transferred = payload.min(requested);
                    (fixed, out.1)
                } else {
                    (out.0, out.1)
                }
            }
        };

        match sense {
            None => Ok(ReadOutcome::Data(st.transferred)),
            Some(s) => {
                let err = sense::decode(&s);
                match err {
                    DeviceError::FilemarkDetected => Ok(ReadOutcome::Filemark),
                    DeviceError::EodDetected => Ok(ReadOutcome::EndOfData),
                    DeviceError::NoSense | DeviceError::RecoveredError => {
                        Ok(ReadOutcome::Data(st.transferred))
                    }
                    DeviceError::LengthMismatch => {
                        // Consult the residual: positive difference is an
                        // underrun and succeeds with the short count.
                        match sense::classify_ili(&s, requested) {
                            DeviceError::Underrun => Ok(ReadOutcome::Data(st.transferred)),
                            _ => Err(self.raise(DeviceError::Overrun, &s)),
                        }
                    }
                    DeviceError::EarlyWarning | DeviceError::ProgEarlyWarning => {
                        Ok(ReadOutcome::Data(st.transferred))
                    }
                    other => Err(self.raise(other, &s)),
                }
            }
        }
    }

    /// Write one block. Early warning and programmable early warning are
    /// reported in the result; the data is on tape.
    pub fn write_block(&mut self, data: &[u8]) -> Result<WriteStatus> {
        if self.force_write_perm.fire() {
            let s = SenseData {
                key: 0x03,
                asc: 0x0C,
                ascq: 0x00,
                ..Default::default()
            };
            return Err(self.raise(DeviceError::WritePerm, &s));
        }
        let (st, sense) = match self.lbp {
            None => {
                let cdb_bytes = cdb::write(data.len() as u32);
                self.issue(&cdb_bytes, DataDir::Out(data))?
            }
            Some(codec) => {
                let mut protected = data.to_vec();
                codec.encode(&mut protected);
                let cdb_bytes = cdb::write(protected.len() as u32);
                self.issue(&cdb_bytes, DataDir::Out(&protected))?
            }
        };
        let _ = st;
        self.write_completion(sense)
    }

    pub fn write_filemarks(&mut self, count: u32, immed: bool) -> Result<WriteStatus> {
        let (_, sense) = self.issue(&cdb::write_filemarks(count, immed), DataDir::None)?;
        self.write_completion(sense)
    }

    fn write_completion(&mut self, sense: Option<SenseData>) -> Result<WriteStatus> {
        match sense {
            None => Ok(WriteStatus::default()),
            Some(s) => {
                let err = sense::decode(&s);
                match err {
                    DeviceError::NoSense | DeviceError::RecoveredError => Ok(WriteStatus::default()),
                    DeviceError::EarlyWarning | DeviceError::EomDetected => Ok(WriteStatus {
                        ew: true,
                        pew: false,
                    }),
                    DeviceError::ProgEarlyWarning => Ok(WriteStatus {
                        ew: false,
                        pew: true,
                    }),
                    DeviceError::NoSpace => Err(LtfsError::NoSpace),
                    other => Err(self.raise(other, &s)),
                }
            }
        }
    }

    // --- medium management -----------------------------------------------

    pub fn load(&mut self) -> Result<()> {
        self.issue_clean(&cdb::load_unload(true, false), DataDir::None)?;
        Ok(())
    }

    pub fn unload(&mut self) -> Result<()> {
        self.issue_clean(&cdb::load_unload(false, false), DataDir::None)?;
        Ok(())
    }

    pub fn erase(&mut self, long: bool) -> Result<()> {
        self.issue_clean(&cdb::erase(long, false), DataDir::None)?;
        Ok(())
    }

    pub fn format(&mut self, format_type: u8) -> Result<()> {
        info!("formatting medium (type {})", format_type);
        self.issue_clean(&cdb::format_medium(format_type), DataDir::None)?;
        Ok(())
    }

    pub fn prevent_medium_removal(&mut self, prevent: bool) -> Result<()> {
        self.issue_clean(&cdb::prevent_allow_medium_removal(prevent), DataDir::None)?;
        Ok(())
    }

    pub fn allow_overwrite(&mut self, partition: u8, block: u64) -> Result<()> {
        self.issue_clean(&cdb::allow_overwrite(partition, block), DataDir::None)?;
        Ok(())
    }

    pub fn set_compression(&mut self, enable: bool) -> Result<()> {
        // Read-modify-write of the device configuration page.
        let page = self.mode_sense(cdb::modepage::DEVICE_CONFIGURATION, 0x00, 0x00)?;
        let mut param = page;
        if param.len() >= 17 {
            if enable {
                param[16] |= 0x40;
            } else {
                param[16] &= !0x40;
            }
            // Mode select wants reserved header fields zeroed.
            param[0] = 0;
            param[1] = 0;
            self.mode_select(&param)?;
        }
        Ok(())
    }

    // --- mode/log paging -------------------------------------------------

    pub fn mode_sense(&mut self, page: u8, pc: u8, subpage: u8) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 512];
        let cdb_bytes = cdb::mode_sense10(page, pc, subpage, buf.len() as u16);
        let n = self.issue_clean(&cdb_bytes, DataDir::In(&mut buf))?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn mode_select(&mut self, param: &[u8]) -> Result<()> {
        let cdb_bytes = cdb::mode_select10(param.len() as u16);
        self.issue_clean(&cdb_bytes, DataDir::Out(param))?;
        Ok(())
    }

    pub fn log_sense(&mut self, page: u8, subpage: u8) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 1024];
        let cdb_bytes = cdb::log_sense(page, subpage, buf.len() as u16);
        let n = self.issue_clean(&cdb_bytes, DataDir::In(&mut buf))?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Remaining and maximum capacity from the tape capacity log page.
    pub fn remaining_capacity(&mut self) -> Result<Capacity> {
        let page = self.log_sense(0x31, 0x00)?;
        let mut cap = Capacity::default();
        let mut off = 4;
        while off + 8 <= page.len() {
            let code = endian::get_u16(&page[off..off + 2]);
            let len = page[off + 3] as usize;
            if off + 4 + len > page.len() || len < 4 {
                break;
            }
            let value = endian::get_u32(&page[off + 4..off + 8]) as u64;
            match code {
                1 => cap.remaining_ip = value,
                2 => cap.remaining_dp = value,
                3 => cap.max_ip = value,
                4 => cap.max_dp = value,
                _ => {}
            }
            off += 4 + len;
        }
        Ok(cap)
    }

    pub fn get_tape_alert(&mut self) -> Result<Vec<u8>> {
        let page = self.log_sense(0x2E, 0x00)?;
        let mut flags = Vec::new();
        let mut off = 4;
        while off + 5 <= page.len() {
            let len = page[off + 3] as usize;
            if len >= 1 && page[off + 4] != 0 {
                flags.push(endian::get_u16(&page[off..off + 2]) as u8);
            }
            off += 4 + len;
        }
        Ok(flags)
    }

    pub fn clear_tape_alert(&mut self) -> Result<()> {
        // Reading the page clears it on the drive side.
        let _ = self.log_sense(0x2E, 0x00)?;
        Ok(())
    }

    pub fn get_cartridge_health(&mut self) -> Result<CartridgeHealth> {
        Ok(CartridgeHealth {
            tape_alerts: self.get_tape_alert().unwrap_or_default(),
            permanent_read_errors: 0,
            datasets_written: 0,
        })
    }

    /// Check that EOD is readable on a partition. Restores the current
    /// position afterwards.
    pub fn get_eod_status(&mut self, partition: u8) -> Result<bool> {
        let saved = self.read_position()?;
        self.locate(partition, 0)?;
        let ok = self.space(SpaceOp::EndOfData, 0).is_ok();
        self.locate(saved.partition, saved.block)?;
        Ok(ok)
    }

    /// Decide whether a cartridge may be mounted in this drive, from its
    /// barcode density suffix. Same generation mounts read-write, one back
    /// read-write, two back read-only; anything older (or foreign) refuses.
    pub fn is_mountable(&self, barcode: &str, strict: bool) -> Mountable {
        let gen = match self.family.lto_generation() {
            Some(g) => g,
            None => return Mountable::ReadWrite, // enterprise handled by density codes
        };
        let suffix = barcode.trim();
        let cart_gen = suffix
            .char_indices()
            .rev()
            .find(|(_, c)| *c == 'L' || *c == 'M')
            .and_then(|(i, c)| {
                suffix[i + 1..]
                    .parse::<u8>()
                    .ok()
                    .map(|n| if c == 'M' { n } else { n })
            });
        match cart_gen {
            Some(cg) if cg == gen => Mountable::ReadWrite,
            Some(cg) if cg + 1 == gen => Mountable::ReadWrite,
            Some(cg) if cg + 2 == gen && !strict => Mountable::ReadOnly,
            Some(_) => Mountable::No,
            None => {
                if strict {
                    Mountable::No
                } else {
                    Mountable::ReadWrite
                }
            }
        }
    }

    // --- MAM -------------------------------------------------------------

    pub fn read_attribute(&mut self, partition: u8, id: u16) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 1024];
        let cdb_bytes = cdb::read_attribute(partition, id, buf.len() as u32);
        let n = self.issue_clean(&cdb_bytes, DataDir::In(&mut buf))?;
        if n < 9 {
            return Err(LtfsError::SmallBuffer);
        }
        let len = endian::get_u16(&buf[7..9]) as usize;
        if 9 + len > n {
            return Err(LtfsError::SmallBuffer);
        }
        Ok(buf[9..9 + len].to_vec())
    }

    pub fn write_attribute(
        &mut self,
        partition: u8,
        id: u16,
        format: u8,
        value: &[u8],
    ) -> Result<()> {
        let mut param = vec![0u8; 4 + 5 + value.len()];
        endian::put_u32(&mut param[0..4], (5 + value.len()) as u32);
        endian::put_u16(&mut param[4..6], id);
        param[6] = format;
        endian::put_u16(&mut param[7..9], value.len() as u16);
        param[9..].copy_from_slice(value);
        let cdb_bytes = cdb::write_attribute(partition, param.len() as u32);
        self.issue_clean(&cdb_bytes, DataDir::Out(&param))?;
        Ok(())
    }

    // --- reservation -----------------------------------------------------

    /// Register our key (ignoring any stale registration) and take the
    /// exclusive reservation. On conflict, log a hint about the holder.
    pub fn reserve(&mut self, key: [u8; 8]) -> Result<()> {
        let param = reservation::param_list([0u8; 8], key);
        let cdb_bytes =
            cdb::persistent_reserve_out(action::REGISTER_IGNORE_EXISTING, 0, param.len() as u16);
        self.issue_clean(&cdb_bytes, DataDir::Out(&param))?;
        self.reservation_key = Some(key);

        let param = reservation::param_list(key, [0u8; 8]);
        let cdb_bytes = cdb::persistent_reserve_out(
            action::RESERVE,
            reservation::TYPE_EXCLUSIVE,
            param.len() as u16,
        );
        match self.issue_clean(&cdb_bytes, DataDir::Out(&param)) {
            Ok(_) => Ok(()),
            Err(LtfsError::Device(DeviceError::ReservationConflict)) => {
                if let Ok(holders) = self.reservation_holders() {
                    for (holder, held) in holders {
                        if held {
                            warn!(
                                "reservation held by {}",
                                reservation::format_key(&holder)
                            );
                        }
                    }
                }
                Err(DeviceError::ReservationConflict.into())
            }
            Err(e) => Err(e),
        }
    }

    pub fn release(&mut self) -> Result<()> {
        if let Some(key) = self.reservation_key {
            let param = reservation::param_list(key, [0u8; 8]);
            let cdb_bytes = cdb::persistent_reserve_out(
                action::RELEASE,
                reservation::TYPE_EXCLUSIVE,
                param.len() as u16,
            );
            self.issue_clean(&cdb_bytes, DataDir::Out(&param))?;
        }
        Ok(())
    }

    /// Take the reservation from a dead holder.
    pub fn preempt(&mut self, victim: [u8; 8]) -> Result<()> {
        let key = self.reservation_key.ok_or(LtfsError::NullArg("reservation key"))?;
        let param = reservation::param_list(key, victim);
        let cdb_bytes = cdb::persistent_reserve_out(
            action::PREEMPT_ABORT,
            reservation::TYPE_EXCLUSIVE,
            param.len() as u16,
        );
        self.issue_clean(&cdb_bytes, DataDir::Out(&param))?;
        Ok(())
    }

    pub fn reservation_holders(&mut self) -> Result<Vec<([u8; 8], bool)>> {
        let mut buf = vec![0u8; 512];
        let cdb_bytes = cdb::persistent_reserve_in(
            reservation::in_action::FULL_STATUS,
            buf.len() as u16,
        );
        let n = self.issue_clean(&cdb_bytes, DataDir::In(&mut buf))?;
        buf.truncate(n);
        Ok(reservation::parse_full_status(&buf))
    }

    // --- encryption ------------------------------------------------------

    /// Hand the drive a data key for application-managed encryption.
    pub fn set_key(&mut self, key: &[u8; 32], key_alias: &[u8; 12]) -> Result<()> {
        // SET DATA ENCRYPTION page: header, scope/mode bytes, KAD for the
        // alias, then the key itself.
        let mut param = vec![0u8; 20 + 12 + 32];
        endian::put_u16(&mut param[0..2], 0x0010);
        let param_len = param.len();
        endian::put_u16(&mut param[2..4], (param_len - 4) as u16);
        param[4] = 0x40; // scope: all I_T nexus
        param[5] = 0x02; // encrypt mode: encrypt
        param[6] = 0x02; // decrypt mode: decrypt
        param[7] = 0x01; // algorithm index
        endian::put_u16(&mut param[18..20], 32);
        param[20..52].copy_from_slice(key);
        param[52..64].copy_from_slice(key_alias);
        let cdb_bytes = cdb::security_protocol_out(param.len() as u32);
        self.issue_clean(&cdb_bytes, DataDir::Out(&param))?;
        Ok(())
    }

    /// Ask the drive which key alias the current tape was written with.
    pub fn get_key_alias(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; 256];
        let cdb_bytes = cdb::security_protocol_in(0x0021, buf.len() as u32);
        match self.issue_clean(&cdb_bytes, DataDir::In(&mut buf)) {
            Ok(n) if n > 24 => Ok(Some(buf[12..24].to_vec())),
            Ok(_) => Ok(None),
            Err(LtfsError::Device(DeviceError::IllegalRequest))
            | Err(LtfsError::Device(DeviceError::InvalidField)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // --- LBP -------------------------------------------------------------

    /// Select and enable a Logical Block Protection method.
    ///
    /// Enterprise drives advertise CRC32C capability in the INIT_EXT mode
    /// page; LTO generation 7 and later always accept it. Everything older
    /// uses the Reed-Solomon code. Enabling writes the control data
    /// protection subpage with both the read and write protection bits.
    pub fn setup_lbp(&mut self) -> Result<()> {
        let mut use_crc32c = false;
        if let Some(gen) = self.family.lto_generation() {
            use_crc32c = gen >= 7;
        }
        if !use_crc32c {
            if let Ok(page) = self.mode_sense(cdb::modepage::INIT_EXT, cdb::modepage::PC_CURRENT, 0)
            {
                if page.len() > 10 && page[10] & 0x20 != 0 {
                    use_crc32c = true;
                }
            }
        }
        let codec = if use_crc32c {
            Codec::Crc32c
        } else {
            Codec::RsGf256
        };

        let mut param = vec![0u8; 8 + 12];
        param[8] = 0x40 | cdb::modepage::CONTROL_DATA_PROTECTION;
        param[9] = cdb::modepage::CONTROL_DP_SUBPAGE;
        endian::put_u16(&mut param[10..12], 8);
        param[12] = codec.method_code();
        param[13] = crate::crc::CRC_SIZE as u8;
        param[14] = 0xC0; // WRDP | RBDP
        self.mode_select(&param)?;

        info!("logical block protection enabled ({:?})", codec);
        self.lbp = Some(codec);
        Ok(())
    }

    pub fn disable_lbp(&mut self) -> Result<()> {
        let mut param = vec![0u8; 8 + 12];
        param[8] = 0x40 | cdb::modepage::CONTROL_DATA_PROTECTION;
        param[9] = cdb::modepage::CONTROL_DP_SUBPAGE;
        endian::put_u16(&mut param[10..12], 8);
        self.mode_select(&param)?;
        self.lbp = None;
        Ok(())
    }

    // --- diagnostics -----------------------------------------------------

    /// Force a dump capture regardless of the auto-dump setting.
    pub fn take_dump(&mut self) -> Result<Option<PathBuf>> {
        let serial = self.serial.clone();
        let dir = self.dump_dir.clone();
        dump::capture(self.transport.as_mut(), &serial, &dir)
    }

    /// Convenience: write a buffer as consecutive fixed-size blocks.
    pub fn write_blocks(&mut self, data: &[u8], blocksize: usize) -> Result<WriteStatus> {
        let mut status = WriteStatus::default();
        for chunk in data.chunks(blocksize.max(1)) {
            let st = self.write_block(chunk)?;
            status.ew |= st.ew;
            status.pew |= st.pew;
        }
        Ok(status)
    }

    /// Default transfer size for label and index blocks.
    pub fn default_blocksize() -> u32 {
        LTFS_BLOCKSIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::sim::SimTape;

    fn device() -> TapeDevice {
        TapeDevice::open(Box::new(SimTape::new())).unwrap()
    }

    #[test]
    fn open_identifies_drive() {
        let dev = device();
        assert_eq!(dev.vendor, "LTFSCORE");
        assert_eq!(dev.family, DriveFamily::Lto9);
        assert_eq!(dev.serial, "SIM0000001");
    }

    #[test]
    fn write_then_read_block() {
        let mut dev = device();
        dev.write_block(b"hello tape").unwrap();
        dev.rewind().unwrap();
        let mut buf = vec![0u8; 64];
        match dev.read_block(&mut buf, true).unwrap() {
            ReadOutcome::Data(n) => assert_eq!(&buf[..n], b"hello tape"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn filemark_and_eod_outcomes() {
        let mut dev = device();
        dev.write_block(b"x").unwrap();
        dev.write_filemarks(1, false).unwrap();
        dev.rewind().unwrap();
        let mut buf = vec![0u8; 8];
        assert!(matches!(
            dev.read_block(&mut buf, true).unwrap(),
            ReadOutcome::Data(1)
        ));
        assert_eq!(dev.read_block(&mut buf, true).unwrap(), ReadOutcome::Filemark);
        assert_eq!(dev.read_block(&mut buf, true).unwrap(), ReadOutcome::EndOfData);
    }

    #[test]
    fn position_tracks_partition_and_block() {
        let mut dev = device();
        dev.write_block(b"a").unwrap();
        dev.write_block(b"b").unwrap();
        let pos = dev.read_position().unwrap();
        assert_eq!(pos.partition, 0);
        assert_eq!(pos.block, 2);
        assert!(pos.at_eod);
    }

    #[test]
    fn lbp_setup_selects_crc32c_on_lto9() {
        let mut dev = device();
        dev.setup_lbp().unwrap();
        assert_eq!(dev.lbp_codec(), Some(Codec::Crc32c));
        // Round trip under protection.
        dev.write_block(b"protected").unwrap();
        dev.rewind().unwrap();
        let mut buf = vec![0u8; 64];
        match dev.read_block(&mut buf, true).unwrap() {
            ReadOutcome::Data(n) => assert_eq!(&buf[..n], b"protected"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn reserve_and_release() {
        let mut dev = device();
        let key = crate::scsi::reservation::key_from_hostname("host1");
        dev.reserve(key).unwrap();
        let holders = dev.reservation_holders().unwrap();
        assert!(holders.iter().any(|(k, held)| *held && *k == key));
        dev.release().unwrap();
    }

    #[test]
    fn mam_round_trip() {
        let mut dev = device();
        dev.write_attribute(0, cdb::mam::BARCODE, cdb::mam::FORMAT_ASCII, b"ABC123L9")
            .unwrap();
        let value = dev.read_attribute(0, cdb::mam::BARCODE).unwrap();
        assert_eq!(&value, b"ABC123L9");
    }

    #[test]
    fn force_write_perm_fires_after_countdown() {
        let mut dev = device();
        dev.set_auto_dump(false);
        dev.force_write_perm = ForceError {
            remaining: 2,
            armed: true,
        };
        assert!(dev.write_block(b"1").is_ok());
        assert!(dev.write_block(b"2").is_ok());
        assert!(matches!(
            dev.write_block(b"3"),
            Err(LtfsError::Device(DeviceError::WritePerm))
        ));
    }

    #[test]
    fn barcode_mountability() {
        let dev = device(); // LTO9
        assert_eq!(dev.is_mountable("ABC123L9", false), Mountable::ReadWrite);
        assert_eq!(dev.is_mountable("ABC123L8", false), Mountable::ReadWrite);
        assert_eq!(dev.is_mountable("ABC123L7", false), Mountable::ReadOnly);
        assert_eq!(dev.is_mountable("ABC123L7", true), Mountable::No);
        assert_eq!(dev.is_mountable("ABC123L5", false), Mountable::No);
    }
}
