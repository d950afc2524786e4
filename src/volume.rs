//! Volume: the mounted cartridge.
//!
//! Owns the device handle, the partition labels, the live index, the plugin
//! handles (KMI, dentry cache, I/O scheduler) and the volume-wide lock
//! state. Mount, unmount, format and index sync live here; chain traversal
//! and recovery are in [`crate::chain`].

use crate::chain;
use crate::dcache::DentryCache;
use crate::error::{LtfsError, Result};
use crate::index::types::{Index, TapePtr, MAX_COMMIT_MESSAGE};
use crate::index::xml as index_xml;
use crate::iosched::IoScheduler;
use crate::kmi::KeyManager;
use crate::lock::Mrsw;
use crate::scsi::cdb::mam;
use crate::scsi::reservation;
use crate::tape::{SpaceOp, TapeDevice};
use crate::util::time::LtfsTime;
use parking_lot::{Mutex, RwLock};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const LTFS_FORMAT_VERSION: &str = "2.4.0";
/// Number of label records (VOL1, filemark, XML label, filemark).
pub const LABEL_END_BLOCK: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountType {
    ReadWrite,
    ReadOnly,
    Rollback,
    RollbackMeta,
}

/// Volume lock state carried in the index and mirrored to MAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeLockState {
    Unlocked,
    Locked,
    PermLocked,
    /// A permanent write error was recorded without naming a partition.
    /// Distinct from [`VolumeLockState::PweBoth`]: the localized states
    /// carry the per-partition error bits, this one does not.
    Pwe,
    PweDp,
    PweIp,
    PweBoth,
}

impl VolumeLockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeLockState::Unlocked => "unlocked",
            VolumeLockState::Locked => "locked",
            VolumeLockState::PermLocked => "permlocked",
            VolumeLockState::Pwe => "pwe",
            VolumeLockState::PweDp => "pwe-dp",
            VolumeLockState::PweIp => "pwe-ip",
            VolumeLockState::PweBoth => "pwe-both",
        }
    }

    pub fn parse(s: &str) -> Option<VolumeLockState> {
        match s.trim() {
            "unlocked" => Some(VolumeLockState::Unlocked),
            "locked" => Some(VolumeLockState::Locked),
            "permlocked" => Some(VolumeLockState::PermLocked),
            "pwe" => Some(VolumeLockState::Pwe),
            "pwe-dp" => Some(VolumeLockState::PweDp),
            "pwe-ip" => Some(VolumeLockState::PweIp),
            "pwe-both" => Some(VolumeLockState::PweBoth),
            _ => None,
        }
    }

    pub fn is_pwe(&self) -> bool {
        matches!(
            self,
            VolumeLockState::Pwe
                | VolumeLockState::PweDp
                | VolumeLockState::PweIp
                | VolumeLockState::PweBoth
        )
    }
}

/// Why an index is being written; recorded as the commit message when the
/// operator has not set one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    Periodic,
    RequestedByUser,
    ExtendedAttribute,
    Close,
    Unmount,
    Format,
    Rollback,
    Recovery,
}

impl SyncReason {
    fn label(&self) -> &'static str {
        match self {
            SyncReason::Periodic => "Sync-by-Time",
            SyncReason::RequestedByUser => "Requested by user",
            SyncReason::ExtendedAttribute => "Sync-by-EA",
            SyncReason::Close => "Sync-by-Close",
            SyncReason::Unmount => "Unmount",
            SyncReason::Format => "Format",
            SyncReason::Rollback => "Rollback",
            SyncReason::Recovery => "Recovery",
        }
    }
}

/// Partition label contents; both partitions carry the same label except for
/// the `this_partition` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub creator: String,
    pub barcode: String,
    pub vol_uuid: String,
    pub format_time: LtfsTime,
    pub blocksize: u32,
    pub compression: bool,
    pub partid_ip: char,
    pub partid_dp: char,
    pub this_partition: char,
    pub version: String,
}

impl Label {
    pub fn new(barcode: &str, vol_uuid: &str, blocksize: u32) -> Label {
        Label {
            creator: crate::index::types::INDEX_CREATOR.to_string(),
            barcode: barcode.to_string(),
            vol_uuid: vol_uuid.to_string(),
            format_time: LtfsTime::now(),
            blocksize,
            compression: true,
            partid_ip: 'a',
            partid_dp: 'b',
            this_partition: 'a',
            version: LTFS_FORMAT_VERSION.to_string(),
        }
    }

    /// Physical partition number for a label partition id.
    pub fn part_num(&self, id: char) -> Result<u8> {
        if id == self.partid_ip {
            Ok(0)
        } else if id == self.partid_dp {
            Ok(1)
        } else {
            Err(LtfsError::bad_arg(format!("unknown partition id '{}'", id)))
        }
    }

    pub fn part_id(&self, num: u8) -> char {
        if num == 0 {
            self.partid_ip
        } else {
            self.partid_dp
        }
    }

    /// The 80-byte ANSI VOL1 record: "VOL1", barcode at 4..9, "LTFS" at
    /// 24..27, "4" (standard level) at 79.
    pub fn vol1(&self) -> [u8; 80] {
        let mut rec = [b' '; 80];
        rec[0..4].copy_from_slice(b"VOL1");
        let barcode = self.barcode.as_bytes();
        let n = barcode.len().min(6);
        rec[4..4 + n].copy_from_slice(&barcode[..n]);
        rec[10] = b'L';
        rec[24..28].copy_from_slice(b"LTFS");
        rec[79] = b'4';
        rec
    }

    pub fn check_vol1(rec: &[u8]) -> Result<String> {
        if rec.len() < 80 || &rec[0..4] != b"VOL1" {
            // A damaged header that still carries the LTFS owner string is
            // worth a different answer: recovery tools may keep going.
            if rec.len() >= 28 && &rec[24..28] == b"LTFS" {
                return Err(LtfsError::LabelPossibleValid);
            }
            return Err(LtfsError::invalid_label("not an ANSI VOL1 record"));
        }
        if &rec[24..28] != b"LTFS" {
            return Err(LtfsError::invalid_label("VOL1 owner is not LTFS"));
        }
        Ok(String::from_utf8_lossy(&rec[4..10]).trim().to_string())
    }

    pub fn to_xml(&self, this_partition: char) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(&format!("<ltfslabel version=\"{}\">\n", self.version));
        xml.push_str(&format!("  <creator>{}</creator>\n", self.creator));
        xml.push_str(&format!(
            "  <formattime>{}</formattime>\n",
            self.format_time.format()
        ));
        xml.push_str(&format!("  <volumeuuid>{}</volumeuuid>\n", self.vol_uuid));
        xml.push_str(&format!(
            "  <location><partition>{}</partition></location>\n",
            this_partition
        ));
        xml.push_str(&format!(
            "  <partitions><index>{}</index><data>{}</data></partitions>\n",
            self.partid_ip, self.partid_dp
        ));
        xml.push_str(&format!("  <blocksize>{}</blocksize>\n", self.blocksize));
        xml.push_str(&format!(
            "  <compression>{}</compression>\n",
            self.compression
        ));
        xml.push_str("</ltfslabel>\n");
        xml
    }

    pub fn from_xml(xml: &str) -> Result<Label> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);
        let mut label = Label::new("", "", crate::scsi::LTFS_BLOCKSIZE);
        label.creator.clear();
        let mut in_partitions = false;
        let mut in_location = false;
        let mut found = false;
        loop {
            match reader
                .read_event()
                .map_err(|e| LtfsError::invalid_label(e.to_string()))?
            {
                Event::Start(e) => {
                    let name = e.local_name().as_ref().to_vec();
                    match name.as_slice() {
                        b"ltfslabel" => {
                            found = true;
                            for attr in e.attributes().flatten() {
                                if attr.key.as_ref() == b"version" {
                                    label.version =
                                        String::from_utf8_lossy(&attr.value).into_owned();
                                }
                            }
                        }
                        b"partitions" => in_partitions = true,
                        b"location" => in_location = true,
                        other => {
                            let tag = other.to_vec();
                            let end = e.to_end().into_owned();
                            let text = reader
                                .read_text(end.name())
                                .map_err(|e| LtfsError::invalid_label(e.to_string()))?
                                .into_owned();
                            match tag.as_slice() {
                                b"creator" => label.creator = text,
                                b"volumeuuid" => label.vol_uuid = text,
                                b"formattime" => {
                                    label.format_time =
                                        LtfsTime::parse(&text).unwrap_or(LtfsTime::EPOCH)
                                }
                                b"blocksize" => {
                                    label.blocksize = text.trim().parse().map_err(|_| {
                                        LtfsError::invalid_label("bad blocksize")
                                    })?
                                }
                                b"compression" => {
                                    label.compression = matches!(text.trim(), "true" | "1")
                                }
                                b"index" if in_partitions => {
                                    label.partid_ip = text.chars().next().unwrap_or('a')
                                }
                                b"data" if in_partitions => {
                                    label.partid_dp = text.chars().next().unwrap_or('b')
                                }
                                b"partition" if in_location => {
                                    label.this_partition = text.chars().next().unwrap_or('a')
                                }
                                _ => {}
                            }
                        }
                    }
                }
                Event::End(e) => match e.local_name().as_ref() {
                    b"partitions" => in_partitions = false,
                    b"location" => in_location = false,
                    b"ltfslabel" => break,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }
        if !found {
            return Err(LtfsError::invalid_label("no ltfslabel element"));
        }
        if label.vol_uuid.is_empty() {
            return Err(LtfsError::invalid_label("label has no volumeuuid"));
        }
        Ok(label)
    }

    /// Both partitions must carry the same label apart from
    /// `this_partition`.
    pub fn check_compatibility(ip: &Label, dp: &Label) -> Result<()> {
        if ip.vol_uuid != dp.vol_uuid {
            return Err(LtfsError::label_mismatch("volume UUID"));
        }
        if ip.version != dp.version {
            return Err(LtfsError::label_mismatch("format version"));
        }
        if ip.blocksize != dp.blocksize {
            return Err(LtfsError::label_mismatch("block size"));
        }
        if ip.partid_ip != dp.partid_ip || ip.partid_dp != dp.partid_dp {
            return Err(LtfsError::label_mismatch("partition map"));
        }
        Ok(())
    }
}

/// MAM volume-coherency record for one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coherency {
    pub uuid: String,
    /// Index generation.
    pub count: u64,
    /// Block of the index the generation refers to.
    pub set_id: u64,
}

impl Coherency {
    pub fn to_mam_bytes(&self) -> Vec<u8> {
        // version(1), count(8), set_id(8), uuid text.
        let mut buf = Vec::with_capacity(17 + self.uuid.len());
        buf.push(1u8);
        buf.extend_from_slice(&self.count.to_be_bytes());
        buf.extend_from_slice(&self.set_id.to_be_bytes());
        buf.extend_from_slice(self.uuid.as_bytes());
        buf
    }

    pub fn from_mam_bytes(buf: &[u8]) -> Option<Coherency> {
        if buf.len() < 17 || buf[0] != 1 {
            return None;
        }
        Some(Coherency {
            count: u64::from_be_bytes(buf[1..9].try_into().ok()?),
            set_id: u64::from_be_bytes(buf[9..17].try_into().ok()?),
            uuid: String::from_utf8_lossy(&buf[17..]).into_owned(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub readonly: bool,
    /// Periodic index sync interval; `None` disables the sync thread.
    pub sync_period: Option<Duration>,
    pub mountpoint: Option<String>,
    /// Rewrite absolute symlink targets relative to the mountpoint.
    pub livelink: bool,
    pub disable_auto_dump: bool,
    pub enable_lbp: bool,
    /// Refuse cartridges the drive can only partially handle.
    pub strict_drive_check: bool,
    /// Capture every index read during recovery to this directory.
    pub capture_index_dir: Option<std::path::PathBuf>,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            readonly: false,
            sync_period: Some(Duration::from_secs(300)),
            mountpoint: None,
            livelink: false,
            disable_auto_dump: false,
            enable_lbp: true,
            strict_drive_check: false,
            capture_index_dir: None,
        }
    }
}

pub struct Volume {
    pub device: Mutex<TapeDevice>,
    pub label: RwLock<Option<Label>>,
    pub index: RwLock<Index>,
    /// Operation-level volume lock; write for global index mutation.
    pub lock: Mrsw<()>,
    /// Serializes renames against each other.
    pub rename_lock: Mutex<()>,
    pub kmi: Mutex<Option<Box<dyn KeyManager>>>,
    pub dcache: Mutex<Option<Box<dyn DentryCache>>>,
    pub iosched: Mutex<Option<Box<dyn IoScheduler>>>,
    pub opts: MountOptions,
    pub mount_type: Mutex<MountType>,
    pub lock_state: Mutex<VolumeLockState>,
    pub ip_coh: Mutex<Coherency>,
    pub dp_coh: Mutex<Coherency>,
    /// Whether each partition currently ends in an index.
    pub ip_index_file_end: AtomicBool,
    pub dp_index_file_end: AtomicBool,
    pub file_open_count: AtomicU32,
    /// Blocks referenced by live files, for quota accounting.
    pub valid_block_count: AtomicU64,
    /// Latency of the first locate after load, a drive health signal.
    pub first_locate: Mutex<Option<Duration>>,
    /// Set while the periodic sync thread should keep running.
    pub periodic_keepalive: AtomicBool,
    /// Cartridge is WORM media: immutable/appendonly flags cannot be
    /// cleared once set.
    pub worm_media: AtomicBool,
    /// Last data block read, kept to serve consecutive byte ranges from the
    /// same block without repositioning.
    pub read_cache: Mutex<Option<ReadCache>>,
}

/// One cached on-tape block.
pub struct ReadCache {
    pub partition: char,
    pub block: u64,
    pub data: Vec<u8>,
}

impl Volume {
    pub fn new(device: TapeDevice, opts: MountOptions) -> Arc<Volume> {
        let index = Index::new_empty("", LtfsTime::now());
        Arc::new(Volume {
            device: Mutex::new(device),
            label: RwLock::new(None),
            index: RwLock::new(index),
            lock: Mrsw::new(()),
            rename_lock: Mutex::new(()),
            kmi: Mutex::new(None),
            dcache: Mutex::new(None),
            iosched: Mutex::new(None),
            opts,
            mount_type: Mutex::new(MountType::ReadWrite),
            lock_state: Mutex::new(VolumeLockState::Unlocked),
            ip_coh: Mutex::new(Coherency::default()),
            dp_coh: Mutex::new(Coherency::default()),
            ip_index_file_end: AtomicBool::new(false),
            dp_index_file_end: AtomicBool::new(false),
            file_open_count: AtomicU32::new(0),
            valid_block_count: AtomicU64::new(0),
            first_locate: Mutex::new(None),
            periodic_keepalive: AtomicBool::new(false),
            worm_media: AtomicBool::new(false),
            read_cache: Mutex::new(None),
        })
    }

    pub fn blocksize(&self) -> u64 {
        self.label
            .read()
            .as_ref()
            .map(|l| l.blocksize as u64)
            .unwrap_or(crate::scsi::LTFS_BLOCKSIZE as u64)
    }

    pub fn partid_ip(&self) -> char {
        self.label.read().as_ref().map(|l| l.partid_ip).unwrap_or('a')
    }

    pub fn partid_dp(&self) -> char {
        self.label.read().as_ref().map(|l| l.partid_dp).unwrap_or('b')
    }

    pub fn part_num(&self, id: char) -> Result<u8> {
        match &*self.label.read() {
            Some(label) => label.part_num(id),
            None => match id {
                'a' => Ok(0),
                'b' => Ok(1),
                _ => Err(LtfsError::bad_arg(format!("partition id '{}'", id))),
            },
        }
    }

    pub fn is_readonly_mount(&self) -> bool {
        self.opts.readonly
            || matches!(
                *self.mount_type.lock(),
                MountType::ReadOnly | MountType::Rollback | MountType::RollbackMeta
            )
    }

    /// True when the lock state forbids writes.
    pub fn is_write_locked(&self) -> bool {
        !matches!(*self.lock_state.lock(), VolumeLockState::Unlocked)
    }

    pub fn index_file_end(&self, partition_id: char) -> bool {
        if partition_id == self.partid_ip() {
            self.ip_index_file_end.load(Ordering::SeqCst)
        } else {
            self.dp_index_file_end.load(Ordering::SeqCst)
        }
    }

    pub fn set_index_file_end(&self, partition_id: char, value: bool) {
        if partition_id == self.partid_ip() {
            self.ip_index_file_end.store(value, Ordering::SeqCst);
        } else {
            self.dp_index_file_end.store(value, Ordering::SeqCst);
        }
    }

    // --- label I/O -------------------------------------------------------

    /// Write the four label records onto one partition, erasing it.
    fn write_label(&self, partition_id: char, label: &Label) -> Result<()> {
        let part = self.part_num(partition_id)?;
        let mut dev = self.device.lock();
        dev.locate(part, 0)?;
        dev.write_block(&label.vol1())?;
        dev.write_filemarks(1, false)?;
        dev.write_block(label.to_xml(partition_id).as_bytes())?;
        dev.write_filemarks(1, false)?;
        Ok(())
    }

    /// Read and validate one partition's label records.
    pub fn read_label(&self, partition_id: char) -> Result<Label> {
        let part = self.part_num(partition_id)?;
        let blocksize = self.blocksize() as usize;
        let mut dev = self.device.lock();
        dev.locate(part, 0)?;

        let mut buf = vec![0u8; blocksize];
        let vol1_len = match dev.read_block(&mut buf, true)? {
            crate::tape::ReadOutcome::Data(n) => n,
            _ => return Err(LtfsError::invalid_label("missing VOL1 record")),
        };
        let barcode = Label::check_vol1(&buf[..vol1_len])?;

        match dev.read_block(&mut buf, true)? {
            crate::tape::ReadOutcome::Filemark => {}
            _ => return Err(LtfsError::invalid_label("missing filemark after VOL1")),
        }

        let xml_len = match dev.read_block(&mut buf, true)? {
            crate::tape::ReadOutcome::Data(n) => n,
            _ => return Err(LtfsError::invalid_label("missing XML label")),
        };
        let xml = String::from_utf8_lossy(&buf[..xml_len]).into_owned();
        let mut label = Label::from_xml(&xml)?;
        label.barcode = barcode;
        Ok(label)
    }

    /// Read labels from both partitions and install the validated result.
    pub fn read_labels(&self) -> Result<()> {
        let ip = self.read_label('a')?;
        // The IP label names the real partition ids; use them for the DP read.
        let dp_id = ip.partid_dp;
        {
            *self.label.write() = Some(ip.clone());
        }
        let dp = self.read_label(dp_id)?;
        Label::check_compatibility(&ip, &dp)?;
        if ip.this_partition != ip.partid_ip || dp.this_partition != dp.partid_dp {
            return Err(LtfsError::label_mismatch("location/partition"));
        }
        info!(
            "labels valid: volume {} barcode '{}' blocksize {}",
            ip.vol_uuid, ip.barcode, ip.blocksize
        );
        *self.label.write() = Some(ip);
        Ok(())
    }

    // --- format ----------------------------------------------------------

    /// Create a fresh two-partition LTFS volume: format the medium, write
    /// both labels and the identification MAM attributes. The first index
    /// is written by the first `sync_index` after mount.
    pub fn format_volume(&self, barcode: &str, blocksize: u32) -> Result<()> {
        let vol_uuid = uuid::Uuid::new_v4().to_string();
        let label = Label::new(barcode, &vol_uuid, blocksize);

        {
            let mut dev = self.device.lock();
            dev.format(0x01)?;
        }
        *self.label.write() = Some(label.clone());

        self.write_label(label.partid_ip, &label)?;
        self.write_label(label.partid_dp, &label)?;

        {
            let mut dev = self.device.lock();
            for part in [0u8, 1u8] {
                dev.write_attribute(part, mam::BARCODE, mam::FORMAT_ASCII, barcode.as_bytes())?;
                dev.write_attribute(part, mam::APP_VENDOR, mam::FORMAT_ASCII, b"OSS")?;
                dev.write_attribute(
                    part,
                    mam::APP_NAME,
                    mam::FORMAT_ASCII,
                    crate::index::types::INDEX_CREATOR.as_bytes(),
                )?;
                dev.write_attribute(part, mam::APP_VERSION, mam::FORMAT_ASCII, b"0.1.0")?;
                dev.write_attribute(
                    part,
                    mam::APP_FORMAT_VERSION,
                    mam::FORMAT_ASCII,
                    LTFS_FORMAT_VERSION.as_bytes(),
                )?;
            }
        }

        {
            let mut index = self.index.write();
            *index = Index::new_empty(&vol_uuid, LtfsTime::now());
        }
        info!("formatted volume {} (barcode '{}')", vol_uuid, barcode);
        Ok(())
    }

    // --- mount -----------------------------------------------------------

    /// Mount: validate labels, find the newest consistent index, take the
    /// exclusive reservation, arm LBP.
    pub fn mount(self: &Arc<Self>, mount_type: MountType) -> Result<()> {
        {
            let mut dev = self.device.lock();
            dev.test_unit_ready()?;
            if self.opts.disable_auto_dump {
                dev.set_auto_dump(false);
            }
            let key = reservation::host_key(None, &hostname());
            dev.reserve(key)?;
        }

        self.read_labels()?;

        if self.opts.enable_lbp {
            let mut dev = self.device.lock();
            if let Err(e) = dev.setup_lbp() {
                warn!("logical block protection unavailable: {}", e);
            }
        }

        // Time the first locate as a drive health sample.
        let started = Instant::now();
        {
            let mut dev = self.device.lock();
            dev.locate(0, 0)?;
        }
        *self.first_locate.lock() = Some(started.elapsed());

        *self.mount_type.lock() = mount_type;
        chain::load_newest_index(self)?;

        {
            let index = self.index.read();
            let parsed = index
                .root
                .meta
                .read()
                .xattr(crate::xattr::VOLUME_LOCK_EA)
                .and_then(|x| std::str::from_utf8(&x.value).ok().map(str::to_string))
                .and_then(|s| VolumeLockState::parse(&s));
            if let Some(state) = parsed {
                *self.lock_state.lock() = state;
            }
        }

        let index = self.index.read();
        info!(
            "mounted volume {} at generation {}",
            index.vol_uuid, index.generation
        );
        Ok(())
    }

    /// Unmount: final sync on RW mounts, release the reservation.
    pub fn unmount(self: &Arc<Self>) -> Result<()> {
        if !self.is_readonly_mount() {
            self.sync_index(SyncReason::Unmount, false)?;
        }
        let mut dev = self.device.lock();
        dev.release()?;
        info!("volume unmounted");
        Ok(())
    }

    // --- index sync ------------------------------------------------------

    /// Record why the next index will be written; an operator-supplied
    /// commit message is never overwritten.
    pub fn set_commit_message_reason(&self, reason: SyncReason) {
        let mut index = self.index.write();
        if index.commit_message.is_none() {
            index.commit_message = Some(reason.label().to_string());
        }
    }

    /// Set an operator commit message, bounded to the format ceiling.
    pub fn set_commit_message(&self, message: &str) -> Result<()> {
        if message.len() > MAX_COMMIT_MESSAGE {
            return Err(LtfsError::LargeXattr);
        }
        let mut index = self.index.write();
        index.commit_message = if message.is_empty() {
            None
        } else {
            Some(message.to_string())
        };
        Ok(())
    }

    /// Append one copy of the current index to a partition. Sequence:
    /// filemark, the XML payload in block-size chunks, filemark. Returns the
    /// pointer to the index's first block.
    pub(crate) fn write_index_copy(
        &self,
        partition_id: char,
        backptr: Option<TapePtr>,
        generation: u64,
    ) -> Result<TapePtr> {
        let part = self.part_num(partition_id)?;
        let blocksize = self.blocksize() as usize;

        // Lock order: index structure before the device mutex.
        let mut index = self.index.write();
        let mut dev = self.device.lock();

        dev.locate(part, 0)?;
        dev.space(SpaceOp::EndOfData, 0)?;
        dev.write_filemarks(1, false)?;
        let pos = dev.read_position()?;
        let selfptr = TapePtr::new(partition_id, pos.block);

        index.generation = generation;
        index.selfptr = Some(selfptr);
        index.backptr = backptr;
        index.mod_time = LtfsTime::now();
        let xml = index_xml::serialize(&index)?;

        debug!(
            "writing index generation {} at p{} b{} ({} bytes)",
            generation,
            partition_id,
            pos.block,
            xml.len()
        );
        dev.write_blocks(xml.as_bytes(), blocksize)?;
        dev.write_filemarks(1, false)?;
        Ok(selfptr)
    }

    fn update_coherency(&self, partition_id: char, generation: u64, block: u64) -> Result<()> {
        let uuid = self.index.read().vol_uuid.clone();
        let coh = Coherency {
            uuid,
            count: generation,
            set_id: block,
        };
        let part = self.part_num(partition_id)?;
        {
            let mut dev = self.device.lock();
            dev.write_attribute(part, mam::VOL_COHERENCY, mam::FORMAT_BINARY, &coh.to_mam_bytes())?;
        }
        if partition_id == self.partid_ip() {
            *self.ip_coh.lock() = coh;
        } else {
            *self.dp_coh.lock() = coh;
        }
        Ok(())
    }

    /// Flush one index copy onto a partition that does not currently end in
    /// an index, so every rollback point stays reachable once data blocks
    /// start landing on the other partition.
    pub fn write_index_conditional(&self, partition_id: char) -> Result<()> {
        if self.index_file_end(partition_id) {
            return Ok(());
        }
        let (generation, backptr) = {
            let index = self.index.read();
            let prev_dp = match (&index.backptr, &index.selfptr) {
                (Some(bp), _) if bp.partition == self.partid_dp() => Some(*bp),
                (_, Some(sp)) if sp.partition == self.partid_dp() => Some(*sp),
                _ => None,
            };
            (index.generation + 1, prev_dp)
        };
        debug!(
            "conditional index flush on partition '{}' (generation {})",
            partition_id, generation
        );
        let ptr = self.write_index_copy(partition_id, backptr, generation)?;
        self.set_index_file_end(partition_id, true);
        self.update_coherency(partition_id, generation, ptr.block)?;
        Ok(())
    }

    /// Write a new index generation: data partition first, then the index
    /// partition, so an interruption leaves the DP strictly ahead. A clean
    /// index appends nothing unless `force` is set.
    pub fn sync_index(&self, reason: SyncReason, force: bool) -> Result<()> {
        if self.is_readonly_mount() {
            return Err(LtfsError::RdonlyVolume);
        }
        let _vol_write = self.lock.write();

        let (dirty, prev_dp, generation) = {
            let index = self.index.read();
            let prev_dp = match (&index.backptr, &index.selfptr) {
                // After a full sync the chain head is the IP copy and its
                // back pointer names the latest DP index.
                (Some(bp), _) if bp.partition == self.partid_dp() => Some(*bp),
                // An index adopted straight from the DP names itself.
                (_, Some(sp)) if sp.partition == self.partid_dp() => Some(*sp),
                _ => None,
            };
            (index.dirty, prev_dp, index.generation + 1)
        };
        if !dirty && !force {
            debug!("index clean, skipping sync ({:?})", reason);
            return Ok(());
        }

        // Writing an index consumes space on both partitions; refuse early
        // when either is exhausted rather than failing halfway through.
        {
            let mut dev = self.device.lock();
            let cap = dev.remaining_capacity()?;
            if cap.remaining_ip == 0 || cap.remaining_dp == 0 {
                return Err(LtfsError::LessSpace);
            }
        }

        self.set_commit_message_reason(reason);

        let dp_id = self.partid_dp();
        let ip_id = self.partid_ip();

        let dp_ptr = self.write_index_copy(dp_id, prev_dp, generation)?;
        self.set_index_file_end(dp_id, true);
        self.update_coherency(dp_id, generation, dp_ptr.block)?;

        let ip_ptr = self.write_index_copy(ip_id, Some(dp_ptr), generation)?;
        self.set_index_file_end(ip_id, true);
        self.update_coherency(ip_id, generation, ip_ptr.block)?;

        {
            let mut index = self.index.write();
            index.dirty = false;
            index.commit_message = None;
            clear_dirty(&index.root);
        }

        info!(
            "index generation {} written (dp b{}, ip b{}) [{:?}]",
            generation, dp_ptr.block, ip_ptr.block, reason
        );
        Ok(())
    }
}

/// Clear dentry dirty flags after a successful index write.
fn clear_dirty(dentry: &Arc<crate::index::types::Dentry>) {
    {
        let mut meta = dentry.meta.write();
        meta.dirty = false;
        meta.extents_dirty = false;
    }
    if dentry.isdir {
        for child in dentry.children_by_uid() {
            clear_dirty(&child);
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "ltfs-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::sim::SimTape;

    fn sim_volume() -> Arc<Volume> {
        let dev = TapeDevice::open(Box::new(SimTape::new())).unwrap();
        let mut opts = MountOptions::default();
        opts.enable_lbp = false;
        opts.sync_period = None;
        Volume::new(dev, opts)
    }

    #[test]
    fn vol1_record_layout() {
        let label = Label::new("ABC123", "some-uuid", 524288);
        let rec = label.vol1();
        assert_eq!(&rec[0..4], b"VOL1");
        assert_eq!(&rec[4..10], b"ABC123");
        assert_eq!(&rec[24..28], b"LTFS");
        assert_eq!(Label::check_vol1(&rec).unwrap(), "ABC123");
    }

    #[test]
    fn label_xml_round_trip() {
        let label = Label::new("TAP001", "aaaa-bbbb", 262144);
        let xml = label.to_xml('b');
        let parsed = Label::from_xml(&xml).unwrap();
        assert_eq!(parsed.vol_uuid, "aaaa-bbbb");
        assert_eq!(parsed.blocksize, 262144);
        assert_eq!(parsed.this_partition, 'b');
        assert_eq!(parsed.partid_ip, 'a');
        assert_eq!(parsed.partid_dp, 'b');
    }

    #[test]
    fn label_mismatch_detected() {
        let a = Label::new("T1", "uuid-1", 524288);
        let mut b = a.clone();
        b.vol_uuid = "uuid-2".to_string();
        assert!(matches!(
            Label::check_compatibility(&a, &b),
            Err(LtfsError::LabelMismatch(_))
        ));
    }

    #[test]
    fn lock_state_wire_strings_round_trip() {
        for state in [
            VolumeLockState::Unlocked,
            VolumeLockState::Locked,
            VolumeLockState::PermLocked,
            VolumeLockState::Pwe,
            VolumeLockState::PweDp,
            VolumeLockState::PweIp,
            VolumeLockState::PweBoth,
        ] {
            assert_eq!(VolumeLockState::parse(state.as_str()), Some(state));
        }
        // The unlocalized error state and the both-partitions state are
        // different states with different wire strings.
        assert_eq!(VolumeLockState::parse("pwe"), Some(VolumeLockState::Pwe));
        assert_eq!(
            VolumeLockState::parse("pwe-both"),
            Some(VolumeLockState::PweBoth)
        );
        assert!(VolumeLockState::Pwe.is_pwe());
        assert!(VolumeLockState::parse("banana").is_none());
    }

    #[test]
    fn coherency_mam_round_trip() {
        let coh = Coherency {
            uuid: "u".to_string(),
            count: 7,
            set_id: 42,
        };
        let bytes = coh.to_mam_bytes();
        assert_eq!(Coherency::from_mam_bytes(&bytes).unwrap(), coh);
    }

    #[test]
    fn format_and_mount_fresh_volume() {
        let vol = sim_volume();
        vol.format_volume("ABC123", 524288).unwrap();
        vol.mount(MountType::ReadWrite).unwrap();

        let index = vol.index.read();
        assert_eq!(index.generation, 0);
        assert!(index.volume_name.is_none());
        assert_eq!(index.root.meta.read().link_count, 1);
        assert!(!index.dirty);
    }

    #[test]
    fn first_sync_writes_generation_one() {
        let vol = sim_volume();
        vol.format_volume("ABC123", 524288).unwrap();
        vol.mount(MountType::ReadWrite).unwrap();

        vol.sync_index(SyncReason::RequestedByUser, true).unwrap();
        let index = vol.index.read();
        assert_eq!(index.generation, 1);
        // Fresh partitions: filemark at 4, index at 5 on both.
        assert_eq!(index.selfptr, Some(TapePtr::new('a', 5)));
        assert_eq!(index.backptr, Some(TapePtr::new('b', 5)));
        assert!(vol.ip_index_file_end.load(Ordering::SeqCst));
        assert!(vol.dp_index_file_end.load(Ordering::SeqCst));
    }

    #[test]
    fn clean_index_skips_second_sync() {
        let vol = sim_volume();
        vol.format_volume("ABC123", 524288).unwrap();
        vol.mount(MountType::ReadWrite).unwrap();
        vol.sync_index(SyncReason::RequestedByUser, true).unwrap();

        let before = vol.index.read().selfptr;
        vol.sync_index(SyncReason::Periodic, false).unwrap();
        assert_eq!(vol.index.read().selfptr, before);
        assert_eq!(vol.index.read().generation, 1);
    }

    #[test]
    fn sync_updates_mam_coherency() {
        let vol = sim_volume();
        vol.format_volume("ABC123", 524288).unwrap();
        vol.mount(MountType::ReadWrite).unwrap();
        vol.sync_index(SyncReason::RequestedByUser, true).unwrap();

        assert_eq!(vol.ip_coh.lock().count, 1);
        assert_eq!(vol.dp_coh.lock().count, 1);
        let uuid = vol.index.read().vol_uuid.clone();
        assert_eq!(vol.ip_coh.lock().uuid, uuid);
    }

    #[test]
    fn readonly_mount_refuses_sync() {
        let vol = sim_volume();
        vol.format_volume("ABC123", 524288).unwrap();
        vol.mount(MountType::Rollback).unwrap();
        assert!(matches!(
            vol.sync_index(SyncReason::Periodic, true),
            Err(LtfsError::RdonlyVolume)
        ));
    }
}
