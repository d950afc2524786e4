//! Index chain traversal, validation and consistency recovery.
//!
//! Every index on tape carries a self pointer (where it sits) and a back
//! pointer (the previous index, always on the data partition). This module
//! reads and validates single indexes, searches partitions backward from
//! EOD, decides which partition holds the newest consistent index, repairs
//! recoverable damage, rolls the volume back to an earlier generation and
//! enumerates rollback points.

use crate::error::{LtfsError, Result};
use crate::index::types::{Dentry, DentryData, Extent, Index, TapePtr};
use crate::index::xml as index_xml;
use crate::tape::{ReadOutcome, SpaceOp};
use crate::util::time::LtfsTime;
use crate::volume::{Coherency, SyncReason, Volume};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const LOSTANDFOUND_DIR: &str = "_ltfs_lostandfound";

/// Outcome of finding an index on one partition.
pub struct SeekedIndex {
    pub index: Index,
    pub eod_pos: u64,
    /// First block after the index file (past its trailing filemark when
    /// one exists).
    pub index_end_pos: u64,
    /// The index is correctly closed by a filemark.
    pub fm_after: bool,
    /// Blocks exist between the index file and EOD.
    pub blocks_after: bool,
}

/// Which partition holds the newest consistent index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Newer {
    Ip,
    Dp,
    Neither,
}

/// What `check_medium` found and did.
#[derive(Debug, Default, Clone)]
pub struct MediumCheck {
    pub errors_found: bool,
    pub errors_fixed: bool,
    pub lostfound_entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverseOrder {
    Forward,
    Backward,
}

/// One enumerable rollback target.
#[derive(Debug, Clone)]
pub struct RollbackPoint {
    pub generation: u64,
    pub selfptr: TapePtr,
    pub backptr: Option<TapePtr>,
    pub mod_time: LtfsTime,
    pub creator: String,
    pub volume_name: Option<String>,
    pub commit_message: Option<String>,
    pub file_count: u64,
}

impl RollbackPoint {
    fn from_index(index: &Index) -> Option<RollbackPoint> {
        Some(RollbackPoint {
            generation: index.generation,
            selfptr: index.selfptr?,
            backptr: index.backptr,
            mod_time: index.mod_time,
            creator: index.creator.clone(),
            volume_name: index.volume_name.clone(),
            commit_message: index.commit_message.clone(),
            file_count: index.file_count,
        })
    }
}

// --- single index read -----------------------------------------------------

/// Read and validate the index file starting at the current position.
///
/// Returns the parsed index and whether it was closed by a filemark. The
/// position is left after the index (past the filemark when present).
fn read_index_here(vol: &Volume) -> Result<(Index, bool)> {
    let blocksize = vol.blocksize() as usize;
    let label = vol
        .label
        .read()
        .clone()
        .ok_or(LtfsError::NullArg("label"))?;

    let mut dev = vol.device.lock();
    let start = dev.read_position()?;

    let mut xml = Vec::new();
    let mut end_fm = true;
    let mut buf = vec![0u8; blocksize];
    loop {
        match dev.read_block(&mut buf, true)? {
            ReadOutcome::Data(n) => {
                xml.extend_from_slice(&buf[..n]);
                // An index block short of the block size is the last one.
                if n < blocksize {
                    match dev.read_block(&mut buf, true)? {
                        ReadOutcome::Filemark => {}
                        ReadOutcome::EndOfData => end_fm = false,
                        ReadOutcome::Data(_) => {
                            return Err(LtfsError::Inconsistent(
                                "data after final index block".to_string(),
                            ))
                        }
                    }
                    break;
                }
            }
            ReadOutcome::Filemark => break,
            ReadOutcome::EndOfData => {
                end_fm = false;
                break;
            }
        }
    }
    drop(dev);

    if xml.is_empty() {
        return Err(LtfsError::NoIndex);
    }
    let text = String::from_utf8_lossy(&xml);
    let index = index_xml::parse(&text)?;

    // Volume UUID must match the label.
    if index.vol_uuid != label.vol_uuid {
        warn!("index volume UUID does not match the label");
        return Err(LtfsError::IndexInvalid);
    }

    // Self pointer must name the physical location we read from.
    let here = TapePtr::new(label.part_id(start.partition), start.block);
    match index.selfptr {
        Some(selfptr) if selfptr == here => {}
        other => {
            warn!("index self pointer {:?} does not match position {:?}", other, here);
            return Err(LtfsError::IndexInvalid);
        }
    }

    // Back pointer rules: absent, or on the data partition at block 5 or
    // later; a same-partition back pointer may not fall within the two
    // blocks preceding the index.
    if let Some(backptr) = index.backptr {
        if backptr.partition != label.partid_dp {
            warn!("index back pointer on partition '{}'", backptr.partition);
            return Err(LtfsError::IndexInvalid);
        }
        if backptr.block < 5 {
            warn!("index back pointer inside the label area");
            return Err(LtfsError::IndexInvalid);
        }
        if let Some(selfptr) = index.selfptr {
            if backptr.partition == selfptr.partition
                && selfptr.block != 5
                && backptr.block != selfptr.block
                && backptr.block >= selfptr.block.saturating_sub(2)
            {
                warn!("index back pointer overlaps the index itself");
                return Err(LtfsError::IndexInvalid);
            }
        }
    }

    Ok((index, end_fm))
}

/// Position to `ptr` and read the index there.
fn read_index_at(vol: &Volume, ptr: TapePtr) -> Result<(Index, bool)> {
    let part = vol.part_num(ptr.partition)?;
    {
        let mut dev = vol.device.lock();
        dev.locate(part, ptr.block)?;
    }
    read_index_here(vol)
}

// --- partition search ------------------------------------------------------

/// Search a partition backward from EOD for the latest readable index.
///
/// Returns `Ok(None)` when the partition holds nothing but its label.
pub fn seek_index(vol: &Volume, partition_id: char) -> Result<Option<SeekedIndex>> {
    let part = vol.part_num(partition_id)?;

    let eod = {
        let mut dev = vol.device.lock();
        dev.locate(part, 0)?;
        dev.space(SpaceOp::EndOfData, 0)?;
        dev.read_position()?
    };
    debug!("partition '{}' EOD at block {}", partition_id, eod.block);
    if eod.block <= 4 {
        return Ok(None);
    }

    {
        let mut dev = vol.device.lock();
        dev.space(SpaceOp::FilemarksBack, 1)?;
        let pos = dev.read_position()?;
        if pos.block == 3 {
            return Ok(None);
        }
        if pos.block == eod.block - 1 {
            dev.space(SpaceOp::FilemarksBack, 1)?;
        }
    }

    loop {
        {
            let mut dev = vol.device.lock();
            let pos = dev.read_position()?;
            if pos.block == 3 {
                return Ok(None);
            }
            dev.space(SpaceOp::Filemarks, 1)?;
        }

        match read_index_here(vol) {
            Ok((index, fm_after)) => {
                let pos = {
                    let mut dev = vol.device.lock();
                    dev.read_position()?
                };
                // The partition searched must be the one the index claims.
                if index.selfptr.map(|p| p.partition) != Some(partition_id) {
                    return Err(LtfsError::IndexInvalid);
                }

                let coh = Coherency {
                    uuid: index.vol_uuid.clone(),
                    count: index.generation,
                    set_id: index.selfptr.map(|p| p.block).unwrap_or(0),
                };
                if partition_id == vol.partid_ip() {
                    *vol.ip_coh.lock() = coh;
                } else {
                    *vol.dp_coh.lock() = coh;
                }

                return Ok(Some(SeekedIndex {
                    index,
                    eod_pos: eod.block,
                    index_end_pos: pos.block,
                    fm_after,
                    blocks_after: pos.block != eod.block,
                }));
            }
            Err(LtfsError::UnsupportedIndexVersion(v)) => {
                return Err(LtfsError::UnsupportedIndexVersion(v));
            }
            Err(e) => {
                debug!("candidate index rejected ({}), stepping back", e);
                let mut dev = vol.device.lock();
                dev.space(SpaceOp::FilemarksBack, 2)?;
            }
        }
    }
}

// --- newest-index decision -------------------------------------------------

/// Decide which of the two partition indexes is the newest consistent one.
///
/// Mirrors the chain rules: a lone DP index wins; a lone IP index must have
/// no back pointer; with both, the IP wins only when its back pointer names
/// the DP index and its generation is not behind. An equal-generation pair
/// whose IP carries no back pointer resolves to the DP. Anything else walks
/// one step down the DP chain to confirm before declaring the DP newer.
pub fn check_pointers(
    vol: &Volume,
    ip_index: Option<&Index>,
    dp_index: Option<&Index>,
) -> Result<Newer> {
    let ip = match ip_index {
        None => {
            return Ok(match dp_index {
                Some(_) => Newer::Dp,
                None => Newer::Neither,
            })
        }
        Some(ip) => ip,
    };

    let dp = match dp_index {
        None => {
            return if ip.backptr.is_some() {
                warn!("index partition points to a data partition index that does not exist");
                Err(LtfsError::IndexInvalid)
            } else {
                Ok(Newer::Ip)
            };
        }
        Some(dp) => dp,
    };

    if ip.generation >= dp.generation && ip.backptr == dp.selfptr {
        return Ok(Newer::Ip);
    }
    if ip.generation > dp.generation {
        warn!(
            "index partition generation {} ahead of data partition {} with mismatched back pointer",
            ip.generation, dp.generation
        );
        return Err(LtfsError::IndexInvalid);
    }
    if ip.generation == dp.generation && ip.backptr.is_none() {
        return Ok(Newer::Dp);
    }

    // Walk one step back on the DP chain and make sure the IP index is not
    // silently missing its back pointer.
    let dp_back = dp.backptr.map(|p| p.block).unwrap_or(0);
    let ip_back = ip.backptr.map(|p| p.block).unwrap_or(0);
    if dp_back > ip_back {
        if let Some(backptr) = dp.backptr {
            let (previous, _) = read_index_at(vol, backptr)?;
            if ip.backptr.is_none() && previous.generation < ip.generation {
                warn!("index partition index is missing its back pointer");
                return Err(LtfsError::IndexInvalid);
            }
        }
    }
    Ok(Newer::Dp)
}

// --- extent sanity ---------------------------------------------------------

/// Verify every extent lands between the label area and its partition's
/// EOD.
fn check_extents(
    dentry: &Arc<Dentry>,
    ip_eod: u64,
    dp_eod: u64,
    partid_ip: char,
    blocksize: u64,
) -> Result<()> {
    if dentry.isdir {
        for child in dentry.children_by_uid() {
            check_extents(&child, ip_eod, dp_eod, partid_ip, blocksize)?;
        }
        return Ok(());
    }
    for ext in dentry.extents() {
        if ext.start_block < 4 {
            return Err(LtfsError::IndexInvalid);
        }
        let last = ext.last_block(blocksize);
        let eod = if ext.partition == partid_ip { ip_eod } else { dp_eod };
        if last > eod {
            return Err(LtfsError::IndexInvalid);
        }
    }
    Ok(())
}

/// Highest referenced block on each partition (ip, dp), over extents and
/// the index files themselves.
fn last_ref(dentry: &Arc<Dentry>, partid_ip: char, blocksize: u64, ip: &mut u64, dp: &mut u64) {
    if dentry.isdir {
        for child in dentry.children_by_uid() {
            last_ref(&child, partid_ip, blocksize, ip, dp);
        }
        return;
    }
    for ext in dentry.extents() {
        let last = ext.last_block(blocksize);
        if ext.partition == partid_ip {
            *ip = (*ip).max(last);
        } else {
            *dp = (*dp).max(last);
        }
    }
}

// --- mount-time loading ----------------------------------------------------

/// Find the newest consistent index on the medium and install it; a fresh
/// cartridge (labels only) installs an empty generation-zero index.
pub fn load_newest_index(vol: &Volume) -> Result<()> {
    let ip_id = vol.partid_ip();
    let dp_id = vol.partid_dp();

    let ip_found = seek_index(vol, ip_id)?;
    let dp_found = seek_index(vol, dp_id)?;

    let newer = check_pointers(
        vol,
        ip_found.as_ref().map(|s| &s.index),
        dp_found.as_ref().map(|s| &s.index),
    )?;

    if let Some(found) = &ip_found {
        vol.set_index_file_end(ip_id, found.fm_after && !found.blocks_after);
    }
    if let Some(found) = &dp_found {
        vol.set_index_file_end(dp_id, found.fm_after && !found.blocks_after);
    }

    let ip_eod = ip_found.as_ref().map(|s| s.eod_pos).unwrap_or(4);
    let dp_eod = dp_found.as_ref().map(|s| s.eod_pos).unwrap_or(4);

    let chosen = match newer {
        Newer::Ip => ip_found.map(|s| s.index),
        Newer::Dp => dp_found.map(|s| s.index),
        Newer::Neither => None,
    };

    match chosen {
        Some(index) => {
            check_extents(&index.root, ip_eod, dp_eod, ip_id, vol.blocksize())?;
            info!(
                "adopting index generation {} from the {} partition",
                index.generation,
                if newer == Newer::Ip { "index" } else { "data" }
            );
            *vol.index.write() = index;
        }
        None => {
            let uuid = vol
                .label
                .read()
                .as_ref()
                .map(|l| l.vol_uuid.clone())
                .ok_or(LtfsError::NullArg("label"))?;
            info!("no index on medium, starting at generation zero");
            *vol.index.write() = Index::new_empty(&uuid, LtfsTime::now());
            vol.set_index_file_end(ip_id, false);
            vol.set_index_file_end(dp_id, false);
        }
    }
    Ok(())
}

// --- medium check / recovery ----------------------------------------------

/// Consistency check and repair.
///
/// Recoverable damage: an index missing its trailing filemark (close it),
/// blocks beyond the last index (optionally collected into lost&found, then
/// a fresh index restores the ends-in-index invariant). Damage past that
/// needs the deep flag and is reported, not guessed at.
pub fn check_medium(
    vol: &Arc<Volume>,
    fix: bool,
    deep: bool,
    recover_extra: bool,
) -> Result<MediumCheck> {
    let mut result = MediumCheck::default();
    let ip_id = vol.partid_ip();
    let dp_id = vol.partid_dp();

    // EOD accessibility first: both gone means deep recovery territory.
    {
        let mut dev = vol.device.lock();
        let ip_eod_ok = dev.get_eod_status(0)?;
        let dp_eod_ok = dev.get_eod_status(1)?;
        if !ip_eod_ok && !dp_eod_ok {
            if !deep {
                return Err(LtfsError::BothEodMissing);
            }
            warn!("both EODs missing, continuing under deep recovery");
        }
    }

    let ip_found = seek_index(vol, ip_id)?;
    let dp_found = seek_index(vol, dp_id)?;

    for (partition_id, found) in [(ip_id, &ip_found), (dp_id, &dp_found)] {
        if let Some(seeked) = found {
            if !seeked.fm_after {
                result.errors_found = true;
                if fix {
                    // Close the index: write the missing filemark at EOD.
                    let part = vol.part_num(partition_id)?;
                    let mut dev = vol.device.lock();
                    dev.locate(part, 0)?;
                    dev.space(SpaceOp::EndOfData, 0)?;
                    dev.write_filemarks(1, false)?;
                    drop(dev);
                    info!(
                        "closed unterminated index on partition '{}'",
                        partition_id
                    );
                    vol.set_index_file_end(partition_id, !seeked.blocks_after);
                    result.errors_fixed = true;
                }
            } else {
                vol.set_index_file_end(partition_id, !seeked.blocks_after);
            }
        }
    }

    let newer = check_pointers(
        vol,
        ip_found.as_ref().map(|s| &s.index),
        dp_found.as_ref().map(|s| &s.index),
    )?;

    let ip_eod = ip_found.as_ref().map(|s| s.eod_pos).unwrap_or(4);
    let dp_eod = dp_found.as_ref().map(|s| s.eod_pos).unwrap_or(4);
    let ip_index_end = ip_found.as_ref().map(|s| s.index_end_pos).unwrap_or(4);
    let dp_index_end = dp_found.as_ref().map(|s| s.index_end_pos).unwrap_or(4);

    let adopted = match newer {
        Newer::Ip => ip_found.map(|s| s.index),
        Newer::Dp => dp_found.map(|s| s.index),
        Newer::Neither => None,
    };
    if let Some(index) = adopted {
        *vol.index.write() = index;
    }

    // Unreferenced blocks past the last reference become lost&found files.
    if recover_extra {
        let count = populate_lost_found(vol, ip_index_end, dp_index_end, ip_eod, dp_eod)?;
        if count > 0 {
            result.errors_found = true;
            result.lostfound_entries = count;
        }
    }

    // Restore the both-ends-in-index invariant when something disturbed it.
    let needs_index = !vol.index_file_end(ip_id) || !vol.index_file_end(dp_id);
    if needs_index && fix {
        let have_any = {
            let index = vol.index.read();
            index.generation > 0 || index.dirty
        };
        if have_any || result.lostfound_entries > 0 {
            result.errors_found = true;
            vol.index.write().dirty = true;
            vol.sync_index(SyncReason::Recovery, true)?;
            result.errors_fixed = true;
        }
    }

    info!(
        "medium check: errors_found={} fixed={} lostfound={}",
        result.errors_found, result.errors_fixed, result.lostfound_entries
    );
    Ok(result)
}

/// Attach `/_ltfs_lostandfound/partitionN_blockM_Nbytes` entries covering
/// unreferenced blocks between the last reference and EOD on each
/// partition.
fn populate_lost_found(
    vol: &Arc<Volume>,
    ip_index_end: u64,
    dp_index_end: u64,
    ip_eod: u64,
    dp_eod: u64,
) -> Result<usize> {
    let blocksize = vol.blocksize();
    let ip_id = vol.partid_ip();
    let dp_id = vol.partid_dp();

    let mut created = 0usize;
    let mut index = vol.index.write();

    // Last block referenced by any extent or by the index files themselves.
    let mut ip_last = ip_index_end.max(4);
    let mut dp_last = dp_index_end.max(4);
    last_ref(&index.root, ip_id, blocksize, &mut ip_last, &mut dp_last);

    let targets = [
        (ip_id, 0u8, ip_last, ip_eod),
        (dp_id, 1u8, dp_last, dp_eod),
    ];

    let mut new_files: Vec<(String, Extent)> = Vec::new();
    for (partition_id, part_num, lastref, eod) in targets {
        if eod <= lastref {
            continue;
        }
        // Size the orphaned region by reading it: the final block is
        // usually short.
        let mut bytes = 0u64;
        {
            let mut dev = vol.device.lock();
            let mut buf = vec![0u8; blocksize as usize];
            dev.locate(part_num, lastref)?;
            for _ in lastref..eod {
                match dev.read_block(&mut buf, true)? {
                    crate::tape::ReadOutcome::Data(n) => bytes += n as u64,
                    _ => {}
                }
            }
        }
        if bytes == 0 {
            continue;
        }
        let name = format!("partition{}_block{}_{}bytes", part_num, lastref, bytes);
        new_files.push((
            name,
            Extent {
                partition: partition_id,
                start_block: lastref,
                byte_offset: 0,
                byte_count: bytes,
                file_offset: 0,
            },
        ));
    }

    if new_files.is_empty() {
        return Ok(0);
    }

    let now = LtfsTime::now();
    let lf_dir = match index.root.lookup(LOSTANDFOUND_DIR) {
        Some(dir) => dir,
        None => {
            let uid = index.alloc_uid();
            let dir = Dentry::new_dir(uid, LOSTANDFOUND_DIR, now);
            index.root.attach_child(&dir)?;
            dir
        }
    };

    for (name, ext) in new_files {
        if lf_dir.lookup(&name).is_some() {
            continue;
        }
        let uid = index.alloc_uid();
        let file = Dentry::new_file(uid, &name, true, now);
        {
            let mut meta = file.meta.write();
            meta.size = ext.byte_count;
            meta.realsize = ext.byte_count;
            meta.used_blocks = ext.block_span(blocksize);
        }
        if let DentryData::File { extents } = &mut *file.contents.write() {
            extents.push(ext);
        }
        lf_dir.attach_child(&file)?;
        index.file_count += 1;
        created += 1;
        info!(
            "lost&found: collected {} blocks at p{} b{}",
            ext.block_span(blocksize),
            ext.partition,
            ext.start_block
        );
    }
    index.dirty = true;
    Ok(created)
}

// --- rollback --------------------------------------------------------------

/// Walk every reachable index and return the rollback points.
///
/// The newest DP index is found from EOD; its back pointers enumerate the
/// rest of the chain. Backward order is newest-first. With `capture_dir`
/// set, each index XML is also written to disk.
pub fn list_rollback_points(
    vol: &Volume,
    order: TraverseOrder,
    capture_dir: Option<&Path>,
) -> Result<Vec<RollbackPoint>> {
    let dp_id = vol.partid_dp();
    let mut points = Vec::new();

    let newest = seek_index(vol, dp_id)?;
    let mut cursor = newest.map(|s| s.index);

    while let Some(index) = cursor {
        // Generation-preserving rollback appends a head that repeats the
        // newest generation; list each generation once.
        let duplicate = points
            .last()
            .map(|p: &RollbackPoint| p.generation == index.generation)
            .unwrap_or(false);
        if let (false, Some(point)) = (duplicate, RollbackPoint::from_index(&index)) {
            if let Some(dir) = capture_dir {
                let path = dir.join(format!(
                    "index_gen{:06}_p{}_b{}.xml",
                    index.generation,
                    point.selfptr.partition,
                    point.selfptr.block
                ));
                std::fs::write(&path, index_xml::serialize(&index)?)?;
            }
            points.push(point);
        }
        cursor = match index.backptr {
            Some(backptr) => Some(read_index_at(vol, backptr)?.0),
            None => None,
        };
    }

    if order == TraverseOrder::Forward {
        points.reverse();
    }
    Ok(points)
}

/// Find the chain entry with `generation`, searching the DP chain.
fn find_generation(vol: &Volume, generation: u64) -> Result<Index> {
    let dp_id = vol.partid_dp();
    let newest = seek_index(vol, dp_id)?.ok_or(LtfsError::NoIndex)?;
    let mut cursor = newest.index;
    loop {
        if cursor.generation == generation {
            return Ok(cursor);
        }
        if cursor.generation < generation {
            return Err(LtfsError::NoIndex);
        }
        match cursor.backptr {
            Some(backptr) => cursor = read_index_at(vol, backptr)?.0,
            None => return Err(LtfsError::NoIndex),
        }
    }
}

/// Roll the volume back to `target_generation`.
///
/// Without `erase_history`, the old tree is appended as a fresh pair of
/// index copies that keep the current generation number, so the chain stays
/// navigable while the rolled-back state becomes the head. With
/// `erase_history`, the data partition is truncated just past the target
/// index and the index partition is rewritten, destroying everything newer.
pub fn rollback(vol: &Arc<Volume>, target_generation: u64, erase_history: bool) -> Result<()> {
    if vol.file_open_count.load(std::sync::atomic::Ordering::SeqCst) > 0 {
        return Err(LtfsError::RestartOperation);
    }

    let current_generation = vol.index.read().generation;
    let target = find_generation(vol, target_generation)?;
    let target_dp_ptr = target.selfptr.ok_or(LtfsError::IndexInvalid)?;
    info!(
        "rolling back from generation {} to {} (erase_history={})",
        current_generation, target_generation, erase_history
    );

    if erase_history {
        let dp_id = vol.partid_dp();
        let ip_id = vol.partid_ip();
        let dp_num = vol.part_num(dp_id)?;
        let ip_num = vol.part_num(ip_id)?;

        // Truncate the DP just past the target index: space over it, step
        // back onto its trailing filemark, and overwrite from there.
        {
            let mut dev = vol.device.lock();
            dev.locate(dp_num, target_dp_ptr.block)?;
            dev.space(SpaceOp::Filemarks, 1)?;
            dev.space(SpaceOp::FilemarksBack, 1)?;
            dev.write_filemarks(1, false)?;
        }

        {
            let mut index = vol.index.write();
            *index = target;
            index.generation = target_generation;
            index.dirty = false;
        }

        // Rewrite the IP from the label end: one index copy, nothing else.
        {
            let mut dev = vol.device.lock();
            dev.locate(ip_num, 4)?;
            dev.erase(false)?;
        }
        let ip_ptr = vol.write_index_copy(ip_id, Some(target_dp_ptr), target_generation)?;
        vol.set_index_file_end(ip_id, true);
        vol.set_index_file_end(dp_id, true);
        let uuid = vol.index.read().vol_uuid.clone();
        *vol.ip_coh.lock() = Coherency {
            uuid,
            count: target_generation,
            set_id: ip_ptr.block,
        };
    } else {
        // Install the old tree, then append it as the new head while
        // keeping the current generation number.
        let prev_dp = {
            let index = vol.index.read();
            match (&index.backptr, &index.selfptr) {
                (Some(bp), _) if bp.partition == vol.partid_dp() => Some(*bp),
                (_, Some(sp)) if sp.partition == vol.partid_dp() => Some(*sp),
                _ => None,
            }
        };
        {
            let mut index = vol.index.write();
            *index = target;
        }
        let dp_id = vol.partid_dp();
        let ip_id = vol.partid_ip();
        let dp_ptr = vol.write_index_copy(dp_id, prev_dp, current_generation)?;
        vol.set_index_file_end(dp_id, true);
        let _ip_ptr = vol.write_index_copy(ip_id, Some(dp_ptr), current_generation)?;
        vol.set_index_file_end(ip_id, true);
        vol.index.write().dirty = false;
    }

    info!("rollback to generation {} complete", target_generation);
    Ok(())
}
