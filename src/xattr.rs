//! Extended attribute engine.
//!
//! Two namespaces share the API: real attributes live on the dentry and
//! round-trip through the index; virtual attributes (the reserved `ltfs.`
//! prefix) are computed on read or dispatched on write. A handful of
//! reserved names are deliberately stored as real attributes so they
//! serialize with the index; every other reserved name is read-only.

use crate::error::{LtfsError, Result};
use crate::fsops;
use crate::index::types::{Dentry, MAX_COMMIT_MESSAGE};
use crate::scsi::cdb::mam;
use crate::tape::ForceError;
use crate::volume::{SyncReason, Volume, VolumeLockState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

pub const VIRTUAL_PREFIX: &str = "ltfs.";

/// Reserved names stored as real attributes (serialized with the index).
pub const APPENDONLY_EA: &str = "ltfs.vendor.IBM.appendonly";
pub const IMMUTABLE_EA: &str = "ltfs.vendor.IBM.immutable";
pub const VOLUME_LOCK_EA: &str = "ltfs.vendor.IBM.volumeLockState";
pub const LIVELINK_EA: &str = "ltfs.vendor.IBM.prefixLength";

/// Debug hooks arming synthetic permanent errors on the tape layer.
const FORCE_ERROR_WRITE_EA: &str = "ltfs.vendor.IBM.forceErrorWrite";
const FORCE_ERROR_READ_EA: &str = "ltfs.vendor.IBM.forceErrorRead";

const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest accepted attribute value.
pub const MAX_XATTR_SIZE: usize = 64 * 1024;

fn is_stored_reserved(name: &str) -> bool {
    name.starts_with("ltfs.permissions.")
        || name.starts_with("ltfs.hash.")
        || name == "ltfs.mediaPool.name"
        || name == APPENDONLY_EA
        || name == IMMUTABLE_EA
        || name == VOLUME_LOCK_EA
        || name == LIVELINK_EA
}

fn is_root(vol: &Volume, dentry: &Arc<Dentry>) -> bool {
    Arc::ptr_eq(dentry, &vol.index.read().root)
}

fn string_value(s: String) -> Vec<u8> {
    s.into_bytes()
}

// --- get -------------------------------------------------------------------

pub fn get_xattr(vol: &Arc<Volume>, path: &str, name: &str) -> Result<Vec<u8>> {
    let dentry = {
        let _vol_read = vol.lock.read();
        fsops::lookup_path(vol, path)?
    };

    if name.starts_with(VIRTUAL_PREFIX) {
        match get_virtual(vol, &dentry, name) {
            Err(LtfsError::NoXattr(_)) if is_stored_reserved(name) => {}
            other => return other,
        }
    }

    let meta = dentry.meta.read();
    meta.xattr(name)
        .map(|x| x.value.clone())
        .ok_or_else(|| LtfsError::NoXattr(name.to_string()))
}

fn get_virtual(vol: &Arc<Volume>, dentry: &Arc<Dentry>, name: &str) -> Result<Vec<u8>> {
    let no_xattr = || Err(LtfsError::NoXattr(name.to_string()));

    // Per-dentry values first.
    {
        let meta = dentry.meta.read();
        let value = match name {
            "ltfs.createTime" => Some(meta.times.creation.format()),
            "ltfs.modifyTime" => Some(meta.times.modify.format()),
            "ltfs.accessTime" => Some(meta.times.access.format()),
            "ltfs.changeTime" => Some(meta.times.change.format()),
            "ltfs.backupTime" => Some(meta.times.backup.format()),
            "ltfs.fileUID" => Some(dentry.uid.to_string()),
            _ => None,
        };
        if let Some(v) = value {
            return Ok(string_value(v));
        }
    }
    if name == "ltfs.partition" || name == "ltfs.startblock" {
        let extents = dentry.extents();
        let first = match extents.first() {
            Some(e) => *e,
            None => return no_xattr(),
        };
        return Ok(string_value(match name {
            "ltfs.partition" => first.partition.to_string(),
            _ => first.start_block.to_string(),
        }));
    }

    if !is_root(vol, dentry) {
        return no_xattr();
    }

    // Root-dentry volume attributes.
    let label = vol.label.read().clone();
    let index_snapshot = {
        let index = vol.index.read();
        (
            index.vol_uuid.clone(),
            index.volume_name.clone(),
            index.commit_message.clone(),
            index.generation,
            index.selfptr,
            index.backptr,
            index.version.clone(),
            index.criteria.clone(),
        )
    };
    let (uuid, volume_name, commit_message, generation, selfptr, backptr, version, criteria) =
        index_snapshot;

    let fmt_ptr = |ptr: Option<crate::index::types::TapePtr>| match ptr {
        Some(p) => format!("{}:{}", p.partition, p.block),
        None => "0:0".to_string(),
    };

    let value = match name {
        "ltfs.volumeUUID" => uuid,
        "ltfs.volumeName" => volume_name.unwrap_or_default(),
        "ltfs.commitMessage" => commit_message.unwrap_or_default(),
        "ltfs.indexGeneration" => generation.to_string(),
        "ltfs.indexLocation" => fmt_ptr(selfptr),
        "ltfs.indexPrevious" => fmt_ptr(backptr),
        "ltfs.indexVersion" => version,
        "ltfs.indexCreator" => crate::index::types::INDEX_CREATOR.to_string(),
        "ltfs.softwareVersion" => SOFTWARE_VERSION.to_string(),
        "ltfs.volumeLockState" => vol.lock_state.lock().as_str().to_string(),
        "ltfs.policyExists" => (!criteria.glob_patterns.is_empty()).to_string(),
        "ltfs.policyAllowUpdate" => criteria.allow_update.to_string(),
        "ltfs.policyMaxFileSize" => criteria.max_filesize.to_string(),
        "ltfs.vendor.IBM.referencedBlocks" => {
            vol.valid_block_count.load(Ordering::SeqCst).to_string()
        }
        "ltfs.sync" => {
            // Reading the sync attribute is itself a sync trigger.
            vol.sync_index(SyncReason::ExtendedAttribute, false)?;
            "1".to_string()
        }
        _ => String::new(),
    };
    if !value.is_empty() || matches!(name, "ltfs.volumeName" | "ltfs.commitMessage") {
        return Ok(string_value(value));
    }

    if let Some(label) = &label {
        let value = match name {
            "ltfs.volumeSerial" => Some(label.barcode.clone()),
            "ltfs.volumeBlocksize" => Some(label.blocksize.to_string()),
            "ltfs.volumeFormatTime" => Some(label.format_time.format()),
            "ltfs.volumeCompression" => Some(label.compression.to_string()),
            "ltfs.labelVersion" => Some(label.version.clone()),
            "ltfs.labelCreator" => Some(label.creator.clone()),
            "ltfs.partitionMap" => Some(format!("I:{},D:{}", label.partid_ip, label.partid_dp)),
            _ => None,
        };
        if let Some(v) = value {
            return Ok(string_value(v));
        }
    }

    // Drive-backed values.
    match name {
        "ltfs.mamBarcode" => {
            let mut dev = vol.device.lock();
            let value = dev.read_attribute(0, mam::BARCODE)?;
            Ok(string_value(
                String::from_utf8_lossy(&value).trim().to_string(),
            ))
        }
        "ltfs.mediaPermanentReadErrors" => {
            let mut dev = vol.device.lock();
            let health = dev.get_cartridge_health()?;
            Ok(string_value(health.permanent_read_errors.to_string()))
        }
        "ltfs.mediaDatasetsWritten" => {
            let mut dev = vol.device.lock();
            let health = dev.get_cartridge_health()?;
            Ok(string_value(health.datasets_written.to_string()))
        }
        "ltfs.mediaEncrypted" => {
            let mut dev = vol.device.lock();
            let encrypted = dev.get_key_alias()?.is_some();
            Ok(string_value(encrypted.to_string()))
        }
        "ltfs.driveEncryptionState" => {
            let mut dev = vol.device.lock();
            let state = if dev.get_key_alias()?.is_some() {
                "on"
            } else {
                "off"
            };
            Ok(string_value(state.to_string()))
        }
        FORCE_ERROR_WRITE_EA => {
            let dev = vol.device.lock();
            Ok(string_value(dev.force_write_perm.remaining.to_string()))
        }
        FORCE_ERROR_READ_EA => {
            let dev = vol.device.lock();
            Ok(string_value(dev.force_read_perm.remaining.to_string()))
        }
        _ => no_xattr(),
    }
}

// --- set -------------------------------------------------------------------

pub fn set_xattr(
    vol: &Arc<Volume>,
    path: &str,
    name: &str,
    value: &[u8],
    create_only: bool,
    replace_only: bool,
) -> Result<()> {
    if name.is_empty() {
        return Err(LtfsError::NullArg("xattr name"));
    }
    if value.len() > MAX_XATTR_SIZE {
        return Err(LtfsError::LargeXattr);
    }
    // Attribute names carry a namespace prefix ("user.", "ltfs.", ...).
    if !name.contains('.') {
        return Err(LtfsError::XattrNamespace(name.to_string()));
    }
    let dentry = {
        let _vol_read = vol.lock.read();
        fsops::lookup_path(vol, path)?
    };

    if name.starts_with(VIRTUAL_PREFIX) {
        match set_virtual(vol, &dentry, name, value) {
            Err(LtfsError::NoXattr(_)) => {
                if !is_stored_reserved(name) {
                    return Err(LtfsError::RdonlyXattr(name.to_string()));
                }
            }
            other => return other,
        }
    }

    if vol.is_readonly_mount() {
        return Err(LtfsError::RdonlyVolume);
    }

    let previous = {
        let mut meta = dentry.meta.write();
        let previous = meta.xattr(name).map(|x| x.value.clone());
        if create_only && previous.is_some() {
            return Err(LtfsError::XattrExists(name.to_string()));
        }
        if replace_only && previous.is_none() {
            return Err(LtfsError::NoXattr(name.to_string()));
        }
        meta.set_xattr(name, value);
        meta.times.change = crate::util::time::LtfsTime::now();
        previous
    };
    vol.index.write().mark_dirty();

    // Mirror through the dentry cache; a failed mirror rolls the value
    // back so both views stay identical.
    if let Some(dcache) = vol.dcache.lock().as_mut() {
        if let Err(e) = dcache.setxattr(path, name, value) {
            let mut meta = dentry.meta.write();
            match previous {
                Some(old) => meta.set_xattr(name, &old),
                None => {
                    meta.remove_xattr(name);
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

fn parse_flag(value: &[u8]) -> bool {
    // Anything except literal "0" enables.
    !matches!(std::str::from_utf8(value).map(str::trim), Ok("0"))
}

fn set_virtual(vol: &Arc<Volume>, dentry: &Arc<Dentry>, name: &str, value: &[u8]) -> Result<()> {
    let root = is_root(vol, dentry);
    match name {
        "ltfs.sync" if root => vol.sync_index(SyncReason::ExtendedAttribute, false),

        "ltfs.commitMessage" if root => {
            if value.len() > MAX_COMMIT_MESSAGE {
                return Err(LtfsError::LargeXattr);
            }
            let text = std::str::from_utf8(value)
                .map_err(|_| LtfsError::bad_arg("commit message must be UTF-8"))?;
            vol.set_commit_message(text)?;
            vol.index.write().mark_dirty();
            Ok(())
        }

        "ltfs.volumeName" if root => {
            let text = std::str::from_utf8(value)
                .map_err(|_| LtfsError::bad_arg("volume name must be UTF-8"))?
                .to_string();
            {
                let mut index = vol.index.write();
                index.volume_name = if text.is_empty() {
                    None
                } else {
                    Some(text.clone())
                };
                index.mark_dirty();
            }
            let mut dev = vol.device.lock();
            dev.write_attribute(0, mam::USER_MEDIUM_LABEL, mam::FORMAT_TEXT, text.as_bytes())?;
            info!("volume name set to '{}'", text);
            Ok(())
        }

        "ltfs.volumeLockState" if root => set_lock_state(vol, dentry, value),

        IMMUTABLE_EA | APPENDONLY_EA => {
            let enable = parse_flag(value);
            let worm = vol.worm_media.load(Ordering::SeqCst);
            let mut meta = dentry.meta.write();
            let flag = if name == IMMUTABLE_EA {
                &mut meta.immutable
            } else {
                &mut meta.appendonly
            };
            if !enable && *flag && worm {
                // WORM media: the flag is one-way.
                return Err(LtfsError::WormEnabled);
            }
            *flag = enable;
            meta.set_xattr(name, if enable { b"1" } else { b"0" });
            drop(meta);
            vol.index.write().mark_dirty();
            debug!("{} set to {} on '{}'", name, enable, path_of(dentry));
            Ok(())
        }

        FORCE_ERROR_WRITE_EA | FORCE_ERROR_READ_EA if root => {
            let count: u64 = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| LtfsError::bad_arg("force error counter"))?;
            let mut dev = vol.device.lock();
            let slot = if name == FORCE_ERROR_WRITE_EA {
                &mut dev.force_write_perm
            } else {
                &mut dev.force_read_perm
            };
            *slot = ForceError {
                remaining: count,
                armed: true,
            };
            Ok(())
        }

        _ => Err(LtfsError::NoXattr(name.to_string())),
    }
}

/// Lock-state transitions. PWE states and the permanent lock are terminal,
/// and no transition is legal while files are open.
fn set_lock_state(vol: &Arc<Volume>, root: &Arc<Dentry>, value: &[u8]) -> Result<()> {
    let requested = std::str::from_utf8(value)
        .ok()
        .and_then(VolumeLockState::parse)
        .ok_or_else(|| LtfsError::bad_arg("volume lock state"))?;

    if vol.file_open_count.load(Ordering::SeqCst) > 0 {
        return Err(LtfsError::RestartOperation);
    }

    {
        let current = *vol.lock_state.lock();
        let legal = match current {
            VolumeLockState::Unlocked => matches!(
                requested,
                VolumeLockState::Locked | VolumeLockState::PermLocked
            ),
            VolumeLockState::Locked => matches!(
                requested,
                VolumeLockState::Unlocked | VolumeLockState::PermLocked
            ),
            // Permanent and error states never transition.
            VolumeLockState::PermLocked => false,
            s if s.is_pwe() => false,
            _ => false,
        };
        if !legal {
            return Err(LtfsError::bad_arg(format!(
                "illegal lock transition {} -> {}",
                current.as_str(),
                requested.as_str()
            )));
        }
    }

    *vol.lock_state.lock() = requested;
    {
        let mut meta = root.meta.write();
        meta.set_xattr(VOLUME_LOCK_EA, requested.as_str().as_bytes());
    }
    vol.index.write().mark_dirty();
    {
        let mut dev = vol.device.lock();
        dev.write_attribute(
            0,
            mam::LOCKED_MAM,
            mam::FORMAT_ASCII,
            requested.as_str().as_bytes(),
        )?;
    }
    info!("volume lock state -> {}", requested.as_str());
    Ok(())
}

fn path_of(dentry: &Arc<Dentry>) -> String {
    dentry.meta.read().name.clone()
}

// --- remove / list ---------------------------------------------------------

pub fn remove_xattr(vol: &Arc<Volume>, path: &str, name: &str) -> Result<()> {
    if vol.is_readonly_mount() {
        return Err(LtfsError::RdonlyVolume);
    }
    let dentry = {
        let _vol_read = vol.lock.read();
        fsops::lookup_path(vol, path)?
    };

    if name.starts_with(VIRTUAL_PREFIX) && !is_stored_reserved(name) {
        return Err(LtfsError::RdonlyXattr(name.to_string()));
    }

    let previous = {
        let mut meta = dentry.meta.write();
        let previous = meta.xattr(name).map(|x| x.value.clone());
        if !meta.remove_xattr(name) {
            return Err(LtfsError::NoXattr(name.to_string()));
        }
        previous
    };
    vol.index.write().mark_dirty();

    if let Some(dcache) = vol.dcache.lock().as_mut() {
        if let Err(e) = dcache.removexattr(path, name) {
            if let Some(old) = previous {
                dentry.meta.write().set_xattr(name, &old);
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Names of the real attributes on a dentry.
pub fn list_xattr(vol: &Arc<Volume>, path: &str) -> Result<Vec<String>> {
    let dentry = {
        let _vol_read = vol.lock.read();
        fsops::lookup_path(vol, path)?
    };
    let meta = dentry.meta.read();
    Ok(meta.xattrs.iter().map(|x| x.name.clone()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::sim::SimTape;
    use crate::tape::TapeDevice;
    use crate::volume::{MountOptions, MountType};

    fn mounted() -> Arc<Volume> {
        let dev = TapeDevice::open(Box::new(SimTape::new())).unwrap();
        let mut opts = MountOptions::default();
        opts.enable_lbp = false;
        opts.sync_period = None;
        let vol = Volume::new(dev, opts);
        vol.format_volume("ABC123", 1024).unwrap();
        vol.mount(MountType::ReadWrite).unwrap();
        vol
    }

    #[test]
    fn real_xattr_round_trip() {
        let vol = mounted();
        fsops::create(&vol, "/f", false, false, false).unwrap();
        set_xattr(&vol, "/f", "user.color", b"blue", false, false).unwrap();
        assert_eq!(get_xattr(&vol, "/f", "user.color").unwrap(), b"blue");
        assert_eq!(list_xattr(&vol, "/f").unwrap(), vec!["user.color"]);
        remove_xattr(&vol, "/f", "user.color").unwrap();
        assert!(matches!(
            get_xattr(&vol, "/f", "user.color"),
            Err(LtfsError::NoXattr(_))
        ));
    }

    #[test]
    fn create_and_replace_flags() {
        let vol = mounted();
        fsops::create(&vol, "/f", false, false, false).unwrap();
        assert!(matches!(
            set_xattr(&vol, "/f", "user.a", b"1", false, true),
            Err(LtfsError::NoXattr(_))
        ));
        set_xattr(&vol, "/f", "user.a", b"1", true, false).unwrap();
        assert!(matches!(
            set_xattr(&vol, "/f", "user.a", b"2", true, false),
            Err(LtfsError::XattrExists(_))
        ));
    }

    #[test]
    fn virtual_getters_on_root() {
        let vol = mounted();
        let uuid = vol.index.read().vol_uuid.clone();
        assert_eq!(get_xattr(&vol, "/", "ltfs.volumeUUID").unwrap(), uuid.as_bytes());
        assert_eq!(
            get_xattr(&vol, "/", "ltfs.partitionMap").unwrap(),
            b"I:a,D:b"
        );
        assert_eq!(
            get_xattr(&vol, "/", "ltfs.volumeBlocksize").unwrap(),
            b"1024"
        );
        assert_eq!(
            get_xattr(&vol, "/", "ltfs.indexGeneration").unwrap(),
            b"0"
        );
        assert_eq!(
            get_xattr(&vol, "/", "ltfs.volumeLockState").unwrap(),
            b"unlocked"
        );
        assert_eq!(get_xattr(&vol, "/", "ltfs.mamBarcode").unwrap(), b"ABC123");
    }

    #[test]
    fn file_virtual_getters() {
        let vol = mounted();
        fsops::create(&vol, "/f", false, false, false).unwrap();
        let handle = fsops::open(&vol, "/f", true, false).unwrap();
        fsops::write(&vol, &handle, b"data", 0).unwrap();
        fsops::close(&vol, handle).unwrap();

        assert_eq!(get_xattr(&vol, "/f", "ltfs.partition").unwrap(), b"b");
        assert_eq!(get_xattr(&vol, "/f", "ltfs.startblock").unwrap(), b"4");
        let uid = fsops::getattr(&vol, "/f").unwrap().uid;
        assert_eq!(
            get_xattr(&vol, "/f", "ltfs.fileUID").unwrap(),
            uid.to_string().as_bytes()
        );
    }

    #[test]
    fn unknown_reserved_name_is_readonly() {
        let vol = mounted();
        assert!(matches!(
            set_xattr(&vol, "/", "ltfs.noSuchThing", b"x", false, false),
            Err(LtfsError::RdonlyXattr(_))
        ));
    }

    #[test]
    fn stored_reserved_names_round_trip() {
        let vol = mounted();
        fsops::create(&vol, "/f", false, false, false).unwrap();
        set_xattr(&vol, "/f", "ltfs.hash.sha1sum", b"da39a3ee", false, false).unwrap();
        assert_eq!(
            get_xattr(&vol, "/f", "ltfs.hash.sha1sum").unwrap(),
            b"da39a3ee"
        );
        set_xattr(&vol, "/f", "ltfs.permissions.mode", b"0644", false, false).unwrap();
        set_xattr(&vol, "/f", "ltfs.mediaPool.name", b"pool1", false, false).unwrap();
    }

    #[test]
    fn sync_ea_triggers_index_write() {
        let vol = mounted();
        fsops::create(&vol, "/f", false, false, false).unwrap();
        assert!(vol.index.read().dirty);
        set_xattr(&vol, "/", "ltfs.sync", b"1", false, false).unwrap();
        assert!(!vol.index.read().dirty);
        assert_eq!(vol.index.read().generation, 1);
    }

    #[test]
    fn commit_message_stored_and_bounded() {
        let vol = mounted();
        set_xattr(&vol, "/", "ltfs.commitMessage", b"checkpoint 1", false, false).unwrap();
        assert_eq!(
            get_xattr(&vol, "/", "ltfs.commitMessage").unwrap(),
            b"checkpoint 1"
        );
        let oversized = vec![b'x'; MAX_COMMIT_MESSAGE + 1];
        assert!(matches!(
            set_xattr(&vol, "/", "ltfs.commitMessage", &oversized, false, false),
            Err(LtfsError::LargeXattr)
        ));
    }

    #[test]
    fn volume_name_updates_mam() {
        let vol = mounted();
        set_xattr(&vol, "/", "ltfs.volumeName", b"archive7", false, false).unwrap();
        assert_eq!(
            vol.index.read().volume_name.as_deref(),
            Some("archive7")
        );
        let mut dev = vol.device.lock();
        assert_eq!(
            dev.read_attribute(0, mam::USER_MEDIUM_LABEL).unwrap(),
            b"archive7"
        );
    }

    #[test]
    fn immutable_flag_set_and_clear() {
        let vol = mounted();
        fsops::create(&vol, "/f", false, false, false).unwrap();
        set_xattr(&vol, "/f", IMMUTABLE_EA, b"1", false, false).unwrap();
        assert!(fsops::getattr(&vol, "/f").unwrap().immutable);
        // Clearing works on non-WORM media.
        set_xattr(&vol, "/f", IMMUTABLE_EA, b"0", false, false).unwrap();
        assert!(!fsops::getattr(&vol, "/f").unwrap().immutable);

        // On WORM media it does not.
        set_xattr(&vol, "/f", IMMUTABLE_EA, b"enable", false, false).unwrap();
        vol.worm_media.store(true, Ordering::SeqCst);
        assert!(matches!(
            set_xattr(&vol, "/f", IMMUTABLE_EA, b"0", false, false),
            Err(LtfsError::WormEnabled)
        ));
    }

    #[test]
    fn lock_state_machine() {
        let vol = mounted();
        set_xattr(&vol, "/", "ltfs.volumeLockState", b"locked", false, false).unwrap();
        assert_eq!(*vol.lock_state.lock(), VolumeLockState::Locked);
        // Locked volume refuses writes.
        assert!(matches!(
            fsops::create(&vol, "/f", false, false, false),
            Err(LtfsError::RdonlyVolume)
        ));
        set_xattr(&vol, "/", "ltfs.volumeLockState", b"permlocked", false, false).unwrap();
        // Permanent lock is terminal.
        assert!(set_xattr(&vol, "/", "ltfs.volumeLockState", b"unlocked", false, false).is_err());
    }

    #[test]
    fn pwe_states_are_distinct_and_terminal() {
        let vol = mounted();
        // The write path records an unlocalized permanent write error; the
        // operator cannot request one through the attribute.
        assert!(set_xattr(&vol, "/", "ltfs.volumeLockState", b"pwe", false, false).is_err());
        *vol.lock_state.lock() = VolumeLockState::Pwe;

        // Reported as the generic state, not as both partitions failed.
        assert_eq!(
            get_xattr(&vol, "/", "ltfs.volumeLockState").unwrap(),
            b"pwe"
        );
        assert!(vol.is_write_locked());
        // No way out of an error state.
        assert!(set_xattr(&vol, "/", "ltfs.volumeLockState", b"unlocked", false, false).is_err());

        *vol.lock_state.lock() = VolumeLockState::PweBoth;
        assert_eq!(
            get_xattr(&vol, "/", "ltfs.volumeLockState").unwrap(),
            b"pwe-both"
        );
    }

    #[test]
    fn force_error_arms_device() {
        let vol = mounted();
        set_xattr(&vol, "/", FORCE_ERROR_WRITE_EA, b"3", false, false).unwrap();
        let dev = vol.device.lock();
        assert!(dev.force_write_perm.armed);
        assert_eq!(dev.force_write_perm.remaining, 3);
    }
}
