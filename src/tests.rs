//! End-to-end scenarios over the simulated cartridge: the whole stack from
//! CDB issue through index chain recovery.

use crate::chain::{self, TraverseOrder};
use crate::error::LtfsError;
use crate::fsops;
use crate::index::types::{Index, TapePtr};
use crate::scsi::sim::{Record, SimTape};
use crate::scsi::transport::{CmdStatus, DataDir, ScsiTransport};
use crate::tape::TapeDevice;
use crate::volume::{MountOptions, MountType, SyncReason, Volume};
use parking_lot::Mutex;
use std::sync::Arc;

/// Transport handle that keeps the simulated cartridge accessible to the
/// test after the device takes ownership, so tests can damage the medium.
#[derive(Clone)]
struct SharedSim(Arc<Mutex<SimTape>>);

impl SharedSim {
    fn new() -> Self {
        SharedSim(Arc::new(Mutex::new(SimTape::new())))
    }

    fn with_tape<R>(&self, f: impl FnOnce(&mut SimTape) -> R) -> R {
        f(&mut self.0.lock())
    }
}

impl ScsiTransport for SharedSim {
    fn issue(
        &mut self,
        cdb: &[u8],
        data: DataDir<'_>,
        timeout_secs: u32,
    ) -> crate::error::Result<CmdStatus> {
        self.0.lock().issue(cdb, data, timeout_secs)
    }

    fn reconnect(&mut self) -> crate::error::Result<()> {
        Ok(())
    }

    fn identifier(&self) -> String {
        self.0.lock().identifier()
    }
}

const BLOCKSIZE: u32 = 1024;

fn fresh_volume(sim: &SharedSim) -> Arc<Volume> {
    let dev = TapeDevice::open(Box::new(sim.clone())).unwrap();
    let mut opts = MountOptions::default();
    opts.enable_lbp = false;
    opts.sync_period = None;
    Volume::new(dev, opts)
}

fn formatted_volume() -> (SharedSim, Arc<Volume>) {
    let sim = SharedSim::new();
    let vol = fresh_volume(&sim);
    vol.format_volume("ABC123", BLOCKSIZE).unwrap();
    vol.mount(MountType::ReadWrite).unwrap();
    (sim, vol)
}

fn write_file(vol: &Arc<Volume>, path: &str, data: &[u8]) {
    fsops::create(vol, path, false, false, false).unwrap();
    let handle = fsops::open(vol, path, true, false).unwrap();
    fsops::write(vol, &handle, data, 0).unwrap();
    fsops::close(vol, handle).unwrap();
}

#[test]
fn mount_fresh_volume() {
    // A labeled two-partition cartridge with no indexes mounts as an empty
    // generation-zero volume.
    let (_sim, vol) = formatted_volume();
    let index = vol.index.read();
    assert_eq!(index.generation, 0);
    assert!(index.volume_name.is_none());
    assert_eq!(index.root.meta.read().link_count, 1);
    assert_eq!(index.file_count, 0);
    let label = vol.label.read().clone().unwrap();
    assert_eq!(label.partid_ip, 'a');
    assert_eq!(label.partid_dp, 'b');
    assert_eq!(label.barcode, "ABC123");
}

#[test]
fn create_write_sync() {
    let (_sim, vol) = formatted_volume();
    write_file(&vol, "/a.txt", &[0x41u8; 32]);

    // First data block lands directly after the data partition label.
    let dentry = fsops::lookup_path(&vol, "/a.txt").unwrap();
    let extents = dentry.extents();
    assert_eq!(extents.len(), 1);
    assert_eq!(extents[0].partition, 'b');
    assert_eq!(extents[0].start_block, 4);
    assert_eq!(extents[0].byte_offset, 0);
    assert_eq!(extents[0].byte_count, 32);
    assert_eq!(extents[0].file_offset, 0);

    vol.sync_index(SyncReason::RequestedByUser, false).unwrap();
    let index = vol.index.read();
    assert_eq!(index.generation, 1);
    // IP: filemark at 4, index at 5. DP: data at 4, filemark at 5, index
    // at 6; the chain head's back pointer names that DP copy.
    assert_eq!(index.selfptr, Some(TapePtr::new('a', 5)));
    assert_eq!(index.backptr, Some(TapePtr::new('b', 6)));
    assert!(vol.index_file_end('a'));
    assert!(vol.index_file_end('b'));
}

#[test]
fn remount_reads_back_the_tree() {
    let (sim, vol) = formatted_volume();
    write_file(&vol, "/a.txt", b"hello tape world");
    fsops::create(&vol, "/docs", true, false, false).unwrap();
    write_file(&vol, "/docs/b.bin", &[9u8; 2048]);
    vol.unmount().unwrap();

    let vol2 = fresh_volume(&sim);
    vol2.mount(MountType::ReadWrite).unwrap();
    assert_eq!(vol2.index.read().generation, 1);
    assert_eq!(vol2.index.read().file_count, 2);

    let handle = fsops::open(&vol2, "/a.txt", false, false).unwrap();
    let mut buf = [0u8; 32];
    let n = fsops::read(&vol2, &handle, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"hello tape world");
    fsops::close(&vol2, handle).unwrap();

    let attrs = fsops::getattr(&vol2, "/docs/b.bin").unwrap();
    assert_eq!(attrs.size, 2048);
}

#[test]
fn rename_clash_replaces_target() {
    let (_sim, vol) = formatted_volume();
    fsops::create(&vol, "/dir1", true, false, false).unwrap();
    fsops::create(&vol, "/dir2", true, false, false).unwrap();
    write_file(&vol, "/dir1/x", b"from dir1");
    write_file(&vol, "/dir2/x", b"from dir2");

    let dir2 = fsops::lookup_path(&vol, "/dir2").unwrap();
    let children_before = dir2.child_count();

    fsops::rename(&vol, "/dir1/x", "/dir2/x").unwrap();
    vol.sync_index(SyncReason::RequestedByUser, false).unwrap();

    // The clash unlinked the old target and moved the source in: dir2
    // holds exactly as many entries as before.
    assert_eq!(dir2.child_count(), children_before);
    assert!(matches!(
        fsops::lookup_path(&vol, "/dir1/x"),
        Err(LtfsError::NoDentry(_))
    ));
    let handle = fsops::open(&vol, "/dir2/x", false, false).unwrap();
    let mut buf = [0u8; 16];
    let n = fsops::read(&vol, &handle, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"from dir1");
    fsops::close(&vol, handle).unwrap();
}

#[test]
fn rollback_preserving_history() {
    let (_sim, vol) = formatted_volume();

    // Generation 1 holds one file; 2, 3 and 4 add one more each.
    write_file(&vol, "/gen1.txt", b"one");
    vol.sync_index(SyncReason::RequestedByUser, false).unwrap();
    for (gen, name) in [(2u64, "/gen2.txt"), (3, "/gen3.txt"), (4, "/gen4.txt")] {
        write_file(&vol, name, name.as_bytes());
        vol.sync_index(SyncReason::RequestedByUser, false).unwrap();
        assert_eq!(vol.index.read().generation, gen);
    }

    chain::rollback(&vol, 2, false).unwrap();

    // Payload is generation 2's (two files), but the head keeps the newest
    // generation number so the chain stays monotonic.
    assert_eq!(vol.index.read().generation, 4);
    assert!(fsops::lookup_path(&vol, "/gen1.txt").is_ok());
    assert!(fsops::lookup_path(&vol, "/gen2.txt").is_ok());
    assert!(matches!(
        fsops::lookup_path(&vol, "/gen3.txt"),
        Err(LtfsError::NoDentry(_))
    ));
    assert!(matches!(
        fsops::lookup_path(&vol, "/gen4.txt"),
        Err(LtfsError::NoDentry(_))
    ));

    // Every generation is still enumerable, newest first.
    let points = chain::list_rollback_points(&vol, TraverseOrder::Backward, None).unwrap();
    let generations: Vec<u64> = points.iter().map(|p| p.generation).collect();
    assert_eq!(generations, vec![4, 3, 2, 1]);
    let forward = chain::list_rollback_points(&vol, TraverseOrder::Forward, None).unwrap();
    let generations: Vec<u64> = forward.iter().map(|p| p.generation).collect();
    assert_eq!(generations, vec![1, 2, 3, 4]);
}

#[test]
fn rollback_erasing_history() {
    let (_sim, vol) = formatted_volume();
    write_file(&vol, "/keep.txt", b"keep");
    vol.sync_index(SyncReason::RequestedByUser, false).unwrap();
    write_file(&vol, "/drop.txt", b"drop");
    vol.sync_index(SyncReason::RequestedByUser, false).unwrap();

    chain::rollback(&vol, 1, true).unwrap();
    assert_eq!(vol.index.read().generation, 1);
    assert!(fsops::lookup_path(&vol, "/keep.txt").is_ok());
    assert!(fsops::lookup_path(&vol, "/drop.txt").is_err());

    // History is gone: only generation 1 remains reachable.
    let points = chain::list_rollback_points(&vol, TraverseOrder::Backward, None).unwrap();
    let generations: Vec<u64> = points.iter().map(|p| p.generation).collect();
    assert_eq!(generations, vec![1]);
}

#[test]
fn missing_trailing_filemark_repaired() {
    let (sim, vol) = formatted_volume();
    write_file(&vol, "/f", b"payload");
    vol.sync_index(SyncReason::RequestedByUser, false).unwrap();
    vol.unmount().unwrap();

    // Damage: drop the filemark terminating the IP index.
    sim.with_tape(|tape| {
        let records = tape.records_mut(0);
        assert!(matches!(records.last(), Some(Record::Filemark)));
        records.pop();
    });

    let vol2 = fresh_volume(&sim);
    vol2.mount(MountType::ReadWrite).unwrap();
    let before_generation = vol2.index.read().generation;

    let result = chain::check_medium(&vol2, true, false, false).unwrap();
    assert!(result.errors_found);
    assert!(result.errors_fixed);
    assert!(vol2.index_file_end('a'));
    // The repair wrote the missing filemark, not a new index.
    assert_eq!(vol2.index.read().generation, before_generation);
    sim.with_tape(|tape| {
        assert!(matches!(tape.records(0).last(), Some(Record::Filemark)));
    });
}

#[test]
fn extra_blocks_collected_into_lost_and_found() {
    let (sim, vol) = formatted_volume();
    write_file(&vol, "/f", b"payload");
    vol.sync_index(SyncReason::RequestedByUser, false).unwrap();
    vol.unmount().unwrap();

    // Damage: orphan data appended past the DP index, never referenced by
    // any index.
    sim.with_tape(|tape| {
        let records = tape.records_mut(1);
        records.push(Record::Block(vec![0xEE; BLOCKSIZE as usize]));
        records.push(Record::Block(vec![0xEE; 100]));
    });

    let vol2 = fresh_volume(&sim);
    vol2.mount(MountType::ReadWrite).unwrap();
    let result = chain::check_medium(&vol2, true, false, true).unwrap();
    assert!(result.errors_found);
    assert_eq!(result.lostfound_entries, 1);

    let mut names = Vec::new();
    fsops::readdir(&vol2, "/_ltfs_lostandfound", |e| names.push(e.name.clone())).unwrap();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("partition1_block"));
    // The repair appended a fresh index, so both partitions close with one.
    assert!(vol2.index_file_end('a'));
    assert!(vol2.index_file_end('b'));
}

#[test]
fn mismatched_chain_is_invalid() {
    // IP at generation 5 pointing at (b,200), DP's latest at generation 3
    // located at (b,150): no consistent interpretation exists.
    let (_sim, vol) = formatted_volume();
    let uuid = vol.index.read().vol_uuid.clone();

    let mut ip_index = Index::new_empty(&uuid, crate::util::time::LtfsTime::now());
    ip_index.generation = 5;
    ip_index.selfptr = Some(TapePtr::new('a', 10));
    ip_index.backptr = Some(TapePtr::new('b', 200));

    let mut dp_index = Index::new_empty(&uuid, crate::util::time::LtfsTime::now());
    dp_index.generation = 3;
    dp_index.selfptr = Some(TapePtr::new('b', 150));
    dp_index.backptr = None;

    assert!(matches!(
        chain::check_pointers(&vol, Some(&ip_index), Some(&dp_index)),
        Err(LtfsError::IndexInvalid)
    ));
}

#[test]
fn lone_index_decisions() {
    let (_sim, vol) = formatted_volume();
    let uuid = vol.index.read().vol_uuid.clone();
    let mut ip_index = Index::new_empty(&uuid, crate::util::time::LtfsTime::now());
    ip_index.generation = 2;
    ip_index.selfptr = Some(TapePtr::new('a', 8));
    ip_index.backptr = Some(TapePtr::new('b', 40));

    // A lone IP index may not point at a DP index that is not there.
    assert!(matches!(
        chain::check_pointers(&vol, Some(&ip_index), None),
        Err(LtfsError::IndexInvalid)
    ));
    assert!(matches!(
        chain::check_pointers(&vol, None, Some(&ip_index)),
        Ok(chain::Newer::Dp)
    ));
    assert!(matches!(
        chain::check_pointers(&vol, None, None),
        Ok(chain::Newer::Neither)
    ));
}

#[test]
fn interrupted_sync_leaves_dp_ahead() {
    // Write data, sync, then damage the IP as if the machine died between
    // the DP and IP index writes: the DP copy must win the next mount.
    let (sim, vol) = formatted_volume();
    write_file(&vol, "/a", b"gen1");
    vol.sync_index(SyncReason::RequestedByUser, false).unwrap();
    write_file(&vol, "/b", b"gen2");
    vol.sync_index(SyncReason::RequestedByUser, false).unwrap();
    vol.unmount().unwrap();

    // Chop the IP back to its generation-1 index: keep everything up to and
    // including the filemark that terminates the first index.
    sim.with_tape(|tape| {
        let records = tape.records_mut(0);
        let end = records
            .iter()
            .enumerate()
            .skip(5)
            .find(|(_, r)| matches!(r, Record::Filemark))
            .map(|(i, _)| i)
            .unwrap();
        records.truncate(end + 1);
    });

    let vol2 = fresh_volume(&sim);
    vol2.mount(MountType::ReadWrite).unwrap();
    let index = vol2.index.read();
    assert_eq!(index.generation, 2);
    assert_eq!(index.selfptr.map(|p| p.partition), Some('b'));
    drop(index);
    assert!(fsops::lookup_path(&vol2, "/b").is_ok());
}

#[test]
fn sparse_read_and_eof_behavior() {
    let (_sim, vol) = formatted_volume();
    fsops::create(&vol, "/sparse", false, false, false).unwrap();
    let handle = fsops::open(&vol, "/sparse", true, false).unwrap();
    fsops::write(&vol, &handle, b"abc", 4000).unwrap();

    let mut buf = vec![0xAAu8; 8000];
    let n = fsops::read(&vol, &handle, &mut buf, 0).unwrap();
    assert_eq!(n, 4003);
    assert!(buf[..4000].iter().all(|&b| b == 0));
    assert_eq!(&buf[4000..4003], b"abc");
    fsops::close(&vol, handle).unwrap();
}

#[test]
fn kmi_simple_backend_feeds_drive_key() {
    use crate::kmi::simple::SimpleKmi;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let (_sim, vol) = formatted_volume();
    let dk = BASE64.encode([5u8; 32]);
    let kmi = SimpleKmi::new(
        format!("{}:KEY000102030405060708", dk),
        Some("KEY000102030405060708".to_string()),
    );
    *vol.kmi.lock() = Some(Box::new(kmi));

    let key = vol
        .kmi
        .lock()
        .as_mut()
        .unwrap()
        .get_key(None)
        .unwrap()
        .unwrap();
    assert_eq!(key.dk, [5u8; 32]);
    let mut dev = vol.device.lock();
    dev.set_key(&key.dk, &key.dki).unwrap();
}

#[test]
fn dcache_mirrors_namespace_changes() {
    use crate::dcache::flatfile::FlatfileDcache;
    use crate::dcache::DentryCache;

    let workdir = tempfile::tempdir().unwrap();
    let (_sim, vol) = formatted_volume();
    {
        let mut dcache = FlatfileDcache::new(workdir.path().join("cache"));
        dcache.mkcache().unwrap();
        dcache.set_vol_uuid(&vol.index.read().vol_uuid).unwrap();
        *vol.dcache.lock() = Some(Box::new(dcache));
    }

    fsops::create(&vol, "/mirrored", false, false, false).unwrap();
    crate::xattr::set_xattr(&vol, "/mirrored", "user.tag", b"42", false, false).unwrap();

    let guard = vol.dcache.lock();
    let dcache = guard.as_ref().unwrap();
    assert!(dcache.read_direntry("/mirrored").unwrap().is_some());
    assert_eq!(dcache.getxattr("/mirrored", "user.tag").unwrap(), b"42");
}
