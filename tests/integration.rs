use tempfile::tempdir;

use vaultlog::config::Config;
use vaultlog::segment_io::{SegmentIO, Tag};
use vaultlog::Repository;

fn key(byte: u8) -> [u8; 32] {
    [byte; 32]
}

fn count_put_frames_for_key(path: &std::path::Path, target: &[u8; 32]) -> usize {
    let config = Config::load(&path.join("config")).unwrap();
    let mut io = SegmentIO::new(path.to_path_buf(), config.max_segment_size, config.segments_per_dir);
    let mut count = 0;
    for (segment, _) in io.segment_iterator(false).unwrap() {
        for object in io.iter_objects(segment, false, false).unwrap() {
            if object.tag == Tag::Put && &object.key == target {
                count += 1;
            }
        }
    }
    count
}

// S1 — basic roundtrip across a close/reopen cycle.
#[test]
fn basic_roundtrip_survives_reopen() {
    let dir = tempdir().unwrap();
    let k1 = key(1);
    let k2 = key(2);

    Repository::create(dir.path()).unwrap();
    let mut repo = Repository::open(dir.path(), true, None).unwrap();
    repo.put(k1, b"alpha").unwrap();
    repo.put(k2, b"beta").unwrap();
    repo.commit(false).unwrap();
    repo.close().unwrap();

    let mut repo = Repository::open(dir.path(), true, None).unwrap();
    assert_eq!(repo.get(&k1).unwrap(), b"alpha");
    assert_eq!(repo.get(&k2).unwrap(), b"beta");
    assert_eq!(repo.len().unwrap(), 2);
}

// S2 — overwriting a key and compacting leaves exactly one live PUT frame.
#[test]
fn overwrite_then_compact_leaves_one_live_frame() {
    let dir = tempdir().unwrap();
    let k1 = key(1);

    Repository::create(dir.path()).unwrap();
    let mut repo = Repository::open(dir.path(), true, None).unwrap();
    repo.put(k1, b"v1").unwrap();
    repo.commit(false).unwrap();

    repo.put(k1, b"v2").unwrap();
    repo.commit(false).unwrap();
    repo.close().unwrap();

    assert_eq!(count_put_frames_for_key(dir.path(), &k1), 1);

    let mut repo = Repository::open(dir.path(), true, None).unwrap();
    assert_eq!(repo.get(&k1).unwrap(), b"v2");
}

// S3 — an uncommitted tail is pruned on next open.
#[test]
fn crash_before_commit_is_pruned_on_reopen() {
    let dir = tempdir().unwrap();
    let k1 = key(1);
    let k2 = key(2);

    Repository::create(dir.path()).unwrap();
    {
        let mut repo = Repository::open(dir.path(), true, None).unwrap();
        repo.put(k1, b"x").unwrap();
        repo.commit(false).unwrap();
        repo.put(k2, b"y").unwrap();
        // repo is dropped here without calling commit() or close() — the
        // lock file is released by Drop, simulating a crashed writer.
    }

    let mut repo = Repository::open(dir.path(), true, None).unwrap();
    assert!(repo.contains(&k1).unwrap());
    assert!(!repo.contains(&k2).unwrap());
    assert_eq!(repo.len().unwrap(), 1);
}

// S4 — small segments force many rollovers; every entry still reads back.
#[test]
fn segment_rollover_keeps_every_entry_readable() {
    let dir = tempdir().unwrap();
    Repository::create(dir.path()).unwrap();

    let mut config = Config::load(&dir.path().join("config")).unwrap();
    config.max_segment_size = 1024;
    config.save(&dir.path().join("config")).unwrap();

    let mut repo = Repository::open(dir.path(), true, None).unwrap();
    let keys: Vec<[u8; 32]> = (0..100u32)
        .map(|i| {
            let mut k = [0u8; 32];
            k[0..4].copy_from_slice(&i.to_le_bytes());
            k
        })
        .collect();
    for k in &keys {
        repo.put(*k, &vec![7u8; 200]).unwrap();
    }
    repo.commit(false).unwrap();

    let data_segments: usize = {
        let config = Config::load(&dir.path().join("config")).unwrap();
        let io = SegmentIO::new(dir.path().to_path_buf(), config.max_segment_size, config.segments_per_dir);
        io.segment_iterator(false).unwrap().len()
    };
    assert!(data_segments >= 20, "expected rollover into many segments, got {}", data_segments);

    for k in &keys {
        assert_eq!(repo.get(k).unwrap(), vec![7u8; 200]);
    }
}

// S5 — corrupting a value frame is detected by check and fixable by repair.
#[test]
fn check_detects_and_repair_recovers_corruption() {
    let dir = tempdir().unwrap();
    let k1 = key(1);
    let k2 = key(2);

    Repository::create(dir.path()).unwrap();
    let mut repo = Repository::open(dir.path(), true, None).unwrap();
    repo.put(k1, b"alpha").unwrap();
    repo.put(k2, b"beta").unwrap();
    repo.commit(false).unwrap();
    repo.close().unwrap();

    // Corrupt a byte inside K1's value, well past the header.
    let config = Config::load(&dir.path().join("config")).unwrap();
    let mut io = SegmentIO::new(dir.path().to_path_buf(), config.max_segment_size, config.segments_per_dir);
    let (segment, offset) = {
        let mut found = None;
        for (segment, _) in io.segment_iterator(false).unwrap() {
            for object in io.iter_objects(segment, false, false).unwrap() {
                if object.tag == Tag::Put && object.key == k1 {
                    found = Some((segment, object.offset));
                }
            }
        }
        found.expect("k1's frame must exist")
    };
    let filename = io.segment_filename(segment);
    let mut bytes = std::fs::read(&filename).unwrap();
    let corrupt_at = offset as usize + 41 + 2; // past the PUT header, inside the value bytes
    bytes[corrupt_at] ^= 0xFF;
    std::fs::write(&filename, bytes).unwrap();
    drop(io);

    let mut repo = Repository::open(dir.path(), true, None).unwrap();
    assert!(!repo.check(false, false).unwrap());

    assert!(repo.check(true, false).unwrap());
    assert!(repo.get(&k1).is_err());
    assert_eq!(repo.get(&k2).unwrap(), b"beta");
}

// A corrupt index.<txid> file is transparently rebuilt from segments even
// when check() is called without repair, matching how the underlying index
// load always auto-recovers outside of an explicit strict check.
#[test]
fn check_without_repair_recovers_corrupt_index() {
    let dir = tempdir().unwrap();
    let k1 = key(1);

    Repository::create(dir.path()).unwrap();
    let mut repo = Repository::open(dir.path(), true, None).unwrap();
    repo.put(k1, b"alpha").unwrap();
    repo.commit(false).unwrap();
    repo.close().unwrap();

    let index_file = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().starts_with("index."))
        .expect("an index file must exist after commit");
    std::fs::write(index_file.path(), [0u8; 4]).unwrap();

    let mut repo = Repository::open(dir.path(), true, None).unwrap();
    assert!(repo.check(false, false).unwrap());
    assert_eq!(repo.get(&k1).unwrap(), b"alpha");
}

// S6 — a missing hints file is transparently rebuilt on next commit.
#[test]
fn missing_hints_file_is_rebuilt() {
    let dir = tempdir().unwrap();
    let k1 = key(1);
    let k2 = key(2);

    Repository::create(dir.path()).unwrap();
    let mut repo = Repository::open(dir.path(), true, None).unwrap();
    repo.put(k1, b"alpha").unwrap();
    repo.commit(false).unwrap();
    repo.close().unwrap();

    let hints_file = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().starts_with("hints."))
        .expect("a hints file must exist after commit");
    std::fs::remove_file(hints_file.path()).unwrap();

    let mut repo = Repository::open(dir.path(), true, None).unwrap();
    repo.put(k2, b"beta").unwrap();
    repo.commit(false).unwrap();

    let rebuilt_hints = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().starts_with("hints."));
    assert!(rebuilt_hints);
    assert_eq!(repo.get(&k1).unwrap(), b"alpha");
    assert_eq!(repo.get(&k2).unwrap(), b"beta");
}

#[test]
fn delete_then_get_reports_object_not_found() {
    let dir = tempdir().unwrap();
    let k1 = key(9);

    Repository::create(dir.path()).unwrap();
    let mut repo = Repository::open(dir.path(), true, None).unwrap();
    repo.put(k1, b"gone-soon").unwrap();
    repo.commit(false).unwrap();

    repo.delete(&k1).unwrap();
    repo.commit(false).unwrap();

    assert!(matches!(repo.get(&k1), Err(vaultlog::Error::ObjectNotFound { .. })));
    assert!(matches!(repo.delete(&k1), Err(vaultlog::Error::ObjectNotFound { .. })));
}

#[test]
fn create_refuses_nonempty_directory() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("stray"), b"x").unwrap();
    assert!(matches!(
        Repository::create(dir.path()),
        Err(vaultlog::Error::AlreadyExists(_))
    ));
}

#[test]
fn destroy_refuses_append_only_repository() {
    let dir = tempdir().unwrap();
    Repository::create(dir.path()).unwrap();
    {
        let mut config = Config::load(&dir.path().join("config")).unwrap();
        config.append_only = true;
        config.save(&dir.path().join("config")).unwrap();
    }
    let repo = Repository::open(dir.path(), true, None).unwrap();
    assert!(matches!(repo.destroy(), Err(vaultlog::Error::AppendOnly(_))));
}
