//! # comprehensive storage tests
//!
//! why: verify all storage scenarios work correctly
//! relations: tests raft-storage crate
//! what: backend contract, crash recovery, atomic records, snapshots, registry, concurrent access

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use raft_core::{ConfigurationEntry, ConfigurationManager, LogEntry, LogId, PeerId, RaftError, SnapshotMeta};
use raft_storage::{
    LocalFileMeta, LocalSnapshotStorage, LogStorage, MemoryLogStorage, RecordFile, SegmentLogStorage, Snapshot,
    SnapshotCopier, SnapshotReader, SnapshotStorage, SnapshotThrottle, SnapshotWriter, StorageRegistry,
    ThroughputSnapshotThrottle, INITIAL_TERM,
};
use serde::{Deserialize, Serialize};
use tempfile::tempdir;

fn entries(term: u64, range: std::ops::RangeInclusive<u64>) -> Vec<Arc<LogEntry>> {
    range
        .map(|i| Arc::new(LogEntry::new(term, i, format!("cmd{}", i).into_bytes())))
        .collect()
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn peer(s: &str) -> PeerId {
    s.parse().unwrap()
}

/// small segments so every test crosses several files
fn segment_storage(path: &Path) -> SegmentLogStorage {
    let storage = SegmentLogStorage::with_options(path, false, 64);
    storage.init(&ConfigurationManager::new()).unwrap();
    storage
}

fn closed_segment_names(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("log_0"))
        .collect();
    names.sort();
    names
}

// =============================================================================
// SECTION 1: LOG STORAGE CONTRACT (every backend)
// =============================================================================

mod log_contract {
    use super::*;

    fn empty_log_lifecycle(storage: &dyn LogStorage) {
        assert_eq!(storage.first_log_index(), 1);
        assert_eq!(storage.last_log_index(), 0);

        for e in entries(1, 1..=3) {
            storage.append_entry(e).unwrap();
        }
        assert_eq!(storage.last_log_index(), 3);

        storage.truncate_suffix(2).unwrap();
        assert_eq!(storage.last_log_index(), 2);
        assert!(storage.get_entry(3).is_none());

        storage.reset(10).unwrap();
        assert_eq!(storage.first_log_index(), 10);
        assert_eq!(storage.last_log_index(), 9);
        assert!(storage.is_empty());
        assert!(storage.get_entry(2).is_none());
    }

    fn round_trip_after_mixed_operations(storage: &dyn LogStorage) {
        let batch = entries(2, 1..=20);
        assert_eq!(storage.append_entries(&batch).unwrap(), 20);
        for e in &batch {
            assert_eq!(storage.get_entry(e.index()).as_deref(), Some(e.as_ref()));
        }

        storage.truncate_prefix(6).unwrap();
        for i in 1..6 {
            assert!(storage.get_entry(i).is_none(), "index {} should be gone", i);
        }
        for e in &batch[5..] {
            assert_eq!(storage.get_entry(e.index()).as_deref(), Some(e.as_ref()));
        }

        storage.truncate_suffix(15).unwrap();
        assert_eq!((storage.first_log_index(), storage.last_log_index()), (6, 15));

        let rewritten = entries(3, 16..=18);
        storage.append_entries(&rewritten).unwrap();
        assert_eq!(storage.get_term(15), 2);
        assert_eq!(storage.get_term(16), 3);
        assert_eq!(storage.get_term(19), 0);
        assert_eq!(storage.get_term(5), 0);
    }

    #[test]
    fn memory_follows_end_to_end_scenario() {
        empty_log_lifecycle(&MemoryLogStorage::new());
    }

    #[test]
    fn segments_follow_end_to_end_scenario() {
        let dir = tempdir().unwrap();
        empty_log_lifecycle(&segment_storage(dir.path()));
    }

    #[test]
    fn memory_round_trips() {
        round_trip_after_mixed_operations(&MemoryLogStorage::new());
    }

    #[test]
    fn segments_round_trip() {
        let dir = tempdir().unwrap();
        round_trip_after_mixed_operations(&segment_storage(dir.path()));
    }

    #[test]
    fn configuration_entries_survive_as_configuration() {
        let dir = tempdir().unwrap();
        let storage = segment_storage(dir.path());
        let conf = Arc::new(LogEntry::configuration(
            1,
            1,
            vec![peer("10.0.0.1:8000"), peer("10.0.0.2:8000")],
            Some(vec![peer("10.0.0.1:8000")]),
        ));
        storage.append_entry(conf.clone()).unwrap();
        assert_eq!(storage.get_entry(1).unwrap().as_ref(), conf.as_ref());
    }

    #[test]
    #[should_panic(expected = "below first_log_index")]
    fn truncate_suffix_below_first_panics() {
        let storage = MemoryLogStorage::new();
        storage.append_entries(&entries(1, 1..=5)).unwrap();
        storage.truncate_prefix(4).unwrap();
        storage.truncate_suffix(1).unwrap();
    }
}

// =============================================================================
// SECTION 2: CRASH RECOVERY
// =============================================================================

mod crash_recovery {
    use super::*;

    #[test]
    fn log_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let storage = segment_storage(dir.path());
            storage.append_entries(&entries(1, 1..=12)).unwrap();
            storage.truncate_prefix(3).unwrap();
        }
        let storage = segment_storage(dir.path());
        assert_eq!(storage.first_log_index(), 3);
        assert_eq!(storage.last_log_index(), 12);
        assert_eq!(storage.get_entry(7).unwrap().data, b"cmd7".to_vec());
    }

    #[test]
    fn init_replays_configuration_history() {
        let dir = tempdir().unwrap();
        {
            let storage = segment_storage(dir.path());
            storage.append_entries(&entries(1, 1..=2)).unwrap();
            storage
                .append_entry(Arc::new(LogEntry::configuration(1, 3, vec![peer("10.0.0.1:8000")], None)))
                .unwrap();
            storage.append_entries(&entries(1, 4..=6)).unwrap();
            storage
                .append_entry(Arc::new(LogEntry::configuration(
                    2,
                    7,
                    vec![peer("10.0.0.1:8000"), peer("10.0.0.2:8000")],
                    None,
                )))
                .unwrap();
        }

        let manager = ConfigurationManager::new();
        let storage = SegmentLogStorage::with_options(dir.path(), false, 64);
        storage.init(&manager).unwrap();
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.last_configuration().id, LogId::new(2, 7));
        assert_eq!(manager.get(5).id, LogId::new(1, 3));
    }

    #[test]
    fn torn_write_at_the_tail_is_dropped() {
        init_logger();
        let dir = tempdir().unwrap();
        {
            let storage = segment_storage(dir.path());
            storage.append_entries(&entries(1, 1..=5)).unwrap();
        }
        let open_segment = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.file_name().unwrap().to_string_lossy().starts_with("log_inprogress_"))
            .unwrap();
        let mut bytes = fs::read(&open_segment).unwrap();
        bytes.extend_from_slice(&[0xAB; 10]);
        fs::write(&open_segment, bytes).unwrap();

        let storage = segment_storage(dir.path());
        assert_eq!(storage.last_log_index(), 5);
        storage.append_entries(&entries(2, 6..=6)).unwrap();
        assert_eq!(storage.get_term(6), 2);
    }

    #[test]
    fn missing_segment_fails_init() {
        init_logger();
        let dir = tempdir().unwrap();
        {
            let storage = segment_storage(dir.path());
            storage.append_entries(&entries(1, 1..=10)).unwrap();
        }
        let closed = closed_segment_names(dir.path());
        assert!(closed.len() >= 3);
        fs::remove_file(dir.path().join(&closed[1])).unwrap();

        let storage = SegmentLogStorage::with_options(dir.path(), false, 64);
        let err = storage.init(&ConfigurationManager::new()).unwrap_err();
        assert!(matches!(err, RaftError::Corrupted(_)));
    }

    #[test]
    fn segment_starting_at_index_zero_is_corruption() {
        init_logger();
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("log_inprogress_00000000000000000000"), b"").unwrap();

        let storage = SegmentLogStorage::with_options(dir.path(), false, 64);
        let err = storage.init(&ConfigurationManager::new()).unwrap_err();
        assert!(matches!(err, RaftError::Corrupted(_)));
    }

    #[test]
    fn leftovers_of_interrupted_prefix_truncation_are_removed() {
        let dir = tempdir().unwrap();
        {
            let storage = segment_storage(dir.path());
            storage.append_entries(&entries(1, 1..=10)).unwrap();
        }
        let before = closed_segment_names(dir.path()).len();
        // the meta is written first, so a crash can leave exactly this state
        RecordFile::new(dir.path().join("log_meta"))
            .save(&serde_json::json!({ "first_log_index": 5 }), false)
            .unwrap();

        let storage = segment_storage(dir.path());
        assert_eq!(storage.first_log_index(), 5);
        assert!(storage.get_entry(4).is_none());
        assert_eq!(storage.get_entry(5).unwrap().data, b"cmd5".to_vec());
        assert!(closed_segment_names(dir.path()).len() < before);
    }
}

// =============================================================================
// SECTION 3: ATOMIC RECORD FILES
// =============================================================================

mod atomic_records {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Vote {
        term: u64,
        voted_for: String,
    }

    #[test]
    fn fresh_instance_loads_what_was_saved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vote");
        let vote = Vote { term: 9, voted_for: "10.0.0.3:8000:0:0".into() };
        RecordFile::new(&path).save(&vote, true).unwrap();
        assert_eq!(RecordFile::new(&path).load::<Vote>().unwrap(), vote);
    }

    #[test]
    fn crash_before_rename_keeps_the_original() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vote");
        let original = Vote { term: 4, voted_for: "a".into() };
        RecordFile::new(&path).save(&original, true).unwrap();

        // half-written temp file from a save that never reached its rename
        fs::write(dir.path().join("vote.tmp"), [0, 0, 1, 0, b'{']).unwrap();
        assert_eq!(RecordFile::new(&path).load::<Vote>().unwrap(), original);

        let next = Vote { term: 5, voted_for: "b".into() };
        RecordFile::new(&path).save(&next, true).unwrap();
        assert_eq!(RecordFile::new(&path).load::<Vote>().unwrap(), next);
        assert!(!dir.path().join("vote.tmp").exists());
    }

    #[test]
    fn garbage_payload_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vote");
        fs::write(&path, [0, 0, 0, 3, b'x', b'y', b'z']).unwrap();
        assert!(matches!(RecordFile::new(&path).load::<Vote>(), Err(RaftError::Corrupted(_))));
    }
}

// =============================================================================
// SECTION 4: SNAPSHOT STORAGE
// =============================================================================

mod snapshots {
    use super::*;

    fn publish(storage: &LocalSnapshotStorage, index: u64, payload: &[u8]) -> String {
        let mut writer = storage.create().unwrap();
        fs::write(writer.path().join("state"), payload).unwrap();
        let meta = LocalFileMeta::of_file(writer.path().join("state")).unwrap();
        writer.add_file("state", Some(meta)).unwrap();
        writer
            .save_meta(SnapshotMeta::new(LogId::new(3, index), &ConfigurationEntry::default()))
            .unwrap();
        storage.close_writer(writer).unwrap();
        storage.open().unwrap().generate_uri_for_copy()
    }

    fn storage(path: &Path) -> LocalSnapshotStorage {
        let storage = LocalSnapshotStorage::new(path, false);
        storage.init().unwrap();
        storage
    }

    #[test]
    fn cancelled_copy_is_interrupted_and_leaves_nothing() {
        init_logger();
        let leader_dir = tempdir().unwrap();
        let follower_dir = tempdir().unwrap();
        let uri = publish(&storage(leader_dir.path()), 100, &vec![1u8; 64 * 1024]);

        let follower = storage(follower_dir.path());
        follower.set_snapshot_throttle(Arc::new(ThroughputSnapshotThrottle::new(1024, 1, 0)));
        let copier = follower.start_to_copy_from(&uri).unwrap();
        thread::sleep(Duration::from_millis(50));
        copier.cancel();

        assert!(matches!(copier.join(), Err(RaftError::Interrupted(_))));
        assert_eq!(follower.last_snapshot_index(), 0);
        assert!(follower.open().is_none());
        let leftovers = fs::read_dir(follower_dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn tampered_source_fails_checksum() {
        let leader_dir = tempdir().unwrap();
        let follower_dir = tempdir().unwrap();
        let leader = storage(leader_dir.path());
        publish(&leader, 7, b"original bytes");
        let reader = leader.open().unwrap();
        fs::write(reader.path().join("state"), b"tampered bytes").unwrap();

        let follower = storage(follower_dir.path());
        let err = follower.copy_from(&reader.generate_uri_for_copy()).err().unwrap();
        assert!(matches!(err, RaftError::Corrupted(_)));
    }

    #[test]
    fn task_limit_rejects_extra_copies() {
        let leader_dir = tempdir().unwrap();
        let follower_dir = tempdir().unwrap();
        let uri = publish(&storage(leader_dir.path()), 1, b"x");

        let throttle = Arc::new(ThroughputSnapshotThrottle::new(0, 10, 1));
        assert!(throttle.add_one_more_task());
        let follower = storage(follower_dir.path());
        follower.set_snapshot_throttle(throttle.clone());
        assert!(matches!(follower.copy_from(&uri), Err(RaftError::Busy(_))));

        throttle.finish_one_task();
        assert!(follower.copy_from(&uri).is_ok());
        assert_eq!(throttle.running_tasks(), 0);
    }

    #[test]
    fn newest_snapshot_wins_after_restart() {
        let dir = tempdir().unwrap();
        {
            let storage = storage(dir.path());
            publish(&storage, 10, b"ten");
            publish(&storage, 30, b"thirty");
        }
        let storage = storage(dir.path());
        let reader = storage.open().unwrap();
        assert_eq!(reader.load_meta().unwrap().last_included, LogId::new(3, 30));
        assert_eq!(fs::read(reader.path().join("state")).unwrap(), b"thirty".to_vec());
    }
}

// =============================================================================
// SECTION 5: URI REGISTRY
// =============================================================================

mod registry {
    use super::*;

    #[test]
    fn local_log_by_uri_and_destroy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let uri = format!("local://{}?sync=false", path.display());
        let registry = StorageRegistry::with_defaults();

        let storage = registry.create_log_storage(&uri).unwrap();
        storage.init(&ConfigurationManager::new()).unwrap();
        storage.append_entries(&entries(1, 1..=3)).unwrap();
        drop(storage);

        let reopened = registry.create_log_storage(&uri).unwrap();
        reopened.init(&ConfigurationManager::new()).unwrap();
        assert_eq!(reopened.last_log_index(), 3);
        drop(reopened);

        registry.destroy_log_storage(&uri).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn merged_meta_destroy_drops_one_group() {
        let dir = tempdir().unwrap();
        let uri = format!("local-merged://{}", dir.path().join("meta").display());
        let registry = StorageRegistry::with_defaults();

        let meta = registry.create_meta_storage(&uri).unwrap();
        meta.init().unwrap();
        meta.set_term_and_votedfor(4, &peer("10.0.0.1:8000"), "orders_0").unwrap();
        meta.set_term_and_votedfor(6, &peer("10.0.0.2:8000"), "users_0").unwrap();
        drop(meta);

        registry.destroy_meta_storage(&uri, "orders_0").unwrap();
        let meta = registry.create_meta_storage(&uri).unwrap();
        meta.init().unwrap();
        assert_eq!(meta.get_term_and_votedfor("orders_0").unwrap(), (INITIAL_TERM, PeerId::default()));
        assert_eq!(meta.get_term_and_votedfor("users_0").unwrap(), (6, peer("10.0.0.2:8000")));
    }

    #[test]
    fn whitespace_in_uri_is_tolerated() {
        let registry = StorageRegistry::with_defaults();
        assert!(registry.create_log_storage(" memory :// ").is_ok());
    }
}

// =============================================================================
// SECTION 6: CONCURRENT ACCESS
// =============================================================================

mod concurrent_access {
    use super::*;

    #[test]
    fn readers_never_see_partial_entries() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(SegmentLogStorage::with_options(dir.path(), false, 4096));
        storage.init(&ConfigurationManager::new()).unwrap();

        let writer = {
            let storage = storage.clone();
            thread::spawn(move || {
                for start in (1..=1000u64).step_by(10) {
                    storage.append_entries(&entries(1, start..=start + 9)).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let storage = storage.clone();
                thread::spawn(move || {
                    while storage.last_log_index() < 1000 {
                        let last = storage.last_log_index();
                        if last == 0 {
                            continue;
                        }
                        for index in [1, last / 2 + 1, last] {
                            let entry = storage.get_entry(index).expect("entry within range");
                            assert_eq!(entry.data, format!("cmd{}", index).into_bytes());
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(storage.last_log_index(), 1000);
    }
}

// =============================================================================
// SECTION 7: EDGE CASES
// =============================================================================

mod edge_cases {
    use super::*;

    #[test]
    fn large_entry_spills_into_its_own_segment() {
        let dir = tempdir().unwrap();
        let storage = segment_storage(dir.path());
        let large = Arc::new(LogEntry::new(1, 1, vec![0x5A; 1024 * 1024]));
        storage.append_entry(large).unwrap();
        storage.append_entries(&entries(1, 2..=3)).unwrap();
        assert_eq!(storage.get_entry(1).unwrap().data.len(), 1024 * 1024);
        assert_eq!(closed_segment_names(dir.path()).len(), 1);
    }

    #[test]
    fn binary_payload_is_preserved() {
        let dir = tempdir().unwrap();
        let storage = segment_storage(dir.path());
        let data = vec![0x00, 0xFF, 0x7F, 0x80, 0xFE];
        storage.append_entry(Arc::new(LogEntry::new(1, 1, data.clone()))).unwrap();
        drop(storage);
        assert_eq!(segment_storage(dir.path()).get_entry(1).unwrap().data, data);
    }

    #[test]
    fn reset_to_high_base() {
        let storage = MemoryLogStorage::new();
        storage.reset(u64::MAX - 1).unwrap();
        storage.append_entry(Arc::new(LogEntry::new(1, u64::MAX - 1, b"cmd".to_vec()))).unwrap();
        assert_eq!(storage.last_log_index(), u64::MAX - 1);
    }
}
