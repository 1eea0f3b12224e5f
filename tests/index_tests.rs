//! Tests for the sorted indices, validity evaluation and deletion side files
//!
//! These tests verify:
//! - Signed index positions for NGA and NGDyn offsets
//! - Binary search and merging of the ID and PID-hash indices
//! - Activation time lookup and interval matching
//! - Side index checksums and two-phase marking

use std::collections::{BTreeMap, HashSet};
use std::fs;

use areastore::area::deletion::{checksum, side_index_paths, DeletionIndex};
use areastore::area::index::{
    decode_id_index, decode_pid_index, encode_id_index, encode_pid_index, merge_id_index, merge_pid_index,
    pid_hash_run, search_id, IdIndexEntry, PidIndexEntry,
};
use areastore::area::validity::{is_valid_in_range, ActivationTimes, INFINITE};
use areastore::area::{IntervalSemantics, NgaBlockEntry, TimeAuthority};
use areastore::{HistoricalOffset, StoreError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn id_entry(id: u64, offset: HistoricalOffset) -> IdIndexEntry {
    IdIndexEntry { id, offset }
}

fn pid_entry(pid_hash: i32, offset: HistoricalOffset) -> PidIndexEntry {
    PidIndexEntry { pid_hash, offset }
}

fn ids(set: &[u64]) -> HashSet<u64> {
    set.iter().copied().collect()
}

// =============================================================================
// Index Position Tests
// =============================================================================

#[test]
fn test_index_position_sign_selects_region() {
    assert_eq!(HistoricalOffset::Config(0).to_index_position(), 0);
    assert_eq!(HistoricalOffset::Config(77).to_index_position(), 77);
    assert_eq!(HistoricalOffset::Dynamic(0).to_index_position(), -1);
    assert_eq!(HistoricalOffset::Dynamic(77).to_index_position(), -78);

    for offset in [HistoricalOffset::Config(5), HistoricalOffset::Dynamic(0), HistoricalOffset::Dynamic(9)] {
        assert_eq!(HistoricalOffset::from_index_position(offset.to_index_position()), offset);
    }
}

// =============================================================================
// Search Tests
// =============================================================================

#[test]
fn test_search_id() {
    let entries = vec![
        id_entry(3, HistoricalOffset::Config(0)),
        id_entry(8, HistoricalOffset::Dynamic(40)),
        id_entry(21, HistoricalOffset::Config(90)),
    ];
    let decoded = decode_id_index(&encode_id_index(&entries)).unwrap();

    assert_eq!(decoded, entries);
    assert_eq!(search_id(&decoded, 8), Some(HistoricalOffset::Dynamic(40)));
    assert_eq!(search_id(&decoded, 21), Some(HistoricalOffset::Config(90)));
    assert_eq!(search_id(&decoded, 4), None);
    assert_eq!(search_id(&decoded, 100), None);
}

#[test]
fn test_pid_hash_run_returns_every_collision() {
    let entries = vec![
        pid_entry(-50, HistoricalOffset::Config(0)),
        pid_entry(12, HistoricalOffset::Config(10)),
        pid_entry(12, HistoricalOffset::Dynamic(0)),
        pid_entry(12, HistoricalOffset::Dynamic(30)),
        pid_entry(99, HistoricalOffset::Config(20)),
    ];
    let decoded = decode_pid_index(&encode_pid_index(&entries)).unwrap();

    assert_eq!(decoded, entries);
    assert_eq!(pid_hash_run(&decoded, 12).len(), 3);
    assert_eq!(pid_hash_run(&decoded, -50).len(), 1);
    assert!(pid_hash_run(&decoded, 13).is_empty());
}

#[test]
fn test_index_with_partial_entry_is_rejected() {
    let mut bytes = encode_id_index(&[id_entry(1, HistoricalOffset::Config(0))]);
    bytes.pop();

    assert!(matches!(decode_id_index(&bytes), Err(StoreError::Format(_))));
}

// =============================================================================
// Merge Tests
// =============================================================================

#[test]
fn test_merge_id_index_newer_wins() {
    let older = vec![
        id_entry(1, HistoricalOffset::Config(0)),
        id_entry(5, HistoricalOffset::Config(10)),
    ];
    let newer = vec![
        id_entry(3, HistoricalOffset::Dynamic(0)),
        id_entry(5, HistoricalOffset::Dynamic(20)),
        id_entry(9, HistoricalOffset::Dynamic(40)),
    ];

    let merged = merge_id_index(older, newer);
    let keys: Vec<u64> = merged.iter().map(|e| e.id).collect();
    assert_eq!(keys, vec![1, 3, 5, 9]);
    assert_eq!(search_id(&merged, 5), Some(HistoricalOffset::Dynamic(20)));
}

#[test]
fn test_merge_pid_index_keeps_duplicates_sorted() {
    let older = vec![pid_entry(1, HistoricalOffset::Config(0)), pid_entry(7, HistoricalOffset::Config(8))];
    let newer = vec![pid_entry(7, HistoricalOffset::Dynamic(0)), pid_entry(8, HistoricalOffset::Dynamic(5))];

    let merged = merge_pid_index(older, newer);
    let keys: Vec<i32> = merged.iter().map(|e| e.pid_hash).collect();
    assert_eq!(keys, vec![1, 7, 7, 8]);
    assert_eq!(merged[1].offset, HistoricalOffset::Config(8));
}

// =============================================================================
// Validity Tests
// =============================================================================

#[test]
fn test_activation_time_lookup() {
    let local = BTreeMap::from([(1, 100), (2, 200)]);
    let blocks = [NgaBlockEntry {
        offset: None,
        version: 1,
        activation_time: 90,
    }];
    let times = ActivationTimes::new(&local, &blocks);

    assert_eq!(times.time_of(1, TimeAuthority::Local, 2), 100);
    assert_eq!(times.time_of(1, TimeAuthority::Authority, 2), 90);
    // No authority time recorded yet for version 2
    assert_eq!(times.time_of(2, TimeAuthority::Authority, 2), 200);
    assert_eq!(times.time_of(0, TimeAuthority::Local, 2), INFINITE);
    assert_eq!(times.time_of(3, TimeAuthority::Local, 2), INFINITE);
    assert_eq!(times.time_of(2, TimeAuthority::Local, 1), INFINITE);
}

#[test]
fn test_local_or_next() {
    let local = BTreeMap::from([(2, 200), (5, 500)]);
    let times = ActivationTimes::new(&local, &[]);

    assert_eq!(times.local_or_next(1), Some(200));
    assert_eq!(times.local_or_next(3), Some(500));
    assert_eq!(times.local_or_next(6), None);
}

#[test]
fn test_interval_semantics() {
    use IntervalSemantics::{FullCoverage, Overlap};

    // [100, 200)
    assert!(is_valid_in_range(100, 200, 150, 150, Overlap));
    assert!(is_valid_in_range(100, 200, 50, 100, Overlap));
    assert!(!is_valid_in_range(100, 200, 201, 300, Overlap));
    assert!(is_valid_in_range(100, 200, 120, 180, FullCoverage));
    assert!(!is_valid_in_range(100, 200, 50, 180, FullCoverage));

    // Still valid
    assert!(is_valid_in_range(100, 0, 10_000, 20_000, Overlap));
    assert!(is_valid_in_range(100, 0, 150, i64::MAX, FullCoverage));
}

// =============================================================================
// Deletion Index Tests
// =============================================================================

#[test]
fn test_side_index_paths() {
    let (locked, pending) = side_index_paths(std::path::Path::new("/data/area.main.cfg"));

    assert_eq!(locked, std::path::PathBuf::from("/data/.area.main.0.index"));
    assert_eq!(pending, std::path::PathBuf::from("/data/.area.main.1.index"));
}

#[test]
fn test_checksum_seed_and_base() {
    assert_eq!(checksum(&[]), 17);
    assert_eq!(checksum(&[5]), 17 * 31 + 5);
    assert_eq!(checksum(&[5, 6]), (17 * 31 + 5) * 31 + 6);
}

#[test]
fn test_two_consecutive_marks_make_pending() {
    let temp = TempDir::new().unwrap();
    let area = temp.path().join("area.cfg");
    let mut index = DeletionIndex::load(&area);

    let first = index.mark(&ids(&[1, 2, 3]));
    assert_eq!(first.locked, 3);
    assert_eq!(first.pending, 0);

    // 2 is referenced again, 4 is new
    let second = index.mark(&ids(&[1, 3, 4]));
    assert_eq!(second.pending, 2);
    assert!(index.is_pending(1));
    assert!(index.is_pending(3));
    assert!(!index.is_pending(2));
    assert!(!index.is_locked(2));
    assert!(index.is_locked(4));
}

#[test]
fn test_marks_survive_reload() {
    let temp = TempDir::new().unwrap();
    let area = temp.path().join("area.cfg");
    {
        let mut index = DeletionIndex::load(&area);
        index.mark(&ids(&[10, 20]));
        index.save().unwrap();
    }

    let mut index = DeletionIndex::load(&area);
    assert!(index.is_locked(10));
    index.mark(&ids(&[10]));
    assert!(index.is_pending(10));
    assert!(!index.is_locked(20));
}

#[test]
fn test_damaged_side_index_is_ignored() {
    let temp = TempDir::new().unwrap();
    let area = temp.path().join("area.cfg");
    {
        let mut index = DeletionIndex::load(&area);
        index.mark(&ids(&[10, 20]));
        index.save().unwrap();
    }

    let (locked_path, _) = side_index_paths(&area);
    let mut bytes = fs::read(&locked_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&locked_path, &bytes).unwrap();

    let index = DeletionIndex::load(&area);
    assert!(index.locked().is_empty());
}

#[test]
fn test_forget_removes_ids_from_both_sets() {
    let temp = TempDir::new().unwrap();
    let mut index = DeletionIndex::load(&temp.path().join("area.cfg"));
    index.mark(&ids(&[1, 2]));
    index.mark(&ids(&[1, 2, 3]));

    index.forget(&ids(&[1, 3]));
    assert_eq!(index.pending(), &ids(&[2]));
    assert!(index.locked().is_empty());
}
