//! Integration tests for areastore
//!
//! These tests verify end-to-end scenarios:
//! - Configuration objects waiting for the next active version
//! - Transient objects resolved purely from memory
//! - A full area lifecycle across versions, restructures and backups

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use areastore::{
    Config, ConfigAreaFile, FileManager, IntervalSemantics, Location, ObjectInfo, PersistenceMode,
    RestructureMode, StoreError, TimeAuthority,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config() -> Config {
    Config::builder().sync_on_flush(false).build()
}

fn setup_temp_area() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("area.pid1.cfg");
    (temp_dir, path)
}

fn ids(objects: &[ObjectInfo]) -> Vec<u64> {
    let mut ids: Vec<u64> = objects.iter().map(|o| o.id()).collect();
    ids.sort_unstable();
    ids
}

// =============================================================================
// Scenario Tests
// =============================================================================

#[test]
fn test_configuration_object_waits_for_next_version() {
    let (_temp, path) = setup_temp_area();
    {
        let area = ConfigAreaFile::create_with(test_config(), &path, "pid:1", 0, 1).unwrap();

        let early = area.create_configuration_object(100, 1, "cfg.hundred", "");
        assert!(matches!(early, Err(StoreError::IllegalState(_))));

        area.set_next_active_version(1).unwrap();
        let object = area.create_configuration_object(100, 1, "cfg.hundred", "").unwrap();
        assert_eq!(object.first_valid_version(), 1);

        assert_eq!(ids(&area.get_new_objects()), vec![100]);
        assert!(area.get_current_objects().is_empty());
        area.close().unwrap();
    }

    let area = ConfigAreaFile::open_with(test_config(), &path, 1, &BTreeMap::from([(1, 1_000)])).unwrap();
    assert_eq!(area.active_version(), 1);
    assert_eq!(ids(&area.get_current_objects()), vec![100]);
    assert!(area.get_new_objects().is_empty());
    assert_eq!(area.get_active_object("cfg.hundred").unwrap().id(), 100);
}

#[test]
fn test_transient_object_resolved_from_memory() {
    let (_temp, path) = setup_temp_area();
    let area = ConfigAreaFile::create_with(test_config(), &path, "pid:1", 1, 1).unwrap();
    let len_before = area.file_len();

    let object: ObjectInfo = area
        .create_dynamic_object(200, 9, "dyn.transient", 0, "", PersistenceMode::Transient)
        .unwrap()
        .into();
    area.set_invalid(&object).unwrap();

    assert!(area.get_current_objects().is_empty());
    let old = area.get_old_object(200).unwrap().unwrap();
    assert!(old.ptr_eq(&object));
    assert_eq!(old.location().get(), Location::Transient);

    assert_eq!(area.flush().unwrap(), 0);
    assert_eq!(area.file_len(), len_before);
}

#[test]
fn test_area_lifecycle() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("area.life.cfg");
    let config = Config::builder()
        .sync_on_flush(false)
        .restructure_mode(RestructureMode::RemoveGaps)
        .build();

    // Version 1: one configuration object, one dynamic object
    let started;
    {
        let area = ConfigAreaFile::create_with(config.clone(), &path, "area.life", 1, 1).unwrap();
        area.set_next_active_version(2).unwrap();
        let cfg = area.create_configuration_object(10, 1, "cfg.a", "A").unwrap();
        cfg.set_config_data(2, b"first".to_vec());
        let dynamic = area
            .create_dynamic_object(20, 2, "dyn.a", 0, "", PersistenceMode::Persistent)
            .unwrap();
        started = dynamic.first_valid_time();
        area.close().unwrap();
    }

    // Version 2: cfg.a is current; replace it by cfg.b for version 3
    {
        let times = BTreeMap::from([(1, 1_000), (2, 2_000)]);
        let area = ConfigAreaFile::open_with(config.clone(), &path, 2, &times).unwrap();
        let cfg = area.get_active_object("cfg.a").unwrap();
        assert_eq!(cfg.config_data(2), Some(b"first".to_vec()));

        area.set_next_active_version(3).unwrap();
        area.invalidate(&cfg).unwrap();
        area.create_configuration_object(11, 1, "cfg.b", "B").unwrap();

        let dynamic = area.get_object(20).unwrap();
        area.set_invalid_at(&dynamic, started + 500).unwrap();
        area.close().unwrap();
    }

    // Version 3: move the history out of the mixed set
    let times = BTreeMap::from([(1, 1_000), (2, 2_000), (3, 3_000)]);
    {
        let area = ConfigAreaFile::open_with(config.clone(), &path, 3, &times).unwrap();
        assert_eq!(ids(&area.get_current_objects()), vec![11]);

        let report = area.restructure(RestructureMode::RemoveGaps).unwrap();
        assert_eq!(report.records_historized, 2);
        assert!(area.get_invalid_objects().is_empty());

        let backup = area.backup_to(temp.path().join("backup")).unwrap();
        assert_eq!(backup.crc32, crc32fast::hash(&fs::read(&backup.path).unwrap()));
        area.close().unwrap();
    }

    // The backup opens like the original
    let manager = FileManager::new(config);
    manager
        .add_area_file(temp.path().join("backup").join("area.life.cfg"), 3, &times)
        .unwrap();

    assert_eq!(manager.get_active_object("cfg.b").unwrap().id(), 11);
    assert!(manager.get_active_object("cfg.a").is_none());

    let old = manager.get_object(10).unwrap().unwrap();
    assert_eq!(old.as_configuration().unwrap().versions(), (2, 3));
    assert_eq!(old.config_data(2), Some(b"first".to_vec()));

    let area = manager.area("area.life").unwrap();
    let at_version_2 = area
        .query(2_500, 2_500, TimeAuthority::Local, IntervalSemantics::Overlap, &[1])
        .unwrap();
    assert_eq!(ids(&at_version_2), vec![10]);

    let dynamic_then = area
        .query(started + 100, started + 100, TimeAuthority::Local, IntervalSemantics::Overlap, &[2])
        .unwrap();
    assert_eq!(ids(&dynamic_then), vec![20]);
    let dynamic_after = area
        .query(started + 600, started + 600, TimeAuthority::Local, IntervalSemantics::Overlap, &[2])
        .unwrap();
    assert!(dynamic_after.is_empty());
}
