//! Tests for FileManager
//!
//! These tests verify:
//! - Registering areas and rejecting duplicate area pids
//! - Id, pid, future and simulation lookups across areas
//! - Releasing invalid objects and reloading them on demand
//! - Fan-out of save, backup, restructure and close

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use areastore::{Config, FileManager, Location, ObjectInfo, PersistenceMode, RestructureMode, StoreError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config() -> Config {
    Config::builder()
        .sync_on_flush(false)
        .restructure_mode(RestructureMode::RemoveGaps)
        .build()
}

fn setup_temp_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().to_path_buf();
    (temp_dir, path)
}

fn area_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.cfg", name))
}

/// Manager with two empty areas, "area.one" and "area.two", at version 1
fn setup_manager(dir: &Path) -> FileManager {
    let manager = FileManager::new(test_config());
    manager
        .create_area_file(area_path(dir, "one"), "area.one", 1)
        .unwrap();
    manager
        .create_area_file(area_path(dir, "two"), "area.two", 1)
        .unwrap();
    manager
}

fn create_dynamic(manager: &FileManager, area_pid: &str, id: u64, pid: &str, variant: i16) -> ObjectInfo {
    manager
        .create_dynamic_object(area_pid, id, 7, pid, variant, "dyn", PersistenceMode::Persistent)
        .unwrap()
        .into()
}

// =============================================================================
// Area Registration Tests
// =============================================================================

#[test]
fn test_areas_are_registered_by_pid() {
    let (_temp, dir) = setup_temp_dir();
    let manager = setup_manager(&dir);

    assert_eq!(manager.area_pids(), vec!["area.one".to_string(), "area.two".to_string()]);
    assert_eq!(manager.area("area.two").unwrap().area_pid(), "area.two");
    assert!(manager.area("area.three").is_none());
}

#[test]
fn test_duplicate_area_pid_is_rejected() {
    let (_temp, dir) = setup_temp_dir();
    let manager = setup_manager(&dir);

    let result = manager.create_area_file(area_path(&dir, "other"), "area.one", 1);
    assert!(matches!(result, Err(StoreError::DuplicateArea(_))));
    assert!(!area_path(&dir, "other").exists());
}

#[test]
fn test_copy_of_open_area_is_rejected() {
    let (_temp, dir) = setup_temp_dir();
    let manager = setup_manager(&dir);
    create_dynamic(&manager, "area.one", 1, "dyn.a", 0);

    let reports = manager.backup_all(dir.join("backup")).unwrap();
    assert_eq!(reports.len(), 2);

    let copy = dir.join("backup").join("one.cfg");
    let result = manager.add_area_file(&copy, 1, &BTreeMap::new());
    assert!(matches!(result, Err(StoreError::DuplicateArea(_))));
}

#[test]
fn test_unknown_area_is_rejected() {
    let (_temp, dir) = setup_temp_dir();
    let manager = setup_manager(&dir);

    let result = manager.create_dynamic_object("area.nope", 1, 7, "", 0, "", PersistenceMode::Persistent);
    assert!(matches!(result, Err(StoreError::IllegalState(_))));
}

// =============================================================================
// Lookup Tests
// =============================================================================

#[test]
fn test_lookups_span_all_areas() {
    let (_temp, dir) = setup_temp_dir();
    let manager = setup_manager(&dir);
    create_dynamic(&manager, "area.one", 1, "dyn.a", 0);
    create_dynamic(&manager, "area.two", 2, "dyn.b", 0);

    assert_eq!(manager.get_object(1).unwrap().unwrap().pid(), "dyn.a");
    assert_eq!(manager.get_object(2).unwrap().unwrap().pid(), "dyn.b");
    assert!(manager.get_object(3).unwrap().is_none());
    assert_eq!(manager.get_active_object("dyn.b").unwrap().id(), 2);
}

#[test]
fn test_objects_created_on_the_area_can_be_registered() {
    let (_temp, dir) = setup_temp_dir();
    let manager = setup_manager(&dir);
    let area = manager.area("area.one").unwrap();
    let object: ObjectInfo = area
        .create_dynamic_object(1, 7, "dyn.direct", 0, "", PersistenceMode::Persistent)
        .unwrap()
        .into();

    // Found by id through the area scan, but not by pid until registered
    assert!(manager.get_object(1).unwrap().is_some());
    assert!(manager.get_active_object("dyn.direct").is_none());

    manager.register_object("area.one", &object).unwrap();
    assert!(manager.get_active_object("dyn.direct").unwrap().ptr_eq(&object));
}

#[test]
fn test_invalidated_object_leaves_active_lookup() {
    let (_temp, dir) = setup_temp_dir();
    let manager = setup_manager(&dir);
    let object = create_dynamic(&manager, "area.one", 1, "dyn.a", 0);

    manager.area("area.one").unwrap().set_invalid(&object).unwrap();

    assert!(manager.get_active_object("dyn.a").is_none());
    assert!(manager.get_object(1).unwrap().is_some());
}

#[test]
fn test_future_objects_by_pid() {
    let (_temp, dir) = setup_temp_dir();
    let manager = setup_manager(&dir);
    manager.area("area.one").unwrap().set_next_active_version(2).unwrap();

    manager
        .create_configuration_object("area.one", 10, 3, "cfg.a", "A")
        .unwrap();

    assert_eq!(manager.get_new_objects("cfg.a").len(), 1);
    assert!(manager.get_active_object("cfg.a").is_none());
}

#[test]
fn test_simulation_lookups_fall_back_to_active_objects() {
    let (_temp, dir) = setup_temp_dir();
    let manager = setup_manager(&dir);
    create_dynamic(&manager, "area.one", 1, "dyn.a", 0);
    create_dynamic(&manager, "area.two", 5, "dyn.a", 2);

    assert_eq!(manager.get_simulation_object("dyn.a", 2).unwrap().id(), 5);
    assert_eq!(manager.get_simulation_object("dyn.a", 3).unwrap().id(), 1);
    assert_eq!(manager.get_simulation_object("dyn.a", 0).unwrap().id(), 1);
    assert_eq!(manager.get_simulation_objects(2).len(), 1);
    assert_eq!(manager.get_active_object("dyn.a").unwrap().id(), 1);

    assert_eq!(manager.delete_simulation_objects(2).unwrap(), 1);
    assert!(manager.get_simulation_objects(2).is_empty());
    assert_eq!(manager.get_simulation_object("dyn.a", 2).unwrap().id(), 1);
    assert!(manager.get_object(5).unwrap().is_none());
}

// =============================================================================
// Maintenance Tests
// =============================================================================

#[test]
fn test_released_objects_are_reloaded_on_demand() {
    let (_temp, dir) = setup_temp_dir();
    let manager = setup_manager(&dir);
    let object = create_dynamic(&manager, "area.one", 1, "dyn.a", 0);
    create_dynamic(&manager, "area.two", 2, "dyn.b", 0);
    manager.area("area.one").unwrap().set_invalid(&object).unwrap();
    manager.save_all().unwrap();

    assert_eq!(manager.release_invalid_objects(), 1);
    assert_eq!(manager.release_invalid_objects(), 0);

    let reports = manager.restructure_all().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports.iter().map(|r| r.records_historized).sum::<usize>(), 1);
    assert!(matches!(object.location().get(), Location::Historical(_)));

    let reloaded = manager.get_object(1).unwrap().unwrap();
    assert_eq!(reloaded.id(), 1);
    assert!(!reloaded.as_dynamic().unwrap().is_valid());
    assert_eq!(manager.get_active_object("dyn.b").unwrap().id(), 2);
}

#[test]
fn test_close_all_and_reopen() {
    let (_temp, dir) = setup_temp_dir();
    {
        let manager = setup_manager(&dir);
        manager.area("area.one").unwrap().set_next_active_version(2).unwrap();
        manager
            .create_configuration_object("area.one", 10, 3, "cfg.a", "A")
            .unwrap();
        create_dynamic(&manager, "area.two", 2, "dyn.b", 0);
        manager.close_all().unwrap();

        assert!(manager.area_pids().is_empty());
        assert!(manager.get_active_object("dyn.b").is_none());
    }

    let manager = FileManager::new(test_config());
    let times = BTreeMap::from([(1, 1_000), (2, 2_000)]);
    manager.add_area_file(area_path(&dir, "one"), 2, &times).unwrap();
    manager.add_area_file(area_path(&dir, "two"), 1, &BTreeMap::new()).unwrap();

    assert_eq!(manager.get_active_object("cfg.a").unwrap().id(), 10);
    assert!(manager.get_new_objects("cfg.a").is_empty());
    assert_eq!(manager.get_active_object("dyn.b").unwrap().id(), 2);

    let again = manager.add_area_file(area_path(&dir, "two"), 1, &BTreeMap::new());
    assert!(matches!(again, Err(StoreError::AreaLocked(_))));
}
