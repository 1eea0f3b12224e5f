//! File Manager
//!
//! Aggregates every open area file behind one lookup surface.
//!
//! ## Responsibilities
//! - Open / create area files and reject duplicate area pids
//! - Id, pid, simulation and future-object lookups across all areas
//! - Downgrading invalid objects to stored location references
//! - Fan-out of flush, close, backup and restructure
//!
//! Fan-out operations visit every area even if some fail and surface the
//! last error.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::area::{BackupReport, ConfigAreaFile, RestructureReport};
use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::object::{
    ConfigurationObjectInfo, DynamicObjectInfo, ObjectInfo, ObjectLocation, PersistenceMode,
};

/// Where the manager finds an object by id
#[derive(Debug, Clone)]
enum IdEntry {
    /// Entity held in memory
    Resident { area_pid: String, object: ObjectInfo },
    /// Only a location; the entity is reloaded on demand
    Stored {
        area_pid: String,
        location: ObjectLocation,
    },
}

impl IdEntry {
    fn area_pid(&self) -> &str {
        match self {
            IdEntry::Resident { area_pid, .. } | IdEntry::Stored { area_pid, .. } => area_pid,
        }
    }
}

/// Lookup surface over all open area files
///
/// ## Concurrency:
/// - Every map has its own RwLock, held for one map operation
/// - No manager lock is held while an area does I/O
#[derive(Debug, Default)]
pub struct FileManager {
    config: Config,

    /// Open areas by area pid
    areas: RwLock<HashMap<String, Arc<ConfigAreaFile>>>,

    ids: RwLock<HashMap<u64, IdEntry>>,
    active_by_pid: RwLock<HashMap<String, ObjectInfo>>,
    simulation_by_pid: RwLock<HashMap<(String, i16), ObjectInfo>>,
    future_by_pid: RwLock<HashMap<String, Vec<ObjectInfo>>>,
    simulation_objects: RwLock<HashMap<i16, Vec<ObjectInfo>>>,
}

impl FileManager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    // =========================================================================
    // Areas
    // =========================================================================

    /// Open an area file and publish its objects
    pub fn add_area_file(
        &self,
        path: impl AsRef<Path>,
        desired_active_version: u16,
        local_activation_times: &BTreeMap<u16, i64>,
    ) -> Result<Arc<ConfigAreaFile>> {
        let area = ConfigAreaFile::open_with(
            self.config.clone(),
            path,
            desired_active_version,
            local_activation_times,
        )?;
        self.publish(area)
    }

    /// Create a new area file and register it
    pub fn create_area_file(
        &self,
        path: impl AsRef<Path>,
        area_pid: &str,
        active_version: u16,
    ) -> Result<Arc<ConfigAreaFile>> {
        if self.areas.read().contains_key(area_pid) {
            return Err(StoreError::DuplicateArea(area_pid.to_string()));
        }
        let area = ConfigAreaFile::create_with(
            self.config.clone(),
            path,
            area_pid,
            active_version,
            self.config.serializer_version,
        )?;
        self.publish(area)
    }

    fn publish(&self, area: ConfigAreaFile) -> Result<Arc<ConfigAreaFile>> {
        let area_pid = area.area_pid().to_string();
        let area = Arc::new(area);
        {
            let mut areas = self.areas.write();
            if areas.contains_key(&area_pid) {
                return Err(StoreError::DuplicateArea(area_pid));
            }
            areas.insert(area_pid.clone(), Arc::clone(&area));
        }

        let objects = area
            .get_current_objects()
            .into_iter()
            .chain(area.get_new_objects())
            .chain(area.get_invalid_objects());
        let mut count = 0;
        for object in objects {
            self.index_object(&area, &object);
            count += 1;
        }

        info!(area = %area_pid, objects = count, "Registered area file");
        Ok(area)
    }

    pub fn area(&self, area_pid: &str) -> Option<Arc<ConfigAreaFile>> {
        self.areas.read().get(area_pid).cloned()
    }

    /// Pids of every open area, sorted
    pub fn area_pids(&self) -> Vec<String> {
        let mut pids: Vec<String> = self.areas.read().keys().cloned().collect();
        pids.sort();
        pids
    }

    fn require_area(&self, area_pid: &str) -> Result<Arc<ConfigAreaFile>> {
        self.area(area_pid)
            .ok_or_else(|| StoreError::IllegalState(format!("Unknown area {}", area_pid)))
    }

    fn all_areas(&self) -> Vec<Arc<ConfigAreaFile>> {
        let mut areas: Vec<Arc<ConfigAreaFile>> = self.areas.read().values().cloned().collect();
        areas.sort_by(|a, b| a.area_pid().cmp(b.area_pid()));
        areas
    }

    // =========================================================================
    // Object Creation
    // =========================================================================

    pub fn create_configuration_object(
        &self,
        area_pid: &str,
        id: u64,
        type_id: u64,
        pid: &str,
        name: &str,
    ) -> Result<Arc<ConfigurationObjectInfo>> {
        let area = self.require_area(area_pid)?;
        let object = area.create_configuration_object(id, type_id, pid, name)?;
        self.index_object(&area, &ObjectInfo::Configuration(Arc::clone(&object)));
        Ok(object)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_dynamic_object(
        &self,
        area_pid: &str,
        id: u64,
        type_id: u64,
        pid: &str,
        simulation_variant: i16,
        name: &str,
        persistence: PersistenceMode,
    ) -> Result<Arc<DynamicObjectInfo>> {
        let area = self.require_area(area_pid)?;
        let object = area.create_dynamic_object(id, type_id, pid, simulation_variant, name, persistence)?;
        self.index_object(&area, &ObjectInfo::Dynamic(Arc::clone(&object)));
        Ok(object)
    }

    /// Republish an object created directly on one of the managed areas
    pub fn register_object(&self, area_pid: &str, object: &ObjectInfo) -> Result<()> {
        let area = self.require_area(area_pid)?;
        self.index_object(&area, object);
        Ok(())
    }

    fn index_object(&self, area: &ConfigAreaFile, object: &ObjectInfo) {
        self.ids.write().insert(
            object.id(),
            IdEntry::Resident {
                area_pid: area.area_pid().to_string(),
                object: object.clone(),
            },
        );

        let pid = object.pid().to_string();
        let variant = object.simulation_variant();
        if variant > 0 {
            if !pid.is_empty() {
                self.simulation_by_pid.write().insert((pid, variant), object.clone());
            }
            self.simulation_objects
                .write()
                .entry(variant)
                .or_default()
                .push(object.clone());
            return;
        }

        if pid.is_empty() || !is_active(area, object) {
            return;
        }
        match object {
            ObjectInfo::Configuration(c) if c.first_valid_version() > area.active_version() => {
                self.future_by_pid.write().entry(pid).or_default().push(object.clone());
            }
            _ => {
                self.active_by_pid.write().insert(pid, object.clone());
            }
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Object by id in any area, reloading stored references on demand
    pub fn get_object(&self, id: u64) -> Result<Option<ObjectInfo>> {
        let entry = self.ids.read().get(&id).cloned();
        match entry {
            Some(IdEntry::Resident { object, .. }) => return Ok(Some(object)),
            Some(IdEntry::Stored { area_pid, location }) => {
                if let Some(area) = self.area(&area_pid) {
                    if let Some(object) = area.load_object(&location)? {
                        return Ok(Some(object));
                    }
                }
            }
            None => {}
        }

        let areas = self.all_areas();
        for area in &areas {
            if let Some(object) = area.get_object(id) {
                return Ok(Some(object));
            }
        }
        for area in &areas {
            if let Some(object) = area.get_old_object(id)? {
                return Ok(Some(object));
            }
        }
        Ok(None)
    }

    /// Currently valid object with this pid
    ///
    /// Entries that became invalid since they were published are dropped.
    pub fn get_active_object(&self, pid: &str) -> Option<ObjectInfo> {
        let object = self.active_by_pid.read().get(pid).cloned()?;
        let area = self.area_of(object.id())?;
        if is_active(&area, &object) {
            return Some(object);
        }

        let mut active = self.active_by_pid.write();
        if active.get(pid).map_or(false, |o| o.ptr_eq(&object)) {
            active.remove(pid);
        }
        None
    }

    /// Object with this pid as seen by simulation `simulation_variant`
    pub fn get_simulation_object(&self, pid: &str, simulation_variant: i16) -> Option<ObjectInfo> {
        if simulation_variant > 0 {
            let key = (pid.to_string(), simulation_variant);
            let object = self.simulation_by_pid.read().get(&key).cloned();
            if let Some(object) = object {
                if object.as_dynamic().map_or(true, |d| d.is_valid()) {
                    return Some(object);
                }
            }
        }
        self.get_active_object(pid)
    }

    /// Objects with this pid that become valid in a future version
    pub fn get_new_objects(&self, pid: &str) -> Vec<ObjectInfo> {
        self.future_by_pid.read().get(pid).cloned().unwrap_or_default()
    }

    pub fn get_simulation_objects(&self, simulation_variant: i16) -> Vec<ObjectInfo> {
        self.simulation_objects
            .read()
            .get(&simulation_variant)
            .cloned()
            .unwrap_or_default()
    }

    fn area_of(&self, id: u64) -> Option<Arc<ConfigAreaFile>> {
        let area_pid = self.ids.read().get(&id).map(|e| e.area_pid().to_string())?;
        self.area(&area_pid)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Replace invalid resident entries by their location references
    ///
    /// Returns the number of entries released. `get_object` reloads them.
    pub fn release_invalid_objects(&self) -> usize {
        let areas = self.areas.read().clone();
        let mut released = Vec::new();
        {
            let mut ids = self.ids.write();
            for entry in ids.values_mut() {
                let replacement = match entry {
                    IdEntry::Resident { area_pid, object } => match areas.get(area_pid.as_str()) {
                        Some(area) if is_invalid(area, object) => {
                            released.push(object.clone());
                            Some(IdEntry::Stored {
                                area_pid: area_pid.clone(),
                                location: object.location().clone(),
                            })
                        }
                        _ => None,
                    },
                    IdEntry::Stored { .. } => None,
                };
                if let Some(replacement) = replacement {
                    *entry = replacement;
                }
            }
        }

        if !released.is_empty() {
            let mut active = self.active_by_pid.write();
            for object in &released {
                if active.get(object.pid()).map_or(false, |o| o.ptr_eq(object)) {
                    active.remove(object.pid());
                }
            }
        }
        debug!(released = released.len(), "Released invalid objects");
        released.len()
    }

    /// Delete every object of simulation `simulation_variant` in all areas
    pub fn delete_simulation_objects(&self, simulation_variant: i16) -> Result<usize> {
        let mut deleted = 0;
        let mut last_error = None;
        for area in self.all_areas() {
            match area.delete_simulation_objects(simulation_variant) {
                Ok(count) => deleted += count,
                Err(e) => {
                    warn!(area = %area.area_pid(), error = %e, "Failed to delete simulation objects");
                    last_error = Some(e);
                }
            }
        }

        let objects = self
            .simulation_objects
            .write()
            .remove(&simulation_variant)
            .unwrap_or_default();
        {
            let mut ids = self.ids.write();
            for object in &objects {
                ids.remove(&object.id());
            }
        }
        self.simulation_by_pid
            .write()
            .retain(|(_, variant), _| *variant != simulation_variant);

        match last_error {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }

    /// Flush every area
    pub fn save_all(&self) -> Result<()> {
        fan_out(self.all_areas(), "flush", |area| area.flush().map(|_| ()))
    }

    /// Close every area and forget all objects
    pub fn close_all(&self) -> Result<()> {
        let areas: Vec<Arc<ConfigAreaFile>> = self.areas.write().drain().map(|(_, a)| a).collect();
        let result = fan_out(areas, "close", |area| area.close());

        self.ids.write().clear();
        self.active_by_pid.write().clear();
        self.simulation_by_pid.write().clear();
        self.future_by_pid.write().clear();
        self.simulation_objects.write().clear();
        result
    }

    /// Back up every area into `target_dir`
    pub fn backup_all(&self, target_dir: impl AsRef<Path>) -> Result<Vec<BackupReport>> {
        let target_dir = target_dir.as_ref();
        let mut reports = Vec::new();
        fan_out(self.all_areas(), "backup", |area| {
            reports.push(area.backup_to(target_dir)?);
            Ok(())
        })?;
        Ok(reports)
    }

    /// Restructure every area with the configured mode
    pub fn restructure_all(&self) -> Result<Vec<RestructureReport>> {
        let mode = self.config.restructure_mode;
        let mut reports = Vec::new();
        fan_out(self.all_areas(), "restructure", |area| {
            reports.push(area.restructure(mode)?);
            Ok(())
        })?;
        Ok(reports)
    }
}

/// Run `op` on every area, logging failures and returning the last one
fn fan_out<F>(areas: Vec<Arc<ConfigAreaFile>>, what: &str, mut op: F) -> Result<()>
where
    F: FnMut(&ConfigAreaFile) -> Result<()>,
{
    let mut last_error = None;
    for area in &areas {
        if let Err(e) = op(area) {
            warn!(area = %area.area_pid(), operation = what, error = %e, "Area operation failed");
            last_error = Some(e);
        }
    }
    match last_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Valid now or from the next version on
fn is_active(area: &ConfigAreaFile, object: &ObjectInfo) -> bool {
    !is_invalid(area, object)
}

fn is_invalid(area: &ConfigAreaFile, object: &ObjectInfo) -> bool {
    match object {
        ObjectInfo::Configuration(c) => {
            let invalid = c.first_invalid_version();
            invalid != 0 && invalid <= area.active_version()
        }
        ObjectInfo::Dynamic(d) => !d.is_valid(),
    }
}
