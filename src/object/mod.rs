//! Object Module
//!
//! In-memory representation of stored objects.
//!
//! ## Responsibilities
//! - Identity, validity window and payload of one object
//! - Per-entity lock around every mutable field
//! - Logging mutations into the owning area's dirty set
//! - Conversion to and from stored records
//!
//! ## Ownership
//! Entities are owned by their area file; callers hold `ObjectInfo` clones.
//! An entity only keeps a weak reference to its area's dirty set, so dropping
//! the area never leaks through entities held elsewhere.

mod configuration;
mod dynamic;
pub mod location;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use flate2::Compression;
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::record::Record;

pub use configuration::ConfigurationObjectInfo;
pub use dynamic::DynamicObjectInfo;
pub use location::{HistoricalOffset, Location, ObjectLocation};

/// Mask selecting the per-area running number from an object id
pub const RUNNING_NUMBER_MASK: u64 = 0xFF_FFFF_FFFF;

/// How a dynamic object survives restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PersistenceMode {
    /// Stored and valid across restarts
    Persistent = 0,
    /// Stored, but invalidated when the area is opened again
    PersistentAndInvalidOnRestart = 1,
    /// Memory only
    Transient = 2,
}

impl PersistenceMode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PersistenceMode::Persistent),
            1 => Ok(PersistenceMode::PersistentAndInvalidOnRestart),
            2 => Ok(PersistenceMode::Transient),
            other => Err(StoreError::Format(format!(
                "Unknown persistence mode: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Dirty Set
// =============================================================================

/// Objects modified since the last flush, keyed by id
#[derive(Debug, Default)]
pub(crate) struct DirtyLog {
    objects: Mutex<HashMap<u64, ObjectInfo>>,
    /// Last time any configuration data set changed (unix millis)
    last_data_change: AtomicI64,
}

impl DirtyLog {
    pub fn mark(&self, object: ObjectInfo) {
        self.objects.lock().insert(object.id(), object);
    }

    pub fn remove(&self, id: u64) {
        self.objects.lock().remove(&id);
    }

    /// Take every dirty object, sorted by id
    pub fn drain(&self) -> Vec<ObjectInfo> {
        let mut objects: Vec<ObjectInfo> = self.objects.lock().drain().map(|(_, o)| o).collect();
        objects.sort_by_key(|o| o.id());
        objects
    }

    /// Put objects back after a failed flush (newer marks win)
    pub fn requeue(&self, objects: Vec<ObjectInfo>) {
        let mut dirty = self.objects.lock();
        for object in objects {
            dirty.entry(object.id()).or_insert(object);
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn note_data_change(&self) {
        self.last_data_change.store(now_millis(), Ordering::SeqCst);
    }

    pub fn last_data_change(&self) -> i64 {
        self.last_data_change.load(Ordering::SeqCst)
    }

    pub fn restore_last_data_change(&self, time: i64) {
        self.last_data_change.fetch_max(time, Ordering::SeqCst);
    }
}

// =============================================================================
// Base Entity
// =============================================================================

/// Immutable identity shared by both entity kinds
#[derive(Debug)]
pub(crate) struct ObjectCore {
    pub id: u64,
    pub type_id: u64,
    pub pid: String,
    pub pid_hash: i32,
    pub location: ObjectLocation,
    pub dirty: Weak<DirtyLog>,
}

impl ObjectCore {
    pub fn new(id: u64, type_id: u64, pid: String, location: ObjectLocation, dirty: Weak<DirtyLog>) -> Self {
        let pid_hash = crate::record::pid_hash(&pid);
        Self {
            id,
            type_id,
            pid,
            pid_hash,
            location,
            dirty,
        }
    }

    fn mark_dirty(&self, object: ObjectInfo) {
        if let Some(log) = self.dirty.upgrade() {
            log.mark(object);
        }
    }

    fn note_data_change(&self) {
        if let Some(log) = self.dirty.upgrade() {
            log.note_data_change();
        }
    }
}

/// Handle on an object of either kind
#[derive(Debug, Clone)]
pub enum ObjectInfo {
    Configuration(Arc<ConfigurationObjectInfo>),
    Dynamic(Arc<DynamicObjectInfo>),
}

impl ObjectInfo {
    fn core(&self) -> &ObjectCore {
        match self {
            ObjectInfo::Configuration(o) => &o.core,
            ObjectInfo::Dynamic(o) => &o.core,
        }
    }

    pub fn id(&self) -> u64 {
        self.core().id
    }

    pub fn type_id(&self) -> u64 {
        self.core().type_id
    }

    pub fn pid(&self) -> &str {
        &self.core().pid
    }

    pub fn pid_hash(&self) -> i32 {
        self.core().pid_hash
    }

    pub fn name(&self) -> String {
        match self {
            ObjectInfo::Configuration(o) => o.name(),
            ObjectInfo::Dynamic(o) => o.name(),
        }
    }

    pub fn location(&self) -> &ObjectLocation {
        &self.core().location
    }

    /// Simulation variant (always 0 for configuration objects)
    pub fn simulation_variant(&self) -> i16 {
        match self {
            ObjectInfo::Configuration(_) => 0,
            ObjectInfo::Dynamic(o) => o.simulation_variant(),
        }
    }

    pub fn config_data(&self, usage_id: u64) -> Option<Vec<u8>> {
        match self {
            ObjectInfo::Configuration(o) => o.config_data(usage_id),
            ObjectInfo::Dynamic(o) => o.config_data(usage_id),
        }
    }

    pub fn as_configuration(&self) -> Option<&Arc<ConfigurationObjectInfo>> {
        match self {
            ObjectInfo::Configuration(o) => Some(o),
            ObjectInfo::Dynamic(_) => None,
        }
    }

    pub fn as_dynamic(&self) -> Option<&Arc<DynamicObjectInfo>> {
        match self {
            ObjectInfo::Dynamic(o) => Some(o),
            ObjectInfo::Configuration(_) => None,
        }
    }

    /// True when both handles refer to the same entity
    pub fn ptr_eq(&self, other: &ObjectInfo) -> bool {
        match (self, other) {
            (ObjectInfo::Configuration(a), ObjectInfo::Configuration(b)) => Arc::ptr_eq(a, b),
            (ObjectInfo::Dynamic(a), ObjectInfo::Dynamic(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Snapshot the entity and encode it as a record
    pub(crate) fn to_record(&self, compression: Compression, serializer_version: u16) -> Result<Record> {
        match self {
            ObjectInfo::Configuration(o) => o.to_record(compression, serializer_version),
            ObjectInfo::Dynamic(o) => o.to_record(compression, serializer_version),
        }
    }

    /// Build an entity from a stored record
    pub(crate) fn from_record(
        record: Record,
        location: ObjectLocation,
        serializer_version: u16,
        dirty: Weak<DirtyLog>,
    ) -> Result<Self> {
        match record {
            Record::Configuration(r) => Ok(ObjectInfo::Configuration(Arc::new(
                ConfigurationObjectInfo::from_record(r, location, serializer_version, dirty)?,
            ))),
            Record::Dynamic(r) => Ok(ObjectInfo::Dynamic(Arc::new(
                DynamicObjectInfo::from_record(r, location, serializer_version, dirty)?,
            ))),
        }
    }
}

impl From<Arc<ConfigurationObjectInfo>> for ObjectInfo {
    fn from(object: Arc<ConfigurationObjectInfo>) -> Self {
        ObjectInfo::Configuration(object)
    }
}

impl From<Arc<DynamicObjectInfo>> for ObjectInfo {
    fn from(object: Arc<DynamicObjectInfo>) -> Self {
        ObjectInfo::Dynamic(object)
    }
}

/// Current wall-clock time in unix milliseconds
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
