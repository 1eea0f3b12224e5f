//! Configuration-object entity

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use flate2::Compression;
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::record::payload::ConfigurationPayload;
use crate::record::{compress_payload, decompress_payload, ConfigurationRecord, Record};

use super::{DirtyLog, ObjectCore, ObjectInfo, ObjectLocation};

/// Mutable part of a configuration object, guarded by the entity lock
#[derive(Debug, Clone, Default)]
struct ConfigurationState {
    name: String,
    first_valid_version: u16,
    first_invalid_version: u16,
    data: BTreeMap<u64, Vec<u8>>,
    sets: BTreeMap<String, Vec<u64>>,
}

/// A configuration object: valid in `[first_valid_version, first_invalid_version)`
#[derive(Debug)]
pub struct ConfigurationObjectInfo {
    pub(super) core: ObjectCore,
    state: Mutex<ConfigurationState>,
}

impl ConfigurationObjectInfo {
    pub(crate) fn new(
        id: u64,
        type_id: u64,
        pid: String,
        name: String,
        first_valid_version: u16,
        location: ObjectLocation,
        dirty: Weak<DirtyLog>,
    ) -> Self {
        Self {
            core: ObjectCore::new(id, type_id, pid, location, dirty),
            state: Mutex::new(ConfigurationState {
                name,
                first_valid_version,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn from_record(
        record: ConfigurationRecord,
        location: ObjectLocation,
        serializer_version: u16,
        dirty: Weak<DirtyLog>,
    ) -> Result<Self> {
        let raw = decompress_payload(&record.payload)?;
        let payload = ConfigurationPayload::deserialize(&raw, serializer_version)?;
        Ok(Self {
            core: ObjectCore::new(record.id, record.type_id, payload.pid, location, dirty),
            state: Mutex::new(ConfigurationState {
                name: payload.name,
                first_valid_version: record.first_valid_version,
                first_invalid_version: record.first_invalid_version,
                data: payload.data,
                sets: payload.sets,
            }),
        })
    }

    pub(crate) fn to_record(&self, compression: Compression, serializer_version: u16) -> Result<Record> {
        // Snapshot under the entity lock, serialize outside of it
        let state = self.state.lock().clone();
        let payload = ConfigurationPayload {
            pid: self.core.pid.clone(),
            name: state.name,
            data: state.data,
            sets: state.sets,
        };
        let raw = payload.serialize(serializer_version)?;
        Ok(Record::Configuration(ConfigurationRecord {
            id: self.core.id,
            pid_hash: self.core.pid_hash,
            type_id: self.core.type_id,
            first_valid_version: state.first_valid_version,
            first_invalid_version: state.first_invalid_version,
            payload: compress_payload(&raw, compression)?,
        }))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn type_id(&self) -> u64 {
        self.core.type_id
    }

    pub fn pid(&self) -> &str {
        &self.core.pid
    }

    pub fn location(&self) -> &ObjectLocation {
        &self.core.location
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn first_valid_version(&self) -> u16 {
        self.state.lock().first_valid_version
    }

    /// 0 while the object has not been invalidated
    pub fn first_invalid_version(&self) -> u16 {
        self.state.lock().first_invalid_version
    }

    /// `(first_valid_version, first_invalid_version)` read under one lock
    pub fn versions(&self) -> (u16, u16) {
        let state = self.state.lock();
        (state.first_valid_version, state.first_invalid_version)
    }

    pub fn config_data(&self, usage_id: u64) -> Option<Vec<u8>> {
        self.state.lock().data.get(&usage_id).cloned()
    }

    pub fn config_data_ids(&self) -> Vec<u64> {
        self.state.lock().data.keys().copied().collect()
    }

    pub fn object_set_names(&self) -> Vec<String> {
        self.state.lock().sets.keys().cloned().collect()
    }

    pub fn set_elements(&self, set_name: &str) -> Result<Vec<u64>> {
        self.state
            .lock()
            .sets
            .get(set_name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownObjectSet(set_name.to_string()))
    }

    // =========================================================================
    // Mutations (each one marks the object dirty)
    // =========================================================================

    pub fn set_name(self: &Arc<Self>, name: impl Into<String>) {
        self.state.lock().name = name.into();
        self.mark_dirty();
    }

    pub fn set_config_data(self: &Arc<Self>, usage_id: u64, data: Vec<u8>) {
        self.state.lock().data.insert(usage_id, data);
        self.core.note_data_change();
        self.mark_dirty();
    }

    pub fn remove_config_data(self: &Arc<Self>, usage_id: u64) -> bool {
        let removed = self.state.lock().data.remove(&usage_id).is_some();
        if removed {
            self.core.note_data_change();
            self.mark_dirty();
        }
        removed
    }

    /// Attach an empty named set; no-op if it already exists
    pub fn add_object_set(self: &Arc<Self>, set_name: impl Into<String>) {
        let added = {
            let mut state = self.state.lock();
            let set_name = set_name.into();
            if state.sets.contains_key(&set_name) {
                false
            } else {
                state.sets.insert(set_name, Vec::new());
                true
            }
        };
        if added {
            self.mark_dirty();
        }
    }

    pub fn remove_object_set(self: &Arc<Self>, set_name: &str) -> Result<()> {
        self.state
            .lock()
            .sets
            .remove(set_name)
            .ok_or_else(|| StoreError::UnknownObjectSet(set_name.to_string()))?;
        self.mark_dirty();
        Ok(())
    }

    pub fn add_set_element(self: &Arc<Self>, set_name: &str, element_id: u64) -> Result<()> {
        {
            let mut state = self.state.lock();
            let members = state
                .sets
                .get_mut(set_name)
                .ok_or_else(|| StoreError::UnknownObjectSet(set_name.to_string()))?;
            if members.contains(&element_id) {
                return Ok(());
            }
            members.push(element_id);
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn remove_set_element(self: &Arc<Self>, set_name: &str, element_id: u64) -> Result<bool> {
        let removed = {
            let mut state = self.state.lock();
            let members = state
                .sets
                .get_mut(set_name)
                .ok_or_else(|| StoreError::UnknownObjectSet(set_name.to_string()))?;
            let before = members.len();
            members.retain(|id| *id != element_id);
            members.len() != before
        };
        if removed {
            self.mark_dirty();
        }
        Ok(removed)
    }

    // =========================================================================
    // Engine-side Mutations
    // =========================================================================

    pub(crate) fn set_first_invalid_version(self: &Arc<Self>, version: u16) {
        self.state.lock().first_invalid_version = version;
        self.mark_dirty();
    }

    fn mark_dirty(self: &Arc<Self>) {
        self.core.mark_dirty(ObjectInfo::Configuration(Arc::clone(self)));
    }
}
