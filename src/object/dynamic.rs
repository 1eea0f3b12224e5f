//! Dynamic-object entity

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use flate2::Compression;
use parking_lot::Mutex;

use crate::error::Result;
use crate::record::payload::DynamicPayload;
use crate::record::{compress_payload, decompress_payload, DynamicRecord, Record};

use super::{DirtyLog, ObjectCore, ObjectInfo, ObjectLocation, PersistenceMode};

#[derive(Debug, Clone, Default)]
struct DynamicState {
    name: String,
    first_valid_time: i64,
    first_invalid_time: i64,
    data: BTreeMap<u64, Vec<u8>>,
}

/// A dynamic object: valid in `[first_valid_time, first_invalid_time)`
#[derive(Debug)]
pub struct DynamicObjectInfo {
    pub(super) core: ObjectCore,
    simulation_variant: i16,
    persistence: PersistenceMode,
    state: Mutex<DynamicState>,
}

impl DynamicObjectInfo {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        type_id: u64,
        pid: String,
        name: String,
        simulation_variant: i16,
        persistence: PersistenceMode,
        first_valid_time: i64,
        location: ObjectLocation,
        dirty: Weak<DirtyLog>,
    ) -> Self {
        Self {
            core: ObjectCore::new(id, type_id, pid, location, dirty),
            simulation_variant,
            persistence,
            state: Mutex::new(DynamicState {
                name,
                first_valid_time,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn from_record(
        record: DynamicRecord,
        location: ObjectLocation,
        serializer_version: u16,
        dirty: Weak<DirtyLog>,
    ) -> Result<Self> {
        let raw = decompress_payload(&record.payload)?;
        let payload = DynamicPayload::deserialize(&raw, serializer_version)?;
        Ok(Self {
            core: ObjectCore::new(record.id, record.type_id, payload.pid, location, dirty),
            simulation_variant: record.simulation_variant,
            persistence: payload.persistence,
            state: Mutex::new(DynamicState {
                name: payload.name,
                first_valid_time: record.first_valid_time,
                first_invalid_time: record.first_invalid_time,
                data: payload.data,
            }),
        })
    }

    pub(crate) fn to_record(&self, compression: Compression, serializer_version: u16) -> Result<Record> {
        let state = self.state.lock().clone();
        let payload = DynamicPayload {
            pid: self.core.pid.clone(),
            name: state.name,
            persistence: self.persistence,
            data: state.data,
        };
        let raw = payload.serialize(serializer_version)?;
        Ok(Record::Dynamic(DynamicRecord {
            id: self.core.id,
            pid_hash: self.core.pid_hash,
            type_id: self.core.type_id,
            first_valid_time: state.first_valid_time,
            first_invalid_time: state.first_invalid_time,
            simulation_variant: self.simulation_variant,
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

    pub fn simulation_variant(&self) -> i16 {
        self.simulation_variant
    }

    pub fn persistence(&self) -> PersistenceMode {
        self.persistence
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn first_valid_time(&self) -> i64 {
        self.state.lock().first_valid_time
    }

    /// 0 while the object is valid
    pub fn first_invalid_time(&self) -> i64 {
        self.state.lock().first_invalid_time
    }

    pub fn is_valid(&self) -> bool {
        self.first_invalid_time() == 0
    }

    pub fn config_data(&self, usage_id: u64) -> Option<Vec<u8>> {
        self.state.lock().data.get(&usage_id).cloned()
    }

    pub fn config_data_ids(&self) -> Vec<u64> {
        self.state.lock().data.keys().copied().collect()
    }

    // =========================================================================
    // Mutations
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

    /// Record the invalidation time; false if the object already was invalid
    ///
    /// Does not mark the object dirty: the engine patches the stored
    /// timestamp in place.
    pub(crate) fn mark_invalid(&self, time: i64) -> bool {
        let mut state = self.state.lock();
        if state.first_invalid_time != 0 {
            return false;
        }
        state.first_invalid_time = time;
        true
    }

    fn mark_dirty(self: &Arc<Self>) {
        if self.persistence == PersistenceMode::Transient {
            return;
        }
        self.core.mark_dirty(ObjectInfo::Dynamic(Arc::clone(self)));
    }
}
