//! Area File Engine
//!
//! Owns one area file and every entity loaded from it.
//!
//! ## Responsibilities
//! - Exclusive ownership of the file (advisory lock for the engine lifetime)
//! - Loading the mixed set into the resident maps on open
//! - Appending dirty objects on flush, gapping their previous records
//! - Time-travel queries over resident objects and the historical regions
//! - Two-phase deletion marking, backups, restructuring (see `restructure`)
//!
//! ## Lock Order
//! ```text
//! restructure_lock (RwLock<()>)      exclusive: restructure, shared: everything else
//!   └─ io (Mutex<AreaIo>)            file handle + header
//!        └─ resident / times / deletion / registry   one map operation each
//!             └─ entity locks
//! ```
//! A flush drains the dirty set before it takes the file lock and never holds
//! the dirty-set lock while it snapshots an entity.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::object::location::LocationRegistry;
use crate::object::{
    now_millis, ConfigurationObjectInfo, DirtyLog, DynamicObjectInfo, HistoricalOffset, Location, ObjectInfo,
    ObjectLocation, PersistenceMode, RUNNING_NUMBER_MASK,
};
use crate::record::payload::{check_serializer_version, encode_latin1};
use crate::record::{decode_slice, encode_to_vec, read_raw, Record, DYNAMIC_INVALID_TIME_OFFSET, ID_OFFSET};

use super::deletion::{side_index_paths, DeletionIndex, MarkOutcome};
use super::header::{AreaHeader, RECORD_FORMAT_VERSION};
use super::index::{decode_id_index, read_region, search_id_on_disk, search_pid_hash_on_disk, INDEX_ENTRY_SIZE};
use super::validity::{is_valid_in_range, ActivationTimes, IntervalSemantics, TimeAuthority};

// =============================================================================
// File Access
// =============================================================================

/// File handle and header, guarded together by the file lock
#[derive(Debug)]
pub(super) struct AreaIo {
    pub file: File,
    pub header: AreaHeader,
    /// Declared header size; every relative position starts here
    pub header_len: u64,
    pub file_len: u64,
}

impl AreaIo {
    /// Absolute position of a historical record
    pub fn absolute(&self, offset: HistoricalOffset) -> u64 {
        match offset {
            HistoricalOffset::Config(o) => self.header_len + o,
            HistoricalOffset::Dynamic(o) => self.header_len + self.header.ngdyn_start + o,
        }
    }

    /// Absolute position of the record behind `location`, if it has one
    pub fn position_of(&self, location: Location) -> Option<u64> {
        match location {
            Location::Mixed(pos) => Some(pos),
            Location::Historical(offset) => Some(self.absolute(offset)),
            Location::Unwritten | Location::Transient | Location::Deleted => None,
        }
    }

    pub fn read_raw_at(&self, pos: u64) -> Result<Vec<u8>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(pos))?;
        read_raw(&mut file)
    }

    pub fn read_record_at(&self, pos: u64) -> Result<Option<Record>> {
        decode_slice(&self.read_raw_at(pos)?)
    }

    pub fn write_at(&self, pos: u64, bytes: &[u8]) -> Result<()> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Append at the end of the mixed set, returning the record position
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let pos = self.file_len;
        self.write_at(pos, bytes)?;
        self.file_len += bytes.len() as u64;
        Ok(pos)
    }

    /// Zero the id field of the record at `pos`
    pub fn declare_gap(&self, pos: u64) -> Result<()> {
        self.write_at(pos + ID_OFFSET, &[0u8; 8])
    }

    /// Rewrite the header in place; its size never changes
    pub fn rewrite_header(&self) -> Result<()> {
        let bytes = self.header.encode_to_size(self.header_len)?;
        self.write_at(0, &bytes)
    }
}

/// Visit every complete record in `[start, end)` with its absolute position
///
/// Returns the position after the last complete record. A record cut off by
/// the end of the file or by `end` stops the scan without an error.
pub(super) fn scan_region<F>(file: &File, start: u64, end: u64, buffer_size: usize, mut visit: F) -> Result<u64>
where
    F: FnMut(u64, &[u8]) -> Result<()>,
{
    let mut reader = BufReader::with_capacity(buffer_size, file);
    reader.seek(SeekFrom::Start(start))?;

    let mut pos = start;
    while pos < end {
        let raw = match read_raw(&mut reader) {
            Ok(raw) => raw,
            Err(StoreError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        if pos + raw.len() as u64 > end {
            break;
        }
        visit(pos, &raw)?;
        pos += raw.len() as u64;
    }
    Ok(pos)
}

/// Like [`scan_region`], but a cut-off record is a format error
pub(super) fn scan_historical<F>(file: &File, start: u64, end: u64, buffer_size: usize, visit: F) -> Result<()>
where
    F: FnMut(u64, &[u8]) -> Result<()>,
{
    let reached = scan_region(file, start, end, buffer_size, visit)?;
    if reached != end {
        return Err(StoreError::Format(format!(
            "Historical region [{}, {}) ends inside a record at {}",
            start, end, reached
        )));
    }
    Ok(())
}

fn lock_exclusive(file: &File, path: &Path) -> Result<()> {
    file.try_lock_exclusive().map_err(|e| {
        if e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
            StoreError::AreaLocked(path.to_path_buf())
        } else {
            StoreError::Io(e)
        }
    })
}

// =============================================================================
// Resident Objects
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Slot {
    Current,
    Future,
    Invalid,
    Simulation(i16),
}

/// Objects held in memory, by role
#[derive(Debug, Default)]
pub(super) struct Resident {
    pub current: HashMap<u64, ObjectInfo>,
    pub future: HashMap<u64, ObjectInfo>,
    /// Invalid objects whose record still lives in the mixed set
    pub invalid: HashMap<u64, ObjectInfo>,
    pub simulation: HashMap<i16, HashMap<u64, ObjectInfo>>,
    by_type: HashMap<u64, HashSet<u64>>,
    /// Current object per pid
    by_pid: HashMap<String, u64>,
    /// Every resident object per pid, whatever its slot
    all_by_pid: HashMap<String, HashSet<u64>>,
}

impl Resident {
    pub fn insert(&mut self, slot: Slot, object: ObjectInfo) {
        let id = object.id();
        self.all_by_pid.entry(object.pid().to_string()).or_default().insert(id);
        match slot {
            Slot::Current => {
                self.by_type.entry(object.type_id()).or_default().insert(id);
                if !object.pid().is_empty() {
                    self.by_pid.insert(object.pid().to_string(), id);
                }
                self.current.insert(id, object);
            }
            Slot::Future => {
                self.future.insert(id, object);
            }
            Slot::Invalid => {
                self.invalid.insert(id, object);
            }
            Slot::Simulation(variant) => {
                self.simulation.entry(variant).or_default().insert(id, object);
            }
        }
    }

    pub fn remove(&mut self, id: u64) -> Option<ObjectInfo> {
        let removed = self
            .current
            .remove(&id)
            .or_else(|| self.future.remove(&id))
            .or_else(|| self.invalid.remove(&id))
            .or_else(|| self.simulation.values_mut().find_map(|objects| objects.remove(&id)));

        if let Some(object) = &removed {
            if let Some(ids) = self.by_type.get_mut(&object.type_id()) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_type.remove(&object.type_id());
                }
            }
            if self.by_pid.get(object.pid()) == Some(&id) {
                self.by_pid.remove(object.pid());
            }
            if let Some(ids) = self.all_by_pid.get_mut(object.pid()) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.all_by_pid.remove(object.pid());
                }
            }
        }
        self.simulation.retain(|_, objects| !objects.is_empty());
        removed
    }

    pub fn get(&self, id: u64) -> Option<&ObjectInfo> {
        self.current
            .get(&id)
            .or_else(|| self.future.get(&id))
            .or_else(|| self.invalid.get(&id))
            .or_else(|| self.simulation.values().find_map(|objects| objects.get(&id)))
    }

    /// Resident objects with this pid, in any slot
    pub fn with_pid(&self, pid: &str) -> impl Iterator<Item = &ObjectInfo> + '_ {
        self.all_by_pid
            .get(pid)
            .into_iter()
            .flatten()
            .filter_map(|id| self.get(*id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectInfo> {
        self.current
            .values()
            .chain(self.future.values())
            .chain(self.invalid.values())
            .chain(self.simulation.values().flat_map(|objects| objects.values()))
    }

    pub fn len(&self) -> usize {
        self.current.len()
            + self.future.len()
            + self.invalid.len()
            + self.simulation.values().map(HashMap::len).sum::<usize>()
    }
}

/// Outcome of the mixed-set scan on open, applied only once it succeeded
#[derive(Default)]
struct LoadedMixedSet {
    objects: Vec<(Slot, ObjectInfo)>,
    /// Superseded duplicates and simulation leftovers
    gaps: Vec<u64>,
    /// `PersistentAndInvalidOnRestart` records to patch, with the open time
    restart_invalidations: Vec<(u64, i64)>,
    truncate_to: Option<u64>,
}

// =============================================================================
// Reports
// =============================================================================

/// Result of [`ConfigAreaFile::backup_to`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub path: PathBuf,
    pub bytes: u64,
    /// CRC32 over the copied area file
    pub crc32: u32,
}

/// Last modification times of an area (unix millis, 0 = never)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeTimes {
    pub dynamic: i64,
    pub configuration: i64,
    pub configuration_data: i64,
}

// =============================================================================
// Engine
// =============================================================================

/// Storage engine of one configuration area
///
/// ## Concurrency:
/// - All methods take `&self`; the engine is `Send + Sync`
/// - See the module docs for the lock order
pub struct ConfigAreaFile {
    path: PathBuf,
    pub(super) config: Config,
    area_pid: String,
    pub(super) serializer_version: u16,
    pub(super) active_version: u16,
    next_active_version: AtomicU16,

    pub(super) restructure_lock: RwLock<()>,
    pub(super) io: Mutex<AreaIo>,
    pub(super) times: RwLock<ActivationTimes>,
    pub(super) resident: RwLock<Resident>,
    pub(super) dirty: Arc<DirtyLog>,
    pub(super) locations: LocationRegistry,
    pub(super) deletion: Mutex<DeletionIndex>,

    greatest_running_number: AtomicU64,
    last_dynamic_change: AtomicI64,
    last_config_change: AtomicI64,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConfigAreaFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigAreaFile")
            .field("path", &self.path)
            .field("area_pid", &self.area_pid)
            .field("active_version", &self.active_version)
            .finish_non_exhaustive()
    }
}

impl ConfigAreaFile {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open an existing area file with the default configuration
    pub fn open(
        path: impl AsRef<Path>,
        desired_active_version: u16,
        local_activation_times: &BTreeMap<u16, i64>,
    ) -> Result<Self> {
        Self::open_with(Config::default(), path, desired_active_version, local_activation_times)
    }

    /// Open an existing area file
    ///
    /// On open:
    /// 1. Lock the file (fails fast with `AreaLocked`)
    /// 2. Parse the header and check format and serializer versions
    /// 3. Activate `max(desired, stored)` as the active version
    /// 4. Scan the mixed set into the resident maps
    /// 5. Derive the greatest running number from the mixed set and ID index
    pub fn open_with(
        config: Config,
        path: impl AsRef<Path>,
        desired_active_version: u16,
        local_activation_times: &BTreeMap<u16, i64>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        lock_exclusive(&file, &path)?;

        let (mut header, header_len) = {
            let mut reader = BufReader::new(&file);
            AreaHeader::decode_sized(&mut reader)?
        };
        if header.record_format_version != RECORD_FORMAT_VERSION {
            return Err(StoreError::UnsupportedRecordVersion(header.record_format_version));
        }
        check_serializer_version(header.serializer_version)?;

        let file_len = file.metadata()?.len();
        if header_len + header.mixed_set_start > file_len {
            return Err(StoreError::Format(format!(
                "Mixed set starts at {} beyond end of file {}",
                header_len + header.mixed_set_start,
                file_len
            )));
        }

        let active_version = if desired_active_version < header.active_version {
            warn!(
                desired = desired_active_version,
                stored = header.active_version,
                "Requested active version is older than the stored one, keeping stored"
            );
            header.active_version
        } else {
            desired_active_version
        };
        let next_active_version = header.next_active_version.max(active_version);
        let header_changed =
            header.active_version != active_version || header.next_active_version != next_active_version;
        header.active_version = active_version;
        header.next_active_version = next_active_version;

        let times = ActivationTimes::new(local_activation_times, &header.nga_blocks);
        let deletion = DeletionIndex::load(&path);
        let io = AreaIo {
            file,
            header,
            header_len,
            file_len,
        };
        let area = Self::assemble(config, path, io, times, deletion);

        // A failed load must leave the file untouched, including on drop
        if let Err(e) = area.load(header_changed) {
            area.closed.store(true, Ordering::SeqCst);
            return Err(e);
        }

        info!(
            path = %area.path.display(),
            area = %area.area_pid,
            active_version,
            objects = area.resident.read().len(),
            "Opened area file"
        );
        Ok(area)
    }

    /// Create a new, empty area file with the default configuration
    pub fn create(
        path: impl AsRef<Path>,
        area_pid: &str,
        active_version: u16,
        serializer_version: u16,
    ) -> Result<Self> {
        Self::create_with(Config::default(), path, area_pid, active_version, serializer_version)
    }

    /// Create a new, empty area file; fails if the file exists
    pub fn create_with(
        config: Config,
        path: impl AsRef<Path>,
        area_pid: &str,
        active_version: u16,
        serializer_version: u16,
    ) -> Result<Self> {
        encode_latin1(area_pid)?;
        check_serializer_version(serializer_version)?;

        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        lock_exclusive(&file, &path)?;

        let header = AreaHeader::new(area_pid, active_version, serializer_version);
        let bytes = header.encode()?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        let len = bytes.len() as u64;
        let deletion = DeletionIndex::load(&path);
        let io = AreaIo {
            file,
            header,
            header_len: len,
            file_len: len,
        };
        let area = Self::assemble(config, path, io, ActivationTimes::default(), deletion);

        info!(path = %area.path.display(), area = %area.area_pid, active_version, "Created area file");
        Ok(area)
    }

    fn assemble(config: Config, path: PathBuf, io: AreaIo, times: ActivationTimes, deletion: DeletionIndex) -> Self {
        let header = &io.header;
        let dirty = Arc::new(DirtyLog::default());
        dirty.restore_last_data_change(header.last_data_change);

        Self {
            area_pid: header.area_pid.clone(),
            serializer_version: header.serializer_version,
            active_version: header.active_version,
            next_active_version: AtomicU16::new(header.next_active_version),
            last_dynamic_change: AtomicI64::new(header.last_dynamic_change),
            last_config_change: AtomicI64::new(header.last_config_change),
            path,
            config,
            restructure_lock: RwLock::new(()),
            times: RwLock::new(times),
            resident: RwLock::new(Resident::default()),
            dirty,
            locations: LocationRegistry::default(),
            deletion: Mutex::new(deletion),
            greatest_running_number: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            io: Mutex::new(io),
        }
    }

    /// Read everything first, then apply the repairs the scan asked for
    fn load(&self, header_changed: bool) -> Result<()> {
        let loaded = self.scan_mixed_set()?;
        self.load_greatest_indexed_id()?;

        let mut io = self.io.lock();
        if let Some(len) = loaded.truncate_to {
            io.file.set_len(len)?;
            io.file_len = len;
        }
        for pos in loaded.gaps {
            io.declare_gap(pos)?;
        }
        for (pos, time) in loaded.restart_invalidations {
            io.write_at(pos + DYNAMIC_INVALID_TIME_OFFSET, &time.to_be_bytes())?;
            self.last_dynamic_change.fetch_max(time, Ordering::SeqCst);
        }
        if header_changed {
            io.rewrite_header()?;
        }

        let mut resident = self.resident.write();
        for (slot, object) in loaded.objects {
            resident.insert(slot, object);
        }
        Ok(())
    }

    /// Decode the mixed set without writing to the file
    fn scan_mixed_set(&self) -> Result<LoadedMixedSet> {
        let io = self.io.lock();
        let start = io.header_len + io.header.mixed_set_start;
        let end = io.file_len;

        let mut records: Vec<(u64, Record)> = Vec::new();
        let mut latest: HashMap<u64, u64> = HashMap::new();
        let reached = scan_region(&io.file, start, end, self.config.io_buffer_size, |pos, raw| {
            if let Some(record) = decode_slice(raw)? {
                latest.insert(record.id(), pos);
                records.push((pos, record));
            }
            Ok(())
        })?;

        let mut loaded = LoadedMixedSet::default();
        if reached < end {
            warn!(
                path = %self.path.display(),
                position = reached,
                lost_bytes = end - reached,
                "Truncating partial record at end of area file"
            );
            loaded.truncate_to = Some(reached);
        }

        let now = now_millis();
        for (pos, record) in records {
            let id = record.id();
            if latest.get(&id) != Some(&pos) {
                warn!(id, position = pos, "Superseded duplicate record, declaring gap");
                loaded.gaps.push(pos);
                continue;
            }
            self.note_id(id);

            if let Record::Dynamic(r) = &record {
                if r.simulation_variant > 0 {
                    debug!(id, variant = r.simulation_variant, "Dropping leftover simulation object");
                    loaded.gaps.push(pos);
                    continue;
                }
            }

            let object = self.materialize(record, self.locations.track(Location::Mixed(pos)), true)?;
            let slot = match &object {
                ObjectInfo::Configuration(c) => {
                    let (valid, invalid) = c.versions();
                    if valid > self.active_version {
                        Slot::Future
                    } else if invalid != 0 && invalid <= self.active_version {
                        Slot::Invalid
                    } else {
                        Slot::Current
                    }
                }
                ObjectInfo::Dynamic(d) => {
                    if !d.is_valid() {
                        Slot::Invalid
                    } else if d.persistence() == PersistenceMode::PersistentAndInvalidOnRestart {
                        d.mark_invalid(now);
                        loaded.restart_invalidations.push((pos, now));
                        Slot::Invalid
                    } else {
                        Slot::Current
                    }
                }
            };
            loaded.objects.push((slot, object));
        }
        Ok(loaded)
    }

    fn load_greatest_indexed_id(&self) -> Result<()> {
        let io = self.io.lock();
        let count = io.header.id_index_len();
        if count == 0 {
            return Ok(());
        }
        let last = io.header_len + io.header.id_index_start + (count - 1) * INDEX_ENTRY_SIZE;
        let bytes = read_region(&io.file, last, INDEX_ENTRY_SIZE)?;
        if let Some(entry) = decode_id_index(&bytes)?.last() {
            self.note_id(entry.id);
        }
        Ok(())
    }

    /// Flush pending changes and release the file lock
    ///
    /// Idempotent. Every later operation fails with `IllegalState`.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        {
            let _guard = self.restructure_lock.read();
            self.flush_locked()?;
        }
        self.deletion.lock().save()?;
        self.closed.store(true, Ordering::SeqCst);
        FileExt::unlock(&self.io.lock().file)?;
        info!(path = %self.path.display(), area = %self.area_pid, "Closed area file");
        Ok(())
    }

    pub(super) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::IllegalState(format!(
                "Area file {} is closed",
                self.path.display()
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Versions
    // =========================================================================

    /// Announce the version that becomes active on the next open
    pub fn set_next_active_version(&self, version: u16) -> Result<()> {
        self.ensure_open()?;
        if version <= self.active_version {
            return Err(StoreError::IllegalState(format!(
                "Next active version {} must be greater than the active version {}",
                version, self.active_version
            )));
        }
        let _guard = self.restructure_lock.read();
        let mut io = self.io.lock();
        io.header.next_active_version = version;
        io.rewrite_header()?;
        self.next_active_version.store(version, Ordering::SeqCst);
        debug!(area = %self.area_pid, version, "Set next active version");
        Ok(())
    }

    /// Record when this instance activated `version`
    pub fn set_local_activation_time(&self, version: u16, time: i64) {
        self.times.write().set_local(version, time);
    }

    fn require_next_version(&self) -> Result<u16> {
        let next = self.next_active_version.load(Ordering::SeqCst);
        if next <= self.active_version {
            return Err(StoreError::IllegalState(format!(
                "No next active version set for area {}",
                self.area_pid
            )));
        }
        Ok(next)
    }

    // =========================================================================
    // Object Creation
    // =========================================================================

    /// Create a configuration object that becomes valid in the next version
    pub fn create_configuration_object(
        &self,
        id: u64,
        type_id: u64,
        pid: &str,
        name: &str,
    ) -> Result<Arc<ConfigurationObjectInfo>> {
        self.ensure_open()?;
        let next = self.require_next_version()?;
        encode_latin1(pid)?;
        self.ensure_unused(id)?;

        let object = Arc::new(ConfigurationObjectInfo::new(
            id,
            type_id,
            pid.to_string(),
            name.to_string(),
            next,
            self.locations.track(Location::Unwritten),
            Arc::downgrade(&self.dirty),
        ));
        let info = ObjectInfo::Configuration(Arc::clone(&object));
        self.resident.write().insert(Slot::Future, info.clone());
        self.dirty.mark(info);
        self.note_id(id);
        self.last_config_change.store(now_millis(), Ordering::SeqCst);

        debug!(id, pid, version = next, "Created configuration object");
        Ok(object)
    }

    /// Create a dynamic object, valid from now on
    ///
    /// Objects with `simulation_variant > 0` are only visible to that
    /// simulation. Transient objects are never written.
    pub fn create_dynamic_object(
        &self,
        id: u64,
        type_id: u64,
        pid: &str,
        simulation_variant: i16,
        name: &str,
        persistence: PersistenceMode,
    ) -> Result<Arc<DynamicObjectInfo>> {
        self.ensure_open()?;
        if simulation_variant < 0 {
            return Err(StoreError::IllegalState(format!(
                "Negative simulation variant {}",
                simulation_variant
            )));
        }
        encode_latin1(pid)?;
        self.ensure_unused(id)?;

        let now = now_millis();
        let location = if persistence == PersistenceMode::Transient {
            Location::Transient
        } else {
            Location::Unwritten
        };
        let object = Arc::new(DynamicObjectInfo::new(
            id,
            type_id,
            pid.to_string(),
            name.to_string(),
            simulation_variant,
            persistence,
            now,
            self.locations.track(location),
            Arc::downgrade(&self.dirty),
        ));
        let info = ObjectInfo::Dynamic(Arc::clone(&object));
        let slot = if simulation_variant > 0 {
            Slot::Simulation(simulation_variant)
        } else {
            Slot::Current
        };
        self.resident.write().insert(slot, info.clone());
        if persistence != PersistenceMode::Transient {
            self.dirty.mark(info);
        }
        self.note_id(id);
        self.last_dynamic_change.store(now, Ordering::SeqCst);

        debug!(id, pid, variant = simulation_variant, ?persistence, "Created dynamic object");
        Ok(object)
    }

    fn ensure_unused(&self, id: u64) -> Result<()> {
        if id == 0 {
            return Err(StoreError::IllegalState("Object id 0 marks a gap".to_string()));
        }
        if self.resident.read().get(id).is_some() {
            return Err(StoreError::IllegalState(format!("Object id {} already in use", id)));
        }
        Ok(())
    }

    fn note_id(&self, id: u64) {
        self.greatest_running_number
            .fetch_max(id & RUNNING_NUMBER_MASK, Ordering::SeqCst);
    }

    // =========================================================================
    // Validity Changes
    // =========================================================================

    /// Invalidate a configuration object with the next active version
    ///
    /// An object that would be invalid in the same version it becomes valid
    /// in is deleted instead.
    pub fn invalidate(&self, object: &ObjectInfo) -> Result<()> {
        self.ensure_open()?;
        let config = object.as_configuration().ok_or(StoreError::WrongObjectKind)?;
        let next = self.require_next_version()?;
        let (valid, invalid) = config.versions();

        if invalid == next {
            return Ok(());
        }
        if invalid != 0 {
            return Err(StoreError::IllegalState(format!(
                "Object {} is already invalid since version {}",
                config.id(),
                invalid
            )));
        }

        self.last_config_change.store(now_millis(), Ordering::SeqCst);
        if valid >= next {
            debug!(id = config.id(), version = next, "Invalidated in its first version, deleting");
            return self.delete_object(object);
        }
        config.set_first_invalid_version(next);
        debug!(id = config.id(), version = next, "Invalidated configuration object");
        Ok(())
    }

    /// Undo an invalidation that has not become active yet
    pub fn revalidate(&self, object: &ObjectInfo) -> Result<()> {
        self.ensure_open()?;
        let config = object.as_configuration().ok_or(StoreError::WrongObjectKind)?;
        let invalid = config.first_invalid_version();
        if invalid == 0 {
            return Ok(());
        }
        if invalid <= self.active_version {
            return Err(StoreError::IllegalState(format!(
                "Object {} became invalid in active version {}",
                config.id(),
                invalid
            )));
        }
        config.set_first_invalid_version(0);
        self.last_config_change.store(now_millis(), Ordering::SeqCst);
        debug!(id = config.id(), "Revalidated configuration object");
        Ok(())
    }

    /// Invalidate a dynamic object now
    pub fn set_invalid(&self, object: &ObjectInfo) -> Result<()> {
        self.set_invalid_at(object, now_millis())
    }

    /// Invalidate a dynamic object at `time`
    ///
    /// Already invalid objects are left untouched. A stored record is patched
    /// in place; an unwritten one picks the time up on the next flush.
    ///
    /// The file lock is held from the state change to the patch, so neither
    /// a flush nor a restructure can copy the record in between.
    pub fn set_invalid_at(&self, object: &ObjectInfo, time: i64) -> Result<()> {
        self.ensure_open()?;
        let dynamic = object.as_dynamic().ok_or(StoreError::WrongObjectKind)?;

        let _guard = self.restructure_lock.read();
        let io = self.io.lock();
        if !dynamic.mark_invalid(time) {
            warn!(id = dynamic.id(), "Dynamic object is already invalid");
            return Ok(());
        }

        {
            let mut resident = self.resident.write();
            resident.remove(dynamic.id());
            resident.insert(Slot::Invalid, object.clone());
        }
        self.last_dynamic_change.store(time, Ordering::SeqCst);
        debug!(id = dynamic.id(), time, "Invalidated dynamic object");

        if dynamic.persistence() == PersistenceMode::Transient {
            return Ok(());
        }
        match dynamic.location().get() {
            Location::Mixed(pos) => io.write_at(pos + DYNAMIC_INVALID_TIME_OFFSET, &time.to_be_bytes())?,
            Location::Unwritten => {}
            other => warn!(id = dynamic.id(), location = ?other, "Cannot patch invalidation time"),
        }
        Ok(())
    }

    /// Remove a dynamic object without keeping history
    pub fn delete_dynamic_object(&self, object: &ObjectInfo) -> Result<()> {
        self.ensure_open()?;
        if object.as_dynamic().is_none() {
            return Err(StoreError::WrongObjectKind);
        }
        self.delete_object(object)
    }

    /// Delete every object of a finished simulation
    pub fn delete_simulation_objects(&self, simulation_variant: i16) -> Result<usize> {
        self.ensure_open()?;
        let doomed: Vec<ObjectInfo> = self
            .resident
            .read()
            .iter()
            .filter(|o| simulation_variant > 0 && o.simulation_variant() == simulation_variant)
            .cloned()
            .collect();

        for object in &doomed {
            self.delete_object(object)?;
        }
        debug!(variant = simulation_variant, count = doomed.len(), "Deleted simulation objects");
        Ok(doomed.len())
    }

    fn delete_object(&self, object: &ObjectInfo) -> Result<()> {
        let _guard = self.restructure_lock.read();
        let io = self.io.lock();
        if let Some(pos) = io.position_of(object.location().get()) {
            io.declare_gap(pos)?;
        }
        object.location().set(Location::Deleted);
        self.dirty.remove(object.id());
        self.resident.write().remove(object.id());
        debug!(id = object.id(), "Deleted object");
        Ok(())
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write every dirty object and the header
    pub fn flush(&self) -> Result<usize> {
        self.ensure_open()?;
        let _guard = self.restructure_lock.read();
        self.flush_locked()
    }

    /// Flush with the restructure lock already held (either mode)
    pub(super) fn flush_locked(&self) -> Result<usize> {
        let objects = self.dirty.drain();
        let mut io = self.io.lock();

        let mut written = 0;
        let mut pending = objects.into_iter();
        while let Some(object) = pending.next() {
            match self.write_object(&mut io, &object) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    let mut failed = vec![object];
                    failed.extend(pending);
                    self.dirty.requeue(failed);
                    return Err(e);
                }
            }
        }

        io.header.last_dynamic_change = self.last_dynamic_change.load(Ordering::SeqCst);
        io.header.last_config_change = self.last_config_change.load(Ordering::SeqCst);
        io.header.last_data_change = self.dirty.last_data_change();
        io.rewrite_header()?;
        if self.config.sync_on_flush {
            io.file.sync_data()?;
        }

        if written > 0 {
            debug!(area = %self.area_pid, written, "Flushed dirty objects");
        }
        Ok(written)
    }

    /// Append the object's record and gap its previous one
    fn write_object(&self, io: &mut AreaIo, object: &ObjectInfo) -> Result<bool> {
        let previous = match object.location().get() {
            Location::Transient | Location::Deleted => return Ok(false),
            Location::Historical(_) => {
                warn!(id = object.id(), "Historical records are immutable, change not persisted");
                return Ok(false);
            }
            Location::Unwritten => None,
            Location::Mixed(pos) => Some(pos),
        };

        let record = object.to_record(self.config.compression(), self.serializer_version)?;
        let bytes = encode_to_vec(&record)?;
        let pos = io.append(&bytes)?;
        if let Some(previous) = previous {
            io.declare_gap(previous)?;
        }
        object.location().set(Location::Mixed(pos));
        Ok(true)
    }

    /// Copy the flushed area file (and its deletion indices) into `target_dir`
    pub fn backup_to(&self, target_dir: impl AsRef<Path>) -> Result<BackupReport> {
        self.ensure_open()?;
        let target_dir = target_dir.as_ref();
        fs::create_dir_all(target_dir)?;
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| StoreError::IllegalState(format!("No file name in {}", self.path.display())))?;
        let target = target_dir.join(file_name);

        let _guard = self.restructure_lock.read();
        self.flush_locked()?;

        let (bytes, crc32) = {
            let io = self.io.lock();
            let mut reader = BufReader::with_capacity(self.config.io_buffer_size, &io.file);
            reader.seek(SeekFrom::Start(0))?;
            let mut writer = BufWriter::with_capacity(self.config.io_buffer_size, File::create(&target)?);

            let mut hasher = crc32fast::Hasher::new();
            let mut buf = vec![0u8; self.config.io_buffer_size.max(4096)];
            let mut total = 0u64;
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                writer.write_all(&buf[..n])?;
                total += n as u64;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
            (total, hasher.finalize())
        };

        let (locked, pending) = side_index_paths(&self.path);
        for side in [locked, pending] {
            if let Some(name) = side.file_name() {
                if side.exists() {
                    fs::copy(&side, target_dir.join(name))?;
                }
            }
        }

        info!(area = %self.area_pid, target = %target.display(), bytes, crc32, "Backed up area file");
        Ok(BackupReport {
            path: target,
            bytes,
            crc32,
        })
    }

    // =========================================================================
    // Two-Phase Deletion
    // =========================================================================

    /// Run one deletion marking round over ids the caller no longer references
    ///
    /// Only ids of invalid dynamic objects take part; anything else is ignored.
    pub fn mark_for_deletion(&self, candidate_ids: &[u64]) -> Result<MarkOutcome> {
        self.ensure_open()?;
        let mut eligible = HashSet::new();
        for &id in candidate_ids {
            match self.get_old_object(id)? {
                Some(ObjectInfo::Dynamic(d)) if !d.is_valid() && d.simulation_variant() == 0 => {
                    eligible.insert(id);
                }
                _ => debug!(id, "Not eligible for deletion"),
            }
        }

        let mut deletion = self.deletion.lock();
        let outcome = deletion.mark(&eligible);
        deletion.save()?;
        Ok(outcome)
    }

    pub fn is_pending_deletion(&self, id: u64) -> bool {
        self.deletion.lock().is_pending(id)
    }

    pub fn is_locked_for_deletion(&self, id: u64) -> bool {
        self.deletion.lock().is_locked(id)
    }

    // =========================================================================
    // Resident Lookups
    // =========================================================================

    /// Any resident object with this id
    pub fn get_object(&self, id: u64) -> Option<ObjectInfo> {
        self.resident.read().get(id).cloned()
    }

    /// Current (not simulation) object with this pid
    pub fn get_active_object(&self, pid: &str) -> Option<ObjectInfo> {
        let resident = self.resident.read();
        let id = resident.by_pid.get(pid)?;
        resident.current.get(id).cloned()
    }

    pub fn get_current_objects(&self) -> Vec<ObjectInfo> {
        sorted_by_id(self.resident.read().current.values().cloned().collect())
    }

    /// Objects that become valid with the next active version
    pub fn get_new_objects(&self) -> Vec<ObjectInfo> {
        sorted_by_id(self.resident.read().future.values().cloned().collect())
    }

    /// Invalid objects still held in memory (not yet moved into history)
    pub fn get_invalid_objects(&self) -> Vec<ObjectInfo> {
        sorted_by_id(self.resident.read().invalid.values().cloned().collect())
    }

    pub fn get_objects_of_type(&self, type_id: u64) -> Vec<ObjectInfo> {
        let resident = self.resident.read();
        let objects = resident
            .by_type
            .get(&type_id)
            .map(|ids| ids.iter().filter_map(|id| resident.current.get(id).cloned()).collect())
            .unwrap_or_default();
        sorted_by_id(objects)
    }

    pub fn get_simulation_objects(&self, simulation_variant: i16) -> Vec<ObjectInfo> {
        let objects = self
            .resident
            .read()
            .simulation
            .get(&simulation_variant)
            .map(|objects| objects.values().cloned().collect())
            .unwrap_or_default();
        sorted_by_id(objects)
    }

    /// Resolve a location reference handed out earlier
    ///
    /// Historical objects are rebuilt around the same location cell.
    pub fn load_object(&self, location: &ObjectLocation) -> Result<Option<ObjectInfo>> {
        self.ensure_open()?;
        let _guard = self.restructure_lock.read();
        let io = self.io.lock();

        let record = match location.get() {
            Location::Mixed(pos) => io.read_record_at(pos)?,
            Location::Historical(offset) => io.read_record_at(io.absolute(offset))?,
            Location::Unwritten | Location::Transient | Location::Deleted => None,
        };
        let Some(record) = record else {
            return Ok(None);
        };

        if let Some(object) = self.get_object(record.id()) {
            return Ok(Some(object));
        }
        self.materialize(record, location.clone(), false).map(Some)
    }

    // =========================================================================
    // Historical Queries
    // =========================================================================

    /// Object by id, including invalid and historical ones
    pub fn get_old_object(&self, id: u64) -> Result<Option<ObjectInfo>> {
        self.ensure_open()?;
        if let Some(object) = self.get_object(id) {
            return Ok(Some(object));
        }

        let _guard = self.restructure_lock.read();
        let io = self.io.lock();
        let count = io.header.id_index_len();
        if count == 0 {
            return Ok(None);
        }
        let index_start = io.header_len + io.header.id_index_start;
        let Some(offset) = search_id_on_disk(&io.file, index_start, count, id)? else {
            return Ok(None);
        };

        match io.read_record_at(io.absolute(offset))? {
            Some(record) if record.id() == id => {
                let location = self.locations.track(Location::Historical(offset));
                self.materialize(record, location, false).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Every object valid at some point in `[start, end]` whose type is in
    /// `type_ids` (all types if empty)
    ///
    /// Simulation objects never take part.
    pub fn query(
        &self,
        start: i64,
        end: i64,
        authority: TimeAuthority,
        semantics: IntervalSemantics,
        type_ids: &[u64],
    ) -> Result<Vec<ObjectInfo>> {
        self.ensure_open()?;
        let wanted = |type_id: u64| type_ids.is_empty() || type_ids.contains(&type_id);
        let times = self.times.read().clone();
        let matches = |(since, until): (i64, i64)| is_valid_in_range(since, until, start, end, semantics);

        let _guard = self.restructure_lock.read();
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        for object in self.resident.read().iter() {
            seen.insert(object.id());
            if object.simulation_variant() == 0
                && wanted(object.type_id())
                && matches(self.object_interval(&times, object, authority))
            {
                found.push(object.clone());
            }
        }

        let io = self.io.lock();
        let base = io.header_len;
        for (i, block) in io.header.nga_blocks.iter().enumerate() {
            let Some((from, to)) = io.header.nga_block_range(i) else {
                continue;
            };
            let invalid_since = times.time_of(block.version, authority, self.active_version);
            let out_of_range = match semantics {
                IntervalSemantics::Overlap => invalid_since < start,
                IntervalSemantics::FullCoverage => invalid_since < end,
            };
            if out_of_range {
                continue;
            }

            scan_historical(&io.file, base + from, base + to, self.config.io_buffer_size, |pos, raw| {
                if let Some(record) = decode_slice(raw)? {
                    if !seen.contains(&record.id())
                        && wanted(record.type_id())
                        && matches(self.record_interval(&times, &record, authority))
                    {
                        let location = Location::Historical(HistoricalOffset::Config(pos - base));
                        found.push(self.materialize(record, self.locations.track(location), false)?);
                    }
                }
                Ok(())
            })?;
        }

        let dyn_base = base + io.header.ngdyn_start;
        let dyn_end = base + io.header.id_index_start;
        scan_historical(&io.file, dyn_base, dyn_end, self.config.io_buffer_size, |pos, raw| {
            if let Some(record) = decode_slice(raw)? {
                let simulation = matches!(&record, Record::Dynamic(r) if r.simulation_variant != 0);
                if !simulation
                    && !seen.contains(&record.id())
                    && wanted(record.type_id())
                    && matches(self.record_interval(&times, &record, authority))
                {
                    let location = Location::Historical(HistoricalOffset::Dynamic(pos - dyn_base));
                    found.push(self.materialize(record, self.locations.track(location), false)?);
                }
            }
            Ok(())
        })?;

        Ok(found)
    }

    /// Every object with `pid` valid at some point in `[start, end]`
    ///
    /// Objects of `simulation_variant` are included next to normal ones.
    pub fn get_objects(
        &self,
        pid: &str,
        start: i64,
        end: i64,
        authority: TimeAuthority,
        simulation_variant: i16,
    ) -> Result<Vec<ObjectInfo>> {
        self.ensure_open()?;
        let in_variant = |variant: i16| variant == 0 || variant == simulation_variant;
        let times = self.times.read().clone();
        let matches =
            |(since, until): (i64, i64)| is_valid_in_range(since, until, start, end, IntervalSemantics::Overlap);

        let _guard = self.restructure_lock.read();
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        for object in self.resident.read().with_pid(pid) {
            seen.insert(object.id());
            if in_variant(object.simulation_variant())
                && matches(self.object_interval(&times, object, authority))
            {
                found.push(object.clone());
            }
        }

        if pid.is_empty() {
            return Ok(found);
        }

        let io = self.io.lock();
        let count = io.header.pid_index_len();
        let index_start = io.header_len + io.header.pid_index_start;
        let hash = crate::record::pid_hash(pid);
        for offset in search_pid_hash_on_disk(&io.file, index_start, count, hash)? {
            let Some(record) = io.read_record_at(io.absolute(offset))? else {
                continue;
            };
            let variant = match &record {
                Record::Dynamic(r) => r.simulation_variant,
                Record::Configuration(_) => 0,
            };
            if seen.contains(&record.id())
                || record.pid_hash() != hash
                || !in_variant(variant)
                || !matches(self.record_interval(&times, &record, authority))
            {
                continue;
            }
            let object = self.materialize(record, self.locations.track(Location::Historical(offset)), false)?;
            if object.pid() == pid {
                seen.insert(object.id());
                found.push(object);
            }
        }
        Ok(found)
    }

    fn version_interval(&self, times: &ActivationTimes, valid: u16, invalid: u16, authority: TimeAuthority) -> (i64, i64) {
        let since = times.time_of(valid, authority, self.active_version);
        let until = if invalid == 0 {
            0
        } else {
            times.time_of(invalid, authority, self.active_version)
        };
        (since, until)
    }

    fn object_interval(&self, times: &ActivationTimes, object: &ObjectInfo, authority: TimeAuthority) -> (i64, i64) {
        match object {
            ObjectInfo::Configuration(c) => {
                let (valid, invalid) = c.versions();
                self.version_interval(times, valid, invalid, authority)
            }
            ObjectInfo::Dynamic(d) => (d.first_valid_time(), d.first_invalid_time()),
        }
    }

    fn record_interval(&self, times: &ActivationTimes, record: &Record, authority: TimeAuthority) -> (i64, i64) {
        match record {
            Record::Configuration(r) => {
                self.version_interval(times, r.first_valid_version, r.first_invalid_version, authority)
            }
            Record::Dynamic(r) => (r.first_valid_time, r.first_invalid_time),
        }
    }

    /// Build an entity; only resident entities log into the dirty set
    pub(super) fn materialize(&self, record: Record, location: ObjectLocation, resident: bool) -> Result<ObjectInfo> {
        let dirty = if resident {
            Arc::downgrade(&self.dirty)
        } else {
            Weak::new()
        };
        ObjectInfo::from_record(record, location, self.serializer_version, dirty)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn area_pid(&self) -> &str {
        &self.area_pid
    }

    pub fn active_version(&self) -> u16 {
        self.active_version
    }

    /// `None` until a version newer than the active one was announced
    pub fn next_active_version(&self) -> Option<u16> {
        let next = self.next_active_version.load(Ordering::SeqCst);
        (next > self.active_version).then_some(next)
    }

    pub fn serializer_version(&self) -> u16 {
        self.serializer_version
    }

    pub fn greatest_running_number(&self) -> u64 {
        self.greatest_running_number.load(Ordering::SeqCst)
    }

    pub fn last_change_times(&self) -> ChangeTimes {
        ChangeTimes {
            dynamic: self.last_dynamic_change.load(Ordering::SeqCst),
            configuration: self.last_config_change.load(Ordering::SeqCst),
            configuration_data: self.dirty.last_data_change(),
        }
    }

    /// Snapshot of the in-memory header
    pub fn header(&self) -> AreaHeader {
        self.io.lock().header.clone()
    }

    pub fn file_len(&self) -> u64 {
        self.io.lock().file_len
    }

    /// Objects changed since the last flush
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Location references currently alive for this area
    pub fn live_location_count(&self) -> usize {
        self.locations.live_count()
    }
}

impl Drop for ConfigAreaFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "Failed to close area file cleanly");
        }
    }
}

fn sorted_by_id(mut objects: Vec<ObjectInfo>) -> Vec<ObjectInfo> {
    objects.sort_by_key(ObjectInfo::id);
    objects
}
