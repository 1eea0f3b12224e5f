//! Restructuring
//!
//! Rebuilds an area file next to the live one and swaps it in.
//!
//! ## Steps
//! ```text
//! 1. flush, size the new header for old + new NGA entries
//! 2. copy the old NGA blocks (verbatim, or without gaps)
//! 3. append one NGA block per newly active version
//! 4. merge the old NGDyn block with newly invalid dynamic objects,
//!    ordered by invalidation time
//! 5. merge the ID and PID-hash indices
//! 6. re-append the records that stay in the mixed set
//! 7. write the final header, sync, swap through `<file>.Old`
//! 8. relocate every live location reference
//! ```
//! Any failure before the swap leaves the live file untouched.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::object::{now_millis, HistoricalOffset, Location, ObjectInfo};
use crate::record::{decode_slice, is_gap, Record};

use super::file::{scan_historical, scan_region, AreaIo, ConfigAreaFile};
use super::header::{AreaHeader, NgaBlockEntry};
use super::index::{
    decode_id_index, decode_pid_index, encode_id_index, encode_pid_index, merge_id_index, merge_pid_index,
    read_region, IdIndexEntry, PidIndexEntry,
};
use super::RestructureMode;

/// What a restructure did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestructureReport {
    pub mode: Option<RestructureMode>,
    /// Bytes read from old historical regions plus newly historized records
    pub historical_bytes_read: u64,
    /// Bytes written to the new NGA and NGDyn regions
    pub historical_bytes_written: u64,
    /// Records moved from the mixed set into a historical region
    pub records_historized: usize,
    /// Records dropped for good
    pub records_dropped: usize,
    pub gaps_removed: usize,
    /// Records re-appended to the new mixed set
    pub mixed_records_kept: usize,
    pub file_size_before: u64,
    pub file_size_after: u64,
}

/// A mixed-set record on its way into history
struct Historize {
    id: u64,
    /// Position in the old mixed set
    position: u64,
    pid_hash: i32,
    has_pid: bool,
    raw: Vec<u8>,
}

#[derive(Default)]
struct Plan {
    config_by_version: BTreeMap<u16, Vec<Historize>>,
    /// Sorted by (invalidation time, id)
    dynamic: Vec<(i64, Historize)>,
    /// Mixed-set positions that stay in the mixed set
    keep: HashSet<u64>,
    /// Mixed-set positions that leave the mixed set
    leaving: HashSet<u64>,
    /// Resident records dropped for good: (id, position)
    dropped: Vec<(u64, u64)>,
}

struct Build {
    header: AreaHeader,
    header_len: u64,
    relocations: HashMap<Location, Location>,
    historized: HashSet<u64>,
    dropped: HashSet<u64>,
    report: RestructureReport,
}

/// Destination file plus the running position after the header
struct RegionWriter {
    writer: BufWriter<File>,
    pos: u64,
}

impl RegionWriter {
    fn create(path: &Path, header_len: u64, buffer_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::with_capacity(buffer_size, file);
        writer.write_all(&vec![0u8; header_len as usize])?;
        Ok(Self { writer, pos: 0 })
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    fn copy_from(&mut self, file: &File, start: u64, len: u64, buffer_size: usize) -> Result<()> {
        let mut reader = BufReader::with_capacity(buffer_size, file);
        reader.seek(SeekFrom::Start(start))?;
        let copied = io::copy(&mut reader.take(len), &mut self.writer)?;
        if copied != len {
            return Err(StoreError::Format(format!(
                "Historical region at {} truncated: {} of {} bytes",
                start, copied, len
            )));
        }
        self.pos += len;
        Ok(())
    }

    /// Flush, write the header at offset 0 and sync
    fn finish(self, header: &[u8]) -> Result<u64> {
        let mut file = self.writer.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(header)?;
        file.sync_all()?;
        Ok(file.metadata()?.len())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

impl ConfigAreaFile {
    /// Compact the area file and move newly invalid objects into history
    ///
    /// Runs under the exclusive restructure lock. On error the previous file
    /// stays live and nothing in memory changes.
    pub fn restructure(&self, mode: RestructureMode) -> Result<RestructureReport> {
        self.ensure_open()?;
        let _guard = self.restructure_lock.write();
        self.flush_locked()?;

        let mut io = self.io.lock();
        let pending: HashSet<u64> = if mode == RestructureMode::DeleteObjectsPermanently {
            self.deletion.lock().pending().clone()
        } else {
            HashSet::new()
        };

        let new_path = with_suffix(self.path(), ".new");
        let built = self
            .plan_restructure(&io, mode, &pending)
            .and_then(|plan| self.write_restructured(&io, &plan, mode, &pending, &new_path));
        let build = match built {
            Ok(build) => build,
            Err(e) => {
                let _ = fs::remove_file(&new_path);
                return Err(StoreError::Restructure(e.to_string()));
            }
        };

        let Build {
            header,
            header_len,
            relocations,
            historized,
            dropped,
            mut report,
        } = build;
        let nga_blocks = header.nga_blocks.clone();
        self.swap_files(&mut io, &new_path, header, header_len)?;
        report.file_size_after = io.file_len;
        drop(io);

        let patched = self.locations.relocate(&relocations);
        {
            let mut resident = self.resident.write();
            for id in historized.iter().chain(dropped.iter()) {
                resident.remove(*id);
            }
        }
        self.times.write().set_authority_from(&nga_blocks);

        if !dropped.is_empty() {
            let mut deletion = self.deletion.lock();
            deletion.forget(&dropped);
            if let Err(e) = deletion.save() {
                warn!(area = %self.area_pid(), error = %e, "Could not save deletion indices after restructure");
            }
        }

        info!(
            area = %self.area_pid(),
            ?mode,
            historized = report.records_historized,
            dropped = report.records_dropped,
            gaps_removed = report.gaps_removed,
            relocated = patched,
            size_before = report.file_size_before,
            size_after = report.file_size_after,
            "Restructured area file"
        );
        Ok(report)
    }

    /// Sort the resident objects into what moves, stays or goes
    fn plan_restructure(&self, io: &AreaIo, mode: RestructureMode, pending: &HashSet<u64>) -> Result<Plan> {
        let last_done = io.header.last_restructured_version();
        let mut plan = Plan::default();
        let resident = self.resident.read();

        for object in resident.invalid.values() {
            let Location::Mixed(pos) = object.location().get() else {
                continue;
            };
            match object {
                ObjectInfo::Configuration(c) => {
                    let invalid = c.first_invalid_version();
                    if invalid > last_done && invalid <= self.active_version {
                        plan.config_by_version
                            .entry(invalid)
                            .or_default()
                            .push(historize(io, object, pos)?);
                        plan.leaving.insert(pos);
                    } else {
                        plan.keep.insert(pos);
                    }
                }
                ObjectInfo::Dynamic(d) => {
                    if d.simulation_variant() > 0
                        || (mode == RestructureMode::DeleteObjectsPermanently && pending.contains(&d.id()))
                    {
                        plan.dropped.push((d.id(), pos));
                    } else {
                        plan.dynamic.push((d.first_invalid_time(), historize(io, object, pos)?));
                    }
                    plan.leaving.insert(pos);
                }
            }
        }

        let staying = resident
            .current
            .values()
            .chain(resident.future.values())
            .chain(resident.simulation.values().flat_map(|objects| objects.values()));
        for object in staying {
            if pending.contains(&object.id()) {
                warn!(id = object.id(), "Object pending deletion is still valid, keeping it");
            }
            if let Location::Mixed(pos) = object.location().get() {
                plan.keep.insert(pos);
            }
        }

        for records in plan.config_by_version.values_mut() {
            records.sort_by_key(|h| h.id);
        }
        plan.dynamic.sort_by_key(|(time, h)| (*time, h.id));
        Ok(plan)
    }

    fn write_restructured(
        &self,
        io: &AreaIo,
        plan: &Plan,
        mode: RestructureMode,
        pending: &HashSet<u64>,
        new_path: &Path,
    ) -> Result<Build> {
        let old = &io.header;
        let old_base = io.header_len;
        let buffer = self.config.io_buffer_size;
        let times = self.times.read().clone();
        let now = now_millis();

        let mut header = old.clone();
        let old_blocks = old.nga_blocks.len();
        let last_done = old.last_restructured_version();
        if self.active_version > last_done {
            for version in last_done + 1..=self.active_version {
                header.nga_blocks.push(NgaBlockEntry {
                    offset: None,
                    version,
                    activation_time: times.local_or_next(version).unwrap_or(now),
                });
            }
        }
        // Offsets are fixed width, so the final header has the same size
        let header_len = header.encode()?.len() as u64;
        let mut out = RegionWriter::create(new_path, header_len, buffer)?;

        let mut report = RestructureReport {
            mode: Some(mode),
            file_size_before: io.file_len,
            ..Default::default()
        };
        let mut relocations: HashMap<Location, Location> = HashMap::new();
        let mut new_ids: Vec<IdIndexEntry> = Vec::new();
        let mut new_pids: Vec<PidIndexEntry> = Vec::new();
        let mut historized = HashSet::new();
        let mut dropped = HashSet::new();

        // ---------------------------------------------------------------------
        // Old NGA blocks
        // ---------------------------------------------------------------------
        let mut config_moves: HashMap<u64, u64> = HashMap::new();
        let mut removed_config: HashSet<u64> = HashSet::new();
        if mode == RestructureMode::PreserveGaps {
            out.copy_from(&io.file, old_base, old.ngdyn_start, buffer)?;
            report.historical_bytes_read += old.ngdyn_start;
            report.historical_bytes_written += old.ngdyn_start;
        } else {
            for i in 0..old_blocks {
                let block_start = out.pos;
                let mut kept = false;
                if let Some((from, to)) = old.nga_block_range(i) {
                    scan_historical(&io.file, old_base + from, old_base + to, buffer, |pos, raw| {
                        report.historical_bytes_read += raw.len() as u64;
                        let old_offset = pos - old_base;
                        if is_gap(raw) {
                            report.gaps_removed += 1;
                            removed_config.insert(old_offset);
                            return Ok(());
                        }
                        if old_offset != out.pos {
                            config_moves.insert(old_offset, out.pos);
                        }
                        out.write(raw)?;
                        report.historical_bytes_written += raw.len() as u64;
                        kept = true;
                        Ok(())
                    })?;
                }
                header.nga_blocks[i].offset = kept.then_some(block_start);
            }
        }

        // ---------------------------------------------------------------------
        // New NGA blocks
        // ---------------------------------------------------------------------
        for i in old_blocks..header.nga_blocks.len() {
            let version = header.nga_blocks[i].version;
            let block_start = out.pos;
            let records = plan.config_by_version.get(&version).map(Vec::as_slice).unwrap_or(&[]);
            for h in records {
                let offset = HistoricalOffset::Config(out.pos);
                append_historized(&mut out, h, offset, &mut new_ids, &mut new_pids)?;
                relocations.insert(Location::Mixed(h.position), Location::Historical(offset));
                report.historical_bytes_read += h.raw.len() as u64;
                report.historical_bytes_written += h.raw.len() as u64;
                report.records_historized += 1;
                historized.insert(h.id);
            }
            header.nga_blocks[i].offset = (!records.is_empty()).then_some(block_start);
        }

        // ---------------------------------------------------------------------
        // NGDyn
        // ---------------------------------------------------------------------
        header.ngdyn_start = out.pos;
        let new_dyn_base = out.pos;
        let old_dyn_base = old_base + old.ngdyn_start;
        let old_dyn_end = old_base + old.id_index_start;
        let mut fresh = plan.dynamic.iter().peekable();
        let mut dynamic_moves: HashMap<u64, u64> = HashMap::new();
        let mut removed_dynamic: HashSet<u64> = HashSet::new();
        let mut fresh_positions: Vec<(&Historize, HistoricalOffset)> = Vec::new();

        scan_historical(&io.file, old_dyn_base, old_dyn_end, buffer, |pos, raw| {
            report.historical_bytes_read += raw.len() as u64;
            let old_offset = pos - old_dyn_base;

            let record = match decode_slice(raw)? {
                None => {
                    if mode == RestructureMode::PreserveGaps {
                        out.write(raw)?;
                        report.historical_bytes_written += raw.len() as u64;
                    } else {
                        report.gaps_removed += 1;
                        removed_dynamic.insert(old_offset);
                    }
                    return Ok(());
                }
                Some(Record::Dynamic(r)) => r,
                Some(Record::Configuration(r)) => {
                    return Err(StoreError::Format(format!(
                        "Configuration record {} inside the NGDyn block",
                        r.id
                    )));
                }
            };

            if mode == RestructureMode::DeleteObjectsPermanently && pending.contains(&record.id) {
                if record.first_invalid_time != 0 && record.simulation_variant == 0 {
                    dropped.insert(record.id);
                    removed_dynamic.insert(old_offset);
                    relocations.insert(
                        Location::Historical(HistoricalOffset::Dynamic(old_offset)),
                        Location::Deleted,
                    );
                    report.records_dropped += 1;
                    return Ok(());
                }
                warn!(id = record.id, "Object pending deletion is not an invalid dynamic object, keeping it");
            }

            while let Some((time, h)) = fresh.peek() {
                if *time >= record.first_invalid_time {
                    break;
                }
                let offset = HistoricalOffset::Dynamic(out.pos - new_dyn_base);
                append_historized(&mut out, h, offset, &mut new_ids, &mut new_pids)?;
                fresh_positions.push((h, offset));
                report.historical_bytes_read += h.raw.len() as u64;
                report.historical_bytes_written += h.raw.len() as u64;
                fresh.next();
            }

            let new_offset = out.pos - new_dyn_base;
            if new_offset != old_offset {
                dynamic_moves.insert(old_offset, new_offset);
            }
            out.write(raw)?;
            report.historical_bytes_written += raw.len() as u64;
            Ok(())
        })?;

        for (_, h) in fresh {
            let offset = HistoricalOffset::Dynamic(out.pos - new_dyn_base);
            append_historized(&mut out, h, offset, &mut new_ids, &mut new_pids)?;
            fresh_positions.push((h, offset));
            report.historical_bytes_read += h.raw.len() as u64;
            report.historical_bytes_written += h.raw.len() as u64;
        }

        for (h, offset) in fresh_positions {
            relocations.insert(Location::Mixed(h.position), Location::Historical(offset));
            report.records_historized += 1;
            historized.insert(h.id);
        }
        for (old_offset, new_offset) in &config_moves {
            relocations.insert(
                Location::Historical(HistoricalOffset::Config(*old_offset)),
                Location::Historical(HistoricalOffset::Config(*new_offset)),
            );
        }
        for (old_offset, new_offset) in &dynamic_moves {
            relocations.insert(
                Location::Historical(HistoricalOffset::Dynamic(*old_offset)),
                Location::Historical(HistoricalOffset::Dynamic(*new_offset)),
            );
        }
        for &(id, pos) in &plan.dropped {
            relocations.insert(Location::Mixed(pos), Location::Deleted);
            dropped.insert(id);
            report.records_dropped += 1;
        }

        // ---------------------------------------------------------------------
        // Indices
        // ---------------------------------------------------------------------
        let remap = |offset: HistoricalOffset| match offset {
            HistoricalOffset::Config(o) if removed_config.contains(&o) => None,
            HistoricalOffset::Config(o) => Some(HistoricalOffset::Config(config_moves.get(&o).copied().unwrap_or(o))),
            HistoricalOffset::Dynamic(o) if removed_dynamic.contains(&o) => None,
            HistoricalOffset::Dynamic(o) => {
                Some(HistoricalOffset::Dynamic(dynamic_moves.get(&o).copied().unwrap_or(o)))
            }
        };

        let old_ids: Vec<IdIndexEntry> = decode_id_index(&read_region(
            &io.file,
            old_base + old.id_index_start,
            old.pid_index_start - old.id_index_start,
        )?)?
        .into_iter()
        .filter_map(|e| remap(e.offset).map(|offset| IdIndexEntry { id: e.id, offset }))
        .collect();
        let old_pids: Vec<PidIndexEntry> = decode_pid_index(&read_region(
            &io.file,
            old_base + old.pid_index_start,
            old.mixed_set_start - old.pid_index_start,
        )?)?
        .into_iter()
        .filter_map(|e| {
            remap(e.offset).map(|offset| PidIndexEntry {
                pid_hash: e.pid_hash,
                offset,
            })
        })
        .collect();

        new_ids.sort_by_key(|e| e.id);
        new_pids.sort_by_key(|e| e.pid_hash);
        let ids = merge_id_index(old_ids, new_ids);
        let pids = merge_pid_index(old_pids, new_pids);

        header.id_index_start = out.pos;
        out.write(&encode_id_index(&ids))?;
        header.pid_index_start = out.pos;
        out.write(&encode_pid_index(&pids))?;
        header.mixed_set_start = out.pos;

        // ---------------------------------------------------------------------
        // Mixed set
        // ---------------------------------------------------------------------
        let old_mixed = old_base + old.mixed_set_start;
        scan_region(&io.file, old_mixed, io.file_len, buffer, |pos, raw| {
            if is_gap(raw) {
                return Ok(());
            }
            if plan.keep.contains(&pos) {
                let new_pos = header_len + out.pos;
                if new_pos != pos {
                    relocations.insert(Location::Mixed(pos), Location::Mixed(new_pos));
                }
                out.write(raw)?;
                report.mixed_records_kept += 1;
            } else if !plan.leaving.contains(&pos) {
                warn!(position = pos, "Dropping unreferenced mixed-set record");
            }
            Ok(())
        })?;

        let header_bytes = header.encode_to_size(header_len)?;
        report.file_size_after = out.finish(&header_bytes)?;

        debug!(
            ids = ids.len(),
            pids = pids.len(),
            relocations = relocations.len(),
            "Built restructured area file"
        );
        Ok(Build {
            header,
            header_len,
            relocations,
            historized,
            dropped,
            report,
        })
    }

    /// Replace the live file with the rebuilt one
    ///
    /// `live → live.Old`, then `new → live`; the first rename is undone if the
    /// second one fails.
    fn swap_files(&self, io: &mut AreaIo, new_path: &Path, header: AreaHeader, header_len: u64) -> Result<()> {
        let path = self.path();
        let backup = with_suffix(path, ".Old");
        let abort = |message: String| {
            let _ = fs::remove_file(new_path);
            StoreError::Restructure(message)
        };

        match fs::remove_file(&backup) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(abort(format!("cannot remove {}: {}", backup.display(), e))),
        }
        if let Err(e) = fs::rename(path, &backup) {
            return Err(abort(format!("cannot rename live file to {}: {}", backup.display(), e)));
        }
        if let Err(e) = fs::rename(new_path, path) {
            let _ = fs::rename(&backup, path);
            return Err(abort(format!("cannot move rebuilt file into place: {}", e)));
        }

        let reopened = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .and_then(|file| file.try_lock_exclusive().map(|_| file));
        let file = match reopened {
            Ok(file) => file,
            Err(e) => {
                let _ = fs::rename(path, new_path);
                let _ = fs::rename(&backup, path);
                return Err(abort(format!("cannot reopen rebuilt file: {}", e)));
            }
        };

        let file_len = file.metadata()?.len();
        let previous = std::mem::replace(&mut io.file, file);
        if let Err(e) = FileExt::unlock(&previous) {
            debug!(error = %e, "Unlocking replaced area file failed");
        }
        io.header = header;
        io.header_len = header_len;
        io.file_len = file_len;
        Ok(())
    }
}

fn historize(io: &AreaIo, object: &ObjectInfo, pos: u64) -> Result<Historize> {
    Ok(Historize {
        id: object.id(),
        position: pos,
        pid_hash: object.pid_hash(),
        has_pid: !object.pid().is_empty(),
        raw: io.read_raw_at(pos)?,
    })
}

fn append_historized(
    out: &mut RegionWriter,
    h: &Historize,
    offset: HistoricalOffset,
    new_ids: &mut Vec<IdIndexEntry>,
    new_pids: &mut Vec<PidIndexEntry>,
) -> Result<()> {
    out.write(&h.raw)?;
    new_ids.push(IdIndexEntry { id: h.id, offset });
    if h.has_pid {
        new_pids.push(PidIndexEntry {
            pid_hash: h.pid_hash,
            offset,
        });
    }
    Ok(())
}
