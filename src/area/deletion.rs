//! Two-Phase Deletion
//!
//! Historical dynamic objects are removed permanently only after two
//! consecutive marking rounds found them unreferenced:
//!
//! ```text
//!   mark #1: candidate          → locked-for-deletion  (.<area>.0.index)
//!   mark #2: still a candidate  → pending-deletion     (.<area>.1.index)
//!   restructure(DeleteObjectsPermanently) drops pending ids
//! ```
//!
//! ## Side Index Format (big-endian)
//! ```text
//! ┌───────────┬──────────────────┬──────────────┐
//! │ Count (4) │ Count × Id (8)   │ Checksum (8) │
//! └───────────┴──────────────────┴──────────────┘
//! ```
//! A file whose checksum does not match is ignored with a warning.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};

use crate::error::Result;

/// Outcome of one marking round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkOutcome {
    /// Ids now locked for deletion (first mark)
    pub locked: usize,
    /// Ids now pending deletion (second consecutive mark)
    pub pending: usize,
}

/// Locked and pending id sets of one area, backed by two side files
#[derive(Debug)]
pub struct DeletionIndex {
    locked: HashSet<u64>,
    pending: HashSet<u64>,
    locked_path: PathBuf,
    pending_path: PathBuf,
}

impl DeletionIndex {
    /// Load both side indices next to `area_path`; missing or damaged files
    /// count as empty
    pub fn load(area_path: &Path) -> Self {
        let (locked_path, pending_path) = side_index_paths(area_path);
        let locked = read_side_index(&locked_path).into_iter().collect();
        let pending = read_side_index(&pending_path).into_iter().collect();
        Self {
            locked,
            pending,
            locked_path,
            pending_path,
        }
    }

    /// Run one marking round over the ids that are currently unreferenced
    ///
    /// Locked ids that are candidates again become pending; the remaining
    /// candidates become the new locked set. Locked ids that are no longer
    /// candidates are released.
    pub fn mark(&mut self, candidates: &HashSet<u64>) -> MarkOutcome {
        let promoted: Vec<u64> = self.locked.intersection(candidates).copied().collect();
        self.pending.extend(promoted);
        self.locked = candidates
            .iter()
            .filter(|id| !self.pending.contains(id))
            .copied()
            .collect();

        debug!(
            locked = self.locked.len(),
            pending = self.pending.len(),
            "Marked objects for deletion"
        );

        MarkOutcome {
            locked: self.locked.len(),
            pending: self.pending.len(),
        }
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.contains(&id)
    }

    pub fn is_locked(&self, id: u64) -> bool {
        self.locked.contains(&id)
    }

    pub fn pending(&self) -> &HashSet<u64> {
        &self.pending
    }

    pub fn locked(&self) -> &HashSet<u64> {
        &self.locked
    }

    /// Forget ids that were removed from the file
    pub fn forget(&mut self, ids: &HashSet<u64>) {
        self.pending.retain(|id| !ids.contains(id));
        self.locked.retain(|id| !ids.contains(id));
    }

    /// Persist both side indices
    pub fn save(&self) -> Result<()> {
        write_side_index(&self.locked_path, &sorted(&self.locked))?;
        write_side_index(&self.pending_path, &sorted(&self.pending))?;
        Ok(())
    }
}

fn sorted(ids: &HashSet<u64>) -> Vec<u64> {
    let mut ids: Vec<u64> = ids.iter().copied().collect();
    ids.sort_unstable();
    ids
}

/// `.<stem>.0.index` and `.<stem>.1.index` beside the area file
pub fn side_index_paths(area_path: &Path) -> (PathBuf, PathBuf) {
    let dir = area_path.parent().unwrap_or_else(|| Path::new("."));
    let stem = area_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    (
        dir.join(format!(".{}.0.index", stem)),
        dir.join(format!(".{}.1.index", stem)),
    )
}

/// Polynomial checksum over the ids (seed 17, base 31)
pub fn checksum(ids: &[u64]) -> i64 {
    ids.iter()
        .fold(17i64, |h, &id| h.wrapping_mul(31).wrapping_add(id as i64))
}

/// Read a side index; any damage yields an empty list
fn read_side_index(path: &Path) -> Vec<u64> {
    let mut bytes = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            if let Err(e) = file.read_to_end(&mut bytes) {
                warn!(path = %path.display(), error = %e, "Could not read deletion index, ignoring it");
                return Vec::new();
            }
        }
        Err(_) => return Vec::new(),
    }

    let mut buf = &bytes[..];
    if buf.remaining() < 4 {
        warn!(path = %path.display(), "Truncated deletion index, ignoring it");
        return Vec::new();
    }
    let count = buf.get_i32();
    if count < 0 || buf.remaining() != count as usize * 8 + 8 {
        warn!(path = %path.display(), count, "Deletion index size mismatch, ignoring it");
        return Vec::new();
    }

    let ids: Vec<u64> = (0..count).map(|_| buf.get_u64()).collect();
    let stored = buf.get_i64();
    if stored != checksum(&ids) {
        warn!(path = %path.display(), "Deletion index checksum mismatch, ignoring it");
        return Vec::new();
    }
    ids
}

/// Write a side index through a temporary file and rename it into place
fn write_side_index(path: &Path, ids: &[u64]) -> Result<()> {
    let mut buf = BytesMut::with_capacity(4 + ids.len() * 8 + 8);
    buf.put_i32(ids.len() as i32);
    for id in ids {
        buf.put_u64(*id);
    }
    buf.put_i64(checksum(ids));

    let tmp = path.with_extension("index.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_all(&buf)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
