//! Sorted Indices
//!
//! The ID index and the PID-hash index of the historical regions. Both are
//! flat arrays of 16-byte entries sorted by key:
//!
//! ```text
//! ┌──────────────────┬──────────────────────┐
//! │ Key (8)          │ Position (8, signed) │
//! └──────────────────┴──────────────────────┘
//! ```
//!
//! The ID index holds one entry per id. The PID-hash index holds one entry
//! per object, so several entries may share a hash; lookups return the whole
//! run and callers must compare the literal pid.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, StoreError};
use crate::object::HistoricalOffset;

/// Bytes per index entry
pub const INDEX_ENTRY_SIZE: u64 = 16;

/// Entry of the ID index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdIndexEntry {
    pub id: u64,
    pub offset: HistoricalOffset,
}

/// Entry of the PID-hash index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidIndexEntry {
    pub pid_hash: i32,
    pub offset: HistoricalOffset,
}

// =============================================================================
// Encoding
// =============================================================================

pub fn encode_id_index(entries: &[IdIndexEntry]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(entries.len() * INDEX_ENTRY_SIZE as usize);
    for entry in entries {
        buf.put_u64(entry.id);
        buf.put_i64(entry.offset.to_index_position());
    }
    buf.to_vec()
}

pub fn encode_pid_index(entries: &[PidIndexEntry]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(entries.len() * INDEX_ENTRY_SIZE as usize);
    for entry in entries {
        buf.put_i64(entry.pid_hash as i64);
        buf.put_i64(entry.offset.to_index_position());
    }
    buf.to_vec()
}

pub fn decode_id_index(bytes: &[u8]) -> Result<Vec<IdIndexEntry>> {
    check_index_len(bytes)?;
    let mut buf = bytes;
    let mut entries = Vec::with_capacity(bytes.len() / INDEX_ENTRY_SIZE as usize);
    while buf.has_remaining() {
        let id = buf.get_u64();
        let offset = HistoricalOffset::from_index_position(buf.get_i64());
        entries.push(IdIndexEntry { id, offset });
    }
    Ok(entries)
}

pub fn decode_pid_index(bytes: &[u8]) -> Result<Vec<PidIndexEntry>> {
    check_index_len(bytes)?;
    let mut buf = bytes;
    let mut entries = Vec::with_capacity(bytes.len() / INDEX_ENTRY_SIZE as usize);
    while buf.has_remaining() {
        let pid_hash = buf.get_i64() as i32;
        let offset = HistoricalOffset::from_index_position(buf.get_i64());
        entries.push(PidIndexEntry { pid_hash, offset });
    }
    Ok(entries)
}

fn check_index_len(bytes: &[u8]) -> Result<()> {
    if bytes.len() as u64 % INDEX_ENTRY_SIZE != 0 {
        return Err(StoreError::Format(format!(
            "Index length {} is not a multiple of {}",
            bytes.len(),
            INDEX_ENTRY_SIZE
        )));
    }
    Ok(())
}

// =============================================================================
// Search
// =============================================================================

/// First position in `[0, count)` whose key is `>= key`
///
/// `key_at` reads the key of one entry; it is called O(log n) times.
fn lower_bound<F>(count: u64, key: i128, mut key_at: F) -> Result<u64>
where
    F: FnMut(u64) -> Result<i128>,
{
    let (mut lo, mut hi) = (0u64, count);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if key_at(mid)? < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Binary search an in-memory ID index
pub fn search_id(entries: &[IdIndexEntry], id: u64) -> Option<HistoricalOffset> {
    let pos = entries.partition_point(|e| e.id < id);
    entries.get(pos).filter(|e| e.id == id).map(|e| e.offset)
}

/// All entries of an in-memory PID-hash index that share `pid_hash`
pub fn pid_hash_run(entries: &[PidIndexEntry], pid_hash: i32) -> &[PidIndexEntry] {
    let start = entries.partition_point(|e| e.pid_hash < pid_hash);
    let end = start + entries[start..].partition_point(|e| e.pid_hash == pid_hash);
    &entries[start..end]
}

/// Binary search the on-disk ID index starting at absolute position `start`
pub(crate) fn search_id_on_disk(
    file: &File,
    start: u64,
    count: u64,
    id: u64,
) -> Result<Option<HistoricalOffset>> {
    let mut reader = file;
    let pos = lower_bound(count, id as i128, |i| {
        read_entry(&mut reader, start, i).map(|(key, _)| key as u64 as i128)
    })?;
    if pos == count {
        return Ok(None);
    }
    let (key, position) = read_entry(&mut reader, start, pos)?;
    if key as u64 == id {
        Ok(Some(HistoricalOffset::from_index_position(position)))
    } else {
        Ok(None)
    }
}

/// Every on-disk PID-hash index entry matching `pid_hash`
pub(crate) fn search_pid_hash_on_disk(
    file: &File,
    start: u64,
    count: u64,
    pid_hash: i32,
) -> Result<Vec<HistoricalOffset>> {
    let mut reader = file;
    let first = lower_bound(count, pid_hash as i128, |i| {
        read_entry(&mut reader, start, i).map(|(key, _)| key as i128)
    })?;

    let mut offsets = Vec::new();
    let mut i = first;
    while i < count {
        let (key, position) = read_entry(&mut reader, start, i)?;
        if key != pid_hash as i64 {
            break;
        }
        offsets.push(HistoricalOffset::from_index_position(position));
        i += 1;
    }
    Ok(offsets)
}

fn read_entry(reader: &mut &File, start: u64, i: u64) -> Result<(i64, i64)> {
    reader.seek(SeekFrom::Start(start + i * INDEX_ENTRY_SIZE))?;
    let mut entry = [0u8; INDEX_ENTRY_SIZE as usize];
    reader.read_exact(&mut entry)?;
    let mut buf = &entry[..];
    Ok((buf.get_i64(), buf.get_i64()))
}

/// Load a whole index region into memory
pub(crate) fn read_region(file: &File, start: u64, len: u64) -> Result<Vec<u8>> {
    let mut reader = file;
    reader.seek(SeekFrom::Start(start))?;
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

// =============================================================================
// Merging
// =============================================================================

/// Merge two ID indices; entries of `newer` replace entries of `older`
/// with the same id
pub fn merge_id_index(older: Vec<IdIndexEntry>, newer: Vec<IdIndexEntry>) -> Vec<IdIndexEntry> {
    let mut merged = Vec::with_capacity(older.len() + newer.len());
    let mut older = older.into_iter().peekable();
    let mut newer = newer.into_iter().peekable();

    loop {
        let order = match (older.peek(), newer.peek()) {
            (Some(a), Some(b)) => a.id.cmp(&b.id),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => break,
        };
        match order {
            Ordering::Less => merged.extend(older.next()),
            Ordering::Equal => {
                older.next();
                merged.extend(newer.next());
            }
            Ordering::Greater => merged.extend(newer.next()),
        }
    }
    merged
}

/// Merge two PID-hash indices, keeping every entry (equal hashes are legal)
pub fn merge_pid_index(older: Vec<PidIndexEntry>, newer: Vec<PidIndexEntry>) -> Vec<PidIndexEntry> {
    let mut merged = Vec::with_capacity(older.len() + newer.len());
    let mut older = older.into_iter().peekable();
    let mut newer = newer.into_iter().peekable();

    loop {
        let order = match (older.peek(), newer.peek()) {
            (Some(a), Some(b)) => a.pid_hash.cmp(&b.pid_hash),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => break,
        };
        match order {
            Ordering::Less | Ordering::Equal => merged.extend(older.next()),
            Ordering::Greater => merged.extend(newer.next()),
        }
    }
    merged
}
