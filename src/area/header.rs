//! Area File Header
//!
//! Tagged header block at the start of every area file.
//!
//! ## Format
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────────┬─────
//! │ Size (4) │ Tag (2)  │ Len (2)  │ Payload     │ ...
//! └──────────┴──────────┴──────────┴─────────────┴─────
//! ```
//! `Size` covers the whole header including itself. Unknown tags are skipped.

use std::io::Read;

use bytes::{Buf, BufMut, BytesMut};
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::record::payload::{decode_latin1, encode_latin1};

/// Current record layout version
pub const RECORD_FORMAT_VERSION: u16 = 1;

/// Upper bound for a header (16 MB)
const MAX_HEADER_SIZE: i32 = 16 * 1024 * 1024;

const TAG_VERSIONS: u16 = 1;
const TAG_NGA_TABLE: u16 = 2;
const TAG_NGDYN_START: u16 = 3;
const TAG_ID_INDEX_START: u16 = 4;
const TAG_PID_INDEX_START: u16 = 5;
const TAG_MIXED_SET_START: u16 = 6;
const TAG_AREA_PID: u16 = 7;
const TAG_LAST_DYNAMIC_CHANGE: u16 = 8;
const TAG_LAST_CONFIG_CHANGE: u16 = 9;
const TAG_LAST_DATA_CHANGE: u16 = 10;
const TAG_RECORD_FORMAT_VERSION: u16 = 11;
const TAG_SERIALIZER_VERSION: u16 = 12;
const TAG_PADDING: u16 = 0xFFFF;

/// Tag (2) + Len (2)
const TAG_OVERHEAD: usize = 4;

/// Offset (8) + Version (2) + ActivationTime (8)
const NGA_ENTRY_SIZE: usize = 18;

/// Entries per NGA table tag so the payload length fits in a u16
const NGA_ENTRIES_PER_TAG: usize = u16::MAX as usize / NGA_ENTRY_SIZE;

/// One NGA block: configuration objects invalidated in `version`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NgaBlockEntry {
    /// Offset relative to the end of the header; `None` for an empty block
    pub offset: Option<u64>,
    pub version: u16,
    pub activation_time: i64,
}

/// Decoded header of an area file
///
/// All region starts are relative to the end of the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaHeader {
    pub active_version: u16,
    pub next_active_version: u16,
    pub nga_blocks: Vec<NgaBlockEntry>,
    pub ngdyn_start: u64,
    pub id_index_start: u64,
    pub pid_index_start: u64,
    pub mixed_set_start: u64,
    pub area_pid: String,
    pub last_dynamic_change: i64,
    pub last_config_change: i64,
    pub last_data_change: i64,
    pub record_format_version: u16,
    pub serializer_version: u16,
}

impl AreaHeader {
    /// Header of a freshly created, empty area
    pub fn new(area_pid: impl Into<String>, active_version: u16, serializer_version: u16) -> Self {
        Self {
            active_version,
            next_active_version: active_version,
            nga_blocks: Vec::new(),
            ngdyn_start: 0,
            id_index_start: 0,
            pid_index_start: 0,
            mixed_set_start: 0,
            area_pid: area_pid.into(),
            last_dynamic_change: 0,
            last_config_change: 0,
            last_data_change: 0,
            record_format_version: RECORD_FORMAT_VERSION,
            serializer_version,
        }
    }

    /// Highest version that already owns an NGA block (0 if none)
    pub fn last_restructured_version(&self) -> u16 {
        self.nga_blocks.iter().map(|b| b.version).max().unwrap_or(0)
    }

    /// Number of entries in the ID index
    pub fn id_index_len(&self) -> u64 {
        (self.pid_index_start - self.id_index_start) / super::index::INDEX_ENTRY_SIZE
    }

    /// Number of entries in the PID-hash index
    pub fn pid_index_len(&self) -> u64 {
        (self.mixed_set_start - self.pid_index_start) / super::index::INDEX_ENTRY_SIZE
    }

    /// Byte range of NGA block `i`, relative to the end of the header
    ///
    /// Returns `None` for empty blocks.
    pub fn nga_block_range(&self, i: usize) -> Option<(u64, u64)> {
        let start = self.nga_blocks.get(i)?.offset?;
        let end = self.nga_blocks[i + 1..]
            .iter()
            .find_map(|b| b.offset)
            .unwrap_or(self.ngdyn_start);
        Some((start, end))
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    /// Encode the header, size field included
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(128 + self.nga_blocks.len() * NGA_ENTRY_SIZE);
        buf.put_i32(0); // patched below

        put_tag(&mut buf, TAG_RECORD_FORMAT_VERSION, &self.record_format_version.to_be_bytes());
        put_tag(&mut buf, TAG_SERIALIZER_VERSION, &self.serializer_version.to_be_bytes());

        let mut versions = [0u8; 4];
        versions[..2].copy_from_slice(&self.active_version.to_be_bytes());
        versions[2..].copy_from_slice(&self.next_active_version.to_be_bytes());
        put_tag(&mut buf, TAG_VERSIONS, &versions);

        for chunk in self.nga_blocks.chunks(NGA_ENTRIES_PER_TAG) {
            let mut payload = BytesMut::with_capacity(chunk.len() * NGA_ENTRY_SIZE);
            for block in chunk {
                payload.put_i64(block.offset.map(|o| o as i64).unwrap_or(-1));
                payload.put_u16(block.version);
                payload.put_i64(block.activation_time);
            }
            put_tag(&mut buf, TAG_NGA_TABLE, &payload);
        }

        put_tag(&mut buf, TAG_NGDYN_START, &(self.ngdyn_start as i64).to_be_bytes());
        put_tag(&mut buf, TAG_ID_INDEX_START, &(self.id_index_start as i64).to_be_bytes());
        put_tag(&mut buf, TAG_PID_INDEX_START, &(self.pid_index_start as i64).to_be_bytes());
        put_tag(&mut buf, TAG_MIXED_SET_START, &(self.mixed_set_start as i64).to_be_bytes());

        let pid = encode_latin1(&self.area_pid)?;
        if pid.len() > u16::MAX as usize - 2 {
            return Err(StoreError::Format(format!("Area pid too long: {}", self.area_pid)));
        }
        let mut pid_payload = BytesMut::with_capacity(2 + pid.len());
        pid_payload.put_u16(pid.len() as u16);
        pid_payload.put_slice(&pid);
        put_tag(&mut buf, TAG_AREA_PID, &pid_payload);

        put_tag(&mut buf, TAG_LAST_DYNAMIC_CHANGE, &self.last_dynamic_change.to_be_bytes());
        put_tag(&mut buf, TAG_LAST_CONFIG_CHANGE, &self.last_config_change.to_be_bytes());
        put_tag(&mut buf, TAG_LAST_DATA_CHANGE, &self.last_data_change.to_be_bytes());

        let size = buf.len() as i32;
        buf[..4].copy_from_slice(&size.to_be_bytes());
        Ok(buf.to_vec())
    }

    /// Encode the header padded to exactly `size` bytes
    ///
    /// Used for in-place rewrites, where the data region must not move.
    pub fn encode_to_size(&self, size: u64) -> Result<Vec<u8>> {
        let mut bytes = self.encode()?;
        let current = bytes.len() as u64;
        if current == size {
            return Ok(bytes);
        }
        if current > size || size - current < TAG_OVERHEAD as u64 || size - current > u16::MAX as u64 {
            return Err(StoreError::Format(format!(
                "Header of {} bytes cannot be padded to {}",
                current, size
            )));
        }

        let padding = (size - current) as usize - TAG_OVERHEAD;
        let mut buf = BytesMut::from(&bytes[..]);
        put_tag(&mut buf, TAG_PADDING, &vec![0u8; padding]);
        buf[..4].copy_from_slice(&(size as i32).to_be_bytes());
        bytes = buf.to_vec();
        Ok(bytes)
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    /// Read and decode a header from the start of a stream
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        Self::decode_sized(reader).map(|(header, _)| header)
    }

    /// Decode a header and report its declared size in bytes
    pub fn decode_sized<R: Read>(reader: &mut R) -> Result<(Self, u64)> {
        let mut size_bytes = [0u8; 4];
        reader.read_exact(&mut size_bytes)?;
        let size = i32::from_be_bytes(size_bytes);
        if !(4..=MAX_HEADER_SIZE).contains(&size) {
            return Err(StoreError::Format(format!("Invalid header size: {}", size)));
        }

        let mut bytes = vec![0u8; size as usize];
        bytes[..4].copy_from_slice(&size_bytes);
        reader.read_exact(&mut bytes[4..])?;
        Ok((Self::decode_bytes(&bytes)?, size as u64))
    }

    /// Decode a header from its raw bytes, size field included
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;
        if buf.remaining() < 4 {
            return Err(StoreError::Format("Truncated header size".to_string()));
        }
        let size = buf.get_i32();
        if size as usize != bytes.len() {
            return Err(StoreError::Format(format!(
                "Header size mismatch: declared {}, got {}",
                size,
                bytes.len()
            )));
        }

        let mut header = AreaHeader::new(String::new(), 0, 0);
        header.record_format_version = 0;

        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(StoreError::Format("Truncated header tag".to_string()));
            }
            let tag = buf.get_u16();
            let len = buf.get_u16() as usize;
            if buf.remaining() < len {
                return Err(StoreError::Format(format!(
                    "Header tag {} declares {} bytes, {} left",
                    tag,
                    len,
                    buf.remaining()
                )));
            }
            let (payload, rest) = buf.split_at(len);
            buf = rest;
            header.apply_tag(tag, payload)?;
        }

        header.check_regions()?;
        Ok(header)
    }

    /// Regions must appear in file order
    fn check_regions(&self) -> Result<()> {
        let ordered = self.ngdyn_start <= self.id_index_start
            && self.id_index_start <= self.pid_index_start
            && self.pid_index_start <= self.mixed_set_start
            && self
                .nga_blocks
                .iter()
                .filter_map(|b| b.offset)
                .all(|o| o <= self.ngdyn_start);
        if !ordered {
            return Err(StoreError::Format(format!(
                "Header regions out of order: ngdyn={} id={} pid={} mixed={}",
                self.ngdyn_start, self.id_index_start, self.pid_index_start, self.mixed_set_start
            )));
        }
        Ok(())
    }

    fn apply_tag(&mut self, tag: u16, mut payload: &[u8]) -> Result<()> {
        match tag {
            TAG_VERSIONS => {
                expect_len(tag, payload, 4)?;
                self.active_version = payload.get_u16();
                self.next_active_version = payload.get_u16();
            }
            TAG_NGA_TABLE => {
                if payload.len() % NGA_ENTRY_SIZE != 0 {
                    return Err(StoreError::Format(format!(
                        "NGA table length {} is not a multiple of {}",
                        payload.len(),
                        NGA_ENTRY_SIZE
                    )));
                }
                while payload.has_remaining() {
                    let offset = payload.get_i64();
                    let version = payload.get_u16();
                    let activation_time = payload.get_i64();
                    self.nga_blocks.push(NgaBlockEntry {
                        offset: u64::try_from(offset).ok(),
                        version,
                        activation_time,
                    });
                }
            }
            TAG_NGDYN_START => self.ngdyn_start = read_offset(tag, payload)?,
            TAG_ID_INDEX_START => self.id_index_start = read_offset(tag, payload)?,
            TAG_PID_INDEX_START => self.pid_index_start = read_offset(tag, payload)?,
            TAG_MIXED_SET_START => self.mixed_set_start = read_offset(tag, payload)?,
            TAG_AREA_PID => {
                if payload.len() < 2 {
                    return Err(StoreError::Format("Truncated area pid".to_string()));
                }
                let len = payload.get_u16() as usize;
                expect_len(tag, payload, len)?;
                self.area_pid = decode_latin1(payload);
            }
            TAG_LAST_DYNAMIC_CHANGE => {
                expect_len(tag, payload, 8)?;
                self.last_dynamic_change = payload.get_i64();
            }
            TAG_LAST_CONFIG_CHANGE => {
                expect_len(tag, payload, 8)?;
                self.last_config_change = payload.get_i64();
            }
            TAG_LAST_DATA_CHANGE => {
                expect_len(tag, payload, 8)?;
                self.last_data_change = payload.get_i64();
            }
            TAG_RECORD_FORMAT_VERSION => {
                expect_len(tag, payload, 2)?;
                self.record_format_version = payload.get_u16();
            }
            TAG_SERIALIZER_VERSION => {
                expect_len(tag, payload, 2)?;
                self.serializer_version = payload.get_u16();
            }
            TAG_PADDING => {}
            unknown => {
                warn!(tag = unknown, len = payload.len(), "Skipping unknown header tag");
            }
        }
        Ok(())
    }
}

fn put_tag(buf: &mut BytesMut, tag: u16, payload: &[u8]) {
    buf.put_u16(tag);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
}

fn expect_len(tag: u16, payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(StoreError::Format(format!(
            "Header tag {} has {} bytes, expected {}",
            tag,
            payload.len(),
            expected
        )));
    }
    Ok(())
}

fn read_offset(tag: u16, mut payload: &[u8]) -> Result<u64> {
    expect_len(tag, payload, 8)?;
    let offset = payload.get_i64();
    u64::try_from(offset)
        .map_err(|_| StoreError::Format(format!("Negative region offset {} in tag {}", offset, tag)))
}
