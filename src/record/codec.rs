//! Record codec
//!
//! Encoding and decoding of single records plus payload compression.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Result, StoreError};

use super::{
    ConfigurationRecord, DynamicRecord, Record, COMMON_HEADER_SIZE, CONFIGURATION_HEADER_SIZE,
    DYNAMIC_HEADER_SIZE, ID_OFFSET, KIND_CONFIGURATION, KIND_DYNAMIC, LENGTH_FIELD_SIZE,
};

/// Upper bound for a single record (64 MB)
pub const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

// =============================================================================
// Decoding
// =============================================================================

/// Read the raw bytes of the next record, length field included
///
/// Leaves the reader positioned exactly after the declared length.
pub fn read_raw<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = i32::from_be_bytes(len_bytes);

    if len < COMMON_HEADER_SIZE as i32 || len as u32 > MAX_RECORD_SIZE {
        return Err(StoreError::Format(format!("Invalid record length: {}", len)));
    }

    let mut raw = vec![0u8; LENGTH_FIELD_SIZE as usize + len as usize];
    raw[..4].copy_from_slice(&len_bytes);
    reader.read_exact(&mut raw[4..])?;
    Ok(raw)
}

/// True if the raw record bytes (length field included) form a gap
pub fn is_gap(raw: &[u8]) -> bool {
    let id = (ID_OFFSET as usize)..(ID_OFFSET as usize + 8);
    raw.get(id).map_or(false, |bytes| bytes.iter().all(|b| *b == 0))
}

/// Decode the next record from a stream
///
/// Returns `Ok(None)` for a gap.
pub fn decode<R: Read>(reader: &mut R) -> Result<Option<Record>> {
    decode_sized(reader).map(|(_, record)| record)
}

/// Decode the next record and report how many bytes it occupied
pub fn decode_sized<R: Read>(reader: &mut R) -> Result<(u64, Option<Record>)> {
    let raw = read_raw(reader)?;
    let record = decode_slice(&raw)?;
    Ok((raw.len() as u64, record))
}

/// Decode a record from its raw bytes (length field included)
pub fn decode_slice(raw: &[u8]) -> Result<Option<Record>> {
    let mut buf = raw;
    if buf.remaining() < (LENGTH_FIELD_SIZE + COMMON_HEADER_SIZE) as usize {
        return Err(StoreError::Format(format!(
            "Incomplete record header: {} bytes",
            buf.remaining()
        )));
    }

    let len = buf.get_i32() as usize;
    if buf.remaining() != len {
        return Err(StoreError::Format(format!(
            "Record length mismatch: declared {}, got {}",
            len,
            buf.remaining()
        )));
    }

    let id = buf.get_u64();
    if id == 0 {
        return Ok(None);
    }

    let pid_hash = buf.get_i32();
    let type_id = buf.get_u64();
    let kind = buf.get_u8();

    match kind {
        KIND_CONFIGURATION => {
            let payload = payload_slice(buf, len, CONFIGURATION_HEADER_SIZE, 4)?;
            let first_valid_version = buf.get_u16();
            let first_invalid_version = buf.get_u16();
            Ok(Some(Record::Configuration(ConfigurationRecord {
                id,
                pid_hash,
                type_id,
                first_valid_version,
                first_invalid_version,
                payload,
            })))
        }
        KIND_DYNAMIC => {
            let payload = payload_slice(buf, len, DYNAMIC_HEADER_SIZE, 18)?;
            let first_valid_time = buf.get_i64();
            let first_invalid_time = buf.get_i64();
            let simulation_variant = buf.get_i16();
            Ok(Some(Record::Dynamic(DynamicRecord {
                id,
                pid_hash,
                type_id,
                first_valid_time,
                first_invalid_time,
                simulation_variant,
                payload,
            })))
        }
        other => Err(StoreError::Format(format!(
            "Unknown record kind {} for id {}",
            other, id
        ))),
    }
}

/// Copy the payload that follows `validity_size` bytes of validity fields
fn payload_slice(buf: &[u8], len: usize, header_size: u64, validity_size: usize) -> Result<Vec<u8>> {
    if len < header_size as usize {
        return Err(StoreError::Format(format!(
            "Record too short for its kind: {} < {}",
            len, header_size
        )));
    }
    Ok(buf[validity_size..].to_vec())
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode a record into a stream, returning the exact number of bytes written
pub fn encode<W: Write>(record: &Record, writer: &mut W) -> Result<usize> {
    let bytes = encode_to_vec(record)?;
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Encode a record into a fresh buffer
pub fn encode_to_vec(record: &Record) -> Result<Vec<u8>> {
    let total = record.encoded_len();
    if total - LENGTH_FIELD_SIZE > MAX_RECORD_SIZE as u64 {
        return Err(StoreError::Format(format!(
            "Record {} too large: {} bytes",
            record.id(),
            total
        )));
    }

    let mut buf = BytesMut::with_capacity(total as usize);
    buf.put_i32((total - LENGTH_FIELD_SIZE) as i32);

    match record {
        Record::Configuration(r) => {
            buf.put_u64(r.id);
            buf.put_i32(r.pid_hash);
            buf.put_u64(r.type_id);
            buf.put_u8(KIND_CONFIGURATION);
            buf.put_u16(r.first_valid_version);
            buf.put_u16(r.first_invalid_version);
            buf.put_slice(&r.payload);
        }
        Record::Dynamic(r) => {
            buf.put_u64(r.id);
            buf.put_i32(r.pid_hash);
            buf.put_u64(r.type_id);
            buf.put_u8(KIND_DYNAMIC);
            buf.put_i64(r.first_valid_time);
            buf.put_i64(r.first_invalid_time);
            buf.put_i16(r.simulation_variant);
            buf.put_slice(&r.payload);
        }
    }

    Ok(buf.to_vec())
}

// =============================================================================
// Payload Compression
// =============================================================================

/// Deflate a serialized payload
pub fn compress_payload(raw: &[u8], level: Compression) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2 + 16), level);
    encoder
        .write_all(raw)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| StoreError::Compression(e.to_string()))
}

/// Inflate a stored payload
pub fn decompress_payload(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut raw = Vec::with_capacity(compressed.len() * 2);
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    Ok(raw)
}
