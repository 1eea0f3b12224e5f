//! Payload serializer
//!
//! Typed field writer/reader for the uncompressed part of a record. The
//! serializer version is stored in the area header and selects the layout.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, StoreError};
use crate::object::PersistenceMode;

/// Serializer version written by this build
pub const SERIALIZER_VERSION: u16 = 1;

/// Fail with a distinct error for serializer versions this build cannot read
pub fn check_serializer_version(version: u16) -> Result<()> {
    if version == SERIALIZER_VERSION {
        Ok(())
    } else {
        Err(StoreError::UnsupportedSerializerVersion(version))
    }
}

// =============================================================================
// ISO-8859-1
// =============================================================================

/// Encode a string as ISO-8859-1, rejecting characters above U+00FF
pub fn encode_latin1(value: &str) -> Result<Vec<u8>> {
    value
        .chars()
        .map(|c| u8::try_from(u32::from(c)).map_err(|_| StoreError::InvalidPid(value.to_string())))
        .collect()
}

pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

// =============================================================================
// Payload Contents
// =============================================================================

/// Variable part of a configuration object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationPayload {
    pub pid: String,
    pub name: String,
    pub data: BTreeMap<u64, Vec<u8>>,
    pub sets: BTreeMap<String, Vec<u64>>,
}

/// Variable part of a dynamic object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicPayload {
    pub pid: String,
    pub name: String,
    pub persistence: PersistenceMode,
    pub data: BTreeMap<u64, Vec<u8>>,
}

impl ConfigurationPayload {
    pub fn serialize(&self, version: u16) -> Result<Vec<u8>> {
        check_serializer_version(version)?;
        let mut w = PayloadWriter::new();
        w.put_latin1(&self.pid)?;
        w.put_str(&self.name)?;
        w.put_data_sets(&self.data)?;
        w.put_len(self.sets.len())?;
        for (name, members) in &self.sets {
            w.put_str(name)?;
            w.put_len(members.len())?;
            for id in members {
                w.buf.put_u64(*id);
            }
        }
        Ok(w.finish())
    }

    pub fn deserialize(bytes: &[u8], version: u16) -> Result<Self> {
        check_serializer_version(version)?;
        let mut r = PayloadReader::new(bytes);
        let pid = r.get_latin1()?;
        let name = r.get_str()?;
        let data = r.get_data_sets()?;
        let set_count = r.get_len()?;
        let mut sets = BTreeMap::new();
        for _ in 0..set_count {
            let set_name = r.get_str()?;
            let member_count = r.get_len()?;
            let mut members = Vec::with_capacity(member_count);
            for _ in 0..member_count {
                members.push(r.get_u64()?);
            }
            sets.insert(set_name, members);
        }
        Ok(Self { pid, name, data, sets })
    }
}

impl DynamicPayload {
    pub fn serialize(&self, version: u16) -> Result<Vec<u8>> {
        check_serializer_version(version)?;
        let mut w = PayloadWriter::new();
        w.put_latin1(&self.pid)?;
        w.put_str(&self.name)?;
        w.buf.put_u8(self.persistence as u8);
        w.put_data_sets(&self.data)?;
        Ok(w.finish())
    }

    pub fn deserialize(bytes: &[u8], version: u16) -> Result<Self> {
        check_serializer_version(version)?;
        let mut r = PayloadReader::new(bytes);
        let pid = r.get_latin1()?;
        let name = r.get_str()?;
        let persistence = PersistenceMode::from_u8(r.get_u8()?)?;
        let data = r.get_data_sets()?;
        Ok(Self { pid, name, persistence, data })
    }
}

// =============================================================================
// Field Writer / Reader
// =============================================================================

struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    fn new() -> Self {
        Self { buf: BytesMut::with_capacity(256) }
    }

    fn put_len(&mut self, len: usize) -> Result<()> {
        let len = i32::try_from(len)
            .map_err(|_| StoreError::Format(format!("Collection too large: {}", len)))?;
        self.buf.put_i32(len);
        Ok(())
    }

    fn put_short_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u16::try_from(bytes.len())
            .map_err(|_| StoreError::Format(format!("String too long: {} bytes", bytes.len())))?;
        self.buf.put_u16(len);
        self.buf.put_slice(bytes);
        Ok(())
    }

    fn put_str(&mut self, value: &str) -> Result<()> {
        self.put_short_bytes(value.as_bytes())
    }

    fn put_latin1(&mut self, value: &str) -> Result<()> {
        let bytes = encode_latin1(value)?;
        self.put_short_bytes(&bytes)
    }

    fn put_data_sets(&mut self, data: &BTreeMap<u64, Vec<u8>>) -> Result<()> {
        self.put_len(data.len())?;
        for (usage, bytes) in data {
            self.buf.put_u64(*usage);
            self.put_len(bytes.len())?;
            self.buf.put_slice(bytes);
        }
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(StoreError::Format(format!(
                "Truncated payload: need {} bytes, have {}",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn get_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn get_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn get_len(&mut self) -> Result<usize> {
        self.need(4)?;
        let len = self.buf.get_i32();
        usize::try_from(len).map_err(|_| StoreError::Format(format!("Negative length: {}", len)))
    }

    fn get_short_bytes(&mut self) -> Result<&'a [u8]> {
        self.need(2)?;
        let len = self.buf.get_u16() as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn get_str(&mut self) -> Result<String> {
        let bytes = self.get_short_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| StoreError::Format(format!("Invalid UTF-8 string: {}", e)))
    }

    fn get_latin1(&mut self) -> Result<String> {
        Ok(decode_latin1(self.get_short_bytes()?))
    }

    fn get_data_sets(&mut self) -> Result<BTreeMap<u64, Vec<u8>>> {
        let count = self.get_len()?;
        let mut data = BTreeMap::new();
        for _ in 0..count {
            let usage = self.get_u64()?;
            let len = self.get_len()?;
            self.need(len)?;
            let (head, tail) = self.buf.split_at(len);
            self.buf = tail;
            data.insert(usage, head.to_vec());
        }
        Ok(data)
    }
}
