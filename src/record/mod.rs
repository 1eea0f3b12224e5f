//! Record Module
//!
//! One stored object record, in either configuration-object or dynamic-object
//! flavor. The module knows nothing about indices or files.
//!
//! ## Record Format (big-endian)
//! ```text
//! ┌──────────┬────────┬──────────────┬─────────────┬──────────┐
//! │ Len (4)  │ Id (8) │ PidHash (4)  │ TypeId (8)  │ Kind (1) │
//! └──────────┴────────┴──────────────┴─────────────┴──────────┘
//!   Kind 0 (configuration):  ValidVersion (2) | InvalidVersion (2)
//!   Kind 1 (dynamic):        ValidTime (8) | InvalidTime (8) | SimVariant (2)
//! ┌──────────────────────────────────────────────────────────┐
//! │ Deflate payload (Len - fixed header)                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! `Len` counts the bytes after the length field. A record whose id is 0 is a
//! gap: it is skipped by readers but still occupies its declared length.

pub mod codec;
pub mod payload;

pub use codec::{
    compress_payload, decode, decode_sized, decode_slice, decompress_payload, encode, encode_to_vec, is_gap,
    read_raw,
};

// =============================================================================
// Shared Constants
// =============================================================================

/// Size of the leading length field
pub const LENGTH_FIELD_SIZE: u64 = 4;

/// Id (8) + PidHash (4) + TypeId (8) + Kind (1)
pub const COMMON_HEADER_SIZE: u64 = 21;

/// Fixed header after the length field for configuration records
pub const CONFIGURATION_HEADER_SIZE: u64 = COMMON_HEADER_SIZE + 4;

/// Fixed header after the length field for dynamic records
pub const DYNAMIC_HEADER_SIZE: u64 = COMMON_HEADER_SIZE + 18;

/// Position of the id field, relative to the record start
pub const ID_OFFSET: u64 = LENGTH_FIELD_SIZE;

/// Position of `first_invalid_version`, relative to the record start
pub const CONFIGURATION_INVALID_VERSION_OFFSET: u64 = LENGTH_FIELD_SIZE + COMMON_HEADER_SIZE + 2;

/// Position of `first_invalid_time`, relative to the record start
pub const DYNAMIC_INVALID_TIME_OFFSET: u64 = LENGTH_FIELD_SIZE + COMMON_HEADER_SIZE + 8;

pub(crate) const KIND_CONFIGURATION: u8 = 0;
pub(crate) const KIND_DYNAMIC: u8 = 1;

// =============================================================================
// Record Types
// =============================================================================

/// Stored form of a configuration object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationRecord {
    pub id: u64,
    pub pid_hash: i32,
    pub type_id: u64,
    pub first_valid_version: u16,
    pub first_invalid_version: u16,
    /// Compressed payload, exactly as stored
    pub payload: Vec<u8>,
}

/// Stored form of a dynamic object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicRecord {
    pub id: u64,
    pub pid_hash: i32,
    pub type_id: u64,
    pub first_valid_time: i64,
    pub first_invalid_time: i64,
    pub simulation_variant: i16,
    /// Compressed payload, exactly as stored
    pub payload: Vec<u8>,
}

/// A decoded record of either kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Configuration(ConfigurationRecord),
    Dynamic(DynamicRecord),
}

impl Record {
    pub fn id(&self) -> u64 {
        match self {
            Record::Configuration(r) => r.id,
            Record::Dynamic(r) => r.id,
        }
    }

    pub fn pid_hash(&self) -> i32 {
        match self {
            Record::Configuration(r) => r.pid_hash,
            Record::Dynamic(r) => r.pid_hash,
        }
    }

    pub fn type_id(&self) -> u64 {
        match self {
            Record::Configuration(r) => r.type_id,
            Record::Dynamic(r) => r.type_id,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Record::Configuration(r) => &r.payload,
            Record::Dynamic(r) => &r.payload,
        }
    }

    /// Header bytes following the length field
    pub fn header_size(&self) -> u64 {
        match self {
            Record::Configuration(_) => CONFIGURATION_HEADER_SIZE,
            Record::Dynamic(_) => DYNAMIC_HEADER_SIZE,
        }
    }

    /// Total bytes the record occupies on disk, length field included
    pub fn encoded_len(&self) -> u64 {
        LENGTH_FIELD_SIZE + self.header_size() + self.payload().len() as u64
    }
}

// =============================================================================
// Pid Hash
// =============================================================================

/// Polynomial (base 31) string hash of a pid, as stored in records and the
/// PID-hash index.
pub fn pid_hash(pid: &str) -> i32 {
    pid.chars()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}
