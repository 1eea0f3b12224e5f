//! Error types for areastore
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for areastore operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Area file {0} is locked by another engine")]
    AreaLocked(PathBuf),

    // -------------------------------------------------------------------------
    // Format Errors
    // -------------------------------------------------------------------------
    #[error("Format error: {0}")]
    Format(String),

    #[error("Unsupported payload serializer version: {0}")]
    UnsupportedSerializerVersion(u16),

    #[error("Unsupported record format version: {0}")]
    UnsupportedRecordVersion(u16),

    #[error("Compression error: {0}")]
    Compression(String),

    // -------------------------------------------------------------------------
    // Contract Errors
    // -------------------------------------------------------------------------
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Object set not found: {0}")]
    UnknownObjectSet(String),

    #[error("Pid is not ISO-8859-1: {0}")]
    InvalidPid(String),

    #[error("Operation not supported for this object kind")]
    WrongObjectKind,

    #[error("Area already registered: {0}")]
    DuplicateArea(String),

    // -------------------------------------------------------------------------
    // Restructure Errors
    // -------------------------------------------------------------------------
    #[error("Restructure failed, previous file kept: {0}")]
    Restructure(String),
}
