//! # areastore
//!
//! Persistence engine for configuration areas:
//! - One append-only file per area, holding configuration and dynamic objects
//! - Time-travel queries by version or timestamp
//! - Restructuring that moves invalid objects into sorted historical regions
//! - Two-phase permanent deletion of historical dynamic objects
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      FileManager                            │
//! │        (id / pid / simulation lookups across areas)         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ 1..N
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                   ConfigAreaFile                            │
//! │   (resident objects, queries, flush, restructure)           │
//! └──────┬───────────────────┬───────────────────┬──────────────┘
//!        │                   │                   │
//!        ▼                   ▼                   ▼
//!  ┌───────────┐      ┌─────────────┐     ┌─────────────┐
//!  │  Header   │      │   Indices   │     │   Records   │
//!  │  (tags)   │      │ (id / pid)  │     │  (deflate)  │
//!  └───────────┘      └─────────────┘     └─────────────┘
//! ```
//!
//! Entities (`ObjectInfo`) share `ObjectLocation` cells with their area, so
//! a restructure relocates every handle at once.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod area;
pub mod manager;
pub mod object;
pub mod record;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use area::{
    BackupReport, ChangeTimes, ConfigAreaFile, IntervalSemantics, MarkOutcome, RestructureMode, RestructureReport,
    TimeAuthority,
};
pub use config::Config;
pub use error::{Result, StoreError};
pub use manager::FileManager;
pub use object::{
    ConfigurationObjectInfo, DynamicObjectInfo, HistoricalOffset, Location, ObjectInfo, ObjectLocation,
    PersistenceMode,
};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of areastore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
