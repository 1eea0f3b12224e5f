//! Area Module
//!
//! One configuration area = one append-only file.
//!
//! ## File Layout
//! ```text
//! ┌────────────┐
//! │   Header   │  tagged, see `header`
//! ├────────────┤ ◄── offset 0 of every relative position
//! │ NGA v1     │  configuration objects invalidated in version 1
//! │ NGA v2     │
//! │ ...        │
//! ├────────────┤
//! │   NGDyn    │  historical dynamic objects, by invalidation time
//! ├────────────┤
//! │  ID index  │  (id, position), sorted by id
//! ├────────────┤
//! │ PID index  │  (pid hash, position), sorted by hash
//! ├────────────┤
//! │ Mixed set  │  current and future objects, append-only
//! └────────────┘
//! ```
//!
//! Everything before the mixed set is only rewritten by a restructure.

pub mod deletion;
pub mod header;
pub mod index;
pub mod validity;

mod file;
mod restructure;

pub use deletion::MarkOutcome;
pub use file::{BackupReport, ChangeTimes, ConfigAreaFile};
pub use header::{AreaHeader, NgaBlockEntry};
pub use restructure::RestructureReport;
pub use validity::{IntervalSemantics, TimeAuthority};

/// What a restructure does with the historical regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestructureMode {
    /// Copy historical regions byte for byte, gaps included
    PreserveGaps,
    /// Compact gaps out of the historical regions
    RemoveGaps,
    /// Compact gaps and drop dynamic objects pending deletion
    DeleteObjectsPermanently,
}
