//! Object Location References
//!
//! A location is where an object can be found again: a record in the mixed
//! set, a record in one of the historical regions, or memory only.
//!
//! Locations are shared cells. The engine, every entity and the file manager
//! hold clones of the same cell, so a restructure updates all of them at once
//! by applying a relocation map to the registry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

/// Offset of a record inside the historical regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HistoricalOffset {
    /// Relative to the end of the header (NGA blocks)
    Config(u64),
    /// Relative to the start of the NGDyn block
    Dynamic(u64),
}

impl HistoricalOffset {
    /// Signed position as stored in the on-disk indices
    ///
    /// Non-negative values are NGA offsets, negative values encode
    /// `-(offset + 1)` of an NGDyn offset.
    pub fn to_index_position(self) -> i64 {
        match self {
            HistoricalOffset::Config(offset) => offset as i64,
            HistoricalOffset::Dynamic(offset) => -(offset as i64) - 1,
        }
    }

    pub fn from_index_position(position: i64) -> Self {
        if position >= 0 {
            HistoricalOffset::Config(position as u64)
        } else {
            HistoricalOffset::Dynamic((-(position + 1)) as u64)
        }
    }
}

/// Where an object's current record lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// Created but not flushed yet
    Unwritten,
    /// Absolute file position of a record in the mixed set
    Mixed(u64),
    /// Record in the NGA or NGDyn region
    Historical(HistoricalOffset),
    /// Never written to disk
    Transient,
    /// Declared a gap or dropped permanently
    Deleted,
}

/// Shared handle on a location cell
#[derive(Debug, Clone)]
pub struct ObjectLocation {
    cell: Arc<RwLock<Location>>,
}

impl ObjectLocation {
    /// Create an untracked location (not patched by restructures)
    pub fn detached(location: Location) -> Self {
        Self {
            cell: Arc::new(RwLock::new(location)),
        }
    }

    pub fn get(&self) -> Location {
        *self.cell.read()
    }

    pub fn set(&self, location: Location) {
        *self.cell.write() = location;
    }

    /// True when both handles share one cell
    pub fn same_cell(&self, other: &ObjectLocation) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

/// Registry of every live location cell handed out by one area
///
/// Holds weak references only; dropped cells are pruned lazily.
#[derive(Debug, Default)]
pub(crate) struct LocationRegistry {
    cells: Mutex<Vec<Weak<RwLock<Location>>>>,
}

impl LocationRegistry {
    const PRUNE_THRESHOLD: usize = 4096;

    pub fn track(&self, location: Location) -> ObjectLocation {
        let handle = ObjectLocation::detached(location);
        let mut cells = self.cells.lock();
        if cells.len() >= Self::PRUNE_THRESHOLD && cells.len().is_power_of_two() {
            cells.retain(|cell| cell.strong_count() > 0);
        }
        cells.push(Arc::downgrade(&handle.cell));
        handle
    }

    /// Rewrite every live cell whose value appears in `relocations`
    ///
    /// Returns the number of cells patched.
    pub fn relocate(&self, relocations: &HashMap<Location, Location>) -> usize {
        let mut cells = self.cells.lock();
        cells.retain(|cell| cell.strong_count() > 0);

        let mut patched = 0;
        for cell in cells.iter() {
            if let Some(cell) = cell.upgrade() {
                let mut location = cell.write();
                if let Some(new_location) = relocations.get(&*location) {
                    *location = *new_location;
                    patched += 1;
                }
            }
        }
        patched
    }

    pub fn live_count(&self) -> usize {
        self.cells
            .lock()
            .iter()
            .filter(|cell| cell.strong_count() > 0)
            .count()
    }
}
