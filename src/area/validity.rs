//! Validity Evaluation
//!
//! Resolves versions to activation timestamps and decides whether a validity
//! interval matches a query range. Shared by every query of the engine.

use std::collections::BTreeMap;

use super::header::NgaBlockEntry;

/// Timestamp used for versions that are unknown or not yet active
pub const INFINITE: i64 = i64::MAX;

/// Which activation timestamps resolve configuration-object versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAuthority {
    /// Times at which this instance activated the versions
    Local,
    /// Times declared by the configuration authority (stored in the header)
    Authority,
}

/// How a validity interval must relate to the query range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalSemantics {
    /// Valid at some point in the range
    Overlap,
    /// Valid during the whole range
    FullCoverage,
}

/// Version → activation time tables, indexed by version number
///
/// A slot holding 0 means "unknown".
#[derive(Debug, Clone, Default)]
pub struct ActivationTimes {
    local: Vec<i64>,
    authority: Vec<i64>,
}

impl ActivationTimes {
    pub fn new(local: &BTreeMap<u16, i64>, nga_blocks: &[NgaBlockEntry]) -> Self {
        let mut times = Self::default();
        for (&version, &time) in local {
            times.set_local(version, time);
        }
        times.set_authority_from(nga_blocks);
        times
    }

    pub fn set_local(&mut self, version: u16, time: i64) {
        set_slot(&mut self.local, version, time);
    }

    pub fn set_authority_from(&mut self, nga_blocks: &[NgaBlockEntry]) {
        for block in nga_blocks {
            set_slot(&mut self.authority, block.version, block.activation_time);
        }
    }

    pub fn local(&self, version: u16) -> Option<i64> {
        slot(&self.local, version)
    }

    pub fn authority(&self, version: u16) -> Option<i64> {
        slot(&self.authority, version)
    }

    /// Activation time of `version`, or [`INFINITE`] if it is 0, newer than
    /// `active_version` or unknown
    ///
    /// Authority lookups fall back to the local table for versions that have
    /// not been recorded in the header yet.
    pub fn time_of(&self, version: u16, authority: TimeAuthority, active_version: u16) -> i64 {
        if version == 0 || version > active_version {
            return INFINITE;
        }
        let time = match authority {
            TimeAuthority::Local => self.local(version),
            TimeAuthority::Authority => self.authority(version).or_else(|| self.local(version)),
        };
        time.unwrap_or(INFINITE)
    }

    /// Local time of `version`, or of the closest later version that has one
    pub fn local_or_next(&self, version: u16) -> Option<i64> {
        self.local
            .iter()
            .skip(version as usize)
            .copied()
            .find(|&t| t != 0)
    }
}

fn set_slot(table: &mut Vec<i64>, version: u16, time: i64) {
    let index = version as usize;
    if table.len() <= index {
        table.resize(index + 1, 0);
    }
    table[index] = time;
}

fn slot(table: &[i64], version: u16) -> Option<i64> {
    table.get(version as usize).copied().filter(|&t| t != 0)
}

/// Decide whether `[valid_since, invalid_since)` matches `[start, end]`
///
/// `invalid_since == 0` means "still valid" and is treated as +∞.
pub fn is_valid_in_range(
    valid_since: i64,
    invalid_since: i64,
    start: i64,
    end: i64,
    semantics: IntervalSemantics,
) -> bool {
    let invalid_since = if invalid_since == 0 { INFINITE } else { invalid_since };
    match semantics {
        IntervalSemantics::Overlap => valid_since <= end && start <= invalid_since,
        IntervalSemantics::FullCoverage => valid_since <= start && end <= invalid_since,
    }
}
