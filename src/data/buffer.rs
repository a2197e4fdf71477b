//! Per-point acquisition buffer.
//!
//! Samples arrive tagged with the index of the scan point that owns them and a
//! sequence number from a single monotonically increasing counter. The buffer
//! attributes each sample by its index (never by arrival order), refuses to
//! attribute a sequence number twice, and reports when a point has collected
//! its expected number of samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

/// One raw reading attributed to a scan point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Point the reading was taken at.
    pub point_index: usize,
    /// Run-wide acquisition order, unique per sample.
    pub sequence: u64,
    /// Instrument reading.
    pub value: f64,
    /// Wall-clock time the reading was stamped.
    pub acquired_at: DateTime<Utc>,
}

/// Sample rejected by the [`AcquisitionBuffer`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// No slot is open for the point.
    #[error("point {0} is not open")]
    UnknownPoint(usize),

    /// The point was opened before.
    #[error("point {0} was already opened")]
    PointReused(usize),

    /// The sequence number already belongs to a sample.
    #[error("sequence {sequence} already attributed to point {owner}")]
    DuplicateSequence {
        /// Rejected sequence number.
        sequence: u64,
        /// Point holding the earlier sample.
        owner: usize,
    },

    /// The point already has every sample it expects.
    #[error("point {index} already holds its {expected} samples")]
    PointFull {
        /// Point index.
        index: usize,
        /// Samples the point expects.
        expected: usize,
    },
}

#[derive(Debug)]
struct PointSlot {
    expected: usize,
    samples: BTreeMap<u64, Sample>,
}

/// Accumulates samples for the points currently in flight.
#[derive(Debug, Default)]
pub struct AcquisitionBuffer {
    open: HashMap<usize, PointSlot>,
    closed: HashSet<usize>,
    owners: HashMap<u64, usize>,
    next_sequence: u64,
}

impl AcquisitionBuffer {
    /// Empty buffer; sequence numbers start at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting for `index`, expecting `expected` samples.
    pub fn open(&mut self, index: usize, expected: usize) -> Result<(), BufferError> {
        if self.open.contains_key(&index) || self.closed.contains(&index) {
            return Err(BufferError::PointReused(index));
        }
        self.open.insert(
            index,
            PointSlot {
                expected,
                samples: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Tag a reading for `point_index` with the next sequence number.
    pub fn stamp(&mut self, point_index: usize, value: f64) -> Sample {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Sample {
            point_index,
            sequence,
            value,
            acquired_at: Utc::now(),
        }
    }

    /// Attribute a sample to the point named by its `point_index`.
    pub fn push(&mut self, sample: Sample) -> Result<(), BufferError> {
        if let Some(&owner) = self.owners.get(&sample.sequence) {
            return Err(BufferError::DuplicateSequence {
                sequence: sample.sequence,
                owner,
            });
        }
        let slot = self
            .open
            .get_mut(&sample.point_index)
            .ok_or(BufferError::UnknownPoint(sample.point_index))?;
        if slot.samples.len() >= slot.expected {
            return Err(BufferError::PointFull {
                index: sample.point_index,
                expected: slot.expected,
            });
        }

        self.owners.insert(sample.sequence, sample.point_index);
        self.next_sequence = self.next_sequence.max(sample.sequence + 1);
        slot.samples.insert(sample.sequence, sample);
        Ok(())
    }

    /// Number of samples collected so far for `index`.
    pub fn count(&self, index: usize) -> usize {
        self.open.get(&index).map_or(0, |slot| slot.samples.len())
    }

    /// True once `index` holds its expected number of samples.
    pub fn is_complete(&self, index: usize) -> bool {
        self.open
            .get(&index)
            .is_some_and(|slot| slot.samples.len() >= slot.expected)
    }

    /// Copy of the samples gathered so far for `index`, ordered by sequence.
    pub fn snapshot(&self, index: usize) -> Vec<Sample> {
        self.open
            .get(&index)
            .map(|slot| slot.samples.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the samples gathered so far for `index`, keeping it open.
    ///
    /// Discarded sequence numbers stay claimed.
    pub fn reset(&mut self, index: usize) -> Result<usize, BufferError> {
        let slot = self
            .open
            .get_mut(&index)
            .ok_or(BufferError::UnknownPoint(index))?;
        let dropped = slot.samples.len();
        slot.samples.clear();
        Ok(dropped)
    }

    /// Close `index` and return its samples ordered by sequence number.
    ///
    /// Works for partially filled points as well; the caller decides whether
    /// the count is acceptable.
    pub fn take(&mut self, index: usize) -> Result<Vec<Sample>, BufferError> {
        let slot = self
            .open
            .remove(&index)
            .ok_or(BufferError::UnknownPoint(index))?;
        self.closed.insert(index);
        Ok(slot.samples.into_values().collect())
    }
}
