//! Occupancy statistics gathered while assigning the corpus.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::CellId;

/// Per-cell and per-`(subspace, code)` assignment counts.
///
/// Coarse counts are sparse because a multi-index addresses far more cells
/// than are ever occupied. Fine counts are a dense `m × k` array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyCounts {
    pub m: usize,
    pub k: usize,
    pub coarse: BTreeMap<CellId, u64>,
    /// `fine[pos * k + code]`.
    pub fine: Vec<u64>,
}

impl OccupancyCounts {
    pub fn new(m: usize, k: usize) -> Self {
        Self {
            m,
            k,
            coarse: BTreeMap::new(),
            fine: vec![0; m * k],
        }
    }

    /// Record one quantized vector.
    pub fn record(&mut self, cell: CellId, codes: &[u16]) {
        *self.coarse.entry(cell).or_insert(0) += 1;
        for (pos, &code) in codes.iter().enumerate() {
            self.fine[pos * self.k + code as usize] += 1;
        }
    }

    /// Add `other` into `self`. Both must describe the same codebook shape.
    pub fn merge(&mut self, other: &OccupancyCounts) {
        debug_assert_eq!((self.m, self.k), (other.m, other.k));
        for (&cell, &n) in &other.coarse {
            *self.coarse.entry(cell).or_insert(0) += n;
        }
        for (acc, &n) in self.fine.iter_mut().zip(&other.fine) {
            *acc += n;
        }
    }

    pub fn coarse_count(&self, cell: CellId) -> u64 {
        self.coarse.get(&cell).copied().unwrap_or(0)
    }

    pub fn fine_count(&self, pos: usize, code: usize) -> u64 {
        self.fine[pos * self.k + code]
    }

    /// Number of vectors recorded.
    pub fn total(&self) -> u64 {
        self.coarse.values().sum()
    }
}
