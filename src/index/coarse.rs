//! Coarse quantizer: partitions the corpus into cells.
//!
//! A single-index quantizer is a codebook with one subspace; the cell id is
//! the centroid index. A multi-index quantizer has `m_coarse` subspaces and
//! the cell id is the radix-encoded tuple `Σ code_i · k_coarse^i`, addressing
//! one of `k_coarse^m_coarse` virtual cells.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::error::{Result, WordPqError};
use crate::index::codebook::{Codebook, CodebookKind};
use crate::index::distance::squared_euclidean;
use crate::types::CellId;

#[derive(Debug, Clone, PartialEq)]
pub struct CoarseQuantizer {
    codebook: Codebook,
    num_cells: u64,
}

impl CoarseQuantizer {
    pub fn new(codebook: Codebook) -> Result<Self> {
        if codebook.kind != CodebookKind::Coarse {
            return Err(WordPqError::Config(format!(
                "coarse quantizer requires a coarse codebook, got {}",
                codebook.kind
            )));
        }
        let num_cells = (codebook.k as u64)
            .checked_pow(codebook.m as u32)
            .filter(|&n| n <= CellId::MAX as u64 + 1)
            .ok_or_else(|| {
                WordPqError::Config(format!(
                    "k_coarse^m_coarse = {}^{} does not fit a 32-bit cell id",
                    codebook.k, codebook.m
                ))
            })?;
        Ok(Self {
            codebook,
            num_cells,
        })
    }

    pub fn codebook(&self) -> &Codebook {
        &self.codebook
    }

    pub fn dim(&self) -> usize {
        self.codebook.dim
    }

    /// Number of coarse subspaces (1 for a single index).
    pub fn m_coarse(&self) -> usize {
        self.codebook.m
    }

    pub fn k_coarse(&self) -> usize {
        self.codebook.k
    }

    pub fn num_cells(&self) -> u64 {
        self.num_cells
    }

    pub fn is_multi(&self) -> bool {
        self.codebook.m > 1
    }

    /// Nearest cell for `vector`. Ties resolve to the lowest centroid index
    /// in each subspace.
    pub fn assign(&self, vector: &[f32]) -> CellId {
        self.encode_cell(&self.codebook.encode(vector))
    }

    /// Radix-encode a per-subspace code tuple.
    pub fn encode_cell(&self, codes: &[u16]) -> CellId {
        let k = self.codebook.k as u64;
        let mut cell = 0u64;
        let mut weight = 1u64;
        for &code in codes {
            cell += code as u64 * weight;
            weight *= k;
        }
        cell as CellId
    }

    /// Inverse of [`encode_cell`](Self::encode_cell).
    pub fn decode_cell(&self, cell: CellId) -> Vec<u16> {
        let k = self.codebook.k as u64;
        let mut rest = cell as u64;
        (0..self.codebook.m)
            .map(|_| {
                let code = rest % k;
                rest /= k;
                code as u16
            })
            .collect()
    }

    /// Concatenated centroid of `cell`, the point residuals are taken from.
    pub fn cell_centroid(&self, cell: CellId) -> Vec<f32> {
        self.codebook.reconstruct(&self.decode_cell(cell))
    }

    /// Cells in ascending distance from `query`.
    ///
    /// Multi-index cells are enumerated lazily with a multi-sequence
    /// traversal, so the first few cells cost far less than ranking all
    /// `k_coarse^m_coarse` of them.
    pub fn ranked_cells(&self, query: &[f32]) -> CellRanking<'_> {
        let cb = &self.codebook;
        let sorted: Vec<Vec<(u16, f32)>> = (0..cb.m)
            .map(|pos| {
                let sub = &query[pos * cb.sub_dim..(pos + 1) * cb.sub_dim];
                let mut dists: Vec<(u16, f32)> = cb
                    .subspace(pos)
                    .enumerate()
                    .map(|(code, c)| (code as u16, squared_euclidean(sub, c)))
                    .collect();
                dists.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
                dists
            })
            .collect();

        let mut ranking = CellRanking {
            quantizer: self,
            sorted,
            heap: BinaryHeap::new(),
            seen: HashSet::new(),
        };
        ranking.push(vec![0; cb.m]);
        ranking
    }
}

/// Lazy ascending-distance iterator over coarse cells.
pub struct CellRanking<'a> {
    quantizer: &'a CoarseQuantizer,
    /// Per-subspace `(code, distance)` lists sorted by distance.
    sorted: Vec<Vec<(u16, f32)>>,
    heap: BinaryHeap<Candidate>,
    seen: HashSet<Vec<u32>>,
}

impl CellRanking<'_> {
    fn push(&mut self, ranks: Vec<u32>) {
        if !self.seen.insert(ranks.clone()) {
            return;
        }
        let mut distance = 0.0f32;
        let mut codes = Vec::with_capacity(ranks.len());
        for (pos, &r) in ranks.iter().enumerate() {
            let (code, d) = self.sorted[pos][r as usize];
            distance += d;
            codes.push(code);
        }
        let cell = self.quantizer.encode_cell(&codes);
        self.heap.push(Candidate {
            distance,
            cell,
            ranks,
        });
    }
}

impl Iterator for CellRanking<'_> {
    type Item = (CellId, f32);

    fn next(&mut self) -> Option<Self::Item> {
        let top = self.heap.pop()?;
        let k = self.quantizer.k_coarse();
        for pos in 0..top.ranks.len() {
            if (top.ranks[pos] as usize) + 1 < k {
                let mut next = top.ranks.clone();
                next[pos] += 1;
                self.push(next);
            }
        }
        Some((top.cell, top.distance))
    }
}

/// Heap entry ordered so the smallest distance (then lowest cell) pops first.
struct Candidate {
    distance: f32,
    cell: CellId,
    ranks: Vec<u32>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .distance
            .total_cmp(&self.distance)
            .then_with(|| other.cell.cmp(&self.cell))
    }
}
