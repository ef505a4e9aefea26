//! Query phase.
//!
//! 1. Rank coarse cells by distance to each query and pick the cells to
//!    probe (fixed `pvf`, or until a target-count confidence is reached).
//! 2. Fetch every selected cell from storage once, shared across the batch.
//!    With `expand_until_k` this repeats while a query has fewer than `k`
//!    candidates.
//! 3. Score candidates with asymmetric distances from per-query lookup
//!    tables, in parallel across queries on the blocking pool. No storage
//!    reads happen here.
//! 4. Optionally re-rank the `k * alpha` shortlist against raw vectors.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{Result, WordPqError};
use crate::index::codebook::{Codebook, CodebookKind};
use crate::index::coarse::{CellRanking, CoarseQuantizer};
use crate::index::counts::OccupancyCounts;
use crate::index::distance::{compute_distance, residual};
use crate::storage::IndexStorage;
use crate::types::{
    CellId, DistanceMetric, IndexVariant, ProbeStrategy, QuantizedEntry, SearchMethod, SearchParams,
    SearchResult, VectorId, WordVector,
};

/// Loaded quantizers plus occupancy statistics; everything a query needs
/// besides the per-cell entries. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SearchEngine {
    state: Arc<EngineState>,
}

#[derive(Debug)]
struct EngineState {
    variant: IndexVariant,
    coarse: Option<CoarseQuantizer>,
    fine: Codebook,
    counts: OccupancyCounts,
}

/// Cells chosen for one query.
struct ProbePlan<'a> {
    ranking: Option<CellRanking<'a>>,
    cells: Vec<CellId>,
    /// Corpus vectors living in `cells`, per the occupancy counts.
    covered: u64,
    /// Candidates seen so far in fetched cells (after target filtering).
    found: usize,
    counted_cells: usize,
}

impl ProbePlan<'_> {
    /// Pull the next cell from the ranking. Returns false once exhausted.
    fn advance(&mut self, counts: &OccupancyCounts) -> bool {
        let Some(ranking) = self.ranking.as_mut() else {
            return false;
        };
        match ranking.next() {
            Some((cell, _)) => {
                self.covered += counts.coarse_count(cell);
                self.cells.push(cell);
                true
            }
            None => {
                self.ranking = None;
                false
            }
        }
    }

    /// Pull cells until one holds at least one vector.
    fn advance_to_occupied(&mut self, counts: &OccupancyCounts) -> bool {
        while self.advance(counts) {
            if let Some(&cell) = self.cells.last() {
                if counts.coarse_count(cell) > 0 {
                    return true;
                }
            }
        }
        false
    }
}

/// A scored candidate borrowing its entry from the fetched cells.
struct Hit<'a> {
    distance: f32,
    entry: &'a QuantizedEntry,
}

impl SearchEngine {
    pub fn new(coarse: Option<CoarseQuantizer>, fine: Codebook, counts: OccupancyCounts) -> Result<Self> {
        let variant = match (&coarse, fine.kind) {
            (None, CodebookKind::Fine) => IndexVariant::Pq,
            (Some(_), CodebookKind::Fine) => IndexVariant::Ivpq,
            (Some(_), CodebookKind::Residual) => IndexVariant::Ivfadc,
            (None, CodebookKind::Residual) => {
                return Err(WordPqError::Index(
                    "residual codebook stored without a coarse quantizer".into(),
                ))
            }
            (_, CodebookKind::Coarse) => {
                return Err(WordPqError::Index(
                    "fine codebook slot holds a coarse codebook".into(),
                ))
            }
        };
        if let Some(cq) = &coarse {
            if cq.dim() != fine.dim {
                return Err(WordPqError::DimensionMismatch {
                    expected: cq.dim(),
                    actual: fine.dim,
                });
            }
        }
        Ok(Self {
            state: Arc::new(EngineState {
                variant,
                coarse,
                fine,
                counts,
            }),
        })
    }

    /// Read quantizers and counts from storage.
    pub async fn load(storage: &dyn IndexStorage) -> Result<Self> {
        let coarse = storage.load_coarse_quantizer().await?;
        let fine = storage.load_codebook().await?;
        let counts = storage.load_counts().await?;
        let engine = Self::new(coarse, fine, counts)?;
        info!(
            variant = %engine.variant(),
            dim = engine.dim(),
            vectors = engine.counts().total(),
            "search engine loaded"
        );
        Ok(engine)
    }

    pub fn variant(&self) -> IndexVariant {
        self.state.variant
    }

    pub fn dim(&self) -> usize {
        self.state.fine.dim
    }

    pub fn counts(&self) -> &OccupancyCounts {
        &self.state.counts
    }

    /// `k` nearest neighbours of `query`, ascending by distance, ties by id.
    ///
    /// With `targets` the search universe is restricted to those ids. An
    /// empty universe or no candidates yields an empty result.
    pub async fn search(
        &self,
        query: &[f32],
        k: usize,
        targets: Option<&HashSet<VectorId>>,
        params: &SearchParams,
        storage: &dyn IndexStorage,
    ) -> Result<Vec<SearchResult>> {
        let mut results = self.search_batch(&[query], k, targets, params, storage).await?;
        Ok(results.pop().unwrap_or_default())
    }

    /// Answer many queries sharing one target set and parameter set.
    ///
    /// Storage reads happen on the async runtime; scoring runs on the
    /// blocking pool, fanned out over rayon.
    pub async fn search_batch<Q>(
        &self,
        queries: &[Q],
        k: usize,
        targets: Option<&HashSet<VectorId>>,
        params: &SearchParams,
        storage: &dyn IndexStorage,
    ) -> Result<Vec<Vec<SearchResult>>>
    where
        Q: AsRef<[f32]>,
    {
        for q in queries {
            if q.as_ref().len() != self.dim() {
                return Err(WordPqError::DimensionMismatch {
                    expected: self.dim(),
                    actual: q.as_ref().len(),
                });
            }
        }
        if k == 0 || queries.is_empty() {
            return Ok(vec![Vec::new(); queries.len()]);
        }
        let queries: Vec<Vec<f32>> = queries.iter().map(|q| q.as_ref().to_vec()).collect();
        let metric = params.metric;

        match params.method {
            SearchMethod::Exact => {
                let vectors = storage.load_vectors(targets).await?;
                debug!(universe = vectors.len(), "exact search");
                offload(move || {
                    queries
                        .par_iter()
                        .map(|q| exact_search(q, &vectors, k, metric))
                        .collect::<Vec<_>>()
                })
                .await
            }
            SearchMethod::Pq => {
                let cells = self
                    .probe(&queries, k, params.shortlist_size(k), targets, params, storage)
                    .await?;
                let state = Arc::clone(&self.state);
                let targets = targets.cloned();
                offload(move || {
                    queries
                        .par_iter()
                        .zip(&cells.plans)
                        .map(|(q, cell_ids)| {
                            state
                                .rank_codes(q, cell_ids, &cells.entries, targets.as_ref(), k)
                                .into_iter()
                                .map(|hit| SearchResult {
                                    id: hit.entry.id,
                                    word: hit.entry.word.clone(),
                                    distance: hit.distance,
                                })
                                .collect::<Vec<_>>()
                        })
                        .collect::<Vec<_>>()
                })
                .await
            }
            SearchMethod::PqPostVerify => {
                let shortlist = params.shortlist_size(k);
                let cells = self.probe(&queries, k, shortlist, targets, params, storage).await?;
                let state = Arc::clone(&self.state);
                let owned_targets = targets.cloned();
                let (queries, shortlists) = offload(move || {
                    let shortlists = queries
                        .par_iter()
                        .zip(&cells.plans)
                        .map(|(q, cell_ids)| {
                            state
                                .rank_codes(q, cell_ids, &cells.entries, owned_targets.as_ref(), shortlist)
                                .into_iter()
                                .map(|hit| hit.entry.id)
                                .collect::<Vec<VectorId>>()
                        })
                        .collect::<Vec<_>>();
                    (queries, shortlists)
                })
                .await?;

                let wanted: HashSet<VectorId> = shortlists.iter().flatten().copied().collect();
                let vectors = storage.load_vectors(Some(&wanted)).await?;
                debug!(shortlisted = wanted.len(), loaded = vectors.len(), "post-verification");

                offload(move || {
                    let by_id: HashMap<VectorId, &WordVector> = vectors.iter().map(|v| (v.id, v)).collect();
                    queries
                        .par_iter()
                        .zip(&shortlists)
                        .map(|(q, ids)| {
                            let candidates: Vec<&WordVector> =
                                ids.iter().filter_map(|id| by_id.get(id).copied()).collect();
                            exact_rank(q, candidates, k, metric)
                        })
                        .collect::<Vec<_>>()
                })
                .await
            }
        }
    }

    /// Choose cells per query and fetch them. `min_found` drives
    /// `expand_until_k`; `expect` is the target count the confidence rule
    /// aims for.
    async fn probe(
        &self,
        queries: &[Vec<f32>],
        min_found: usize,
        expect: usize,
        targets: Option<&HashSet<VectorId>>,
        params: &SearchParams,
        storage: &dyn IndexStorage,
    ) -> Result<FetchedCells> {
        let state = &*self.state;
        let total = state.counts.total();
        let universe = targets.map_or(total as usize, |t| t.len());
        let mut plans: Vec<ProbePlan<'_>> = queries
            .iter()
            .map(|q| state.plan(q, expect, universe, params))
            .collect();

        let mut entries: HashMap<CellId, Vec<QuantizedEntry>> = HashMap::new();
        let mut rounds = 0usize;
        loop {
            let missing: Vec<CellId> = plans
                .iter()
                .flat_map(|p| p.cells.iter().copied())
                .filter(|c| !entries.contains_key(c))
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            let fetched = futures::future::try_join_all(missing.iter().map(|&cell| async move {
                if state.counts.coarse_count(cell) == 0 {
                    return Ok((cell, Vec::new()));
                }
                storage
                    .scan_entries_by_coarse_cell(cell)
                    .await
                    .map(|e| (cell, e))
            }))
            .await?;
            entries.extend(fetched);

            for plan in plans.iter_mut() {
                for cell in &plan.cells[plan.counted_cells..] {
                    if let Some(list) = entries.get(cell) {
                        plan.found += list
                            .iter()
                            .filter(|e| targets.map_or(true, |t| t.contains(&e.id)))
                            .count();
                    }
                }
                plan.counted_cells = plan.cells.len();
            }

            if !params.expand_until_k {
                break;
            }
            let mut progressed = false;
            for plan in plans.iter_mut() {
                if plan.found < min_found && plan.covered < total && plan.advance_to_occupied(&state.counts) {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
            rounds += 1;
        }

        debug!(
            queries = queries.len(),
            cells = entries.len(),
            expansion_rounds = rounds,
            "cells fetched"
        );
        Ok(FetchedCells {
            plans: plans.into_iter().map(|p| p.cells).collect(),
            entries,
        })
    }
}

impl EngineState {
    fn plan(&self, query: &[f32], expect: usize, universe: usize, params: &SearchParams) -> ProbePlan<'_> {
        let Some(cq) = &self.coarse else {
            return ProbePlan {
                ranking: None,
                cells: vec![0],
                covered: self.counts.total(),
                found: 0,
                counted_cells: 0,
            };
        };

        let mut plan = ProbePlan {
            ranking: Some(cq.ranked_cells(query)),
            cells: Vec::new(),
            covered: 0,
            found: 0,
            counted_cells: 0,
        };
        let total = self.counts.total();
        match params.probe {
            ProbeStrategy::Fixed => {
                for _ in 0..params.pvf.max(1) {
                    if !plan.advance(&self.counts) {
                        break;
                    }
                }
            }
            ProbeStrategy::Confidence { confidence } => {
                while plan.advance_to_occupied(&self.counts) {
                    let p = plan.covered as f64 / total.max(1) as f64;
                    let reached = target_confidence(expect, universe, p, total) >= confidence as f64;
                    if reached || plan.covered >= total {
                        break;
                    }
                }
            }
        }
        plan
    }

    /// ADC scoring over the given cells, returning the `limit` best hits.
    fn rank_codes<'a>(
        &self,
        query: &[f32],
        cells: &[CellId],
        entries: &'a HashMap<CellId, Vec<QuantizedEntry>>,
        targets: Option<&HashSet<VectorId>>,
        limit: usize,
    ) -> Vec<Hit<'a>> {
        let shared_table = match (&self.coarse, self.variant.is_residual()) {
            (Some(_), true) => None,
            _ => Some(self.fine.distance_table(query)),
        };

        let mut hits: Vec<Hit<'a>> = Vec::new();
        for &cell in cells {
            let Some(list) = entries.get(&cell) else {
                continue;
            };
            let mut candidates = list
                .iter()
                .filter(|e| targets.map_or(true, |t| t.contains(&e.id)))
                .peekable();
            if candidates.peek().is_none() {
                continue;
            }

            let cell_table;
            let table = match (&shared_table, &self.coarse) {
                (Some(t), _) => t,
                (None, Some(cq)) => {
                    cell_table = self
                        .fine
                        .distance_table(&residual(query, &cq.cell_centroid(cell)));
                    &cell_table
                }
                (None, None) => continue,
            };

            hits.extend(candidates.map(|entry| Hit {
                distance: self.fine.adc_distance(table, &entry.codes),
                entry,
            }));
        }

        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.entry.id.cmp(&b.entry.id))
        });
        hits.truncate(limit);
        hits
    }
}

struct FetchedCells {
    /// Selected cells, one list per query.
    plans: Vec<Vec<CellId>>,
    entries: HashMap<CellId, Vec<QuantizedEntry>>,
}

/// Run CPU-bound scoring on the blocking pool so it never stalls the
/// runtime's worker threads.
async fn offload<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| WordPqError::Index(format!("scoring task failed: {e}")))
}

/// Exact `k` nearest neighbours of `query` among `vectors`.
pub fn exact_search(query: &[f32], vectors: &[WordVector], k: usize, metric: DistanceMetric) -> Vec<SearchResult> {
    exact_rank(query, vectors.iter().collect(), k, metric)
}

fn exact_rank(query: &[f32], candidates: Vec<&WordVector>, k: usize, metric: DistanceMetric) -> Vec<SearchResult> {
    let mut scored: Vec<(f32, &WordVector)> = candidates
        .into_iter()
        .map(|v| (compute_distance(query, &v.values, metric), v))
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.id.cmp(&b.1.id)));
    scored.truncate(k);
    scored
        .into_iter()
        .map(|(distance, v)| SearchResult {
            id: v.id,
            word: v.word.clone(),
            distance,
        })
        .collect()
}

/// Probability that cells covering fraction `p` of a `stat_size` corpus
/// contain at least `expect` of `size` targets.
///
/// Normal approximation of the hypergeometric distribution with continuity
/// correction. Zero when more targets are expected than exist.
pub fn target_confidence(expect: usize, size: usize, p: f64, stat_size: u64) -> f64 {
    if expect > size {
        return 0.0;
    }
    let n = size as f64;
    let mu = n * p;
    let correction = if stat_size > 1 {
        ((stat_size as f64 - n) / (stat_size as f64 - 1.0)).max(0.0)
    } else {
        0.0
    };
    let sigma = (n * p * (1.0 - p)).max(0.0).sqrt() * correction;
    let threshold = expect as f64 - 0.5;
    if sigma <= f64::EPSILON {
        return if mu > threshold { 1.0 } else { 0.0 };
    }
    1.0 - 0.5 * (1.0 + erf((threshold - mu) / (sigma * std::f64::consts::SQRT_2)))
}

/// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}
