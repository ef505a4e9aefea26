//! Latency and precision measurements over a query set.
//!
//! Every parameter set is compared against exact search (method 1) over the
//! same target universe and under the same metric.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::index::search::SearchEngine;
use crate::storage::IndexStorage;
use crate::types::{DistanceMetric, SearchMethod, SearchParams, SearchResult, VectorId};

/// Fraction of `exact` ids present in `approx`. An empty ground truth
/// counts as fully recovered.
pub fn precision(approx: &[SearchResult], exact: &[SearchResult]) -> f64 {
    if exact.is_empty() {
        return 1.0;
    }
    let found: HashSet<VectorId> = approx.iter().map(|r| r.id).collect();
    let hits = exact.iter().filter(|r| found.contains(&r.id)).count();
    hits as f64 / exact.len() as f64
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub params: SearchParams,
    pub mean_latency_ms: f64,
    pub median_latency_ms: f64,
    pub mean_precision: f64,
}

/// Exact search latency for one metric, the baseline its runs are scored
/// against.
#[derive(Debug, Clone, Serialize)]
pub struct BaselineReport {
    pub metric: DistanceMetric,
    pub mean_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub k: usize,
    pub queries: usize,
    pub target_count: Option<usize>,
    pub baselines: Vec<BaselineReport>,
    pub runs: Vec<RunReport>,
}

impl EvaluationReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct Evaluator<'a> {
    engine: &'a SearchEngine,
    storage: &'a dyn IndexStorage,
    k: usize,
    targets: Option<HashSet<VectorId>>,
}

impl<'a> Evaluator<'a> {
    pub fn new(engine: &'a SearchEngine, storage: &'a dyn IndexStorage, k: usize) -> Self {
        Self {
            engine,
            storage,
            k,
            targets: None,
        }
    }

    /// Restrict every search to `targets`.
    pub fn with_targets(mut self, targets: HashSet<VectorId>) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Run each query once per parameter set, sequentially so latencies
    /// are not skewed by each other.
    pub async fn run<Q: AsRef<[f32]>>(&self, queries: &[Q], param_sets: &[SearchParams]) -> Result<EvaluationReport> {
        let mut metrics: Vec<DistanceMetric> = Vec::new();
        for params in param_sets {
            if !metrics.contains(&params.metric) {
                metrics.push(params.metric);
            }
        }
        if metrics.is_empty() {
            metrics.push(DistanceMetric::default());
        }

        let mut truth: HashMap<DistanceMetric, Vec<Vec<SearchResult>>> = HashMap::new();
        let mut baselines = Vec::with_capacity(metrics.len());
        for metric in metrics {
            let (results, latency) = self.exact_baseline(queries, metric).await?;
            truth.insert(metric, results);
            baselines.push(BaselineReport {
                metric,
                mean_latency_ms: latency,
            });
        }

        let targets = self.targets.as_ref();
        let mut runs = Vec::with_capacity(param_sets.len());
        for params in param_sets {
            let expected_all = truth.get(&params.metric).map(Vec::as_slice).unwrap_or(&[]);
            let mut latencies = Vec::with_capacity(queries.len());
            let mut precision_sum = 0.0;
            for (q, expected) in queries.iter().zip(expected_all) {
                let start = Instant::now();
                let results = self
                    .engine
                    .search(q.as_ref(), self.k, targets, params, self.storage)
                    .await?;
                latencies.push(start.elapsed().as_secs_f64() * 1000.0);
                precision_sum += precision(&results, expected);
            }
            let run = RunReport {
                params: *params,
                mean_latency_ms: mean(&latencies),
                median_latency_ms: median(&mut latencies),
                mean_precision: if queries.is_empty() {
                    0.0
                } else {
                    precision_sum / queries.len() as f64
                },
            };
            info!(
                method = u8::from(params.method),
                pvf = params.pvf,
                alpha = params.alpha,
                precision = run.mean_precision,
                median_ms = run.median_latency_ms,
                "evaluation run finished"
            );
            runs.push(run);
        }

        Ok(EvaluationReport {
            k: self.k,
            queries: queries.len(),
            target_count: self.targets.as_ref().map(|t| t.len()),
            baselines,
            runs,
        })
    }

    /// Exact results for every query under `metric`, with their mean latency.
    async fn exact_baseline<Q: AsRef<[f32]>>(
        &self,
        queries: &[Q],
        metric: DistanceMetric,
    ) -> Result<(Vec<Vec<SearchResult>>, f64)> {
        let exact = SearchParams::default()
            .with_method(SearchMethod::Exact)
            .with_metric(metric);
        let mut results = Vec::with_capacity(queries.len());
        let mut latencies = Vec::with_capacity(queries.len());
        for q in queries {
            let start = Instant::now();
            let hits = self
                .engine
                .search(q.as_ref(), self.k, self.targets.as_ref(), &exact, self.storage)
                .await?;
            latencies.push(start.elapsed().as_secs_f64() * 1000.0);
            results.push(hits);
        }
        Ok((results, mean(&latencies)))
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: VectorId) -> SearchResult {
        SearchResult {
            id,
            word: String::new(),
            distance: 0.0,
        }
    }

    #[test]
    fn test_precision() {
        let exact = vec![hit(1), hit(2), hit(3), hit(4)];
        assert_eq!(precision(&[hit(4), hit(9), hit(1)], &exact), 0.5);
        assert_eq!(precision(&[], &exact), 0.0);
        assert_eq!(precision(&[hit(1)], &[]), 1.0);
    }

    #[test]
    fn test_median_and_mean() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(&mut []), 0.0);
        assert_eq!(mean(&[1.0, 2.0, 3.0]), 2.0);
    }
}
