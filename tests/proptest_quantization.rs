//! Property-based tests for codebook training, exact search and batched
//! index construction.

use std::collections::HashSet;

use proptest::prelude::*;
use wordpq::config::IndexingConfig;
use wordpq::corpus::VectorStore;
use wordpq::index::coarse::CoarseQuantizer;
use wordpq::index::codebook::{Codebook, CodebookKind, TrainParams};
use wordpq::index::distance::squared_euclidean;
use wordpq::index::search::exact_search;
use wordpq::index::IndexBuilder;
use wordpq::types::{CellId, DistanceMetric, IndexVariant, VectorId, WordVector};

fn vectors_strategy(dim: usize, max_n: usize) -> impl Strategy<Value = Vec<Vec<f32>>> {
    prop::collection::vec(prop::collection::vec(-10.0f32..10.0, dim), 1..max_n)
}

/// Small integers keep every squared distance exact, so ties are real ties.
fn grid_values(n: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec((-3i8..=3).prop_map(f32::from), n)
}

/// Nearest cell by scanning every full cell centroid; the first minimum wins.
fn brute_force_cell(cq: &CoarseQuantizer, v: &[f32]) -> CellId {
    let mut best = (0 as CellId, f32::INFINITY);
    for cell in 0..cq.num_cells() as CellId {
        let d = squared_euclidean(v, &cq.cell_centroid(cell));
        if d < best.1 {
            best = (cell, d);
        }
    }
    best.0
}

fn to_words(rows: &[Vec<f32>]) -> Vec<WordVector> {
    rows.iter()
        .enumerate()
        .map(|(i, v)| WordVector::new(i as VectorId + 1, format!("w{i}"), v.clone()))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn codebook_has_m_sets_of_k_subvectors(
        m in 1usize..4,
        sub_dim in 1usize..4,
        k in 1usize..9,
        seed in any::<u64>(),
        raw in prop::collection::vec(-5.0f32..5.0, 12..120),
    ) {
        let dim = m * sub_dim;
        let rows: Vec<&[f32]> = raw.chunks_exact(dim).collect();
        prop_assume!(!rows.is_empty());

        let cb = Codebook::train(
            CodebookKind::Fine,
            &rows,
            dim,
            TrainParams { m, k, iterations: 3, seed },
        ).unwrap();
        prop_assert_eq!(cb.m, m);
        prop_assert_eq!(cb.k, k);
        prop_assert_eq!(cb.sub_dim, sub_dim);
        for pos in 0..m {
            prop_assert_eq!(cb.subspace(pos).count(), k);
            for code in 0..k {
                prop_assert_eq!(cb.centroid(pos, code).len(), sub_dim);
            }
        }
        for row in &rows {
            let codes = cb.encode(row);
            prop_assert_eq!(codes.len(), m);
            prop_assert!(codes.iter().all(|&c| (c as usize) < k));
        }
    }

    #[test]
    fn exact_search_returns_k_closest_targets(
        rows in vectors_strategy(3, 40),
        query in prop::collection::vec(-10.0f32..10.0, 3),
        k in 1usize..10,
        mask in prop::collection::vec(any::<bool>(), 40),
    ) {
        let words = to_words(&rows);
        let targets: Vec<WordVector> = words
            .iter()
            .zip(&mask)
            .filter(|(_, keep)| **keep)
            .map(|(w, _)| w.clone())
            .collect();

        let hits = exact_search(&query, &targets, k, DistanceMetric::Euclidean);
        prop_assert_eq!(hits.len(), k.min(targets.len()));

        // ascending, ties by id
        for pair in hits.windows(2) {
            prop_assert!(
                pair[0].distance < pair[1].distance
                    || (pair[0].distance == pair[1].distance && pair[0].id < pair[1].id)
            );
        }

        // nothing outside the result beats the worst hit
        let returned: HashSet<VectorId> = hits.iter().map(|h| h.id).collect();
        if let Some(worst) = hits.last() {
            for t in targets.iter().filter(|t| !returned.contains(&t.id)) {
                prop_assert!(squared_euclidean(&query, &t.values) >= worst.distance);
            }
        }
    }

    #[test]
    fn built_entry_lands_in_nearest_cell(
        m_coarse in 1usize..=2,
        sub_dim in 1usize..=3,
        k_coarse in 1usize..=4,
        centroid_values in grid_values(2 * 4 * 3),
        v in grid_values(6),
    ) {
        let dim = m_coarse * sub_dim;
        let mut values = centroid_values.chunks_exact(sub_dim);
        let sets: Vec<Vec<Vec<f32>>> = (0..m_coarse)
            .map(|_| (0..k_coarse).map(|_| values.next().unwrap().to_vec()).collect())
            .collect();
        let cq = CoarseQuantizer::new(Codebook::from_centroids(CodebookKind::Coarse, dim, sets).unwrap()).unwrap();
        let fine = Codebook::from_centroids(CodebookKind::Fine, dim, vec![vec![vec![0.0; dim]]]).unwrap();
        let builder = IndexBuilder::new(IndexVariant::Ivpq, Some(cq.clone()), fine).unwrap();

        let vector = WordVector::new(1, "w", v[..dim].to_vec());
        let out = builder.build(std::slice::from_ref(&vector)).unwrap();
        prop_assert_eq!(out.entries.len(), 1);
        prop_assert_eq!(out.entries[0].cell, brute_force_cell(&cq, &vector.values));
        prop_assert_eq!(out.counts.total(), 1);
    }

    #[test]
    fn batched_build_matches_single_pass(
        rows in vectors_strategy(4, 60),
        batch_size in 1usize..20,
        variant in prop_oneof![
            Just(IndexVariant::Ivfadc),
            Just(IndexVariant::Ivpq),
            Just(IndexVariant::Pq),
        ],
    ) {
        let corpus = VectorStore::from_vectors(4, to_words(&rows)).unwrap();
        let config = IndexingConfig {
            m: 2,
            k: 4,
            k_coarse: 3,
            multi_coarse: 1,
            variant,
            kmeans_iterations: 3,
            ..IndexingConfig::default()
        };
        let builder = IndexBuilder::train(&corpus, &config).unwrap();

        let single = builder.build(corpus.vectors()).unwrap();
        let batched = builder.build_batched(corpus.feeder(batch_size)).unwrap();
        prop_assert_eq!(&single, &batched);
        prop_assert_eq!(single.entries.len(), rows.len());
        prop_assert_eq!(single.counts.total(), rows.len() as u64);
    }
}
