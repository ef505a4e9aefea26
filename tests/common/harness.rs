use std::sync::Arc;

use object_store::memory::InMemory;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use wordpq::config::IndexingConfig;
use wordpq::corpus::VectorStore;
use wordpq::index::{IndexBuilder, SearchEngine};
use wordpq::storage::{BlobStore, IndexStorage, ObjectIndexStore};
use wordpq::types::IndexVariant;

/// In-memory index store isolated under a random prefix.
pub struct TestHarness {
    pub storage: ObjectIndexStore,
    pub prefix: String,
}

impl TestHarness {
    pub fn new() -> Self {
        let prefix = format!("test-{}", ulid::Ulid::new());
        let storage = ObjectIndexStore::new(BlobStore::new(Arc::new(InMemory::new())), prefix.clone());
        Self { storage, prefix }
    }

    /// Train on `corpus`, stream it into storage and load a search engine.
    pub async fn build(&self, corpus: &VectorStore, config: &IndexingConfig) -> (IndexBuilder, SearchEngine) {
        let builder = IndexBuilder::train(corpus, config).expect("train should succeed");
        builder
            .build_streaming(corpus.feeder(config.batch_size), &self.storage)
            .await
            .expect("build should succeed");
        let engine = SearchEngine::load(&self.storage as &dyn IndexStorage)
            .await
            .expect("engine should load");
        (builder, engine)
    }
}

/// The two-cluster corpus `(0,0) (0,1) (10,10) (10,11)`, ids 1..=4.
pub fn four_points() -> VectorStore {
    VectorStore::from_rows(
        2,
        vec![
            ("a", vec![0.0, 0.0]),
            ("b", vec![0.0, 1.0]),
            ("c", vec![10.0, 10.0]),
            ("d", vec![10.0, 11.0]),
        ],
    )
    .expect("valid corpus")
}

/// Seeded uniform corpus in `[-1, 1)^dim`.
pub fn random_corpus(n: usize, dim: usize, seed: u64) -> VectorStore {
    let mut rng = StdRng::seed_from_u64(seed);
    let rows = (0..n).map(|i| {
        let values: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        (format!("w{i}"), values)
    });
    VectorStore::from_rows(dim, rows).expect("valid corpus")
}

/// Small indexing config. With `k >= n` every fine subvector is a
/// centroid, so approximate distances equal exact ones.
pub fn small_config(variant: IndexVariant, m: usize, k: usize, k_coarse: usize) -> IndexingConfig {
    IndexingConfig {
        m,
        k,
        k_coarse,
        multi_coarse: 1,
        variant,
        kmeans_iterations: 10,
        batch_size: 7,
        seed: 42,
        ..IndexingConfig::default()
    }
}
