//! Application startup and the index build pipeline.
//!
//! Kept out of `main.rs` so it runs under `cargo test --lib` against the
//! in-memory or local storage backends.

use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, StorageConfig};
use crate::corpus::{load_corpus, LoadReport};
use crate::error::Result;
use crate::index::builder::IndexBuilder;
use crate::storage::{BlobStore, IndexStorage, ObjectIndexStore};
use crate::types::IndexVariant;

/// Resolve the configuration file path.
///
/// Priority:
/// 1. `WORDPQ_CONFIG` environment variable
/// 2. `./wordpq.toml` if it exists
/// 3. None (use defaults)
pub fn resolve_config_path() -> Option<String> {
    std::env::var("WORDPQ_CONFIG").ok().or_else(|| {
        let default = "wordpq.toml";
        std::path::Path::new(default)
            .exists()
            .then(|| default.to_string())
    })
}

/// Initialize tracing subscriber from logging config.
///
/// Uses `RUST_LOG` if set, otherwise `config.logging.level`.
pub fn init_logging(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

pub fn open_storage(config: &StorageConfig) -> Result<ObjectIndexStore> {
    let store = BlobStore::from_config(config)?;
    info!(backend = %config.backend, prefix = %config.prefix, "storage ready");
    Ok(ObjectIndexStore::new(store, config.prefix.clone()))
}

/// Outcome of [`build_index`].
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub variant: IndexVariant,
    pub dim: usize,
    pub vectors: u64,
    pub occupied_cells: usize,
    pub corpus: LoadReport,
}

/// Full rebuild: read the corpus, train or load the quantizers, clear the
/// previous index and stream every vector into `storage`.
///
/// Configuration errors surface before storage is touched.
pub async fn build_index(config: &Config, storage: &dyn IndexStorage) -> Result<BuildSummary> {
    config.validate()?;
    let (corpus, report) = load_corpus(&config.corpus.path, &config.corpus)?;
    let builder = IndexBuilder::train(&corpus, &config.indexing)?;

    storage.clear().await?;
    let counts = builder
        .build_streaming(corpus.feeder(config.indexing.batch_size), storage)
        .await?;

    Ok(BuildSummary {
        variant: builder.variant(),
        dim: builder.dim(),
        vectors: counts.total(),
        occupied_cells: counts.coarse.len(),
        corpus: report,
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;
    use crate::index::search::SearchEngine;
    use crate::types::{SearchMethod, SearchParams};
    use std::io::Write;

    fn test_config(tmp: &tempfile::TempDir) -> Config {
        let corpus = tmp.path().join("vectors.txt");
        let mut file = std::fs::File::create(&corpus).unwrap();
        writeln!(file, "4 2").unwrap();
        writeln!(file, "a 0 0").unwrap();
        writeln!(file, "b 0 1").unwrap();
        writeln!(file, "c 10 10").unwrap();
        writeln!(file, "d 10 11").unwrap();

        let mut config = Config::default();
        config.storage.backend = StorageBackend::Local;
        config.storage.root = tmp.path().join("storage");
        config.corpus.path = corpus;
        config.corpus.normalize = false;
        config.indexing.m = 1;
        config.indexing.k = 4;
        config.indexing.k_coarse = 2;
        config.indexing.multi_coarse = 1;
        config.indexing.batch_size = 3;
        config
    }

    #[test]
    fn test_resolve_config_path_from_env() {
        let original = std::env::var("WORDPQ_CONFIG").ok();

        std::env::set_var("WORDPQ_CONFIG", "foo.toml");
        let path = resolve_config_path();

        match original {
            Some(v) => std::env::set_var("WORDPQ_CONFIG", v),
            None => std::env::remove_var("WORDPQ_CONFIG"),
        }

        assert_eq!(path, Some("foo.toml".to_string()));
    }

    #[tokio::test]
    async fn test_build_index_local_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&tmp);
        let storage = open_storage(&config.storage).unwrap();

        let summary = build_index(&config, &storage).await.unwrap();
        assert_eq!(summary.variant, IndexVariant::Ivfadc);
        assert_eq!(summary.vectors, 4);
        assert_eq!(summary.dim, 2);
        assert_eq!(summary.occupied_cells, 2);
        assert!(summary.corpus.skipped.is_empty());

        let engine = SearchEngine::load(&storage).await.unwrap();
        let params = SearchParams::default().with_method(SearchMethod::Exact);
        let hits = engine
            .search(&[0.0, 0.0], 1, None, &params, &storage)
            .await
            .unwrap();
        assert_eq!(hits[0].word, "a");
    }

    #[tokio::test]
    async fn test_rebuild_replaces_previous_index() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&tmp);
        let storage = open_storage(&config.storage).unwrap();

        build_index(&config, &storage).await.unwrap();
        let summary = build_index(&config, &storage).await.unwrap();
        assert_eq!(summary.vectors, 4);
        assert_eq!(storage.load_vectors(None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_build_index_rejects_indivisible_m() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(&tmp);
        config.indexing.m = 3;
        let storage = open_storage(&config.storage).unwrap();

        let err = build_index(&config, &storage).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(storage.load_counts().await.is_err());
    }
}
