//! Index construction.
//!
//! Pipeline: train (or load) the coarse quantizer and fine codebook, then
//! assign every vector to a cell and encode it into `m` subcodes, counting
//! occupancy along the way. Assignment runs in parallel inside a batch;
//! batches are processed in order so entry order always matches input order.

use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::IndexingConfig;
use crate::corpus::{BatchFeeder, VectorStore};
use crate::error::{Result, WordPqError};
use crate::index::codebook::{construct_or_load, Codebook, CodebookKind, TrainParams};
use crate::index::coarse::CoarseQuantizer;
use crate::index::counts::OccupancyCounts;
use crate::index::distance::residual;
use crate::storage::IndexStorage;
use crate::types::{IndexVariant, QuantizedEntry, WordVector};

/// Entries and statistics produced by an in-memory build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutput {
    pub entries: Vec<QuantizedEntry>,
    pub counts: OccupancyCounts,
}

/// Assigns vectors to cells and encodes them with trained quantizers.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    variant: IndexVariant,
    coarse: Option<CoarseQuantizer>,
    fine: Codebook,
}

impl IndexBuilder {
    /// Pair trained quantizers with a variant, checking they fit together.
    pub fn new(variant: IndexVariant, coarse: Option<CoarseQuantizer>, fine: Codebook) -> Result<Self> {
        match (&coarse, variant.has_coarse()) {
            (None, true) => {
                return Err(WordPqError::Config(format!(
                    "{variant} index requires a coarse quantizer"
                )))
            }
            (Some(_), false) => {
                return Err(WordPqError::Config(
                    "plain pq index takes no coarse quantizer".into(),
                ))
            }
            (Some(cq), true) if cq.dim() != fine.dim => {
                return Err(WordPqError::DimensionMismatch {
                    expected: cq.dim(),
                    actual: fine.dim,
                });
            }
            _ => {}
        }
        let expected_kind = if variant.is_residual() {
            CodebookKind::Residual
        } else {
            CodebookKind::Fine
        };
        if fine.kind != expected_kind {
            return Err(WordPqError::Config(format!(
                "{variant} index needs a {expected_kind} codebook, got {}",
                fine.kind
            )));
        }
        Ok(Self {
            variant,
            coarse,
            fine,
        })
    }

    /// Train (or load, when quantizer files are configured) both quantizers
    /// from the head of the corpus.
    ///
    /// Shape errors are reported before any training starts.
    pub fn train(corpus: &VectorStore, config: &IndexingConfig) -> Result<Self> {
        let dim = corpus.dim();
        if config.m == 0 || dim % config.m != 0 {
            return Err(WordPqError::Config(format!(
                "dim ({dim}) must be divisible by m ({})",
                config.m
            )));
        }
        if config.variant.has_coarse()
            && (config.multi_coarse == 0 || dim % config.multi_coarse != 0)
        {
            return Err(WordPqError::Config(format!(
                "dim ({dim}) must be divisible by multi_coarse ({})",
                config.multi_coarse
            )));
        }
        if corpus.is_empty() {
            return Err(WordPqError::Index(
                "cannot train quantizers on an empty corpus".into(),
            ));
        }

        let coarse = if config.variant.has_coarse() {
            let sample = corpus.sample(config.train_size_coarse);
            let codebook = construct_or_load(
                config.coarse_quantizer_file.as_deref(),
                CodebookKind::Coarse,
                || {
                    Codebook::train(
                        CodebookKind::Coarse,
                        &sample,
                        dim,
                        TrainParams {
                            m: config.multi_coarse,
                            k: config.k_coarse,
                            iterations: config.kmeans_iterations,
                            seed: config.seed,
                        },
                    )
                },
            )?;
            if codebook.dim != dim {
                return Err(WordPqError::DimensionMismatch {
                    expected: dim,
                    actual: codebook.dim,
                });
            }
            Some(CoarseQuantizer::new(codebook)?)
        } else {
            None
        };

        let sample = corpus.sample(config.train_size_fine);
        let params = TrainParams {
            m: config.m,
            k: config.k,
            iterations: config.kmeans_iterations,
            seed: config.seed.wrapping_add(1),
        };
        let kind = if config.variant.is_residual() {
            CodebookKind::Residual
        } else {
            CodebookKind::Fine
        };
        let fine = construct_or_load(config.fine_codebook_file.as_deref(), kind, || {
            match (&coarse, kind) {
                (Some(cq), CodebookKind::Residual) => {
                    Codebook::train_residual(cq.codebook(), &sample, params)
                }
                _ => Codebook::train(CodebookKind::Fine, &sample, dim, params),
            }
        })?;

        info!(
            variant = %config.variant,
            dim = dim,
            m = fine.m,
            k = fine.k,
            cells = coarse.as_ref().map(|c| c.num_cells()).unwrap_or(1),
            "quantizers ready"
        );
        Self::new(config.variant, coarse, fine)
    }

    pub fn variant(&self) -> IndexVariant {
        self.variant
    }

    pub fn coarse(&self) -> Option<&CoarseQuantizer> {
        self.coarse.as_ref()
    }

    pub fn fine(&self) -> &Codebook {
        &self.fine
    }

    pub fn dim(&self) -> usize {
        self.fine.dim
    }

    /// Cell and subcodes for one vector.
    pub fn quantize(&self, vector: &WordVector) -> QuantizedEntry {
        let (cell, codes) = match &self.coarse {
            Some(cq) => {
                let cell = cq.assign(&vector.values);
                let codes = if self.variant.is_residual() {
                    self.fine
                        .encode(&residual(&vector.values, &cq.cell_centroid(cell)))
                } else {
                    self.fine.encode(&vector.values)
                };
                (cell, codes)
            }
            None => (0, self.fine.encode(&vector.values)),
        };
        QuantizedEntry {
            id: vector.id,
            word: vector.word.clone(),
            cell,
            codes,
        }
    }

    /// Encode one batch in parallel. Entries keep input order; counts are
    /// gathered per worker and merged by addition.
    pub fn encode_batch(&self, batch: &[WordVector]) -> Result<(Vec<QuantizedEntry>, OccupancyCounts)> {
        if let Some(bad) = batch.iter().find(|v| v.dim() != self.dim()) {
            return Err(WordPqError::DimensionMismatch {
                expected: self.dim(),
                actual: bad.dim(),
            });
        }

        let entries: Vec<QuantizedEntry> = batch.par_iter().map(|v| self.quantize(v)).collect();

        let (m, k) = (self.fine.m, self.fine.k);
        let counts = entries
            .par_iter()
            .fold(
                || OccupancyCounts::new(m, k),
                |mut acc, e| {
                    acc.record(e.cell, &e.codes);
                    acc
                },
            )
            .reduce(
                || OccupancyCounts::new(m, k),
                |mut a, b| {
                    a.merge(&b);
                    a
                },
            );

        Ok((entries, counts))
    }

    /// Single-pass build over the whole input.
    pub fn build(&self, vectors: &[WordVector]) -> Result<BuildOutput> {
        let (entries, counts) = self.encode_batch(vectors)?;
        Ok(BuildOutput { entries, counts })
    }

    /// Batch-mode build held in memory; identical output to [`build`](Self::build).
    pub fn build_batched(&self, feeder: BatchFeeder<'_>) -> Result<BuildOutput> {
        let mut out = BuildOutput {
            entries: Vec::with_capacity(feeder.total()),
            counts: OccupancyCounts::new(self.fine.m, self.fine.k),
        };
        for batch in feeder {
            let (entries, counts) = self.encode_batch(batch)?;
            out.entries.extend(entries);
            out.counts.merge(&counts);
        }
        Ok(out)
    }

    /// Stream batches into `storage`, then persist the quantizers together
    /// with the final occupancy counts. Only one batch of entries is held in
    /// memory at a time.
    pub async fn build_streaming(
        &self,
        mut feeder: BatchFeeder<'_>,
        storage: &dyn IndexStorage,
    ) -> Result<OccupancyCounts> {
        let total = feeder.total();
        info!(
            n = total,
            batch_size = feeder.batch_size(),
            variant = %self.variant,
            "building index"
        );

        let mut counts = OccupancyCounts::new(self.fine.m, self.fine.k);
        while let Some(batch) = feeder.next_batch() {
            let (entries, batch_counts) = self.encode_batch(batch)?;
            storage.upsert_vectors(batch).await?;
            storage.upsert_quantized_entries(&entries).await?;
            counts.merge(&batch_counts);
            debug!(done = feeder.cursor(), total = total, "batch written");
        }

        if let Some(cq) = &self.coarse {
            storage.upsert_coarse_centroids(cq).await?;
        }
        storage.upsert_fine_codebook(&self.fine).await?;
        storage.upsert_counts(&counts).await?;

        info!(
            vectors = counts.total(),
            occupied_cells = counts.coarse.len(),
            "index build complete"
        );
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coarse_2d() -> CoarseQuantizer {
        CoarseQuantizer::new(
            Codebook::from_centroids(
                CodebookKind::Coarse,
                2,
                vec![vec![vec![0.0, 0.0], vec![10.0, 10.0]]],
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn fine_2d(kind: CodebookKind) -> Codebook {
        Codebook::from_centroids(
            kind,
            2,
            vec![
                vec![vec![0.0], vec![1.0], vec![10.0]],
                vec![vec![0.0], vec![1.0], vec![10.0]],
            ],
        )
        .unwrap()
    }

    fn corpus() -> Vec<WordVector> {
        vec![
            WordVector::new(1, "a", vec![0.0, 0.0]),
            WordVector::new(2, "b", vec![0.0, 1.0]),
            WordVector::new(3, "c", vec![10.0, 10.0]),
            WordVector::new(4, "d", vec![10.0, 11.0]),
        ]
    }

    #[test]
    fn test_single_vector_entry() {
        let builder =
            IndexBuilder::new(IndexVariant::Ivfadc, Some(coarse_2d()), fine_2d(CodebookKind::Residual))
                .unwrap();
        let out = builder.build(&corpus()[3..]).unwrap();
        assert_eq!(out.entries.len(), 1);
        let e = &out.entries[0];
        assert_eq!(e.id, 4);
        assert_eq!(e.cell, 1);
        // residual (0, 1)
        assert_eq!(e.codes, vec![0, 1]);
        assert_eq!(out.counts.coarse_count(1), 1);
        assert_eq!(out.counts.fine_count(1, 1), 1);
    }

    #[test]
    fn test_ivpq_encodes_raw_vector() {
        let builder =
            IndexBuilder::new(IndexVariant::Ivpq, Some(coarse_2d()), fine_2d(CodebookKind::Fine)).unwrap();
        let entry = builder.quantize(&corpus()[3]);
        assert_eq!(entry.cell, 1);
        assert_eq!(entry.codes, vec![2, 2]);
    }

    #[test]
    fn test_plain_pq_uses_cell_zero() {
        let builder = IndexBuilder::new(IndexVariant::Pq, None, fine_2d(CodebookKind::Fine)).unwrap();
        let out = builder.build(&corpus()).unwrap();
        assert!(out.entries.iter().all(|e| e.cell == 0));
        assert_eq!(out.counts.coarse_count(0), 4);
    }

    #[test]
    fn test_mismatched_quantizers_rejected() {
        assert!(IndexBuilder::new(IndexVariant::Ivfadc, None, fine_2d(CodebookKind::Residual)).is_err());
        assert!(IndexBuilder::new(IndexVariant::Ivfadc, Some(coarse_2d()), fine_2d(CodebookKind::Fine)).is_err());
        assert!(IndexBuilder::new(IndexVariant::Pq, Some(coarse_2d()), fine_2d(CodebookKind::Fine)).is_err());
    }

    #[test]
    fn test_batched_matches_single_pass() {
        let builder =
            IndexBuilder::new(IndexVariant::Ivfadc, Some(coarse_2d()), fine_2d(CodebookKind::Residual))
                .unwrap();
        let vectors = corpus();
        let whole = builder.build(&vectors).unwrap();
        for batch_size in 1..=vectors.len() {
            let batched = builder
                .build_batched(BatchFeeder::new(&vectors, batch_size))
                .unwrap();
            assert_eq!(batched, whole, "batch_size {batch_size}");
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let builder = IndexBuilder::new(IndexVariant::Pq, None, fine_2d(CodebookKind::Fine)).unwrap();
        let err = builder
            .build(&[WordVector::new(1, "x", vec![1.0, 2.0, 3.0])])
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_train_rejects_indivisible_m() {
        let corpus = VectorStore::from_rows(3, vec![("a", vec![1.0, 2.0, 3.0])]).unwrap();
        let config = IndexingConfig {
            m: 2,
            ..IndexingConfig::default()
        };
        assert!(IndexBuilder::train(&corpus, &config).unwrap_err().is_configuration());
    }

    #[test]
    fn test_train_small_corpus() {
        let corpus = VectorStore::from_vectors(2, corpus()).unwrap();
        let config = IndexingConfig {
            m: 2,
            k: 2,
            k_coarse: 2,
            multi_coarse: 1,
            train_size_coarse: 4,
            train_size_fine: 4,
            ..IndexingConfig::default()
        };
        let builder = IndexBuilder::train(&corpus, &config).unwrap();
        assert_eq!(builder.variant(), IndexVariant::Ivfadc);
        assert_eq!(builder.coarse().unwrap().num_cells(), 2);
        assert_eq!(builder.fine().kind, CodebookKind::Residual);
    }
}
