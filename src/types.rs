use serde::{Deserialize, Serialize};

use crate::error::{Result, WordPqError};

/// Integer identifier of a word vector, assigned in corpus order starting at 1.
pub type VectorId = u32;

/// Combined coarse cell identifier. In multi-index mode this is the
/// radix-encoded tuple of per-subspace centroid indices.
pub type CellId = u32;

/// Longest label kept for a word; longer labels are truncated on load.
pub const MAX_WORD_LEN: usize = 100;

/// Distance metric used for exact distance computation.
///
/// Approximate (ADC) distances are always squared Euclidean on the codes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Squared Euclidean (L2) distance.
    #[default]
    Euclidean,
    /// `1 - cosine_similarity`.
    Cosine,
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistanceMetric::Euclidean => write!(f, "euclidean"),
            DistanceMetric::Cosine => write!(f, "cosine"),
        }
    }
}

/// Index layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexVariant {
    /// Coarse quantizer + product quantization of the residual.
    #[default]
    Ivfadc,
    /// Coarse quantizer + product quantization of the raw vector.
    Ivpq,
    /// Plain product quantization; every vector lives in cell 0.
    Pq,
}

impl IndexVariant {
    /// Whether fine codes encode `vector - coarse_centroid`.
    pub fn is_residual(self) -> bool {
        matches!(self, IndexVariant::Ivfadc)
    }

    /// Whether a coarse quantizer partitions the corpus.
    pub fn has_coarse(self) -> bool {
        !matches!(self, IndexVariant::Pq)
    }
}

impl std::fmt::Display for IndexVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexVariant::Ivfadc => write!(f, "ivfadc"),
            IndexVariant::Ivpq => write!(f, "ivpq"),
            IndexVariant::Pq => write!(f, "pq"),
        }
    }
}

/// A word vector loaded from the corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordVector {
    pub id: VectorId,
    pub word: String,
    pub values: Vec<f32>,
}

impl WordVector {
    pub fn new(id: VectorId, word: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            id,
            word: word.into(),
            values,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// Compact per-vector representation stored in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizedEntry {
    pub id: VectorId,
    pub word: String,
    /// Combined coarse cell id (0 for the plain PQ variant).
    pub cell: CellId,
    /// One code per fine subspace, each in `[0, k)`.
    pub codes: Vec<u16>,
}

/// Search method selector. Numeric values match the method flag used by
/// the evaluation scripts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    /// Approximate distances over codes only.
    #[default]
    Pq,
    /// Exact distances against the raw vectors.
    Exact,
    /// Approximate shortlist of `k * alpha`, re-ranked exactly.
    PqPostVerify,
}

impl TryFrom<u8> for SearchMethod {
    type Error = WordPqError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SearchMethod::Pq),
            1 => Ok(SearchMethod::Exact),
            2 => Ok(SearchMethod::PqPostVerify),
            other => Err(WordPqError::Config(format!(
                "unknown search method flag: {other}"
            ))),
        }
    }
}

impl From<SearchMethod> for u8 {
    fn from(method: SearchMethod) -> u8 {
        match method {
            SearchMethod::Pq => 0,
            SearchMethod::Exact => 1,
            SearchMethod::PqPostVerify => 2,
        }
    }
}

/// How many coarse cells a query visits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ProbeStrategy {
    /// Visit exactly `pvf` cells.
    #[default]
    Fixed,
    /// Visit cells in ascending distance until, with the given confidence,
    /// the visited cells hold at least `k * alpha` targets. Ignores `pvf`.
    Confidence { confidence: f32 },
}

/// Immutable per-call search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Number of coarse cells probed.
    pub pvf: usize,
    /// Post-verification multiplier: the shortlist holds `k * alpha` candidates.
    pub alpha: usize,
    pub method: SearchMethod,
    #[serde(default)]
    pub probe: ProbeStrategy,
    /// Keep probing further cells while fewer than `k` candidates were found.
    #[serde(default)]
    pub expand_until_k: bool,
    #[serde(default)]
    pub metric: DistanceMetric,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            pvf: 1,
            alpha: 1,
            method: SearchMethod::Pq,
            probe: ProbeStrategy::Fixed,
            expand_until_k: false,
            metric: DistanceMetric::Euclidean,
        }
    }
}

impl SearchParams {
    pub fn with_method(mut self, method: SearchMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_pvf(mut self, pvf: usize) -> Self {
        self.pvf = pvf;
        self
    }

    pub fn with_alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_probe(mut self, probe: ProbeStrategy) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_expand_until_k(mut self, expand: bool) -> Self {
        self.expand_until_k = expand;
        self
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Size of the approximate shortlist handed to post-verification.
    pub fn shortlist_size(&self, k: usize) -> usize {
        k.saturating_mul(self.alpha.max(1))
    }
}

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: VectorId,
    pub word: String,
    pub distance: f32,
}
