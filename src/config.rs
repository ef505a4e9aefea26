use crate::error::{Result, WordPqError};
use crate::types::{DistanceMetric, IndexVariant, SearchMethod};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Local => write!(f, "local"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// Root directory for the local backend.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Key prefix every index object lives under.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Fine subspaces.
    #[serde(default = "default_m")]
    pub m: usize,
    /// Centroids per fine subspace.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Centroids per coarse subspace.
    #[serde(default = "default_k_coarse")]
    pub k_coarse: usize,
    /// Coarse subspaces; 1 is a single index, more is a multi-index.
    #[serde(default = "default_multi_coarse")]
    pub multi_coarse: usize,
    #[serde(default)]
    pub variant: IndexVariant,
    #[serde(default = "default_train_size_coarse")]
    pub train_size_coarse: usize,
    #[serde(default = "default_train_size_fine")]
    pub train_size_fine: usize,
    #[serde(default = "default_kmeans_iterations")]
    pub kmeans_iterations: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Reuse (or create) a persisted coarse quantizer at this path.
    #[serde(default)]
    pub coarse_quantizer_file: Option<PathBuf>,
    /// Reuse (or create) a persisted fine codebook at this path.
    #[serde(default)]
    pub fine_codebook_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_pvf")]
    pub pvf: usize,
    #[serde(default = "default_alpha")]
    pub alpha: usize,
    #[serde(default)]
    pub method: SearchMethod,
    /// When set, probe cells until this confidence is reached instead of a
    /// fixed `pvf`.
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub expand_until_k: bool,
    #[serde(default)]
    pub metric: DistanceMetric,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusConfig {
    #[serde(default = "default_corpus_path")]
    pub path: PathBuf,
    #[serde(default = "default_normalize")]
    pub normalize: bool,
    /// Stop after this many vectors.
    #[serde(default)]
    pub max_vectors: Option<usize>,
    #[serde(default = "default_max_word_len")]
    pub max_word_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_backend() -> StorageBackend {
    match std::env::var("WORDPQ_STORAGE_BACKEND").as_deref() {
        Ok("memory") => StorageBackend::Memory,
        _ => StorageBackend::Local,
    }
}
fn default_root() -> PathBuf {
    std::env::var("WORDPQ_STORAGE_ROOT")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./wordpq-data"))
}
fn default_prefix() -> String {
    "index".to_string()
}
fn default_m() -> usize {
    12
}
fn default_k() -> usize {
    256
}
fn default_k_coarse() -> usize {
    1000
}
fn default_multi_coarse() -> usize {
    1
}
fn default_train_size_coarse() -> usize {
    100_000
}
fn default_train_size_fine() -> usize {
    100_000
}
fn default_kmeans_iterations() -> usize {
    10
}
fn default_batch_size() -> usize {
    std::env::var("WORDPQ_BATCH_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(50_000)
}
fn default_seed() -> u64 {
    42
}
fn default_pvf() -> usize {
    1
}
fn default_alpha() -> usize {
    10
}
fn default_corpus_path() -> PathBuf {
    std::env::var("WORDPQ_CORPUS")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("vectors.txt"))
}
fn default_normalize() -> bool {
    true
}
fn default_max_word_len() -> usize {
    crate::types::MAX_WORD_LEN
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    std::env::var("WORDPQ_LOG_FORMAT").unwrap_or_else(|_| "plain".to_string())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            root: default_root(),
            prefix: default_prefix(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            m: default_m(),
            k: default_k(),
            k_coarse: default_k_coarse(),
            multi_coarse: default_multi_coarse(),
            variant: IndexVariant::default(),
            train_size_coarse: default_train_size_coarse(),
            train_size_fine: default_train_size_fine(),
            kmeans_iterations: default_kmeans_iterations(),
            batch_size: default_batch_size(),
            seed: default_seed(),
            coarse_quantizer_file: None,
            fine_codebook_file: None,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            pvf: default_pvf(),
            alpha: default_alpha(),
            method: SearchMethod::default(),
            confidence: None,
            expand_until_k: false,
            metric: DistanceMetric::default(),
        }
    }
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            path: default_corpus_path(),
            normalize: default_normalize(),
            max_vectors: None,
            max_word_len: default_max_word_len(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl SearchConfig {
    /// Per-call parameters seeded from the configured defaults.
    pub fn params(&self) -> crate::types::SearchParams {
        let probe = match self.confidence {
            Some(confidence) => crate::types::ProbeStrategy::Confidence { confidence },
            None => crate::types::ProbeStrategy::Fixed,
        };
        crate::types::SearchParams::default()
            .with_pvf(self.pvf)
            .with_alpha(self.alpha)
            .with_method(self.method)
            .with_probe(probe)
            .with_expand_until_k(self.expand_until_k)
            .with_metric(self.metric)
    }
}

impl Config {
    /// Load config from a TOML file, falling back to defaults.
    /// After loading, env var overrides are applied so that:
    /// env var > TOML file > defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    WordPqError::Config(format!("failed to read config file {p}: {e}"))
                })?;
                Self::from_toml(&content)?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| WordPqError::Config(format!("failed to parse config: {e}")))
    }

    /// Reject settings that would fail later, before anything is trained or
    /// written.
    pub fn validate(&self) -> Result<()> {
        let ix = &self.indexing;
        if ix.m == 0 || ix.k == 0 {
            return Err(WordPqError::Config("m and k must be > 0".into()));
        }
        if ix.k > crate::index::codebook::MAX_CODES {
            return Err(WordPqError::Config(format!(
                "k ({}) exceeds the 16-bit code range",
                ix.k
            )));
        }
        if ix.variant.has_coarse() {
            if ix.k_coarse == 0 || ix.multi_coarse == 0 {
                return Err(WordPqError::Config(
                    "k_coarse and multi_coarse must be > 0".into(),
                ));
            }
            let cells = (ix.k_coarse as u64).checked_pow(ix.multi_coarse as u32);
            if !matches!(cells, Some(n) if n <= u32::MAX as u64 + 1) {
                return Err(WordPqError::Config(format!(
                    "k_coarse^multi_coarse = {}^{} does not fit a 32-bit cell id",
                    ix.k_coarse, ix.multi_coarse
                )));
            }
        }
        if ix.batch_size == 0 {
            return Err(WordPqError::Config("batch_size must be > 0".into()));
        }
        if ix.kmeans_iterations == 0 {
            return Err(WordPqError::Config(
                "kmeans_iterations must be > 0".into(),
            ));
        }
        if self.search.pvf == 0 {
            return Err(WordPqError::Config("pvf must be > 0".into()));
        }
        if let Some(c) = self.search.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(WordPqError::Config(format!(
                    "confidence must be within [0, 1], got {c}"
                )));
            }
        }
        if self.corpus.max_word_len == 0 {
            return Err(WordPqError::Config("max_word_len must be > 0".into()));
        }
        Ok(())
    }

    /// Apply environment variable overrides on top of file/default values.
    fn apply_env_overrides(&mut self) {
        // Storage
        if let Ok(v) = std::env::var("WORDPQ_STORAGE_BACKEND") {
            match v.as_str() {
                "local" => self.storage.backend = StorageBackend::Local,
                "memory" => self.storage.backend = StorageBackend::Memory,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("WORDPQ_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("WORDPQ_STORAGE_PREFIX") {
            self.storage.prefix = v;
        }

        // Indexing
        if let Some(v) = std::env::var("WORDPQ_M").ok().and_then(|v| v.parse().ok()) {
            self.indexing.m = v;
        }
        if let Some(v) = std::env::var("WORDPQ_K").ok().and_then(|v| v.parse().ok()) {
            self.indexing.k = v;
        }
        if let Some(v) = std::env::var("WORDPQ_K_COARSE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.indexing.k_coarse = v;
        }
        if let Some(v) = std::env::var("WORDPQ_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.indexing.batch_size = v;
        }
        if let Ok(v) = std::env::var("WORDPQ_COARSE_QUANTIZER_FILE") {
            self.indexing.coarse_quantizer_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("WORDPQ_FINE_CODEBOOK_FILE") {
            self.indexing.fine_codebook_file = Some(PathBuf::from(v));
        }

        // Search
        if let Some(v) = std::env::var("WORDPQ_PVF").ok().and_then(|v| v.parse().ok()) {
            self.search.pvf = v;
        }
        if let Some(v) = std::env::var("WORDPQ_ALPHA")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.search.alpha = v;
        }

        // Corpus
        if let Ok(v) = std::env::var("WORDPQ_CORPUS") {
            self.corpus.path = PathBuf::from(v);
        }

        // Logging
        if let Ok(v) = std::env::var("WORDPQ_LOG_FORMAT") {
            self.logging.format = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProbeStrategy;

    #[test]
    fn test_parse_sections() {
        let config = Config::from_toml(
            r#"
            [storage]
            backend = "memory"
            prefix = "words"

            [indexing]
            m = 4
            k = 16
            k_coarse = 8
            multi_coarse = 2
            variant = "ivpq"

            [search]
            pvf = 3
            method = "pq_post_verify"
            confidence = 0.9
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.prefix, "words");
        assert_eq!(config.indexing.m, 4);
        assert_eq!(config.indexing.multi_coarse, 2);
        assert_eq!(config.indexing.variant, IndexVariant::Ivpq);
        assert_eq!(config.indexing.kmeans_iterations, 10);

        let params = config.search.params();
        assert_eq!(params.pvf, 3);
        assert_eq!(params.method, SearchMethod::PqPostVerify);
        assert_eq!(params.probe, ProbeStrategy::Confidence { confidence: 0.9 });
        config.validate().unwrap();
    }

    #[test]
    fn test_malformed_toml() {
        let err = Config::from_toml("[indexing]\nm = \"twelve\"").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_validate_rejects_oversized_multi_index() {
        let mut config = Config::default();
        config.indexing.k_coarse = 70_000;
        config.indexing.multi_coarse = 2;
        assert!(config.validate().is_err());

        // plain PQ ignores the coarse settings
        config.indexing.variant = IndexVariant::Pq;
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_confidence_range() {
        let mut config = Config::default();
        config.search.confidence = Some(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Some("/nonexistent/wordpq.toml")).unwrap_err();
        assert!(err.is_configuration());
    }
}
