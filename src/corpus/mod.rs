//! Word-vector corpus loading.
//!
//! Text format: a header line `<count> <dim>`, then one row per word,
//! `<label> <f_1> ... <f_dim>`, whitespace separated. Malformed rows are
//! skipped and reported, never fatal.

pub mod feeder;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::CorpusConfig;
use crate::error::{Result, WordPqError};
use crate::index::distance::normalize;
use crate::types::{VectorId, WordVector};

pub use feeder::BatchFeeder;

/// In-memory corpus. Ids are dense, starting at 1 in file order.
#[derive(Debug, Clone, Default)]
pub struct VectorStore {
    dim: usize,
    vectors: Vec<WordVector>,
}

/// What happened while reading a corpus file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Count announced by the header.
    pub declared: usize,
    pub loaded: usize,
    /// `(line number, reason)` for every skipped row.
    pub skipped: Vec<(usize, String)>,
    pub truncated_labels: usize,
    /// Rows kept as-is because their norm is zero.
    pub zero_norm: usize,
}

impl VectorStore {
    /// Build a store from vectors that already carry ids.
    pub fn from_vectors(dim: usize, vectors: Vec<WordVector>) -> Result<Self> {
        if let Some(bad) = vectors.iter().find(|v| v.dim() != dim) {
            return Err(WordPqError::DimensionMismatch {
                expected: dim,
                actual: bad.dim(),
            });
        }
        Ok(Self { dim, vectors })
    }

    /// Build a store from bare rows, assigning ids from 1.
    pub fn from_rows<I, S>(dim: usize, rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<f32>)>,
        S: Into<String>,
    {
        let vectors = rows
            .into_iter()
            .enumerate()
            .map(|(i, (word, values))| WordVector::new(i as VectorId + 1, word, values))
            .collect();
        Self::from_vectors(dim, vectors)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn vectors(&self) -> &[WordVector] {
        &self.vectors
    }

    pub fn get(&self, id: VectorId) -> Option<&WordVector> {
        // ids are dense from 1, but fall back to a scan for foreign stores
        let idx = (id as usize).checked_sub(1)?;
        match self.vectors.get(idx) {
            Some(v) if v.id == id => Some(v),
            _ => self.vectors.iter().find(|v| v.id == id),
        }
    }

    pub fn find_word(&self, word: &str) -> Option<&WordVector> {
        self.vectors.iter().find(|v| v.word == word)
    }

    /// The first `n` vectors as slices, the training sample.
    pub fn sample(&self, n: usize) -> Vec<&[f32]> {
        self.vectors
            .iter()
            .take(n)
            .map(|v| v.values.as_slice())
            .collect()
    }

    pub fn feeder(&self, batch_size: usize) -> BatchFeeder<'_> {
        BatchFeeder::new(&self.vectors, batch_size)
    }
}

/// Read and parse a corpus file.
pub fn load_corpus(path: &Path, config: &CorpusConfig) -> Result<(VectorStore, LoadReport)> {
    let file = File::open(path)?;
    let (store, report) = parse_corpus(BufReader::new(file), config)?;
    info!(
        path = %path.display(),
        loaded = report.loaded,
        skipped = report.skipped.len(),
        dim = store.dim(),
        "corpus loaded"
    );
    Ok((store, report))
}

/// Parse a corpus from any buffered reader.
///
/// Only an unreadable header is fatal.
pub fn parse_corpus<R: BufRead>(reader: R, config: &CorpusConfig) -> Result<(VectorStore, LoadReport)> {
    let mut lines = reader.lines();
    let header = lines.next().transpose()?.ok_or(WordPqError::Parse {
        line: 1,
        reason: "empty corpus".into(),
    })?;
    let (declared, dim) = parse_header(&header)?;

    let mut report = LoadReport {
        declared,
        ..LoadReport::default()
    };
    let mut vectors = Vec::with_capacity(declared.min(config.max_vectors.unwrap_or(declared)).min(1 << 20));

    for (idx, line) in lines.enumerate() {
        if config.max_vectors.is_some_and(|max| vectors.len() >= max) {
            break;
        }
        let line_no = idx + 2;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let (word, mut values) = match parse_row(&line, dim) {
            Ok(row) => row,
            Err(reason) => {
                warn!(line = line_no, reason = %reason, "skipping corpus row");
                report.skipped.push((line_no, reason));
                continue;
            }
        };

        let word = if word.chars().count() > config.max_word_len {
            report.truncated_labels += 1;
            word.chars().take(config.max_word_len).collect::<String>()
        } else {
            word.to_string()
        };

        if config.normalize && !normalize(&mut values) {
            report.zero_norm += 1;
        }

        let id = vectors.len() as VectorId + 1;
        vectors.push(WordVector::new(id, word, values));
    }

    report.loaded = vectors.len();
    if config.max_vectors.is_none() && report.loaded + report.skipped.len() != declared {
        warn!(
            declared = declared,
            rows = report.loaded + report.skipped.len(),
            "row count differs from header"
        );
    }

    Ok((VectorStore { dim, vectors }, report))
}

fn parse_header(line: &str) -> Result<(usize, usize)> {
    let mut tokens = line.split_whitespace();
    let parse = |tok: Option<&str>| tok.and_then(|t| t.parse::<usize>().ok());
    match (parse(tokens.next()), parse(tokens.next()), tokens.next()) {
        (Some(count), Some(dim), None) if dim > 0 => Ok((count, dim)),
        _ => Err(WordPqError::Parse {
            line: 1,
            reason: format!("expected \"<count> <dim>\" header, got {line:?}"),
        }),
    }
}

fn parse_row(line: &str, dim: usize) -> std::result::Result<(&str, Vec<f32>), String> {
    let mut tokens = line.split_whitespace();
    let word = tokens.next().ok_or_else(|| "empty row".to_string())?;
    let values = tokens
        .map(|t| t.parse::<f32>().map_err(|_| format!("non-numeric field {t:?}")))
        .collect::<std::result::Result<Vec<f32>, String>>()?;
    if values.len() != dim {
        return Err(format!("expected {dim} values, found {}", values.len()));
    }
    if values.iter().any(|x| !x.is_finite()) {
        return Err("non-finite value".to_string());
    }
    Ok((word, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config() -> CorpusConfig {
        CorpusConfig {
            normalize: false,
            max_vectors: None,
            max_word_len: 100,
            ..CorpusConfig::default()
        }
    }

    #[test]
    fn test_parse_skips_bad_rows() {
        let text = "4 2\napple 1.0 0.0\nbroken 1.0\npear x 2.0\nplum 0.0 3.0\n";
        let (store, report) = parse_corpus(text.as_bytes(), &config()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.dim(), 2);
        assert_eq!(report.loaded, 2);
        assert_eq!(
            report.skipped.iter().map(|(l, _)| *l).collect::<Vec<_>>(),
            vec![3, 4]
        );
        // ids stay dense over accepted rows
        assert_eq!(store.get(2).unwrap().word, "plum");
    }

    #[test]
    fn test_normalize_keeps_zero_rows() {
        let text = "2 2\na 3.0 4.0\nz 0.0 0.0\n";
        let cfg = CorpusConfig {
            normalize: true,
            ..config()
        };
        let (store, report) = parse_corpus(text.as_bytes(), &cfg).unwrap();
        let unit = &store.get(1).unwrap().values;
        assert!((unit[0] - 0.6).abs() < 1e-6 && (unit[1] - 0.8).abs() < 1e-6);
        assert_eq!(store.get(2).unwrap().values, vec![0.0, 0.0]);
        assert_eq!(report.zero_norm, 1);
    }

    #[test]
    fn test_label_truncation_and_cap() {
        let long = "x".repeat(120);
        let text = format!("3 1\n{long} 1.0\nb 2.0\nc 3.0\n");
        let cfg = CorpusConfig {
            max_vectors: Some(2),
            ..config()
        };
        let (store, report) = parse_corpus(text.as_bytes(), &cfg).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(1).unwrap().word.chars().count(), 100);
        assert_eq!(report.truncated_labels, 1);
    }

    #[test]
    fn test_bad_header_is_fatal() {
        let err = parse_corpus("words 300\n".as_bytes(), &config()).unwrap_err();
        assert!(matches!(err, WordPqError::Parse { line: 1, .. }));
        assert!(parse_corpus("".as_bytes(), &config()).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "2 3").unwrap();
        writeln!(file, "king 0.1 0.2 0.3").unwrap();
        writeln!(file, "queen 0.2 0.1 0.3").unwrap();
        let (store, report) = load_corpus(file.path(), &config()).unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(store.find_word("queen").unwrap().id, 2);
        assert_eq!(store.sample(1).len(), 1);
    }

    #[test]
    fn test_from_vectors_rejects_mixed_dims() {
        let err = VectorStore::from_rows(2, vec![("a", vec![1.0, 2.0]), ("b", vec![1.0])]).unwrap_err();
        assert!(err.is_configuration());
    }
}
