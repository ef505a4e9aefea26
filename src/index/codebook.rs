//! Product-quantization codebooks.
//!
//! A [`Codebook`] splits a `dim`-dimensional vector into `m` contiguous
//! subvectors of `sub_dim = dim / m` floats and holds `k` centroids per
//! subspace. The same structure serves three roles, recorded in
//! [`CodebookKind`]:
//!
//! - the coarse quantizer (`m = 1`, or `m_coarse` for a multi-index),
//! - a flat fine codebook trained on raw vectors (IVPQ and plain PQ),
//! - a residual fine codebook trained on `vector - coarse centroid` (IVFADC).
//!
//! ## Search
//!
//! Asymmetric distance computation: for a query, [`Codebook::distance_table`]
//! precomputes the squared distance from each query subvector to every
//! centroid of its subspace (an `m × k` table). The approximate distance to
//! an encoded vector is then the sum of `m` table lookups.
//!
//! ## Binary format
//!
//! All integers and floats little-endian:
//! ```text
//! [magic: b"WPQB"][version: u16][kind: u8][reserved: u8]
//! [dim: u32][m: u32][k: u32][sub_dim: u32]
//! For pos in 0..m:
//!   For code in 0..k:
//!     [f32 * sub_dim]
//! ```

use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, WordPqError};
use crate::index::distance::{nearest, residual, squared_euclidean};
use crate::index::kmeans::{train_kmeans, KMeansParams};

const MAGIC: &[u8; 4] = b"WPQB";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 24;

/// Largest per-subspace centroid count representable by a `u16` code.
pub const MAX_CODES: usize = u16::MAX as usize + 1;

/// Role of a codebook. Persisted in the binary header so a coarse quantizer
/// file cannot be loaded where a fine codebook is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodebookKind {
    Coarse,
    Fine,
    Residual,
}

impl CodebookKind {
    fn as_u8(self) -> u8 {
        match self {
            CodebookKind::Coarse => 1,
            CodebookKind::Fine => 2,
            CodebookKind::Residual => 3,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(CodebookKind::Coarse),
            2 => Ok(CodebookKind::Fine),
            3 => Ok(CodebookKind::Residual),
            other => Err(WordPqError::Serialization(format!(
                "unknown codebook kind: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for CodebookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodebookKind::Coarse => write!(f, "coarse"),
            CodebookKind::Fine => write!(f, "fine"),
            CodebookKind::Residual => write!(f, "residual"),
        }
    }
}

/// Training settings shared by every codebook kind.
#[derive(Debug, Clone, Copy)]
pub struct TrainParams {
    /// Number of subspaces.
    pub m: usize,
    /// Centroids per subspace.
    pub k: usize,
    /// Lloyd rounds per subspace.
    pub iterations: usize,
    pub seed: u64,
}

/// Trained centroid sets, one per subspace.
#[derive(Debug, Clone, PartialEq)]
pub struct Codebook {
    pub kind: CodebookKind,
    /// Full vector dimension.
    pub dim: usize,
    /// Number of subspaces.
    pub m: usize,
    /// Centroids per subspace.
    pub k: usize,
    /// `dim / m`.
    pub sub_dim: usize,
    /// Flat storage: centroid `(pos, code)` starts at `(pos * k + code) * sub_dim`.
    centroids: Vec<f32>,
}

impl Codebook {
    /// Assemble a codebook from per-subspace centroid lists.
    pub fn from_centroids(kind: CodebookKind, dim: usize, sets: Vec<Vec<Vec<f32>>>) -> Result<Self> {
        let m = sets.len();
        validate_shape(dim, m)?;
        let sub_dim = dim / m;
        let k = sets.first().map(|s| s.len()).unwrap_or(0);
        if k == 0 || k > MAX_CODES {
            return Err(WordPqError::Config(format!(
                "k must be in 1..={MAX_CODES}, got {k}"
            )));
        }

        let mut centroids = Vec::with_capacity(m * k * sub_dim);
        for set in &sets {
            if set.len() != k {
                return Err(WordPqError::Index(format!(
                    "ragged codebook: expected {k} centroids per subspace, got {}",
                    set.len()
                )));
            }
            for c in set {
                if c.len() != sub_dim {
                    return Err(WordPqError::DimensionMismatch {
                        expected: sub_dim,
                        actual: c.len(),
                    });
                }
                centroids.extend_from_slice(c);
            }
        }

        Ok(Self {
            kind,
            dim,
            m,
            k,
            sub_dim,
            centroids,
        })
    }

    /// Train `m` independent subspace codebooks on raw vectors.
    ///
    /// Fails with a configuration error when `dim` is not divisible by `m`.
    pub fn train(kind: CodebookKind, vectors: &[&[f32]], dim: usize, params: TrainParams) -> Result<Self> {
        validate_shape(dim, params.m)?;
        if params.k == 0 || params.k > MAX_CODES {
            return Err(WordPqError::Config(format!(
                "k must be in 1..={MAX_CODES}, got {}",
                params.k
            )));
        }
        if vectors.is_empty() {
            return Err(WordPqError::Index(
                "cannot train codebook on empty dataset".into(),
            ));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            return Err(WordPqError::DimensionMismatch {
                expected: dim,
                actual: bad.len(),
            });
        }

        let sub_dim = dim / params.m;
        info!(
            kind = %kind,
            n = vectors.len(),
            dim = dim,
            m = params.m,
            k = params.k,
            "training codebook"
        );

        let mut sets = Vec::with_capacity(params.m);
        for pos in 0..params.m {
            let start = pos * sub_dim;
            let subvectors: Vec<&[f32]> = vectors
                .iter()
                .map(|v| &v[start..start + sub_dim])
                .collect();
            let centroids = train_kmeans(
                &subvectors,
                sub_dim,
                KMeansParams {
                    k: params.k,
                    iterations: params.iterations,
                    seed: params.seed.wrapping_add(pos as u64),
                },
            )?;
            debug!(pos = pos, "subspace trained");
            sets.push(centroids);
        }

        Self::from_centroids(kind, dim, sets)
    }

    /// Train a residual codebook: every training vector is reduced by its
    /// nearest coarse reconstruction before subspace training.
    pub fn train_residual(coarse: &Codebook, vectors: &[&[f32]], params: TrainParams) -> Result<Self> {
        if let Some(bad) = vectors.iter().find(|v| v.len() != coarse.dim) {
            return Err(WordPqError::DimensionMismatch {
                expected: coarse.dim,
                actual: bad.len(),
            });
        }
        let residuals: Vec<Vec<f32>> = vectors
            .par_iter()
            .map(|v| {
                let codes = coarse.encode(v);
                residual(v, &coarse.reconstruct(&codes))
            })
            .collect();
        let refs: Vec<&[f32]> = residuals.iter().map(|r| r.as_slice()).collect();
        Self::train(CodebookKind::Residual, &refs, coarse.dim, params)
    }

    /// Centroid `code` of subspace `pos`.
    #[inline]
    pub fn centroid(&self, pos: usize, code: usize) -> &[f32] {
        let start = (pos * self.k + code) * self.sub_dim;
        &self.centroids[start..start + self.sub_dim]
    }

    /// All centroids of subspace `pos`, in code order.
    pub fn subspace(&self, pos: usize) -> impl Iterator<Item = &[f32]> + '_ {
        let start = pos * self.k * self.sub_dim;
        self.centroids[start..start + self.k * self.sub_dim].chunks_exact(self.sub_dim)
    }

    /// Nearest centroid per subspace. Ties resolve to the lowest code.
    pub fn encode(&self, vector: &[f32]) -> Vec<u16> {
        debug_assert_eq!(vector.len(), self.dim);
        (0..self.m)
            .map(|pos| {
                let sub = &vector[pos * self.sub_dim..(pos + 1) * self.sub_dim];
                nearest(sub, self.subspace(pos))
                    .map(|(code, _)| code as u16)
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Concatenate the centroids selected by `codes`.
    pub fn reconstruct(&self, codes: &[u16]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dim);
        for (pos, &code) in codes.iter().enumerate() {
            out.extend_from_slice(self.centroid(pos, code as usize));
        }
        out
    }

    /// Per-query `m × k` table of squared subvector distances. Subspaces are
    /// filled in parallel.
    pub fn distance_table(&self, query: &[f32]) -> Vec<f32> {
        debug_assert_eq!(query.len(), self.dim);
        let mut table = vec![0.0f32; self.m * self.k];
        table
            .par_chunks_mut(self.k)
            .enumerate()
            .for_each(|(pos, row)| {
                let sub = &query[pos * self.sub_dim..(pos + 1) * self.sub_dim];
                for (slot, centroid) in row.iter_mut().zip(self.subspace(pos)) {
                    *slot = squared_euclidean(sub, centroid);
                }
            });
        table
    }

    /// Sum of table lookups for one encoded vector.
    #[inline]
    pub fn adc_distance(&self, table: &[f32], codes: &[u16]) -> f32 {
        codes
            .iter()
            .enumerate()
            .map(|(pos, &code)| table[pos * self.k + code as usize])
            .sum()
    }

    /// Serialize to the versioned binary format.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.centroids.len() * 4);
        buf.put_slice(MAGIC);
        buf.put_u16_le(FORMAT_VERSION);
        buf.put_u8(self.kind.as_u8());
        buf.put_u8(0);
        buf.put_u32_le(self.dim as u32);
        buf.put_u32_le(self.m as u32);
        buf.put_u32_le(self.k as u32);
        buf.put_u32_le(self.sub_dim as u32);
        for &val in &self.centroids {
            buf.put_f32_le(val);
        }
        buf.freeze()
    }

    /// Deserialize from the versioned binary format.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(WordPqError::Serialization(
                "codebook blob too small for header".into(),
            ));
        }
        let mut buf = data;
        if &buf[..4] != MAGIC {
            return Err(WordPqError::Serialization("bad codebook magic".into()));
        }
        buf.advance(4);
        let version = buf.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(WordPqError::Serialization(format!(
                "unsupported codebook version {version}"
            )));
        }
        let kind = CodebookKind::from_u8(buf.get_u8())?;
        buf.advance(1);
        let dim = buf.get_u32_le() as usize;
        let m = buf.get_u32_le() as usize;
        let k = buf.get_u32_le() as usize;
        let sub_dim = buf.get_u32_le() as usize;

        if dim == 0 || m == 0 || sub_dim.checked_mul(m) != Some(dim) {
            return Err(WordPqError::Serialization(format!(
                "inconsistent codebook header: dim={dim} m={m} sub_dim={sub_dim}"
            )));
        }
        if k == 0 || k > MAX_CODES {
            return Err(WordPqError::Serialization(format!(
                "codebook header k={k} outside 1..={MAX_CODES}"
            )));
        }
        let n_floats = m
            .checked_mul(k)
            .and_then(|n| n.checked_mul(sub_dim))
            .filter(|n| n.checked_mul(4).is_some())
            .ok_or_else(|| {
                WordPqError::Serialization(format!(
                    "codebook header overflows: m={m} k={k} sub_dim={sub_dim}"
                ))
            })?;
        if buf.remaining() != n_floats * 4 {
            return Err(WordPqError::Serialization(format!(
                "codebook body: expected {} bytes, got {}",
                n_floats * 4,
                buf.remaining()
            )));
        }

        let mut centroids = Vec::with_capacity(n_floats);
        for _ in 0..n_floats {
            centroids.push(buf.get_f32_le());
        }

        Ok(Self {
            kind,
            dim,
            m,
            k,
            sub_dim,
            centroids,
        })
    }
}

fn validate_shape(dim: usize, m: usize) -> Result<()> {
    if dim == 0 || m == 0 {
        return Err(WordPqError::Config("dim and m must be > 0".into()));
    }
    if dim % m != 0 {
        return Err(WordPqError::Config(format!(
            "dim ({dim}) must be divisible by m ({m})"
        )));
    }
    Ok(())
}

/// Write a codebook to `path`.
pub fn store_quantizer(codebook: &Codebook, path: &Path) -> Result<()> {
    std::fs::write(path, codebook.to_bytes())?;
    info!(path = %path.display(), kind = %codebook.kind, "stored quantizer");
    Ok(())
}

/// Read a codebook previously written by [`store_quantizer`].
pub fn load_quantizer(path: &Path) -> Result<Codebook> {
    let data = std::fs::read(path)?;
    let codebook = Codebook::from_bytes(&data)?;
    info!(path = %path.display(), kind = %codebook.kind, "loaded quantizer");
    Ok(codebook)
}

/// Reuse the quantizer stored at `path` when it exists, otherwise run
/// `train` and store the result there.
pub fn construct_or_load<F>(path: Option<&Path>, expected: CodebookKind, train: F) -> Result<Codebook>
where
    F: FnOnce() -> Result<Codebook>,
{
    match path {
        Some(p) if p.exists() => {
            let codebook = load_quantizer(p)?;
            if codebook.kind != expected {
                return Err(WordPqError::Config(format!(
                    "{} holds a {} quantizer, expected {}",
                    p.display(),
                    codebook.kind,
                    expected
                )));
            }
            Ok(codebook)
        }
        Some(p) => {
            let codebook = train()?;
            store_quantizer(&codebook, p)?;
            Ok(codebook)
        }
        None => train(),
    }
}
