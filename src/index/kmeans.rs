//! k-means++ seeding followed by a fixed number of Lloyd rounds.
//!
//! The iteration count is the only stop condition. Centroid storage is
//! pre-allocated and swapped between rounds; the assignment step runs on the
//! rayon pool, the update step is a serial reduction.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{Result, WordPqError};
use crate::index::distance::{nearest, squared_euclidean};

/// Lloyd's algorithm settings.
#[derive(Debug, Clone, Copy)]
pub struct KMeansParams {
    /// Number of centroids produced. Always honoured exactly.
    pub k: usize,
    /// Number of Lloyd rounds.
    pub iterations: usize,
    /// Seed for k-means++ sampling.
    pub seed: u64,
}

/// Train exactly `params.k` centroids of length `dim`.
///
/// When there are fewer points than centroids every point becomes a centroid
/// and the remainder is filled by repeating points, so downstream code can
/// rely on the `k` shape.
pub fn train_kmeans(vectors: &[&[f32]], dim: usize, params: KMeansParams) -> Result<Vec<Vec<f32>>> {
    let n = vectors.len();
    let k = params.k;

    if n == 0 {
        return Err(WordPqError::Index(
            "cannot train k-means on empty dataset".into(),
        ));
    }
    if k == 0 {
        return Err(WordPqError::Config("k must be > 0".into()));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
        return Err(WordPqError::DimensionMismatch {
            expected: dim,
            actual: bad.len(),
        });
    }

    if n <= k {
        if n < k {
            warn!(
                requested_k = k,
                n = n,
                "fewer training vectors than centroids, repeating points"
            );
        }
        return Ok((0..k).map(|i| vectors[i % n].to_vec()).collect());
    }

    info!(n = n, k = k, dim = dim, iterations = params.iterations, "starting k-means");

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut centroids = kmeans_pp_init(vectors, k, &mut rng);

    let mut counts = vec![0usize; k];
    let mut next = vec![vec![0.0f32; dim]; k];

    for iter in 0..params.iterations {
        let assignments: Vec<usize> = vectors
            .par_iter()
            .map(|v| {
                nearest(v, centroids.iter().map(|c| c.as_slice()))
                    .map(|(idx, _)| idx)
                    .unwrap_or(0)
            })
            .collect();

        counts.iter_mut().for_each(|c| *c = 0);
        next.iter_mut().for_each(|c| c.iter_mut().for_each(|x| *x = 0.0));

        for (v, &c) in vectors.iter().zip(&assignments) {
            counts[c] += 1;
            for (acc, &x) in next[c].iter_mut().zip(v.iter()) {
                *acc += x;
            }
        }

        let mut max_shift = 0.0f32;
        for (c, centroid) in next.iter_mut().enumerate() {
            if counts[c] == 0 {
                // Empty cluster keeps its previous position.
                centroid.copy_from_slice(&centroids[c]);
                continue;
            }
            let inv = 1.0 / counts[c] as f32;
            centroid.iter_mut().for_each(|x| *x *= inv);
            max_shift = max_shift.max(squared_euclidean(&centroids[c], centroid));
        }

        std::mem::swap(&mut centroids, &mut next);
        debug!(iter = iter + 1, max_shift = max_shift, "k-means round complete");
    }

    Ok(centroids)
}

/// Mean squared distance from every vector to its nearest centroid.
pub fn distortion(vectors: &[&[f32]], centroids: &[Vec<f32>]) -> f64 {
    if vectors.is_empty() {
        return 0.0;
    }
    let total: f64 = vectors
        .par_iter()
        .map(|v| {
            nearest(v, centroids.iter().map(|c| c.as_slice()))
                .map(|(_, d)| d as f64)
                .unwrap_or(0.0)
        })
        .sum();
    total / vectors.len() as f64
}

/// k-means++ seeding: each next centroid is drawn with probability
/// proportional to its squared distance from the closest centroid so far.
fn kmeans_pp_init(vectors: &[&[f32]], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let n = vectors.len();
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    centroids.push(vectors[rng.gen_range(0..n)].to_vec());

    let mut min_dists = vec![f32::MAX; n];

    while centroids.len() < k {
        let last = &centroids[centroids.len() - 1];
        let mut total: f64 = 0.0;
        for (i, v) in vectors.iter().enumerate() {
            let d = squared_euclidean(v, last);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
            total += min_dists[i] as f64;
        }

        if total <= 0.0 {
            // Every point coincides with a chosen centroid.
            warn!(
                chosen = centroids.len(),
                k = k,
                "all remaining distances are zero, duplicating centroids"
            );
            let fill = last.clone();
            centroids.resize(k, fill);
            break;
        }

        let threshold = rng.gen::<f64>() * total;
        let mut cumulative = 0.0f64;
        let mut chosen = n - 1;
        for (i, &d) in min_dists.iter().enumerate() {
            cumulative += d as f64;
            if cumulative >= threshold {
                chosen = i;
                break;
            }
        }
        centroids.push(vectors[chosen].to_vec());
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(k: usize) -> KMeansParams {
        KMeansParams {
            k,
            iterations: 20,
            seed: 7,
        }
    }

    #[test]
    fn test_train_single_point() {
        let data = [vec![1.0, 2.0, 3.0]];
        let refs: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();
        let centroids = train_kmeans(&refs, 3, params(1)).unwrap();
        assert_eq!(centroids, vec![vec![1.0, 2.0, 3.0]]);
    }

    #[test]
    fn test_train_k_gt_n_keeps_shape() {
        let data = [vec![1.0, 0.0], vec![0.0, 1.0]];
        let refs: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();
        let centroids = train_kmeans(&refs, 2, params(5)).unwrap();
        assert_eq!(centroids.len(), 5);
        assert!(centroids.iter().all(|c| c.len() == 2));
    }

    #[test]
    fn test_train_empty() {
        let refs: Vec<&[f32]> = vec![];
        assert!(train_kmeans(&refs, 3, params(2)).is_err());
    }

    #[test]
    fn test_train_dimension_mismatch() {
        let data = [vec![1.0, 0.0], vec![0.0, 1.0, 2.0], vec![3.0, 3.0]];
        let refs: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();
        match train_kmeans(&refs, 2, params(2)) {
            Err(WordPqError::DimensionMismatch { expected, actual }) => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("expected DimensionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_two_separated_clusters() {
        let mut data = Vec::new();
        for i in 0..50 {
            data.push(vec![i as f32 * 0.01, 0.0]);
        }
        for i in 0..50 {
            data.push(vec![10.0 + i as f32 * 0.01, 0.0]);
        }
        let refs: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();
        let centroids = train_kmeans(&refs, 2, params(2)).unwrap();

        let lo = centroids[0][0].min(centroids[1][0]);
        let hi = centroids[0][0].max(centroids[1][0]);
        assert!(lo < 1.0, "lower centroid should be near 0, got {lo}");
        assert!(hi > 9.0, "upper centroid should be near 10, got {hi}");
    }

    #[test]
    fn test_more_centroids_lower_distortion() {
        let data: Vec<Vec<f32>> = (0..200)
            .map(|i| vec![(i % 20) as f32, (i / 20) as f32])
            .collect();
        let refs: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();
        let c2 = train_kmeans(&refs, 2, params(2)).unwrap();
        let c16 = train_kmeans(&refs, 2, params(16)).unwrap();
        assert!(distortion(&refs, &c16) < distortion(&refs, &c2));
    }

    #[test]
    fn test_same_seed_same_centroids() {
        let data: Vec<Vec<f32>> = (0..64).map(|i| vec![(i * 7 % 13) as f32, i as f32]).collect();
        let refs: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();
        let a = train_kmeans(&refs, 2, params(4)).unwrap();
        let b = train_kmeans(&refs, 2, params(4)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_identical_points() {
        let data = vec![vec![1.0f32, 1.0]; 10];
        let refs: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();
        let centroids = train_kmeans(&refs, 2, params(3)).unwrap();
        assert_eq!(centroids.len(), 3);
        assert!(centroids.iter().all(|c| c == &vec![1.0, 1.0]));
    }
}
