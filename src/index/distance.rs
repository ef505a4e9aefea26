//! Distance kernels.
//!
//! All functions return a *distance* (lower is closer). Euclidean distance is
//! returned squared; the ordering is the same and the sqrt is never needed.

use crate::types::DistanceMetric;

/// Dispatch on the metric.
#[inline]
pub fn compute_distance(a: &[f32], b: &[f32], metric: DistanceMetric) -> f32 {
    match metric {
        DistanceMetric::Euclidean => squared_euclidean(a, b),
        DistanceMetric::Cosine => cosine_distance(a, b),
    }
}

/// Squared Euclidean distance, accumulated in lanes of 8 so LLVM can
/// vectorize the loop.
#[inline]
pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector dimensions must match");

    let mut lanes = [0.0f32; 8];
    let a_chunks = a.chunks_exact(8);
    let b_chunks = b.chunks_exact(8);
    let a_tail = a_chunks.remainder();
    let b_tail = b_chunks.remainder();

    for (ca, cb) in a_chunks.zip(b_chunks) {
        for j in 0..8 {
            let d = ca[j] - cb[j];
            lanes[j] += d * d;
        }
    }

    let mut sum: f32 = lanes.iter().sum();
    for (x, y) in a_tail.iter().zip(b_tail) {
        let d = x - y;
        sum += d * d;
    }
    sum
}

/// Dot product.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector dimensions must match");
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `1 - cos(a, b)`. Zero-magnitude inputs are treated as orthogonal (1.0).
#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let denom = l2_norm(a) * l2_norm(b);
    if denom < f32::EPSILON {
        return 1.0;
    }
    1.0 - (dot(a, b) / denom).clamp(-1.0, 1.0)
}

#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length. Returns false (and leaves `v` untouched) for a
/// zero vector.
pub fn normalize(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if norm <= f32::EPSILON {
        return false;
    }
    let inv = 1.0 / norm;
    v.iter_mut().for_each(|x| *x *= inv);
    true
}

/// Exact nearest centroid under squared Euclidean distance.
///
/// Ties resolve to the lowest index. Returns `None` for an empty centroid list.
#[inline]
pub fn nearest<'a, I>(query: &[f32], centroids: I) -> Option<(usize, f32)>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut best: Option<(usize, f32)> = None;
    for (idx, centroid) in centroids.into_iter().enumerate() {
        let d = squared_euclidean(query, centroid);
        match best {
            Some((_, best_d)) if d >= best_d => {}
            _ => best = Some((idx, d)),
        }
    }
    best
}

/// `a - b`, element-wise.
#[inline]
pub fn residual(a: &[f32], b: &[f32]) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x - y).collect()
}
