//! Vectorisation-friendly kernels over flat f32 slices.
//!
//! Row-major point sets (`n x dim` stored contiguously) are the common
//! currency between k-means, the mixture model and the quality metrics.

use rayon::prelude::*;

/// Squared Euclidean distance between two f32 slices.
/// Unrolled by 8 so the main loop autovectorises.
#[inline]
pub fn distance_squared_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let chunks = a.len() / 8;
    let remainder = a.len() % 8;
    let mut sum = 0.0f32;

    for i in 0..chunks {
        let base = i * 8;
        let d0 = a[base] - b[base];
        let d1 = a[base + 1] - b[base + 1];
        let d2 = a[base + 2] - b[base + 2];
        let d3 = a[base + 3] - b[base + 3];
        let d4 = a[base + 4] - b[base + 4];
        let d5 = a[base + 5] - b[base + 5];
        let d6 = a[base + 6] - b[base + 6];
        let d7 = a[base + 7] - b[base + 7];

        sum += d0 * d0 + d1 * d1 + d2 * d2 + d3 * d3 + d4 * d4 + d5 * d5 + d6 * d6 + d7 * d7;
    }

    let base = chunks * 8;
    for i in 0..remainder {
        let d = a[base + i] - b[base + i];
        sum += d * d;
    }

    sum
}

/// Index and squared distance of the centroid closest to `point`.
#[inline]
pub fn nearest_centroid_f32(centroids: &[f32], point: &[f32], k: usize, dim: usize) -> (usize, f32) {
    let mut best_idx = 0;
    let mut best_dist = f32::MAX;

    for i in 0..k {
        let offset = i * dim;
        let dist = distance_squared_f32(&centroids[offset..offset + dim], point);
        if dist < best_dist {
            best_dist = dist;
            best_idx = i;
        }
    }

    (best_idx, best_dist)
}

/// Nearest centroid for every row of `points`, in parallel.
pub fn assign_all_parallel(points: &[f32], centroids: &[f32], k: usize, dim: usize) -> Vec<(usize, f32)> {
    points
        .par_chunks(dim)
        .map(|p| nearest_centroid_f32(centroids, p, k, dim))
        .collect()
}

/// `dst += scale * src`.
#[inline]
pub fn axpy_f32(dst: &mut [f32], src: &[f32], scale: f32) {
    debug_assert_eq!(dst.len(), src.len());

    let chunks = dst.len() / 4;
    let remainder = dst.len() % 4;

    for i in 0..chunks {
        let base = i * 4;
        dst[base] += scale * src[base];
        dst[base + 1] += scale * src[base + 1];
        dst[base + 2] += scale * src[base + 2];
        dst[base + 3] += scale * src[base + 3];
    }

    let base = chunks * 4;
    for i in 0..remainder {
        dst[base + i] += scale * src[base + i];
    }
}

/// Multiply a vector by a scalar in place.
#[inline]
pub fn scale_f32(vec: &mut [f32], scalar: f32) {
    for v in vec.iter_mut() {
        *v *= scalar;
    }
}

/// Per-dimension minimum and maximum of a row-major point set.
pub fn bounding_box(points: &[f32], dim: usize) -> (Vec<f32>, Vec<f32>) {
    let mut lo = vec![f32::MAX; dim];
    let mut hi = vec![f32::MIN; dim];
    for row in points.chunks_exact(dim) {
        for j in 0..dim {
            lo[j] = lo[j].min(row[j]);
            hi[j] = hi[j].max(row[j]);
        }
    }
    (lo, hi)
}

/// Per-dimension mean and standard deviation of a row-major point set.
pub fn mean_std(points: &[f32], dim: usize) -> (Vec<f32>, Vec<f32>) {
    let n = (points.len() / dim.max(1)).max(1) as f32;
    let mut mean = vec![0.0f32; dim];
    for row in points.chunks_exact(dim) {
        axpy_f32(&mut mean, row, 1.0);
    }
    scale_f32(&mut mean, 1.0 / n);

    let mut var = vec![0.0f32; dim];
    for row in points.chunks_exact(dim) {
        for j in 0..dim {
            let d = row[j] - mean[j];
            var[j] += d * d;
        }
    }
    let std = var.into_iter().map(|v| (v / n).sqrt()).collect();
    (mean, std)
}
