//! K-means with k-means++ seeding and Lloyd iterations.

use crate::error::{Result, SeisdecError};
use crate::nn::simd::{assign_all_parallel, axpy_f32, distance_squared_f32, nearest_centroid_f32, scale_f32};
use ndarray::Array2;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// K-means options.
#[derive(Debug, Clone)]
pub struct KMeansOptions {
    /// Number of clusters.
    pub n_clusters: usize,
    /// Maximum Lloyd iterations per restart.
    pub max_iter: usize,
    /// Relative inertia change below which a restart stops.
    pub tol: f64,
    /// Number of restarts; the lowest-inertia result is kept.
    pub n_init: usize,
    /// Seed of the first restart. Restart `r` uses `seed + r`.
    pub seed: u64,
}

impl Default for KMeansOptions {
    fn default() -> Self {
        Self {
            n_clusters: 8,
            max_iter: 300,
            tol: 1e-4,
            n_init: 10,
            seed: 42,
        }
    }
}

impl KMeansOptions {
    /// Defaults with the given cluster count and seed.
    pub fn new(n_clusters: usize, seed: u64) -> Self {
        Self {
            n_clusters,
            seed,
            ..Default::default()
        }
    }
}

/// A fitted k-means model.
#[derive(Debug, Clone)]
pub struct KMeans {
    /// Centroids, `k x dim`.
    pub centroids: Array2<f32>,
    /// Label of every training point.
    pub labels: Vec<usize>,
    /// Sum of squared distances to the nearest centroid.
    pub inertia: f64,
    /// Lloyd iterations of the kept restart.
    pub n_iter: usize,
}

impl KMeans {
    /// Fits `options.n_clusters` centroids to the rows of `data`.
    pub fn fit(data: &Array2<f32>, options: &KMeansOptions) -> Result<Self> {
        let (n, dim) = data.dim();
        let k = options.n_clusters;
        if k == 0 {
            return Err(SeisdecError::Config("k-means needs at least one cluster".to_string()));
        }
        if n < k {
            return Err(SeisdecError::EmptyInput(format!(
                "k-means with {} clusters needs at least {} points, got {}",
                k, k, n
            )));
        }

        let points = data.as_standard_layout();
        let points = points
            .as_slice()
            .ok_or_else(|| SeisdecError::Training("latent matrix is not contiguous".to_string()))?;

        let mut best: Option<KMeans> = None;
        for restart in 0..options.n_init.max(1) {
            let mut rng = ChaCha8Rng::seed_from_u64(options.seed.wrapping_add(restart as u64));
            let fitted = lloyd(points, dim, k, options, &mut rng)?;
            if best.as_ref().map_or(true, |b| fitted.inertia < b.inertia) {
                best = Some(fitted);
            }
        }

        best.ok_or_else(|| SeisdecError::Training("k-means produced no result".to_string()))
    }

    /// Number of clusters.
    pub fn n_clusters(&self) -> usize {
        self.centroids.nrows()
    }

    /// Nearest-centroid labels for new points.
    pub fn predict(&self, data: &Array2<f32>) -> Result<Vec<usize>> {
        Ok(assign(&self.centroids, data)?.into_iter().map(|(l, _)| l).collect())
    }
}

/// Nearest centroid and squared distance for every row of `data`.
pub fn assign(centroids: &Array2<f32>, data: &Array2<f32>) -> Result<Vec<(usize, f32)>> {
    if centroids.ncols() != data.ncols() {
        return Err(SeisdecError::Shape {
            expected: format!("width {}", centroids.ncols()),
            actual: format!("width {}", data.ncols()),
        });
    }
    let c = centroids.as_standard_layout();
    let p = data.as_standard_layout();
    match (c.as_slice(), p.as_slice()) {
        (Some(c), Some(p)) => Ok(assign_all_parallel(p, c, centroids.nrows(), data.ncols())),
        _ => Err(SeisdecError::Training("matrix is not contiguous".to_string())),
    }
}

/// k-means++: each new centroid is drawn with probability proportional to
/// its squared distance from the closest centroid chosen so far.
fn plus_plus_init(points: &[f32], dim: usize, k: usize, rng: &mut ChaCha8Rng) -> Vec<f32> {
    let n = points.len() / dim;
    let mut centroids = Vec::with_capacity(k * dim);
    let first = rng.gen_range(0..n);
    centroids.extend_from_slice(&points[first * dim..(first + 1) * dim]);

    let mut closest: Vec<f32> = points
        .chunks_exact(dim)
        .map(|p| distance_squared_f32(p, &centroids[..dim]))
        .collect();

    for _ in 1..k {
        let total: f64 = closest.iter().map(|&d| d as f64).sum();
        let chosen = if total <= 0.0 {
            rng.gen_range(0..n)
        } else {
            let mut r = rng.gen::<f64>() * total;
            let mut chosen = n - 1;
            for (i, &d) in closest.iter().enumerate() {
                r -= d as f64;
                if r <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        };

        let new_centroid = &points[chosen * dim..(chosen + 1) * dim];
        for (d, p) in closest.iter_mut().zip(points.chunks_exact(dim)) {
            *d = d.min(distance_squared_f32(p, new_centroid));
        }
        centroids.extend_from_slice(new_centroid);
    }

    centroids
}

fn lloyd(points: &[f32], dim: usize, k: usize, options: &KMeansOptions, rng: &mut ChaCha8Rng) -> Result<KMeans> {
    let n = points.len() / dim;
    let mut centroids = plus_plus_init(points, dim, k, rng);
    let mut assignments = assign_all_parallel(points, &centroids, k, dim);
    let mut inertia: f64 = assignments.iter().map(|&(_, d)| d as f64).sum();
    let mut n_iter = 0;

    for _ in 0..options.max_iter {
        n_iter += 1;

        let mut sums = vec![0.0f32; k * dim];
        let mut counts = vec![0usize; k];
        for (p, &(label, _)) in points.chunks_exact(dim).zip(assignments.iter()) {
            axpy_f32(&mut sums[label * dim..(label + 1) * dim], p, 1.0);
            counts[label] += 1;
        }

        for c in 0..k {
            let slot = &mut sums[c * dim..(c + 1) * dim];
            if counts[c] > 0 {
                scale_f32(slot, 1.0 / counts[c] as f32);
            } else {
                // Empty cluster: move it onto the worst-served point.
                let far = assignments
                    .iter()
                    .enumerate()
                    .fold((0, f32::MIN), |best, (i, &(_, d))| if d > best.1 { (i, d) } else { best })
                    .0;
                slot.copy_from_slice(&points[far * dim..(far + 1) * dim]);
            }
        }
        centroids = sums;

        assignments = assign_all_parallel(points, &centroids, k, dim);
        let new_inertia: f64 = assignments.iter().map(|&(_, d)| d as f64).sum();
        let change = (inertia - new_inertia).abs() / inertia.max(f64::MIN_POSITIVE);
        inertia = new_inertia;
        if change < options.tol {
            break;
        }
    }

    let centroids = Array2::from_shape_vec((k, dim), centroids)
        .map_err(|e| SeisdecError::Training(e.to_string()))?;
    debug_assert_eq!(assignments.len(), n);

    Ok(KMeans {
        centroids,
        labels: assignments.into_iter().map(|(l, _)| l).collect(),
        inertia,
        n_iter,
    })
}

/// Index of the centroid nearest to `point` in a `k x dim` matrix.
pub fn nearest(centroids: &Array2<f32>, point: &[f32]) -> usize {
    let c = centroids.as_standard_layout();
    match c.as_slice() {
        Some(c) => nearest_centroid_f32(c, point, centroids.nrows(), centroids.ncols()).0,
        None => 0,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand_distr::{Distribution, Normal};

    /// Three tight blobs in 2-D, `per_blob` points each, in blob order.
    pub(crate) fn blobs(per_blob: usize, seed: u64) -> (Array2<f32>, Vec<usize>) {
        let centers = [(0.0f32, 0.0f32), (10.0, 0.0), (0.0, 10.0)];
        let noise = Normal::new(0.0f32, 0.5).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut data = Array2::zeros((per_blob * 3, 2));
        let mut labels = Vec::new();
        for (b, &(cx, cy)) in centers.iter().enumerate() {
            for i in 0..per_blob {
                let row = b * per_blob + i;
                data[[row, 0]] = cx + noise.sample(&mut rng);
                data[[row, 1]] = cy + noise.sample(&mut rng);
                labels.push(b);
            }
        }
        (data, labels)
    }

    #[test]
    fn test_recovers_blobs() {
        let (data, truth) = blobs(50, 3);
        let km = KMeans::fit(&data, &KMeansOptions::new(3, 7)).unwrap();
        assert_eq!(km.centroids.dim(), (3, 2));

        // Same partition up to relabelling.
        for i in 0..truth.len() {
            for j in 0..truth.len() {
                assert_eq!(truth[i] == truth[j], km.labels[i] == km.labels[j]);
            }
        }
        assert!(km.inertia < 150.0 * 2.0 * 0.5);
    }

    #[test]
    fn test_predict_matches_fit() {
        let (data, _) = blobs(20, 4);
        let km = KMeans::fit(&data, &KMeansOptions::new(3, 1)).unwrap();
        assert_eq!(km.predict(&data).unwrap(), km.labels);
        assert_eq!(nearest(&km.centroids, &[10.0, 0.0]), km.labels[25]);
    }

    #[test]
    fn test_too_few_points() {
        let data = Array2::zeros((2, 3));
        assert!(KMeans::fit(&data, &KMeansOptions::new(3, 0)).is_err());
        assert!(KMeans::fit(&data, &KMeansOptions::new(0, 0)).is_err());
    }

    #[test]
    fn test_identical_points() {
        let data = Array2::ones((10, 2));
        let km = KMeans::fit(&data, &KMeansOptions::new(2, 0)).unwrap();
        assert!(km.inertia.abs() < 1e-9);
        assert!(km.centroids.iter().all(|v| v.is_finite()));
    }
}
