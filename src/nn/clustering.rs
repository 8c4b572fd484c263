//! Soft-clustering head.
//!
//! Latent vectors are assigned to centroids with a Student's-t kernel
//!
//! ```text
//! q_ik ∝ (1 + ||z_i - μ_k||² / α)^(-(α+1)/2)
//! ```
//!
//! normalised over `k`. The kernel is evaluated in log space with the row
//! maximum subtracted, so distant points do not underflow to an all-zero row.
//! Non-finite latents yield non-finite assignments rather than being masked.

use crate::error::{Result, SeisdecError};
use ndarray::{Array1, Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Smallest probability used inside logarithms and divisions.
const PROB_FLOOR: f32 = 1e-12;

/// `v.max(floor)` that keeps NaN instead of returning `floor`.
fn floor_nan(v: f32, floor: f32) -> f32 {
    if v < floor {
        floor
    } else {
        v
    }
}

/// K centroids in latent space plus the kernel's degrees of freedom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringLayer {
    centroids: Array2<f32>,
    alpha: f32,
}

/// Gradients of the KL objective for one batch.
#[derive(Debug, Clone)]
pub struct ClusterGrads {
    /// Batch-mean KL(P || Q).
    pub loss: f32,
    /// Soft assignments the loss was measured on.
    pub q: Array2<f32>,
    /// Gradient with respect to the latent vectors, `n x D`.
    pub latent: Array2<f32>,
    /// Gradient with respect to the centroids, `K x D`.
    pub centroids: Array2<f32>,
}

impl ClusteringLayer {
    /// Creates a head from a `K x D` centroid matrix.
    pub fn new(centroids: Array2<f32>, alpha: f32) -> Result<Self> {
        if centroids.nrows() == 0 || centroids.ncols() == 0 {
            return Err(SeisdecError::Config(format!(
                "clustering head needs at least one centroid of non-zero width, got {:?}",
                centroids.dim()
            )));
        }
        if !(alpha > 0.0 && alpha.is_finite()) {
            return Err(SeisdecError::Config(format!("alpha must be positive, got {}", alpha)));
        }
        Ok(Self { centroids, alpha })
    }

    /// Number of clusters.
    pub fn n_clusters(&self) -> usize {
        self.centroids.nrows()
    }

    /// Latent width.
    pub fn dim(&self) -> usize {
        self.centroids.ncols()
    }

    /// Degrees of freedom of the kernel.
    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Current centroids, one per row.
    pub fn centroids(&self) -> &Array2<f32> {
        &self.centroids
    }

    pub(crate) fn centroids_mut(&mut self) -> &mut Array2<f32> {
        &mut self.centroids
    }

    /// Squared distances from every latent row to every centroid, `n x K`.
    pub fn squared_distances(&self, z: &Array2<f32>) -> Result<Array2<f32>> {
        self.check_latents(z)?;
        let z_sq = z.map_axis(Axis(1), |row| row.dot(&row));
        let mu_sq = self.centroids.map_axis(Axis(1), |row| row.dot(&row));
        let mut d = z.dot(&self.centroids.t());
        Zip::indexed(&mut d).for_each(|(i, k), v| {
            *v = floor_nan(z_sq[i] + mu_sq[k] - 2.0 * *v, 0.0);
        });
        Ok(d)
    }

    /// Soft assignments of a batch of latent vectors, `n x K`.
    pub fn soft_assign(&self, z: &Array2<f32>) -> Result<Array2<f32>> {
        let d = self.squared_distances(z)?;
        Ok(self.kernel(&d))
    }

    fn kernel(&self, distances: &Array2<f32>) -> Array2<f32> {
        let a = self.alpha;
        let power = -(a + 1.0) / 2.0;
        let mut q = distances.mapv(|d| power * (d / a).ln_1p());
        for mut row in q.rows_mut() {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            if sum > 0.0 {
                row.mapv_inplace(|v| v / sum);
            } else if sum == 0.0 {
                let k = row.len() as f32;
                row.fill(1.0 / k);
            }
        }
        q
    }

    /// Sharpened target distribution computed from the soft assignments of
    /// the whole training split.
    pub fn target_distribution(q: &Array2<f32>) -> Array2<f32> {
        let frequencies = q.sum_axis(Axis(0));
        Self::target_with_frequencies(q, &frequencies)
    }

    /// Target distribution for rows of `q` given precomputed per-cluster soft
    /// frequencies.
    pub fn target_with_frequencies(q: &Array2<f32>, frequencies: &Array1<f32>) -> Array2<f32> {
        let f = frequencies.mapv(|v| floor_nan(v, PROB_FLOOR));
        let mut p = Array2::zeros(q.raw_dim());
        Zip::from(p.rows_mut()).and(q.rows()).for_each(|mut p_row, q_row| {
            Zip::from(&mut p_row)
                .and(&q_row)
                .and(&f)
                .for_each(|p, &q, &f| *p = q * q / f);
            let sum = p_row.sum();
            if sum > 0.0 {
                p_row.mapv_inplace(|v| v / sum);
            } else if sum == 0.0 {
                let k = p_row.len() as f32;
                p_row.fill(1.0 / k);
            }
        });
        p
    }

    /// Batch-mean KL(P || Q). NaN if either input holds a NaN.
    pub fn kl_divergence(p: &Array2<f32>, q: &Array2<f32>) -> f32 {
        let n = p.nrows().max(1) as f64;
        let total: f64 = p
            .iter()
            .zip(q.iter())
            .map(|(&p, &q)| {
                if p.is_nan() || q.is_nan() {
                    f64::NAN
                } else if p > 0.0 {
                    p as f64 * ((p as f64).ln() - (floor_nan(q, PROB_FLOOR) as f64).ln())
                } else {
                    0.0
                }
            })
            .sum();
        (total / n) as f32
    }

    /// Loss and analytic gradients of the batch-mean KL(P || Q) with respect
    /// to the latents and centroids, holding `p` fixed.
    pub fn gradients(&self, z: &Array2<f32>, p: &Array2<f32>) -> Result<ClusterGrads> {
        let d = self.squared_distances(z)?;
        if p.dim() != d.dim() {
            return Err(SeisdecError::Shape {
                expected: format!("{:?}", d.dim()),
                actual: format!("{:?}", p.dim()),
            });
        }
        let q = self.kernel(&d);
        let loss = Self::kl_divergence(p, &q);

        let a = self.alpha;
        let scale = (a + 1.0) / a / z.nrows().max(1) as f32;

        // w_ik = (p_ik - q_ik) / (1 + d_ik / α)
        let mut w = p - &q;
        Zip::from(&mut w).and(&d).for_each(|w, &d| *w /= 1.0 + d / a);

        let row_sums = w.sum_axis(Axis(1)).insert_axis(Axis(1));
        let col_sums = w.sum_axis(Axis(0)).insert_axis(Axis(1));

        let latent = (z * &row_sums - w.dot(&self.centroids)) * scale;
        let centroids = (w.t().dot(z) - &self.centroids * &col_sums) * -scale;

        Ok(ClusterGrads {
            loss,
            q,
            latent,
            centroids,
        })
    }

    fn check_latents(&self, z: &Array2<f32>) -> Result<()> {
        if z.ncols() != self.dim() {
            return Err(SeisdecError::Shape {
                expected: format!("latent width {}", self.dim()),
                actual: format!("latent width {}", z.ncols()),
            });
        }
        Ok(())
    }
}

/// Argmax label of every row.
pub fn hard_labels(q: &Array2<f32>) -> Vec<usize> {
    q.rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (k, &v)| if v > best.1 { (k, v) } else { best })
                .0
        })
        .collect()
}

/// Fraction of positions whose label differs between two assignments.
pub fn assignment_delta(previous: &[usize], current: &[usize]) -> f64 {
    if current.is_empty() {
        return 0.0;
    }
    let changed = previous
        .iter()
        .zip(current.iter())
        .filter(|(a, b)| a != b)
        .count()
        + current.len().abs_diff(previous.len()).min(current.len());
    (changed as f64 / current.len() as f64).min(1.0)
}
