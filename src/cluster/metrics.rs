//! Clustering-quality metrics and the K-selection sweep.
//!
//! `select_k` fits k-means for every candidate cluster count and reports
//! inertia, silhouette and the gap statistic against two reference
//! distributions: uniform over the data's bounding box and an axis-aligned
//! Gaussian with the data's per-dimension mean and spread.

use crate::cluster::kmeans::{KMeans, KMeansOptions};
use crate::error::{Result, SeisdecError};
use crate::nn::simd::{bounding_box, distance_squared_f32, mean_std};
use log::{debug, info};
use ndarray::Array2;
use rand::seq::index::sample;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Null distribution for the gap statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapReference {
    /// Uniform over the per-dimension range of the data.
    Uniform,
    /// Independent normals with the data's per-dimension mean and deviation.
    Gaussian,
}

/// Gap statistic for one cluster count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gap {
    /// `E*[log W_k] - log W_k`.
    pub gap: f64,
    /// Simulation error `sd * sqrt(1 + 1/B)`.
    pub std_err: f64,
}

/// Sum of squared distances from each point to its assigned centroid.
pub fn inertia(data: &Array2<f32>, centroids: &Array2<f32>, labels: &[usize]) -> Result<f64> {
    if labels.len() != data.nrows() || centroids.ncols() != data.ncols() {
        return Err(SeisdecError::Shape {
            expected: format!("{} labels of width {}", data.nrows(), centroids.ncols()),
            actual: format!("{} labels of width {}", labels.len(), data.ncols()),
        });
    }
    let mut total = 0.0f64;
    for (row, &l) in data.rows().into_iter().zip(labels) {
        if l >= centroids.nrows() {
            return Err(SeisdecError::IndexOutOfBounds {
                index: l,
                len: centroids.nrows(),
            });
        }
        let d: f32 = row
            .iter()
            .zip(centroids.row(l).iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        total += d as f64;
    }
    Ok(total)
}

/// Mean silhouette coefficient.
///
/// With `sample_size`, the score is computed on a seeded random subset of
/// that many points, which keeps the quadratic cost bounded on large sets.
/// Points in singleton clusters score 0.
pub fn silhouette_score(data: &Array2<f32>, labels: &[usize], sample_size: Option<usize>, seed: u64) -> Result<f64> {
    let n = data.nrows();
    if labels.len() != n {
        return Err(SeisdecError::Shape {
            expected: format!("{} labels", n),
            actual: format!("{} labels", labels.len()),
        });
    }

    let subset: Vec<usize> = match sample_size {
        Some(m) if m < n => {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut picked = sample(&mut rng, n, m).into_vec();
            picked.sort_unstable();
            picked
        }
        _ => (0..n).collect(),
    };

    let n_labels = subset.iter().map(|&i| labels[i]).max().map_or(0, |m| m + 1);
    let mut counts = vec![0usize; n_labels];
    for &i in &subset {
        counts[labels[i]] += 1;
    }
    let populated = counts.iter().filter(|&&c| c > 0).count();
    if populated < 2 || populated >= subset.len() {
        return Err(SeisdecError::Config(format!(
            "silhouette needs between 2 and n-1 clusters, got {} over {} points",
            populated,
            subset.len()
        )));
    }

    let rows: Vec<Vec<f32>> = subset.iter().map(|&i| data.row(i).to_vec()).collect();
    let sub_labels: Vec<usize> = subset.iter().map(|&i| labels[i]).collect();

    let scores: Vec<f64> = (0..rows.len())
        .into_par_iter()
        .map(|i| {
            let own = sub_labels[i];
            if counts[own] <= 1 {
                return 0.0;
            }
            let mut sums = vec![0.0f64; n_labels];
            for (j, other) in rows.iter().enumerate() {
                if j != i {
                    sums[sub_labels[j]] += (distance_squared_f32(&rows[i], other) as f64).sqrt();
                }
            }
            let a = sums[own] / (counts[own] - 1) as f64;
            let b = (0..n_labels)
                .filter(|&c| c != own && counts[c] > 0)
                .map(|c| sums[c] / counts[c] as f64)
                .fold(f64::INFINITY, f64::min);
            let denom = a.max(b);
            if denom > 0.0 {
                (b - a) / denom
            } else {
                0.0
            }
        })
        .collect();

    Ok(scores.iter().sum::<f64>() / scores.len() as f64)
}

/// Gap statistic of a k-means fit with `k` clusters against `n_refs`
/// reference datasets.
pub fn gap_statistic(
    data: &Array2<f32>,
    k: usize,
    data_inertia: f64,
    reference: GapReference,
    n_refs: usize,
    n_init: usize,
    seed: u64,
) -> Result<Gap> {
    let (n, dim) = data.dim();
    let flat = data.as_standard_layout();
    let flat = flat
        .as_slice()
        .ok_or_else(|| SeisdecError::Training("latent matrix is not contiguous".to_string()))?;
    let n_refs = n_refs.max(1);
    let (lo, hi) = bounding_box(flat, dim);
    let (mean, std) = mean_std(flat, dim);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut log_wk = Vec::with_capacity(n_refs);
    for b in 0..n_refs {
        let reference_data = match reference {
            GapReference::Uniform => Array2::from_shape_fn((n, dim), |(_, j)| {
                if hi[j] > lo[j] {
                    rng.gen_range(lo[j]..hi[j])
                } else {
                    lo[j]
                }
            }),
            GapReference::Gaussian => {
                let normals = (0..dim)
                    .map(|j| Normal::new(mean[j], std[j].max(f32::EPSILON)))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| SeisdecError::Training(e.to_string()))?;
                Array2::from_shape_fn((n, dim), |(_, j)| normals[j].sample(&mut rng))
            }
        };
        let fit = KMeans::fit(
            &reference_data,
            &KMeansOptions {
                n_clusters: k,
                n_init,
                seed: seed.wrapping_add(1 + b as u64),
                ..Default::default()
            },
        )?;
        log_wk.push(fit.inertia.max(f64::MIN_POSITIVE).ln());
    }

    let b = log_wk.len() as f64;
    let expected = log_wk.iter().sum::<f64>() / b;
    let sd = (log_wk.iter().map(|v| (v - expected).powi(2)).sum::<f64>() / b).sqrt();

    Ok(Gap {
        gap: expected - data_inertia.max(f64::MIN_POSITIVE).ln(),
        std_err: sd * (1.0 + 1.0 / b).sqrt(),
    })
}

/// Options for [`select_k`].
#[derive(Debug, Clone)]
pub struct KSelectionOptions {
    /// Reference datasets per gap estimate.
    pub n_refs: usize,
    /// Points used for the silhouette; `None` uses all of them.
    pub silhouette_sample: Option<usize>,
    /// k-means restarts per fit.
    pub n_init: usize,
    /// Random seed.
    pub seed: u64,
}

impl Default for KSelectionOptions {
    fn default() -> Self {
        Self {
            n_refs: 5,
            silhouette_sample: Some(2000),
            n_init: 3,
            seed: 42,
        }
    }
}

/// Scores of one candidate cluster count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KScore {
    /// Cluster count.
    pub k: usize,
    /// k-means inertia.
    pub inertia: f64,
    /// Mean silhouette, undefined for `k = 1`.
    pub silhouette: Option<f64>,
    /// Gap against the uniform reference.
    pub gap_uniform: f64,
    /// Its simulation error.
    pub gap_uniform_err: f64,
    /// Gap against the Gaussian reference.
    pub gap_gaussian: f64,
    /// Its simulation error.
    pub gap_gaussian_err: f64,
}

/// Result of a K sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KSelectionReport {
    /// One entry per candidate, in the order requested.
    pub scores: Vec<KScore>,
}

impl KSelectionReport {
    /// The cluster count with the highest silhouette.
    pub fn best_by_silhouette(&self) -> Option<usize> {
        self.scores
            .iter()
            .filter_map(|s| s.silhouette.map(|v| (s.k, v)))
            .fold(None, |best: Option<(usize, f64)>, (k, v)| match best {
                Some((_, bv)) if bv >= v => best,
                _ => Some((k, v)),
            })
            .map(|(k, _)| k)
    }

    /// Smallest `k` with `gap(k) >= gap(k+1) - err(k+1)` under the given
    /// reference, considering candidates in ascending order. Falls back to
    /// the largest gap.
    pub fn best_by_gap(&self, reference: GapReference) -> Option<usize> {
        let mut sorted: Vec<&KScore> = self.scores.iter().collect();
        sorted.sort_by_key(|s| s.k);
        let value = |s: &KScore| match reference {
            GapReference::Uniform => (s.gap_uniform, s.gap_uniform_err),
            GapReference::Gaussian => (s.gap_gaussian, s.gap_gaussian_err),
        };

        for pair in sorted.windows(2) {
            let (g, _) = value(pair[0]);
            let (g_next, err_next) = value(pair[1]);
            if g >= g_next - err_next {
                return Some(pair[0].k);
            }
        }
        sorted
            .iter()
            .max_by(|a, b| value(a).0.total_cmp(&value(b).0))
            .map(|s| s.k)
    }

    /// Writes the scores as CSV.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for score in &self.scores {
            writer.serialize(score)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Fits k-means for each candidate count and scores it.
pub fn select_k(latents: &Array2<f32>, candidates: &[usize], options: &KSelectionOptions) -> Result<KSelectionReport> {
    if candidates.is_empty() {
        return Err(SeisdecError::Config("no candidate cluster counts".to_string()));
    }
    if latents.nrows() == 0 {
        return Err(SeisdecError::EmptyInput("no latent vectors to score".to_string()));
    }

    let mut report = KSelectionReport::default();
    for &k in candidates {
        let fit = KMeans::fit(
            latents,
            &KMeansOptions {
                n_clusters: k,
                n_init: options.n_init.max(1),
                seed: options.seed,
                ..Default::default()
            },
        )?;

        let silhouette = if k >= 2 && k < latents.nrows() {
            Some(silhouette_score(latents, &fit.labels, options.silhouette_sample, options.seed)?)
        } else {
            None
        };
        let uniform = gap_statistic(
            latents,
            k,
            fit.inertia,
            GapReference::Uniform,
            options.n_refs,
            options.n_init.max(1),
            options.seed ^ 0x5eed,
        )?;
        let gaussian = gap_statistic(
            latents,
            k,
            fit.inertia,
            GapReference::Gaussian,
            options.n_refs,
            options.n_init.max(1),
            options.seed ^ 0x6a55,
        )?;

        debug!(
            "k={} inertia={:.4} silhouette={:?} gap_uniform={:.4} gap_gaussian={:.4}",
            k, fit.inertia, silhouette, uniform.gap, gaussian.gap
        );
        report.scores.push(KScore {
            k,
            inertia: fit.inertia,
            silhouette,
            gap_uniform: uniform.gap,
            gap_uniform_err: uniform.std_err,
            gap_gaussian: gaussian.gap,
            gap_gaussian_err: gaussian.std_err,
        });
    }

    info!(
        "K sweep over {:?}: best by silhouette {:?}, best by gap {:?}",
        candidates,
        report.best_by_silhouette(),
        report.best_by_gap(GapReference::Uniform)
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::kmeans::tests::blobs;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn test_inertia() {
        let data = array![[0.0, 0.0], [2.0, 0.0], [10.0, 10.0]];
        let centroids = array![[1.0, 0.0], [10.0, 10.0]];
        let value = inertia(&data, &centroids, &[0, 0, 1]).unwrap();
        assert!((value - 2.0).abs() < 1e-9);
        assert!(inertia(&data, &centroids, &[0, 5, 1]).is_err());
    }

    #[test]
    fn test_silhouette_separated_is_high() {
        let (data, truth) = blobs(30, 1);
        let good = silhouette_score(&data, &truth, None, 0).unwrap();
        assert!(good > 0.8, "silhouette {}", good);

        let scrambled: Vec<usize> = (0..truth.len()).map(|i| i % 3).collect();
        let bad = silhouette_score(&data, &scrambled, None, 0).unwrap();
        assert!(bad < good);

        let sampled = silhouette_score(&data, &truth, Some(40), 3).unwrap();
        assert!(sampled > 0.7);
    }

    #[test]
    fn test_silhouette_needs_two_clusters() {
        let (data, _) = blobs(5, 1);
        assert!(silhouette_score(&data, &[0; 15], None, 0).is_err());
    }

    #[test]
    fn test_select_k_prefers_three() {
        let (data, _) = blobs(40, 5);
        let options = KSelectionOptions {
            n_refs: 3,
            silhouette_sample: None,
            n_init: 2,
            seed: 9,
        };
        let report = select_k(&data, &[2, 3, 4, 5], &options).unwrap();
        assert_eq!(report.scores.len(), 4);
        assert_eq!(report.best_by_silhouette(), Some(3));
        assert!(report.scores[1].gap_uniform > report.scores[0].gap_uniform);
        assert!(report.scores.iter().all(|s| s.gap_gaussian.is_finite()));

        let dir = tempdir().unwrap();
        let path = dir.path().join("k.csv");
        report.write_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("k,inertia,silhouette"));
        assert_eq!(text.lines().count(), 5);
    }

    #[test]
    fn test_best_by_gap_rule() {
        let score = |k, gap, err| KScore {
            k,
            inertia: 0.0,
            silhouette: None,
            gap_uniform: gap,
            gap_uniform_err: err,
            gap_gaussian: gap,
            gap_gaussian_err: err,
        };
        let report = KSelectionReport {
            scores: vec![score(3, 1.0, 0.1), score(1, 0.2, 0.1), score(2, 0.5, 0.1), score(4, 1.05, 0.1)],
        };
        assert_eq!(report.best_by_gap(GapReference::Uniform), Some(3));
    }
}
