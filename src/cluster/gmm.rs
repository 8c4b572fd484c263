//! Diagonal-covariance Gaussian mixture fitted by expectation-maximisation.
//!
//! Components are seeded from a k-means fit; the means after EM are what the
//! `gmm` centroid initialisation hands to the clustering head.

use crate::cluster::kmeans::{KMeans, KMeansOptions};
use crate::error::{Result, SeisdecError};
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;

/// EM options.
#[derive(Debug, Clone)]
pub struct GmmOptions {
    /// Number of components.
    pub n_components: usize,
    /// Maximum EM iterations.
    pub max_iter: usize,
    /// Stop when the mean log-likelihood improves by less than this.
    pub tol: f64,
    /// Added to every variance to keep components from collapsing.
    pub reg_covar: f64,
    /// Restarts of the seeding k-means.
    pub n_init: usize,
    /// Random seed.
    pub seed: u64,
}

impl Default for GmmOptions {
    fn default() -> Self {
        Self {
            n_components: 8,
            max_iter: 100,
            tol: 1e-3,
            reg_covar: 1e-6,
            n_init: 1,
            seed: 42,
        }
    }
}

/// A fitted mixture.
#[derive(Debug, Clone)]
pub struct GaussianMixture {
    /// Component means, `k x dim`.
    pub means: Array2<f64>,
    /// Diagonal variances, `k x dim`.
    pub variances: Array2<f64>,
    /// Mixing weights.
    pub weights: Array1<f64>,
    /// Mean per-sample log-likelihood at the end of EM.
    pub log_likelihood: f64,
    /// EM iterations run.
    pub n_iter: usize,
    /// Whether the tolerance was reached before `max_iter`.
    pub converged: bool,
}

impl GaussianMixture {
    /// Fits a mixture to the rows of `data`.
    pub fn fit(data: &Array2<f32>, options: &GmmOptions) -> Result<Self> {
        let k = options.n_components;
        let kmeans = KMeans::fit(
            data,
            &KMeansOptions {
                n_clusters: k,
                n_init: options.n_init.max(1),
                seed: options.seed,
                ..Default::default()
            },
        )?;

        let x = data.mapv(|v| v as f64);
        let (n, dim) = x.dim();

        // Hard k-means responsibilities give the first M step.
        let mut resp = Array2::<f64>::zeros((n, k));
        for (i, &l) in kmeans.labels.iter().enumerate() {
            resp[[i, l]] = 1.0;
        }
        let mut model = Self {
            means: Array2::zeros((k, dim)),
            variances: Array2::ones((k, dim)),
            weights: Array1::from_elem(k, 1.0 / k as f64),
            log_likelihood: f64::NEG_INFINITY,
            n_iter: 0,
            converged: false,
        };
        model.m_step(&x, &resp, options.reg_covar);

        for _ in 0..options.max_iter {
            model.n_iter += 1;
            let (new_resp, ll) = model.e_step(&x);
            if !ll.is_finite() {
                return Err(SeisdecError::Training("mixture log-likelihood is not finite".to_string()));
            }
            let improvement = ll - model.log_likelihood;
            model.log_likelihood = ll;
            model.m_step(&x, &new_resp, options.reg_covar);
            if improvement.abs() < options.tol {
                model.converged = true;
                break;
            }
        }

        Ok(model)
    }

    /// Number of components.
    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    /// Component means as f32, ready to become centroids.
    pub fn centroids(&self) -> Array2<f32> {
        self.means.mapv(|v| v as f32)
    }

    /// Posterior responsibilities, `n x k`.
    pub fn predict_proba(&self, data: &Array2<f32>) -> Result<Array2<f64>> {
        if data.ncols() != self.means.ncols() {
            return Err(SeisdecError::Shape {
                expected: format!("width {}", self.means.ncols()),
                actual: format!("width {}", data.ncols()),
            });
        }
        Ok(self.e_step(&data.mapv(|v| v as f64)).0)
    }

    /// Most probable component of every row.
    pub fn predict(&self, data: &Array2<f32>) -> Result<Vec<usize>> {
        let resp = self.predict_proba(data)?;
        Ok(resp
            .rows()
            .into_iter()
            .map(|r| {
                r.iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |b, (k, &v)| if v > b.1 { (k, v) } else { b })
                    .0
            })
            .collect())
    }

    /// Per-component log densities plus log weights, `n x k`.
    fn weighted_log_prob(&self, x: &Array2<f64>) -> Array2<f64> {
        let k = self.n_components();
        let dim = x.ncols() as f64;
        let ln_2pi = (2.0 * std::f64::consts::PI).ln();
        let consts: Vec<f64> = (0..k)
            .map(|c| {
                let log_det: f64 = self.variances.row(c).iter().map(|v| v.ln()).sum();
                self.weights[c].max(f64::MIN_POSITIVE).ln() - 0.5 * (dim * ln_2pi + log_det)
            })
            .collect();

        let rows: Vec<Vec<f64>> = (0..x.nrows())
            .into_par_iter()
            .map(|i| {
                let row = x.row(i);
                (0..k)
                    .map(|c| {
                        let mahalanobis: f64 = row
                            .iter()
                            .zip(self.means.row(c).iter())
                            .zip(self.variances.row(c).iter())
                            .map(|((&x, &m), &v)| (x - m) * (x - m) / v)
                            .sum();
                        consts[c] - 0.5 * mahalanobis
                    })
                    .collect()
            })
            .collect();

        let mut out = Array2::zeros((x.nrows(), k));
        for (i, r) in rows.into_iter().enumerate() {
            for (c, v) in r.into_iter().enumerate() {
                out[[i, c]] = v;
            }
        }
        out
    }

    /// Responsibilities and mean log-likelihood.
    fn e_step(&self, x: &Array2<f64>) -> (Array2<f64>, f64) {
        let mut lp = self.weighted_log_prob(x);
        let mut total = 0.0;
        for mut row in lp.rows_mut() {
            let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
            let log_norm = max + row.iter().map(|&v| (v - max).exp()).sum::<f64>().ln();
            total += log_norm;
            row.mapv_inplace(|v| (v - log_norm).exp());
        }
        (lp, total / x.nrows().max(1) as f64)
    }

    fn m_step(&mut self, x: &Array2<f64>, resp: &Array2<f64>, reg: f64) {
        let n = x.nrows() as f64;
        let nk = resp.sum_axis(Axis(0)).mapv(|v| v + 10.0 * f64::EPSILON);
        self.weights = &nk / n;

        let means = resp.t().dot(x) / &nk.view().insert_axis(Axis(1));
        let sq = resp.t().dot(&x.mapv(|v| v * v)) / &nk.view().insert_axis(Axis(1));
        self.variances = (sq - means.mapv(|m| m * m)).mapv(|v| v.max(0.0) + reg);
        self.means = means;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::kmeans::tests::blobs;

    #[test]
    fn test_fits_blobs() {
        let (data, truth) = blobs(40, 8);
        let gmm = GaussianMixture::fit(
            &data,
            &GmmOptions {
                n_components: 3,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(gmm.centroids().dim(), (3, 2));
        assert!((gmm.weights.sum() - 1.0).abs() < 1e-6);
        assert!(gmm.variances.iter().all(|&v| v > 0.0 && v < 1.0));

        let labels = gmm.predict(&data).unwrap();
        for i in (0..truth.len()).step_by(7) {
            for j in (0..truth.len()).step_by(5) {
                assert_eq!(truth[i] == truth[j], labels[i] == labels[j]);
            }
        }
    }

    #[test]
    fn test_responsibilities_sum_to_one() {
        let (data, _) = blobs(10, 2);
        let gmm = GaussianMixture::fit(
            &data,
            &GmmOptions {
                n_components: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let resp = gmm.predict_proba(&data).unwrap();
        for row in resp.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
    }
}
