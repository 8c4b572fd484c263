//! Classical clustering over latent vectors.
//!
//! These fit the initial centroids of the DEC head and drive the
//! auxiliary K-selection sweep.

pub mod gmm;
pub mod kmeans;
pub mod metrics;

pub use gmm::{GaussianMixture, GmmOptions};
pub use kmeans::{KMeans, KMeansOptions};
pub use metrics::{
    gap_statistic, inertia, select_k, silhouette_score, Gap, GapReference, KScore, KSelectionOptions,
    KSelectionReport,
};

use crate::config::CentroidInit;
use crate::error::Result;
use ndarray::Array2;

/// Fits `k` initial centroids to `latents` with the chosen heuristic.
pub fn initial_centroids(
    latents: &Array2<f32>,
    k: usize,
    init: CentroidInit,
    restarts: usize,
    seed: u64,
) -> Result<Array2<f32>> {
    match init {
        CentroidInit::KMeans => {
            let fit = KMeans::fit(
                latents,
                &KMeansOptions {
                    n_clusters: k,
                    n_init: restarts.max(1),
                    seed,
                    ..Default::default()
                },
            )?;
            Ok(fit.centroids)
        }
        CentroidInit::Gmm => {
            let fit = GaussianMixture::fit(
                latents,
                &GmmOptions {
                    n_components: k,
                    n_init: restarts.max(1),
                    seed,
                    ..Default::default()
                },
            )?;
            Ok(fit.centroids())
        }
    }
}
