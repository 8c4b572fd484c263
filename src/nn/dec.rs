//! Joint encoder + clustering model.

use crate::error::{Result, SeisdecError};
use crate::nn::adam::{Adam, AdamConfig, Moments, StackMoments};
use crate::nn::autoencoder::Autoencoder;
use crate::nn::clustering::{hard_labels, ClusteringLayer};
use crate::nn::dense::Stack;
use ndarray::{Array2, Ix2};
use serde::{Deserialize, Serialize};

/// Encoder followed by a soft-clustering head. The decoder is dropped once
/// pretraining is over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecModel {
    encoder: Stack,
    clustering: ClusteringLayer,
}

/// Everything the model says about one batch.
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Latent vectors, `n x D`.
    pub latents: Array2<f32>,
    /// Soft assignments, `n x K`.
    pub q: Array2<f32>,
    /// Argmax labels.
    pub labels: Vec<usize>,
}

impl DecModel {
    /// Joins an encoder and a head, checking that their widths agree.
    pub fn new(encoder: Stack, clustering: ClusteringLayer) -> Result<Self> {
        if encoder.output_dim() != clustering.dim() {
            return Err(SeisdecError::Shape {
                expected: format!("centroid width {}", encoder.output_dim()),
                actual: format!("centroid width {}", clustering.dim()),
            });
        }
        Ok(Self { encoder, clustering })
    }

    /// Builds a model from a pretrained autoencoder and initial centroids.
    pub fn from_autoencoder(autoencoder: Autoencoder, centroids: Array2<f32>, alpha: f32) -> Result<Self> {
        let clustering = ClusteringLayer::new(centroids, alpha)?;
        Self::new(autoencoder.into_encoder(), clustering)
    }

    /// Input width.
    pub fn input_dim(&self) -> usize {
        self.encoder.input_dim()
    }

    /// Latent width.
    pub fn latent_dim(&self) -> usize {
        self.encoder.output_dim()
    }

    /// Number of clusters.
    pub fn n_clusters(&self) -> usize {
        self.clustering.n_clusters()
    }

    /// The clustering head.
    pub fn clustering(&self) -> &ClusteringLayer {
        &self.clustering
    }

    /// Latent vectors of a batch.
    pub fn embed(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        self.check_input(x)?;
        Ok(self.encoder.forward(x))
    }

    /// Soft assignments of a batch.
    pub fn soft_assign(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        let z = self.embed(x)?;
        self.clustering.soft_assign(&z)
    }

    /// Latents, soft assignments and labels of a batch.
    pub fn predict(&self, x: &Array2<f32>) -> Result<Prediction> {
        let latents = self.embed(x)?;
        let q = self.clustering.soft_assign(&latents)?;
        let labels = hard_labels(&q);
        Ok(Prediction { latents, q, labels })
    }

    /// Returns true if every parameter is finite.
    pub fn is_finite(&self) -> bool {
        self.encoder.is_finite() && self.clustering.centroids().iter().all(|v| v.is_finite())
    }

    fn check_input(&self, x: &Array2<f32>) -> Result<()> {
        if x.ncols() != self.input_dim() {
            return Err(SeisdecError::Shape {
                expected: format!("{} features", self.input_dim()),
                actual: format!("{} features", x.ncols()),
            });
        }
        Ok(())
    }
}

/// Adam state for a [`DecModel`]. Encoder weights and centroids share one
/// step counter.
#[derive(Debug, Clone)]
pub struct DecOptimizer {
    adam: Adam,
    encoder: StackMoments,
    centroids: Moments<Ix2>,
}

impl DecOptimizer {
    /// Creates optimiser state for `model`.
    pub fn new(model: &DecModel, learning_rate: f32) -> Self {
        Self {
            adam: Adam::new(AdamConfig::with_learning_rate(learning_rate)),
            encoder: StackMoments::new(&model.encoder),
            centroids: Moments::zeros_like(model.clustering.centroids()),
        }
    }

    /// One joint step on KL(P || Q) for a batch and its target rows.
    ///
    /// Returns the loss measured before the update. A non-finite loss is
    /// returned as-is and the parameters are left untouched. If the update
    /// itself leaves a non-finite parameter the step reports a NaN loss.
    pub fn train_step(&mut self, model: &mut DecModel, x: &Array2<f32>, target: &Array2<f32>) -> Result<f32> {
        model.check_input(x)?;
        let (z, caches) = model.encoder.forward_cached(x);
        let grads = model.clustering.gradients(&z, target)?;
        if !grads.loss.is_finite() {
            return Ok(grads.loss);
        }

        let (encoder_grads, _) = model.encoder.backward(&caches, &grads.latent);

        self.adam.begin_step();
        self.encoder.apply(&self.adam, &mut model.encoder, &encoder_grads);
        self.adam
            .update(model.clustering.centroids_mut(), &grads.centroids, &mut self.centroids);
        if !model.is_finite() {
            return Ok(f32::NAN);
        }

        Ok(grads.loss)
    }

    /// Number of steps taken.
    pub fn steps(&self) -> u64 {
        self.adam.steps()
    }
}
