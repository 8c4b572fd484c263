//! Dense autoencoder over flattened spectrograms.
//!
//! The encoder maps `input -> hidden... -> latent` with ReLU hidden layers and
//! a linear latent layer. The decoder mirrors the widths back to the input
//! and ends in a linear layer, so reconstructions are not clipped.

use crate::config::ModelConfig;
use crate::error::{Result, SeisdecError};
use crate::nn::adam::{Adam, AdamConfig, StackMoments};
use crate::nn::dense::{Activation, Stack};
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Encoder/decoder pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Autoencoder {
    encoder: Stack,
    decoder: Stack,
}

impl Autoencoder {
    /// Creates a randomly initialised autoencoder for `input_dim` features.
    pub fn new<R: Rng + ?Sized>(input_dim: usize, config: &ModelConfig, rng: &mut R) -> Result<Self> {
        if input_dim == 0 || config.latent_dim == 0 {
            return Err(SeisdecError::Config(format!(
                "autoencoder needs non-zero input and latent widths, got {} and {}",
                input_dim, config.latent_dim
            )));
        }

        let mut widths = Vec::with_capacity(config.hidden.len() + 2);
        widths.push(input_dim);
        widths.extend_from_slice(&config.hidden);
        widths.push(config.latent_dim);

        let encoder = Stack::new(&widths, Activation::Relu, Activation::Identity, rng);
        widths.reverse();
        let decoder = Stack::new(&widths, Activation::Relu, Activation::Identity, rng);

        Ok(Self { encoder, decoder })
    }

    /// Input width.
    pub fn input_dim(&self) -> usize {
        self.encoder.input_dim()
    }

    /// Latent width.
    pub fn latent_dim(&self) -> usize {
        self.encoder.output_dim()
    }

    /// The encoder half.
    pub fn encoder(&self) -> &Stack {
        &self.encoder
    }

    /// Consumes the model, keeping only the encoder.
    pub fn into_encoder(self) -> Stack {
        self.encoder
    }

    /// Latent vectors for a batch.
    pub fn encode(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        self.check_input(x)?;
        Ok(self.encoder.forward(x))
    }

    /// Reconstructions and latent vectors for a batch.
    pub fn forward(&self, x: &Array2<f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        self.check_input(x)?;
        let z = self.encoder.forward(x);
        let recon = self.decoder.forward(&z);
        Ok((recon, z))
    }

    /// Reconstructions for a batch.
    pub fn reconstruct(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        Ok(self.forward(x)?.0)
    }

    /// Sum of squared reconstruction errors over the batch, and the number of
    /// elements it covers.
    pub fn squared_error(&self, x: &Array2<f32>) -> Result<(f64, usize)> {
        let recon = self.reconstruct(x)?;
        let sse = recon
            .iter()
            .zip(x.iter())
            .map(|(r, v)| {
                let d = (r - v) as f64;
                d * d
            })
            .sum();
        Ok((sse, x.len()))
    }

    /// Mean squared reconstruction error of a batch.
    pub fn mse(&self, x: &Array2<f32>) -> Result<f32> {
        let (sse, n) = self.squared_error(x)?;
        Ok((sse / n.max(1) as f64) as f32)
    }

    /// Returns true if every parameter is finite.
    pub fn is_finite(&self) -> bool {
        self.encoder.is_finite() && self.decoder.is_finite()
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

/// Adam state for an [`Autoencoder`].
#[derive(Debug, Clone)]
pub struct AutoencoderOptimizer {
    adam: Adam,
    encoder: StackMoments,
    decoder: StackMoments,
}

impl AutoencoderOptimizer {
    /// Creates optimiser state for `model`.
    pub fn new(model: &Autoencoder, learning_rate: f32) -> Self {
        Self {
            adam: Adam::new(AdamConfig::with_learning_rate(learning_rate)),
            encoder: StackMoments::new(&model.encoder),
            decoder: StackMoments::new(&model.decoder),
        }
    }

    /// One gradient step on the mean squared reconstruction error.
    ///
    /// Returns the loss measured before the update. A non-finite loss is
    /// returned as-is and the parameters are left untouched. If the update
    /// itself leaves a non-finite parameter the step reports a NaN loss.
    pub fn train_step(&mut self, model: &mut Autoencoder, x: &Array2<f32>) -> Result<f32> {
        model.check_input(x)?;
        let (z, enc_caches) = model.encoder.forward_cached(x);
        let (recon, dec_caches) = model.decoder.forward_cached(&z);

        let n = x.len().max(1) as f32;
        let diff = &recon - x;
        let loss = diff.iter().map(|d| d * d).sum::<f32>() / n;
        if !loss.is_finite() {
            return Ok(loss);
        }

        let grad_recon = diff * (2.0 / n);
        let (dec_grads, grad_z) = model.decoder.backward(&dec_caches, &grad_recon);
        let (enc_grads, _) = model.encoder.backward(&enc_caches, &grad_z);

        self.adam.begin_step();
        self.decoder.apply(&self.adam, &mut model.decoder, &dec_grads);
        self.encoder.apply(&self.adam, &mut model.encoder, &enc_grads);
        if !model.is_finite() {
            return Ok(f32::NAN);
        }

        Ok(loss)
    }

    /// Number of steps taken.
    pub fn steps(&self) -> u64 {
        self.adam.steps()
    }
}
