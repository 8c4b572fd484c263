//! Fully connected layers with explicit forward and backward passes.

use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Elementwise nonlinearity applied after the affine map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    /// No nonlinearity.
    Identity,
    /// max(0, x).
    Relu,
}

/// Affine layer `y = act(x W + b)` with `W` shaped `input x output`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    /// Weight matrix.
    pub weights: Array2<f32>,
    /// Bias vector.
    pub bias: Array1<f32>,
    /// Output nonlinearity.
    pub activation: Activation,
}

/// Values saved by the forward pass for the backward pass.
#[derive(Debug, Clone)]
pub struct DenseCache {
    input: Array2<f32>,
    output: Array2<f32>,
}

/// Parameter gradients of one layer.
#[derive(Debug, Clone)]
pub struct DenseGrads {
    /// Gradient with respect to the weights.
    pub weights: Array2<f32>,
    /// Gradient with respect to the bias.
    pub bias: Array1<f32>,
}

impl Dense {
    /// Creates a layer with Glorot-uniform weights and zero bias.
    pub fn new<R: Rng + ?Sized>(input: usize, output: usize, activation: Activation, rng: &mut R) -> Self {
        let limit = (6.0 / (input + output) as f32).sqrt();
        let weights = Array2::from_shape_fn((input, output), |_| rng.gen_range(-limit..limit));
        Self {
            weights,
            bias: Array1::zeros(output),
            activation,
        }
    }

    /// Input width.
    #[inline]
    pub fn input_dim(&self) -> usize {
        self.weights.nrows()
    }

    /// Output width.
    #[inline]
    pub fn output_dim(&self) -> usize {
        self.weights.ncols()
    }

    /// Forward pass without caching.
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = x.dot(&self.weights) + &self.bias;
        if self.activation == Activation::Relu {
            out.mapv_inplace(|v| v.max(0.0));
        }
        out
    }

    /// Forward pass that keeps what the backward pass needs.
    pub fn forward_cached(&self, x: &Array2<f32>) -> (Array2<f32>, DenseCache) {
        let out = self.forward(x);
        let cache = DenseCache {
            input: x.clone(),
            output: out.clone(),
        };
        (out, cache)
    }

    /// Backward pass. Returns the parameter gradients and the gradient with
    /// respect to the layer input.
    pub fn backward(&self, cache: &DenseCache, grad_out: &Array2<f32>) -> (DenseGrads, Array2<f32>) {
        let mut grad_z = grad_out.clone();
        if self.activation == Activation::Relu {
            ndarray::Zip::from(&mut grad_z)
                .and(&cache.output)
                .for_each(|g, &o| {
                    if o <= 0.0 {
                        *g = 0.0;
                    }
                });
        }

        let grads = DenseGrads {
            weights: cache.input.t().dot(&grad_z),
            bias: grad_z.sum_axis(Axis(0)),
        };
        let grad_in = grad_z.dot(&self.weights.t());
        (grads, grad_in)
    }
}

/// A chain of dense layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stack {
    /// Layers, input side first.
    pub layers: Vec<Dense>,
}

impl Stack {
    /// Builds a stack through the given widths. Every layer but the last uses
    /// `hidden`; the last uses `last`.
    pub fn new<R: Rng + ?Sized>(widths: &[usize], hidden: Activation, last: Activation, rng: &mut R) -> Self {
        let n = widths.len().saturating_sub(1);
        let layers = widths
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                let act = if i + 1 == n { last } else { hidden };
                Dense::new(w[0], w[1], act, rng)
            })
            .collect();
        Self { layers }
    }

    /// Input width.
    pub fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, |l| l.input_dim())
    }

    /// Output width.
    pub fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, |l| l.output_dim())
    }

    /// Forward pass without caching.
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut h = x.clone();
        for layer in &self.layers {
            h = layer.forward(&h);
        }
        h
    }

    /// Forward pass that keeps one cache per layer.
    pub fn forward_cached(&self, x: &Array2<f32>) -> (Array2<f32>, Vec<DenseCache>) {
        let mut caches = Vec::with_capacity(self.layers.len());
        let mut h = x.clone();
        for layer in &self.layers {
            let (out, cache) = layer.forward_cached(&h);
            caches.push(cache);
            h = out;
        }
        (h, caches)
    }

    /// Backward pass through every layer. Gradients come back in layer order.
    pub fn backward(&self, caches: &[DenseCache], grad_out: &Array2<f32>) -> (Vec<DenseGrads>, Array2<f32>) {
        let mut grads = Vec::with_capacity(self.layers.len());
        let mut g = grad_out.clone();
        for (layer, cache) in self.layers.iter().zip(caches.iter()).rev() {
            let (lg, gin) = layer.backward(cache, &g);
            grads.push(lg);
            g = gin;
        }
        grads.reverse();
        (grads, g)
    }

    /// Returns true if every parameter is finite.
    pub fn is_finite(&self) -> bool {
        self.layers
            .iter()
            .all(|l| l.weights.iter().all(|v| v.is_finite()) && l.bias.iter().all(|v| v.is_finite()))
    }
}
