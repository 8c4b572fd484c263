//! Adam optimiser.
//!
//! Each parameter tensor owns a [`Moments`] pair; the optimiser itself only
//! holds the hyperparameters and the shared step counter used for bias
//! correction.

use crate::nn::dense::{DenseGrads, Stack};
use ndarray::{Array, Dimension, Ix1, Ix2, Zip};

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    /// Step size.
    pub learning_rate: f32,
    /// First moment decay.
    pub beta1: f32,
    /// Second moment decay.
    pub beta2: f32,
    /// Denominator offset.
    pub eps: f32,
}

impl AdamConfig {
    /// Standard betas with the given learning rate.
    pub fn with_learning_rate(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// First and second moment estimates of one parameter tensor.
#[derive(Debug, Clone)]
pub struct Moments<D: Dimension> {
    m: Array<f32, D>,
    v: Array<f32, D>,
}

impl<D: Dimension> Moments<D> {
    /// Zero moments shaped like `param`.
    pub fn zeros_like(param: &Array<f32, D>) -> Self {
        Self {
            m: Array::zeros(param.raw_dim()),
            v: Array::zeros(param.raw_dim()),
        }
    }
}

/// Adam update rule with a global step counter.
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    step: u64,
}

impl Adam {
    /// Creates an optimiser.
    pub fn new(config: AdamConfig) -> Self {
        Self { config, step: 0 }
    }

    /// Hyperparameters.
    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Number of completed steps.
    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Advances the step counter. Call once per optimisation step, before
    /// updating any tensor.
    pub fn begin_step(&mut self) {
        self.step += 1;
    }

    /// Applies one bias-corrected update to `param`.
    pub fn update<D: Dimension>(&self, param: &mut Array<f32, D>, grad: &Array<f32, D>, moments: &mut Moments<D>) {
        let c = self.config;
        let t = self.step.max(1) as i32;
        let bias1 = 1.0 - c.beta1.powi(t);
        let bias2 = 1.0 - c.beta2.powi(t);

        Zip::from(param)
            .and(grad)
            .and(&mut moments.m)
            .and(&mut moments.v)
            .for_each(|p, &g, m, v| {
                *m = c.beta1 * *m + (1.0 - c.beta1) * g;
                *v = c.beta2 * *v + (1.0 - c.beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= c.learning_rate * m_hat / (v_hat.sqrt() + c.eps);
            });
    }
}

/// Moment state for every tensor of a [`Stack`].
#[derive(Debug, Clone)]
pub struct StackMoments {
    layers: Vec<(Moments<Ix2>, Moments<Ix1>)>,
}

impl StackMoments {
    /// Zero moments for every layer of `stack`.
    pub fn new(stack: &Stack) -> Self {
        let layers = stack
            .layers
            .iter()
            .map(|l| (Moments::zeros_like(&l.weights), Moments::zeros_like(&l.bias)))
            .collect();
        Self { layers }
    }

    /// Applies one update to every layer of `stack`.
    pub fn apply(&mut self, adam: &Adam, stack: &mut Stack, grads: &[DenseGrads]) {
        for ((layer, g), (mw, mb)) in stack.layers.iter_mut().zip(grads).zip(self.layers.iter_mut()) {
            adam.update::<Ix2>(&mut layer.weights, &g.weights, mw);
            adam.update::<Ix1>(&mut layer.bias, &g.bias, mb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let mut adam = Adam::new(AdamConfig::with_learning_rate(0.1));
        let mut param = array![1.0f32, -1.0];
        let grad = array![2.0f32, -0.5];
        let mut moments = Moments::zeros_like(&param);

        adam.begin_step();
        adam.update(&mut param, &grad, &mut moments);

        // Bias-corrected first step is lr * sign(g).
        assert!((param[0] - 0.9).abs() < 1e-4);
        assert!((param[1] + 0.9).abs() < 1e-4);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_minimises_quadratic() {
        let mut adam = Adam::new(AdamConfig::with_learning_rate(0.05));
        let mut x = array![[3.0f32, -2.0]];
        let mut moments = Moments::zeros_like(&x);
        for _ in 0..500 {
            let grad = x.mapv(|v| 2.0 * v);
            adam.begin_step();
            adam.update(&mut x, &grad, &mut moments);
        }
        assert!(x.iter().all(|v| v.abs() < 0.05));
    }
}
