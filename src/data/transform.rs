//! Per-sample transforms applied on read.
//!
//! Spectrograms are stored frequency x time. The model consumes a flat
//! time-major vector, so every transform first reorders the axes and then
//! normalises the sample on its own statistics. Transforms are pure: the
//! same input always yields the same vector.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Values smaller than this are treated as zero scale.
const SCALE_EPS: f32 = 1e-12;

/// Named per-sample transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Reorder only.
    Identity,
    /// Divide by the maximum absolute value.
    Normalize,
    /// Subtract the mean and divide by the standard deviation.
    Center,
    /// `ln(1 + |x|)` followed by max normalisation.
    LogNormalize,
}

impl Default for TransformKind {
    fn default() -> Self {
        TransformKind::Center
    }
}

impl std::str::FromStr for TransformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(TransformKind::Identity),
            "normalize" => Ok(TransformKind::Normalize),
            "center" => Ok(TransformKind::Center),
            "log_normalize" => Ok(TransformKind::LogNormalize),
            other => Err(format!("unknown transform '{}'", other)),
        }
    }
}

impl TransformKind {
    /// Flattened length for a spectrogram of the given shape.
    #[inline]
    pub fn output_len(shape: (usize, usize)) -> usize {
        shape.0 * shape.1
    }

    /// Reorders a frequency x time spectrogram into time-major order and
    /// normalises it.
    pub fn apply(&self, spectrogram: &Array2<f32>) -> Vec<f32> {
        let mut out: Vec<f32> = spectrogram.t().iter().copied().collect();
        self.normalize_in_place(&mut out);
        out
    }

    /// Applies the normalisation step to an already flattened sample.
    pub fn normalize_in_place(&self, values: &mut [f32]) {
        match self {
            TransformKind::Identity => {}
            TransformKind::Normalize => max_normalize(values),
            TransformKind::Center => standardize(values),
            TransformKind::LogNormalize => {
                for v in values.iter_mut() {
                    *v = v.abs().ln_1p();
                }
                max_normalize(values);
            }
        }
    }

    /// Undoes the axis reordering of [`TransformKind::apply`].
    ///
    /// The normalisation itself is not inverted; this is meant for rendering
    /// model inputs and reconstructions side by side.
    pub fn restore(values: &[f32], shape: (usize, usize)) -> Option<Array2<f32>> {
        let (height, width) = shape;
        let time_major = ArrayView2::from_shape((width, height), values).ok()?;
        Some(time_major.t().to_owned())
    }
}

fn max_normalize(values: &mut [f32]) {
    let max = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    if max > SCALE_EPS {
        let inv = 1.0 / max;
        for v in values.iter_mut() {
            *v *= inv;
        }
    } else {
        values.iter_mut().for_each(|v| *v = 0.0);
    }
}

fn standardize(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let std = var.sqrt();
    if std > SCALE_EPS {
        let inv = 1.0 / std;
        for v in values.iter_mut() {
            *v = (*v - mean) * inv;
        }
    } else if std.is_finite() {
        values.iter_mut().for_each(|v| *v = 0.0);
    }
    // Non-finite input passes through so corrupt samples surface as a
    // non-finite loss.
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Array2<f32> {
        Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap()
    }

    #[test]
    fn test_identity_reorders_time_major() {
        let out = TransformKind::Identity.apply(&sample());
        assert_eq!(out, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_restore_inverts_reorder() {
        let spec = sample();
        let out = TransformKind::Identity.apply(&spec);
        let restored = TransformKind::restore(&out, (2, 3)).unwrap();
        assert_eq!(restored, spec);
    }

    #[test]
    fn test_normalize_unit_max() {
        let out = TransformKind::Normalize.apply(&sample());
        let max = out.iter().cloned().fold(f32::MIN, f32::max);
        assert!((max - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_center_zero_mean_unit_variance() {
        let out = TransformKind::Center.apply(&sample());
        let n = out.len() as f32;
        let mean = out.iter().sum::<f32>() / n;
        let var = out.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_constant_sample_is_finite() {
        let spec = Array2::from_elem((4, 4), 3.0f32);
        for kind in [TransformKind::Center, TransformKind::Normalize, TransformKind::LogNormalize] {
            let zeros = kind.apply(&Array2::zeros((4, 4)));
            assert!(zeros.iter().all(|v| v.is_finite()));
        }
        let centered = TransformKind::Center.apply(&spec);
        assert!(centered.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_corrupt_sample_stays_non_finite() {
        let mut spec = sample();
        spec[[0, 1]] = f32::NAN;
        for kind in [TransformKind::Center, TransformKind::Normalize] {
            assert!(kind.apply(&spec).iter().any(|v| v.is_nan()));
        }
    }

    #[test]
    fn test_from_str() {
        assert_eq!("log_normalize".parse::<TransformKind>().unwrap(), TransformKind::LogNormalize);
        assert!("bogus".parse::<TransformKind>().is_err());
    }
}
