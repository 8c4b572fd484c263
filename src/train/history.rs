//! Per-run training history.

use serde::{Deserialize, Serialize};

/// One autoencoder epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainEpoch {
    /// One-based epoch.
    pub epoch: usize,
    /// Mean reconstruction loss over the training split.
    pub train_loss: f32,
    /// Mean reconstruction loss over the validation split.
    pub validation_loss: Option<f32>,
    /// Wall-clock seconds.
    pub seconds: f64,
}

/// One target-distribution update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetUpdate {
    /// Zero-based update counter.
    pub update: usize,
    /// Epoch during which the update happened.
    pub epoch: usize,
    /// Gradient steps taken before the update.
    pub step: u64,
    /// Fraction of labels that changed since the previous update.
    pub delta: Option<f64>,
    /// Soft-frequency share of the largest cluster.
    pub largest_cluster: f32,
}

/// One DEC fine-tuning epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecEpoch {
    /// One-based epoch.
    pub epoch: usize,
    /// Mean KL loss over the epoch's batches.
    pub loss: f32,
    /// Wall-clock seconds.
    pub seconds: f64,
}

/// Everything appended during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    /// Run identifier.
    pub run_id: String,
    /// Autoencoder epochs.
    pub pretrain: Vec<PretrainEpoch>,
    /// Epoch whose weights were kept as the final autoencoder.
    pub best_pretrain_epoch: Option<usize>,
    /// DEC epochs.
    pub dec: Vec<DecEpoch>,
    /// Target updates with their label deltas.
    pub updates: Vec<TargetUpdate>,
    /// How fine-tuning ended.
    pub stop_reason: Option<String>,
}

impl History {
    /// Empty history for a run.
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            ..Default::default()
        }
    }

    /// Deltas of every update that had a predecessor.
    pub fn deltas(&self) -> Vec<f64> {
        self.updates.iter().filter_map(|u| u.delta).collect()
    }

    /// Lowest validation loss seen during pretraining.
    pub fn best_validation_loss(&self) -> Option<f32> {
        self.pretrain
            .iter()
            .filter_map(|e| e.validation_loss)
            .fold(None, |best, v| Some(best.map_or(v, |b: f32| b.min(v))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_skip_first_update() {
        let mut history = History::new("run");
        for (i, delta) in [None, Some(0.3), Some(0.0)].into_iter().enumerate() {
            history.updates.push(TargetUpdate {
                update: i,
                epoch: i,
                step: 0,
                delta,
                largest_cluster: 0.5,
            });
        }
        assert_eq!(history.deltas(), vec![0.3, 0.0]);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut history = History::new("bs32_lr0.001");
        history.pretrain.push(PretrainEpoch {
            epoch: 1,
            train_loss: 0.5,
            validation_loss: Some(0.4),
            seconds: 0.1,
        });
        history.pretrain.push(PretrainEpoch {
            epoch: 2,
            train_loss: 0.3,
            validation_loss: Some(0.35),
            seconds: 0.1,
        });
        let json = serde_json::to_string(&history).unwrap();
        let back: History = serde_json::from_str(&json).unwrap();
        assert_eq!(back, history);
        assert_eq!(back.best_validation_loss(), Some(0.35));
    }
}
