//! Autoencoder pretraining.
//!
//! Minimises mean squared reconstruction error on the training split and
//! scores the validation split after every epoch. The weights of the best
//! validation epoch are what the run keeps as its final autoencoder.

use crate::config::{ModelConfig, PretrainConfig};
use crate::context::RunContext;
use crate::data::{BatchLoader, TransformKind};
use crate::error::{Result, SeisdecError};
use crate::nn::{Autoencoder, AutoencoderOptimizer};
use crate::storage::{save_snapshot, RunDirectory, Snapshot, Stage};
use crate::train::history::{History, PretrainEpoch};
use crate::train::notify::{Notifier, NullNotifier, TrainingEvent};
use image::{GrayImage, Luma};
use log::{debug, info};
use ndarray::Array2;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// RNG stream used for weight initialisation and shuffling.
const PRETRAIN_STREAM: u64 = 1;

/// Result of a pretraining run.
#[derive(Debug, Clone)]
pub struct PretrainOutcome {
    /// Weights of the best epoch.
    pub model: Autoencoder,
    /// Epoch those weights come from.
    pub best_epoch: usize,
    /// Loss used to pick the best epoch (validation if available).
    pub best_loss: f32,
    /// Epochs actually run.
    pub epochs_run: usize,
    /// Whether early stopping ended the run.
    pub stopped_early: bool,
}

/// Drives autoencoder pretraining for one run.
pub struct AutoencoderTrainer {
    config: PretrainConfig,
    model: ModelConfig,
    learning_rate: f32,
    context: RunContext,
    notifier: Arc<dyn Notifier>,
}

impl AutoencoderTrainer {
    /// Creates a trainer.
    pub fn new(config: PretrainConfig, model: ModelConfig, learning_rate: f32, context: RunContext) -> Self {
        Self {
            config,
            model,
            learning_rate,
            context,
            notifier: Arc::new(NullNotifier),
        }
    }

    /// Sets the progress notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Trains a fresh autoencoder and writes its initial and final snapshots
    /// into `run`.
    pub fn train(
        &self,
        train: &BatchLoader,
        validation: Option<&BatchLoader>,
        run: &RunDirectory,
        history: &mut History,
    ) -> Result<PretrainOutcome> {
        if train.is_empty() {
            return Err(SeisdecError::EmptyInput("training split is empty".to_string()));
        }
        let validation = validation.filter(|v| !v.is_empty());

        let mut rng = self.context.rng(PRETRAIN_STREAM);
        let mut model = Autoencoder::new(train.feature_dim(), &self.model, &mut rng)?;
        let mut optimizer = AutoencoderOptimizer::new(&model, self.learning_rate);
        self.save(run, Stage::Initial, &model, train, 0)?;

        info!(
            "[{}] Pretraining autoencoder: {} -> {:?} -> {} on {} samples ({} validation)",
            run.run_id(),
            model.input_dim(),
            self.model.hidden,
            model.latent_dim(),
            train.len(),
            validation.map_or(0, |v| v.len())
        );

        let preview_source = validation.unwrap_or(train);
        let preview_positions: Vec<usize> = (0..self.config.preview_samples.min(preview_source.len())).collect();

        let mut best_loss = f32::INFINITY;
        let mut best_model = model.clone();
        let mut best_epoch = 0;
        let mut since_improvement = 0;
        let mut epochs_run = 0;
        let mut stopped_early = false;

        for epoch in 1..=self.config.epochs {
            let start = Instant::now();
            let mut sum = 0.0f64;
            let mut count = 0usize;

            for batch in train.shuffled(&mut rng)? {
                let batch = batch?;
                let loss = optimizer.train_step(&mut model, &batch.data)?;
                if !loss.is_finite() {
                    return Err(SeisdecError::Divergence {
                        run: run.run_id().to_string(),
                        stage: "pretrain".to_string(),
                        detail: format!("loss {} at epoch {} step {}", loss, epoch, optimizer.steps() + 1),
                    });
                }
                sum += loss as f64 * batch.len() as f64;
                count += batch.len();
            }
            let train_loss = (sum / count.max(1) as f64) as f32;

            let validation_loss = match validation {
                Some(v) => Some(evaluate(&model, v)?),
                None => None,
            };
            let monitored = validation_loss.unwrap_or(train_loss);
            if !monitored.is_finite() {
                return Err(SeisdecError::Divergence {
                    run: run.run_id().to_string(),
                    stage: "pretrain".to_string(),
                    detail: format!("validation loss {} at epoch {}", monitored, epoch),
                });
            }

            if monitored < best_loss {
                best_loss = monitored;
                best_model = model.clone();
                best_epoch = epoch;
                since_improvement = 0;
            } else {
                since_improvement += 1;
            }
            epochs_run = epoch;

            history.pretrain.push(PretrainEpoch {
                epoch,
                train_loss,
                validation_loss,
                seconds: start.elapsed().as_secs_f64(),
            });
            history.best_pretrain_epoch = Some(best_epoch);
            run.write_json("history.json", history)?;

            debug!(
                "[{}] pretrain epoch {}/{} train {:.6} validation {:?}",
                run.run_id(),
                epoch,
                self.config.epochs,
                train_loss,
                validation_loss
            );
            self.notifier.notify(&TrainingEvent::EpochCompleted {
                run: run.run_id().to_string(),
                stage: "pretrain".to_string(),
                epoch,
                loss: train_loss,
            });

            if self.config.preview_every > 0 && epoch % self.config.preview_every == 0 && !preview_positions.is_empty() {
                let path = run.previews_dir().join(format!("epoch_{:04}.png", epoch));
                let batch = preview_source.load_positions(&preview_positions)?;
                write_preview(&model, &batch.data, preview_source.shape(), &path)?;
            }

            if self.config.early_stopping && since_improvement >= self.config.patience {
                info!(
                    "[{}] Early stopping at epoch {}: no improvement for {} epochs",
                    run.run_id(),
                    epoch,
                    since_improvement
                );
                stopped_early = true;
                break;
            }
        }

        self.save(run, Stage::Final, &best_model, train, best_epoch)?;
        info!(
            "[{}] Pretraining finished after {} epochs, best loss {:.6} at epoch {}",
            run.run_id(),
            epochs_run,
            best_loss,
            best_epoch
        );

        Ok(PretrainOutcome {
            model: best_model,
            best_epoch,
            best_loss,
            epochs_run,
            stopped_early,
        })
    }

    fn save(&self, run: &RunDirectory, stage: Stage, model: &Autoencoder, loader: &BatchLoader, epoch: usize) -> Result<()> {
        save_snapshot(
            run.autoencoder_path(stage),
            &Snapshot {
                model: model.clone(),
                transform: loader.transform(),
                shape: loader.shape(),
                epoch,
            },
        )
    }
}

/// Mean squared reconstruction error over every batch of `loader`.
pub fn evaluate(model: &Autoencoder, loader: &BatchLoader) -> Result<f32> {
    let mut sse = 0.0f64;
    let mut count = 0usize;
    for batch in loader.iter()? {
        let (s, n) = model.squared_error(&batch?.data)?;
        sse += s;
        count += n;
    }
    Ok((sse / count.max(1) as f64) as f32)
}

/// Renders inputs and reconstructions side by side, one sample per band,
/// frequency increasing upwards.
pub fn write_preview(model: &Autoencoder, inputs: &Array2<f32>, shape: (usize, usize), path: &Path) -> Result<()> {
    let recon = model.reconstruct(inputs)?;
    let (height, width) = shape;
    let n = inputs.nrows();
    let img_w = (2 * width + 1) as u32;
    let img_h = (n * (height + 1)).saturating_sub(1).max(1) as u32;

    let mut panels = Vec::with_capacity(n);
    for i in 0..n {
        let original = TransformKind::restore(&inputs.row(i).to_vec(), shape);
        let rebuilt = TransformKind::restore(&recon.row(i).to_vec(), shape);
        match (original, rebuilt) {
            (Some(o), Some(r)) => {
                let lo = o.iter().chain(r.iter()).fold(f32::INFINITY, |m, &v| m.min(v));
                let hi = o.iter().chain(r.iter()).fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                panels.push((o, r, lo, (hi - lo).max(f32::EPSILON)));
            }
            _ => {
                return Err(SeisdecError::Shape {
                    expected: format!("{:?}", shape),
                    actual: format!("{} values", inputs.ncols()),
                })
            }
        }
    }

    let img: GrayImage = GrayImage::from_fn(img_w, img_h, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let band = y / (height + 1);
        let row = y % (height + 1);
        if band >= n || row == height || x == width {
            return Luma([0u8]);
        }
        let (o, r, lo, span) = &panels[band];
        let f = height - 1 - row;
        let v = if x < width { o[[f, x]] } else { r[[f, x - width - 1]] };
        Luma([(((v - lo) / span) * 255.0).clamp(0.0, 255.0) as u8])
    });
    img.save(path)?;
    Ok(())
}
