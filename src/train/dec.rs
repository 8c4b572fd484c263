//! DEC fine-tuning controller.
//!
//! The controller alternates between two phases:
//!
//! - `AwaitingTarget`: a full forward pass over the training split yields Q,
//!   the sharpened target P and fresh labels. The fraction of labels that
//!   changed since the previous update decides whether training has
//!   converged.
//! - `AccumulatingGradient`: mini-batches are trained on KL(P || Q) against
//!   the rows of P belonging to the batch, until the next update is due.
//!
//! Updates happen at the start of every epoch or every `n` batches,
//! depending on [`UpdateInterval`].

use crate::cluster::initial_centroids;
use crate::config::{DecConfig, UpdateInterval};
use crate::context::RunContext;
use crate::data::BatchLoader;
use crate::error::{Result, SeisdecError};
use crate::nn::{assignment_delta, hard_labels, Autoencoder, ClusteringLayer, DecModel, DecOptimizer};
use crate::storage::{save_snapshot, RunDirectory, Snapshot, Stage};
use crate::train::history::{DecEpoch, History, TargetUpdate};
use crate::train::notify::{Notifier, NullNotifier, TrainingEvent};
use log::{debug, error, info};
use ndarray::{Array2, Axis};
use std::sync::Arc;
use std::time::Instant;

/// RNG stream used for batch shuffling.
const DEC_STREAM: u64 = 2;

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecState {
    /// A target update is due before the next gradient step.
    AwaitingTarget,
    /// Training mini-batches against the current target.
    AccumulatingGradient,
    /// Label drift fell below tolerance.
    Converged,
    /// A non-finite loss aborted the run.
    Failed,
}

/// Why fine-tuning stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Label drift fell below tolerance.
    Converged,
    /// The epoch budget ran out first. The last weights are still the run's
    /// output.
    EpochBudget,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Converged => write!(f, "converged"),
            StopReason::EpochBudget => write!(f, "epoch_budget"),
        }
    }
}

/// Result of a fine-tuning run.
#[derive(Debug, Clone)]
pub struct DecOutcome {
    /// Final weights.
    pub model: DecModel,
    /// How the run ended.
    pub stop_reason: StopReason,
    /// Number of target updates performed.
    pub updates: usize,
    /// Delta of the last update that had a predecessor.
    pub final_delta: Option<f64>,
    /// Epochs started.
    pub epochs_run: usize,
    /// Labels of the training split under the final weights, in loader order.
    pub labels: Vec<usize>,
}

/// Target distribution and labels from the most recent update.
struct TargetState {
    target: Array2<f32>,
    labels: Option<Vec<usize>>,
    updates: usize,
    last_delta: Option<f64>,
}

/// Drives DEC fine-tuning for one run.
pub struct DecTrainer {
    config: DecConfig,
    n_clusters: usize,
    alpha: f32,
    learning_rate: f32,
    context: RunContext,
    notifier: Arc<dyn Notifier>,
}

impl DecTrainer {
    /// Creates a trainer for `n_clusters` clusters.
    pub fn new(config: DecConfig, n_clusters: usize, alpha: f32, learning_rate: f32, context: RunContext) -> Self {
        Self {
            config,
            n_clusters,
            alpha,
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

    /// Fits initial centroids on the pretrained latents of the training split
    /// and joins them to the encoder.
    ///
    /// Non-finite latents fail the run as a `dec_init` divergence.
    pub fn initialize(&self, autoencoder: Autoencoder, train: &BatchLoader, run: &RunDirectory) -> Result<DecModel> {
        let mut latents = Array2::zeros((train.len(), autoencoder.latent_dim()));
        for batch in train.iter()? {
            let batch = batch?;
            let z = autoencoder.encode(&batch.data)?;
            for (row, &pos) in z.rows().into_iter().zip(&batch.positions) {
                latents.row_mut(pos).assign(&row);
            }
        }
        let bad = latents.iter().filter(|v| !v.is_finite()).count();
        if bad > 0 {
            error!("[{}] {} non-finite pretrained latent values", run.run_id(), bad);
            return Err(SeisdecError::Divergence {
                run: run.run_id().to_string(),
                stage: "dec_init".to_string(),
                detail: format!("{} of {} pretrained latent values are not finite", bad, latents.len()),
            });
        }

        let centroids = self.context.pool().install(|| {
            initial_centroids(
                &latents,
                self.n_clusters,
                self.config.init,
                self.config.init_restarts,
                self.context.seed(),
            )
        })?;
        info!(
            "Initialised {} centroids with {:?} on {} latents of width {}",
            self.n_clusters,
            self.config.init,
            latents.nrows(),
            latents.ncols()
        );
        DecModel::from_autoencoder(autoencoder, centroids, self.alpha)
    }

    /// Initialises centroids, saves the initial snapshot, fine-tunes and saves
    /// the final snapshot.
    pub fn train(
        &self,
        autoencoder: Autoencoder,
        train: &BatchLoader,
        run: &RunDirectory,
        history: &mut History,
    ) -> Result<DecOutcome> {
        let model = self.initialize(autoencoder, train, run)?;
        self.save(run, Stage::Initial, &model, train, 0)?;
        let outcome = self.fit(model, train, run, history)?;
        self.save(run, Stage::Final, &outcome.model, train, outcome.epochs_run)?;
        Ok(outcome)
    }

    /// Fine-tunes an initialised model. Writes history but no snapshots.
    pub fn fit(&self, mut model: DecModel, train: &BatchLoader, run: &RunDirectory, history: &mut History) -> Result<DecOutcome> {
        if train.is_empty() {
            return Err(SeisdecError::EmptyInput("training split is empty".to_string()));
        }
        let mut rng = self.context.rng(DEC_STREAM);
        let mut optimizer = DecOptimizer::new(&model, self.learning_rate);
        let mut tracker = TargetState {
            target: Array2::zeros((train.len(), model.n_clusters())),
            labels: None,
            updates: 0,
            last_delta: None,
        };
        let mut state = DecState::AwaitingTarget;
        let mut since_update = 0usize;
        let mut epochs_run = 0;

        info!(
            "[{}] Fine-tuning DEC: K={} on {} samples, update every {:?}, tolerance {}",
            run.run_id(),
            model.n_clusters(),
            train.len(),
            self.config.update_interval,
            self.config.tolerance
        );

        'epochs: for epoch in 1..=self.config.epochs {
            epochs_run = epoch;
            let start = Instant::now();
            if self.config.update_interval == UpdateInterval::Epoch {
                state = DecState::AwaitingTarget;
            }

            let mut sum = 0.0f64;
            let mut count = 0usize;
            for batch in train.shuffled(&mut rng)? {
                if state == DecState::AwaitingTarget {
                    state = self.update_target(&model, train, &mut tracker, history, epoch, optimizer.steps())?;
                    since_update = 0;
                    if state == DecState::Converged {
                        break;
                    }
                }

                let batch = batch?;
                let target = tracker.target.select(Axis(0), &batch.positions);
                let loss = optimizer.train_step(&mut model, &batch.data, &target)?;
                if !loss.is_finite() {
                    state = DecState::Failed;
                    error!("[{}] DEC entered {:?} at epoch {}", run.run_id(), state, epoch);
                    return Err(SeisdecError::Divergence {
                        run: run.run_id().to_string(),
                        stage: "dec".to_string(),
                        detail: format!("loss {} at epoch {} step {}", loss, epoch, optimizer.steps() + 1),
                    });
                }
                sum += loss as f64 * batch.len() as f64;
                count += batch.len();

                since_update += 1;
                if let UpdateInterval::Batches(n) = self.config.update_interval {
                    if since_update >= n {
                        state = DecState::AwaitingTarget;
                    }
                }
            }

            if count == 0 {
                break 'epochs;
            }
            let loss = (sum / count as f64) as f32;
            history.dec.push(DecEpoch {
                epoch,
                loss,
                seconds: start.elapsed().as_secs_f64(),
            });
            run.write_json("history.json", history)?;
            debug!("[{}] dec epoch {}/{} loss {:.6}", run.run_id(), epoch, self.config.epochs, loss);
            self.notifier.notify(&TrainingEvent::EpochCompleted {
                run: run.run_id().to_string(),
                stage: "dec".to_string(),
                epoch,
                loss,
            });
            if state == DecState::Converged {
                break;
            }
        }

        let (stop_reason, labels) = if state == DecState::Converged {
            info!(
                "[{}] Converged after {} target updates (delta {:?})",
                run.run_id(),
                tracker.updates,
                tracker.last_delta
            );
            let labels = tracker.labels.take().unwrap_or_default();
            (StopReason::Converged, labels)
        } else {
            info!(
                "[{}] Epoch budget of {} exhausted without convergence, last delta {:?}",
                run.run_id(),
                self.config.epochs,
                tracker.last_delta
            );
            let q = full_soft_assign(&model, train)?;
            (StopReason::EpochBudget, hard_labels(&q))
        };

        history.stop_reason = Some(stop_reason.to_string());
        run.write_json("history.json", history)?;

        Ok(DecOutcome {
            model,
            stop_reason,
            updates: tracker.updates,
            final_delta: tracker.last_delta,
            epochs_run,
            labels,
        })
    }

    /// Recomputes P and the labels, records the delta and returns the next
    /// state.
    fn update_target(
        &self,
        model: &DecModel,
        train: &BatchLoader,
        tracker: &mut TargetState,
        history: &mut History,
        epoch: usize,
        step: u64,
    ) -> Result<DecState> {
        let q = full_soft_assign(model, train)?;
        let frequencies = q.sum_axis(Axis(0));
        tracker.target = ClusteringLayer::target_with_frequencies(&q, &frequencies);
        let labels = hard_labels(&q);

        let delta = tracker.labels.as_ref().map(|prev| assignment_delta(prev, &labels));
        let total = frequencies.sum().max(f32::MIN_POSITIVE);
        let largest = frequencies.fold(0.0f32, |m, &v| m.max(v)) / total;

        history.updates.push(TargetUpdate {
            update: tracker.updates,
            epoch,
            step,
            delta,
            largest_cluster: largest,
        });
        debug!("target update {} at step {}: delta {:?}", tracker.updates, step, delta);

        tracker.updates += 1;
        tracker.labels = Some(labels);
        if delta.is_some() {
            tracker.last_delta = delta;
        }

        Ok(match delta {
            Some(d) if is_converged(d, self.config.tolerance) => DecState::Converged,
            _ => DecState::AccumulatingGradient,
        })
    }

    fn save(&self, run: &RunDirectory, stage: Stage, model: &DecModel, loader: &BatchLoader, epoch: usize) -> Result<()> {
        save_snapshot(
            run.dec_path(stage),
            &Snapshot {
                model: model.clone(),
                transform: loader.transform(),
                shape: loader.shape(),
                epoch,
            },
        )
    }
}

/// A label drift below tolerance, or no drift at all, counts as converged.
pub fn is_converged(delta: f64, tolerance: f64) -> bool {
    delta < tolerance || delta == 0.0
}

/// Soft assignments of every sample of `loader`, in loader order.
pub fn full_soft_assign(model: &DecModel, loader: &BatchLoader) -> Result<Array2<f32>> {
    let mut q = Array2::zeros((loader.len(), model.n_clusters()));
    for batch in loader.iter()? {
        let batch = batch?;
        let rows = model.soft_assign(&batch.data)?;
        for (row, &pos) in rows.rows().into_iter().zip(&batch.positions) {
            q.row_mut(pos).assign(&row);
        }
    }
    Ok(q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CentroidInit, ModelConfig};
    use crate::data::{InMemoryStore, SampleStore, SyntheticConfig, TransformKind};
    use crate::storage::load_snapshot;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tempfile::tempdir;

    /// A loader over latent-like inputs: three tight, well-separated groups.
    fn separated_loader(ctx: &RunContext) -> (BatchLoader, Vec<usize>) {
        let config = SyntheticConfig {
            n_samples: 90,
            n_clusters: 3,
            height: 6,
            width: 6,
            noise: 0.01,
            ..Default::default()
        };
        let data = config.generate().unwrap();
        let labels = data.labels.clone();
        let store: Arc<dyn SampleStore> = Arc::new(data.store);
        (BatchLoader::full(store, 16, TransformKind::Center, ctx.clone()), labels)
    }

    fn autoencoder(input: usize) -> Autoencoder {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        Autoencoder::new(
            input,
            &ModelConfig {
                hidden: vec![16],
                latent_dim: 4,
                alpha: 1.0,
            },
            &mut rng,
        )
        .unwrap()
    }

    #[test]
    fn test_convergence_rule() {
        assert!(is_converged(0.0, 0.0));
        assert!(is_converged(0.0005, 0.001));
        assert!(!is_converged(0.01, 0.001));
    }

    #[test]
    fn test_tiny_learning_rate_converges_on_second_update() {
        let ctx = RunContext::with_seed(2, 2, 2).unwrap();
        let (loader, _) = separated_loader(&ctx);
        let dir = tempdir().unwrap();
        let run = RunDirectory::create(dir.path(), "dec").unwrap();
        let mut history = History::new("dec");

        let config = DecConfig {
            epochs: 10,
            tolerance: 0.001,
            init: CentroidInit::KMeans,
            init_restarts: 3,
            ..Default::default()
        };
        let trainer = DecTrainer::new(config, 3, 1.0, 0.0, ctx);
        let outcome = trainer.train(autoencoder(loader.feature_dim()), &loader, &run, &mut history).unwrap();

        // A zero learning rate leaves every label in place.
        assert_eq!(outcome.stop_reason, StopReason::Converged);
        assert_eq!(outcome.updates, 2);
        assert_eq!(outcome.final_delta, Some(0.0));
        assert_eq!(history.updates[0].delta, None);
        assert_eq!(outcome.labels.len(), 90);
        assert_eq!(history.stop_reason.as_deref(), Some("converged"));

        let initial: Snapshot<DecModel> = load_snapshot(run.dec_path(Stage::Initial)).unwrap();
        let last: Snapshot<DecModel> = load_snapshot(run.dec_path(Stage::Final)).unwrap();
        assert_eq!(initial.model.clustering().centroids().dim(), (3, 4));
        assert_eq!(last.model.clustering().centroids().dim(), (3, 4));
    }

    #[test]
    fn test_epoch_budget_is_not_an_error() {
        let ctx = RunContext::with_seed(3, 1, 1).unwrap();
        let (loader, _) = separated_loader(&ctx);
        let dir = tempdir().unwrap();
        let run = RunDirectory::create(dir.path(), "budget").unwrap();
        let mut history = History::new("budget");

        let config = DecConfig {
            epochs: 1,
            tolerance: 0.0,
            ..Default::default()
        };
        let trainer = DecTrainer::new(config, 3, 1.0, 1e-3, ctx);
        let outcome = trainer.train(autoencoder(loader.feature_dim()), &loader, &run, &mut history).unwrap();
        assert_eq!(outcome.stop_reason, StopReason::EpochBudget);
        assert_eq!(outcome.updates, 1);
        assert_eq!(outcome.final_delta, None);
        assert!(outcome.labels.iter().all(|&l| l < 3));
        assert!(run.dec_path(Stage::Final).exists());
        assert_eq!(history.dec.len(), 1);
    }

    #[test]
    fn test_batch_interval_updates_mid_epoch() {
        let ctx = RunContext::with_seed(4, 1, 1).unwrap();
        let (loader, _) = separated_loader(&ctx);
        let dir = tempdir().unwrap();
        let run = RunDirectory::create(dir.path(), "batches").unwrap();
        let mut history = History::new("batches");

        // 90 samples at 16 per batch is 6 batches per epoch.
        let config = DecConfig {
            epochs: 2,
            tolerance: 0.0,
            update_interval: UpdateInterval::Batches(2),
            ..Default::default()
        };
        let trainer = DecTrainer::new(config, 3, 1.0, 0.05, ctx);
        let model = trainer.initialize(autoencoder(loader.feature_dim()), &loader, &run).unwrap();
        let outcome = trainer.fit(model, &loader, &run, &mut history).unwrap();

        assert!(history.updates.len() >= 2);
        assert!(history.updates.iter().skip(1).all(|u| u.step % 2 == 0 && u.step > 0));
        assert!(history.deltas().iter().all(|d| (0.0..=1.0).contains(d)));
        assert_eq!(outcome.model.clustering().centroids().dim(), (3, 4));
    }

    #[test]
    fn test_mid_epoch_convergence_records_partial_epoch() {
        let ctx = RunContext::with_seed(5, 1, 1).unwrap();
        let (loader, _) = separated_loader(&ctx);
        let dir = tempdir().unwrap();
        let run = RunDirectory::create(dir.path(), "partial").unwrap();
        let mut history = History::new("partial");

        // Zero learning rate: the second update, two batches in, sees no drift.
        let config = DecConfig {
            epochs: 3,
            tolerance: 0.001,
            update_interval: UpdateInterval::Batches(2),
            ..Default::default()
        };
        let trainer = DecTrainer::new(config, 3, 1.0, 0.0, ctx);
        let outcome = trainer.train(autoencoder(loader.feature_dim()), &loader, &run, &mut history).unwrap();

        assert_eq!(outcome.stop_reason, StopReason::Converged);
        assert_eq!(outcome.updates, 2);
        assert_eq!(outcome.epochs_run, 1);
        assert_eq!(history.dec.len(), 1);
        assert_eq!(history.dec[0].epoch, outcome.epochs_run);
        assert!(history.dec[0].loss.is_finite());

        let saved: History = run.read_json("history.json").unwrap();
        assert_eq!(saved.dec.len(), 1);
    }

    #[test]
    fn test_exploding_learning_rate_is_divergence() {
        let ctx = RunContext::with_seed(6, 1, 1).unwrap();
        let (loader, _) = separated_loader(&ctx);
        let dir = tempdir().unwrap();
        let run = RunDirectory::create(dir.path(), "explode").unwrap();
        let mut history = History::new("explode");

        let config = DecConfig {
            epochs: 5,
            tolerance: 0.0,
            ..Default::default()
        };
        let trainer = DecTrainer::new(config, 3, 1.0, 1e38, ctx);
        let err = trainer
            .train(autoencoder(loader.feature_dim()), &loader, &run, &mut history)
            .unwrap_err();

        assert!(err.is_divergence(), "{}", err);
        assert!(matches!(err, SeisdecError::Divergence { ref stage, .. } if stage == "dec"));
        assert!(run.dec_path(Stage::Initial).exists());
        assert!(!run.dec_path(Stage::Final).exists());
    }

    #[test]
    fn test_non_finite_latents_fail_initialisation() {
        let ctx = RunContext::with_seed(7, 1, 1).unwrap();
        let data = SyntheticConfig {
            n_samples: 30,
            height: 6,
            width: 6,
            ..Default::default()
        }
        .generate()
        .unwrap();
        let mut store = InMemoryStore::new((6, 6));
        for (i, (spectrogram, metadata)) in data.store.iter().enumerate() {
            let spectrogram = if i == 3 {
                spectrogram.mapv(|_| f32::NAN)
            } else {
                spectrogram.clone()
            };
            store.push(spectrogram, metadata.clone()).unwrap();
        }
        let store: Arc<dyn SampleStore> = Arc::new(store);
        let loader = BatchLoader::full(store, 8, TransformKind::Center, ctx.clone());
        let dir = tempdir().unwrap();
        let run = RunDirectory::create(dir.path(), "poisoned").unwrap();

        let trainer = DecTrainer::new(DecConfig::default(), 3, 1.0, 1e-3, ctx);
        let err = trainer
            .initialize(autoencoder(loader.feature_dim()), &loader, &run)
            .unwrap_err();
        match err {
            SeisdecError::Divergence { run, stage, .. } => {
                assert_eq!(run, "poisoned");
                assert_eq!(stage, "dec_init");
            }
            other => panic!("unexpected error {}", other),
        }
    }
}
