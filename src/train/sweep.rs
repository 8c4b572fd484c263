//! Hyperparameter sweeps.
//!
//! Every [`RunParams`] combination gets its own [`RunDirectory`], its own
//! model and optimizer, and a context whose seed is derived from the run's
//! position in the sweep. Runs share the sample store read-only and nothing
//! else. A failing run is recorded and never stops its siblings.

use crate::config::{Mode, RunConfig, RunParams};
use crate::context::RunContext;
use crate::data::{BatchLoader, DataSplit, MmapStore, SampleStore};
use crate::error::{Result, SeisdecError};
use crate::inference::predict_to_directory;
use crate::nn::Autoencoder;
use crate::storage::{load_snapshot, RunDirectory, Snapshot};
use crate::train::dec::DecTrainer;
use crate::train::history::History;
use crate::train::notify::{self, Notifier, TrainingEvent};
use crate::train::pretrain::AutoencoderTrainer;
use log::{error, info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// The run reached a normal terminal state.
    Completed {
        /// Short description of the result.
        summary: String,
    },
    /// The run was aborted.
    Failed {
        /// The error that aborted it.
        error: String,
        /// Whether the loss became non-finite.
        diverged: bool,
    },
}

/// One run of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    /// Run hyperparameters.
    pub params: RunParams,
    /// Run directory.
    pub directory: PathBuf,
    /// Wall-clock seconds.
    pub seconds: f64,
    /// Outcome.
    #[serde(flatten)]
    pub status: RunStatus,
}

impl RunRecord {
    /// Returns true if the run completed.
    pub fn is_completed(&self) -> bool {
        matches!(self.status, RunStatus::Completed { .. })
    }
}

/// Records of every run, in sweep order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// Per-run records.
    pub runs: Vec<RunRecord>,
}

impl SweepReport {
    /// Completed runs.
    pub fn completed(&self) -> impl Iterator<Item = &RunRecord> {
        self.runs.iter().filter(|r| r.is_completed())
    }

    /// Failed runs.
    pub fn failed(&self) -> impl Iterator<Item = &RunRecord> {
        self.runs.iter().filter(|r| !r.is_completed())
    }

    /// Writes the report as pretty JSON.
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Configuration of one run as written to its `config.json`.
#[derive(Serialize)]
struct RunManifest<'a> {
    params: &'a RunParams,
    seed: u64,
    config: &'a RunConfig,
}

/// Executes `runs` under `output_dir`, at most `parallel_runs` at a time.
///
/// `run_fn` does the work of a single run. Its error marks that run as failed
/// and is otherwise contained.
pub fn run_sweep<F>(
    config: &RunConfig,
    runs: &[RunParams],
    context: &RunContext,
    notifier: Arc<dyn Notifier>,
    run_fn: F,
) -> Result<SweepReport>
where
    F: Fn(&RunParams, &RunDirectory, &RunContext) -> Result<String> + Sync,
{
    std::fs::create_dir_all(&config.output_dir)?;
    let execute = |(i, params): (usize, &RunParams)| {
        execute_one(config, params, &context.derive(i as u64), notifier.as_ref(), &run_fn)
    };

    let parallel = config.sweep.parallel_runs.max(1).min(runs.len().max(1));
    let records: Vec<RunRecord> = if parallel > 1 {
        info!("Running {} runs, {} at a time", runs.len(), parallel);
        let pool = ThreadPoolBuilder::new()
            .num_threads(parallel)
            .thread_name(|i| format!("seisdec-run-{}", i))
            .build()?;
        pool.install(|| runs.par_iter().enumerate().map(execute).collect())
    } else {
        info!("Running {} runs sequentially", runs.len());
        runs.iter().enumerate().map(execute).collect()
    };

    let report = SweepReport { runs: records };
    report.save(config.output_dir.join("sweep.json"))?;
    let failed = report.failed().count();
    if failed > 0 {
        warn!("{} of {} runs failed", failed, report.runs.len());
    } else {
        info!("All {} runs completed", report.runs.len());
    }
    Ok(report)
}

fn execute_one<F>(
    config: &RunConfig,
    params: &RunParams,
    context: &RunContext,
    notifier: &dyn Notifier,
    run_fn: &F,
) -> RunRecord
where
    F: Fn(&RunParams, &RunDirectory, &RunContext) -> Result<String>,
{
    let id = params.id();
    let start = Instant::now();
    notifier.notify(&TrainingEvent::RunStarted { run: id.clone() });

    let result = RunDirectory::create(&config.output_dir, &id).and_then(|run| {
        run.write_json(
            "config.json",
            &RunManifest {
                params,
                seed: context.seed(),
                config,
            },
        )?;
        run_fn(params, &run, context)
    });

    let status = match result {
        Ok(summary) => {
            info!("[{}] completed: {}", id, summary);
            notifier.notify(&TrainingEvent::RunFinished {
                run: id.clone(),
                summary: summary.clone(),
            });
            RunStatus::Completed { summary }
        }
        Err(e) => {
            error!("[{}] failed: {}", id, e);
            notifier.notify(&TrainingEvent::RunFailed {
                run: id.clone(),
                error: e.to_string(),
            });
            RunStatus::Failed {
                diverged: e.is_divergence(),
                error: e.to_string(),
            }
        }
    };

    RunRecord {
        params: params.clone(),
        directory: config.output_dir.join(&id),
        seconds: start.elapsed().as_secs_f64(),
        status,
    }
}

/// Everything a single run reads besides its parameters.
#[derive(Clone)]
pub struct RunInputs {
    /// Full configuration.
    pub config: RunConfig,
    /// Shared sample store.
    pub store: Arc<dyn SampleStore>,
    /// Shared train/validation split.
    pub split: DataSplit,
    /// Progress notifier.
    pub notifier: Arc<dyn Notifier>,
}

impl RunInputs {
    /// Executes one run according to its mode and returns a short summary.
    pub fn execute(&self, params: &RunParams, run: &RunDirectory, context: &RunContext) -> Result<String> {
        match params.mode {
            Mode::Pretrain => {
                let mut history = History::new(run.run_id());
                let (train, validation) = self.loaders(params, context);
                let outcome = self
                    .pretrainer(params, context)
                    .train(&train, validation.as_ref(), run, &mut history)?;
                Ok(format!(
                    "best epoch {} of {}, loss {:.6}{}",
                    outcome.best_epoch,
                    outcome.epochs_run,
                    outcome.best_loss,
                    if outcome.stopped_early { ", stopped early" } else { "" }
                ))
            }
            Mode::Train => {
                let k = params
                    .n_clusters
                    .ok_or_else(|| SeisdecError::Config("train runs need n_clusters".to_string()))?;
                let mut history = History::new(run.run_id());
                let (train, validation) = self.loaders(params, context);

                let autoencoder = match &self.config.dec.pretrained {
                    Some(path) => {
                        let snapshot: Snapshot<Autoencoder> = load_snapshot(path)?;
                        if snapshot.model.input_dim() != train.feature_dim() {
                            return Err(SeisdecError::Shape {
                                expected: format!("{} inputs", train.feature_dim()),
                                actual: format!("{} inputs in {}", snapshot.model.input_dim(), path.display()),
                            });
                        }
                        info!("[{}] Fine-tuning from {}", run.run_id(), path.display());
                        snapshot.model
                    }
                    None => {
                        self.pretrainer(params, context)
                            .train(&train, validation.as_ref(), run, &mut history)?
                            .model
                    }
                };

                let outcome = DecTrainer::new(
                    self.config.dec.clone(),
                    k,
                    self.config.model.alpha,
                    params.learning_rate,
                    context.clone(),
                )
                .with_notifier(Arc::clone(&self.notifier))
                .train(autoencoder, &train, run, &mut history)?;

                Ok(format!(
                    "{} after {} epochs, {} target updates, final delta {}",
                    outcome.stop_reason,
                    outcome.epochs_run,
                    outcome.updates,
                    outcome.final_delta.map_or("n/a".to_string(), |d| format!("{:.6}", d))
                ))
            }
            Mode::Predict => {
                let summary = predict_to_directory(&self.config.predict, Arc::clone(&self.store), run, context.clone())?;
                Ok(format!("{} samples in {} batches", summary.samples, summary.batches))
            }
        }
    }

    fn loaders(&self, params: &RunParams, context: &RunContext) -> (BatchLoader, Option<BatchLoader>) {
        let transform = self.config.data.transform;
        let train = BatchLoader::new(
            Arc::clone(&self.store),
            self.split.train.clone(),
            params.batch_size,
            transform,
            context.clone(),
        );
        let validation = (!self.split.validation.is_empty()).then(|| {
            BatchLoader::new(
                Arc::clone(&self.store),
                self.split.validation.clone(),
                params.batch_size,
                transform,
                context.clone(),
            )
        });
        (train, validation)
    }

    fn pretrainer(&self, params: &RunParams, context: &RunContext) -> AutoencoderTrainer {
        AutoencoderTrainer::new(
            self.config.pretrain.clone(),
            self.config.model.clone(),
            params.learning_rate,
            context.clone(),
        )
        .with_notifier(Arc::clone(&self.notifier))
    }
}

/// Validates `config`, opens the store, prepares the shared split and runs
/// the whole sweep.
///
/// Configuration problems surface here before any run starts.
pub fn run(config: &RunConfig) -> Result<SweepReport> {
    let runs = config.expand()?;
    let context = RunContext::new(&config.runtime)?;
    let store: Arc<dyn SampleStore> = Arc::new(MmapStore::open(&config.data.store)?);
    run_with_store(config, runs, store, context)
}

/// Like [`run`] but over an already opened store.
pub fn run_with_store(
    config: &RunConfig,
    runs: Vec<RunParams>,
    store: Arc<dyn SampleStore>,
    context: RunContext,
) -> Result<SweepReport> {
    std::fs::create_dir_all(&config.output_dir)?;
    let split = match config.mode {
        Mode::Predict => DataSplit::generate(store.len(), 0.0, None, context.seed())?,
        Mode::Pretrain | Mode::Train => DataSplit::load_or_generate(
            config.split_path(),
            store.len(),
            config.data.validation_fraction,
            config.data.sample_budget,
            context.seed(),
        )?,
    };
    info!(
        "{} mode over {} samples ({} train / {} validation), {} runs",
        config.mode,
        store.len(),
        split.train.len(),
        split.validation.len(),
        runs.len()
    );

    let notifier = notify::from_config(&config.notify);
    let inputs = RunInputs {
        config: config.clone(),
        store,
        split,
        notifier: Arc::clone(&notifier),
    };
    run_sweep(config, &runs, &context, notifier, |params, run, ctx| {
        inputs.execute(params, run, ctx)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn params(bs: usize) -> RunParams {
        RunParams {
            mode: Mode::Pretrain,
            batch_size: bs,
            learning_rate: 0.01,
            n_clusters: None,
        }
    }

    #[test]
    fn test_failure_is_contained() {
        let dir = tempdir().unwrap();
        let config = RunConfig {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let ctx = RunContext::with_seed(1, 1, 1).unwrap();
        let calls = AtomicUsize::new(0);
        let runs = vec![params(8), params(16), params(32)];

        let report = run_sweep(&config, &runs, &ctx, Arc::new(notify::NullNotifier), |p, run, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            assert!(run.config_path().exists());
            if p.batch_size == 16 {
                Err(SeisdecError::Divergence {
                    run: run.run_id().to_string(),
                    stage: "pretrain".to_string(),
                    detail: "loss NaN".to_string(),
                })
            } else {
                Ok("fine".to_string())
            }
        })
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.completed().count(), 2);
        let failed: Vec<_> = report.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].params.batch_size, 16);
        assert!(matches!(failed[0].status, RunStatus::Failed { diverged: true, .. }));
        assert!(dir.path().join("sweep.json").exists());
    }

    #[test]
    fn test_parallel_runs_get_distinct_seeds() {
        let dir = tempdir().unwrap();
        let mut config = RunConfig {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.sweep.parallel_runs = 2;
        let ctx = RunContext::with_seed(9, 1, 1).unwrap();
        let runs = vec![params(8), params(16), params(32), params(64)];

        let report = run_sweep(&config, &runs, &ctx, Arc::new(notify::NullNotifier), |_, _, c| {
            Ok(c.seed().to_string())
        })
        .unwrap();

        assert_eq!(report.runs.len(), 4);
        let mut seeds: Vec<String> = report
            .runs
            .iter()
            .map(|r| match &r.status {
                RunStatus::Completed { summary } => summary.clone(),
                RunStatus::Failed { error, .. } => panic!("unexpected failure: {}", error),
            })
            .collect();
        seeds.sort();
        seeds.dedup();
        assert_eq!(seeds.len(), 4);
        for record in &report.runs {
            assert!(record.directory.join("config.json").exists());
        }
    }
}
