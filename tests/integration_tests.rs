//! Integration tests for the seisdec clustering pipeline.

use ndarray::{array, Array2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use seisdec::config::{PredictConfig, PretrainConfig};
use seisdec::data::{SpectrogramWriter, SyntheticConfig};
use seisdec::inference::{compare_models, predict_to_directory, InferenceEngine};
use seisdec::storage::{load_snapshot, read_results, save_snapshot};
use seisdec::train::{run_sweep, History, NullNotifier, RunInputs, RunStatus};
use seisdec::{
    Autoencoder, DataSplit, DecModel, MmapStore, Mode, ModelConfig, Result, RunConfig, RunContext, RunDirectory,
    RunParams, SampleMetadata, SampleStore, Snapshot, Stage, TransformKind,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

/// Writes a labelled synthetic store to disk and returns its labels.
fn write_store(path: &Path, n_samples: usize, n_clusters: usize) -> Vec<usize> {
    let config = SyntheticConfig {
        n_samples,
        n_clusters,
        height: 8,
        width: 8,
        noise: 0.02,
        seed: 11,
        ..Default::default()
    };
    let data = config.generate().unwrap();
    let mut writer = SpectrogramWriter::create(path, 8, 8).unwrap();
    writer.append_store(&data.store).unwrap();
    writer.finish().unwrap();
    data.labels
}

fn small_model() -> ModelConfig {
    ModelConfig {
        hidden: vec![32],
        latent_dim: 4,
        alpha: 1.0,
    }
}

fn quick_pretrain() -> PretrainConfig {
    PretrainConfig {
        epochs: 8,
        early_stopping: true,
        patience: 3,
        preview_every: 4,
        preview_samples: 2,
    }
}

/// Store wrapper whose every spectrogram is NaN.
struct PoisonedStore {
    inner: Arc<dyn SampleStore>,
}

impl SampleStore for PoisonedStore {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn shape(&self) -> (usize, usize) {
        self.inner.shape()
    }

    fn spectrogram(&self, index: usize) -> Result<Array2<f32>> {
        Ok(self.inner.spectrogram(index)?.mapv(|_| f32::NAN))
    }

    fn metadata(&self, index: usize) -> Result<SampleMetadata> {
        self.inner.metadata(index)
    }
}

#[test]
fn test_three_clusters_converge_within_twenty_updates() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("synthetic.sspg");
    let truth = write_store(&store_path, 1000, 3);

    let mut config = RunConfig {
        mode: Mode::Train,
        output_dir: dir.path().join("runs"),
        model: small_model(),
        pretrain: quick_pretrain(),
        ..Default::default()
    };
    config.data.store = store_path.clone();
    config.sweep.batch_size = vec![64];
    config.sweep.learning_rate = vec![0.001];
    config.sweep.n_clusters = vec![3];
    config.dec.epochs = 40;
    config.runtime.seed = Some(7);
    config.runtime.workers = 2;

    let report = seisdec::train::run(&config).unwrap();
    assert_eq!(report.runs.len(), 1);
    let record = &report.runs[0];
    assert!(record.is_completed(), "{:?}", record.status);

    let run = RunDirectory::open(&record.directory).unwrap();
    let history: History = run.read_json("history.json").unwrap();
    assert_eq!(history.stop_reason.as_deref(), Some("converged"));
    assert!(!history.updates.is_empty() && history.updates.len() <= 20);
    assert!(history.deltas().iter().all(|d| (0.0..=1.0).contains(d)));
    assert!(!history.pretrain.is_empty());

    for stage in [Stage::Initial, Stage::Final] {
        assert!(run.autoencoder_path(stage).exists());
        assert!(run.dec_path(stage).exists());
    }

    // The clusters found should be the generating ones, up to a permutation.
    let store: Arc<dyn SampleStore> = Arc::new(MmapStore::open(&store_path).unwrap());
    let before: Snapshot<DecModel> = load_snapshot(run.dec_path(Stage::Initial)).unwrap();
    let after: Snapshot<DecModel> = load_snapshot(run.dec_path(Stage::Final)).unwrap();
    let engine = InferenceEngine::new(256, RunContext::with_seed(1, 2, 2).unwrap());
    let drift = compare_models(&engine, &before.model, &after.model, Arc::clone(&store), after.transform).unwrap();
    assert_eq!(drift.total(), 1000);
    assert!(drift.purity() > 0.95);

    let mut sink = seisdec::inference::CollectSink::default();
    engine.run(&after.model, store, after.transform, &mut sink).unwrap();
    let mut agreement = Array2::<usize>::zeros((3, 3));
    for (&index, &label) in sink.indices.iter().zip(&sink.labels) {
        agreement[[truth[index], label]] += 1;
    }
    let matched: usize = agreement
        .rows()
        .into_iter()
        .map(|row| row.iter().copied().max().unwrap())
        .sum();
    assert!(matched as f64 / 1000.0 > 0.95, "{:?}", agreement);
}

#[test]
fn test_sweep_isolates_a_diverging_run() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("synthetic.sspg");
    write_store(&store_path, 200, 3);

    let mut config = RunConfig {
        mode: Mode::Pretrain,
        output_dir: dir.path().join("runs"),
        model: small_model(),
        pretrain: quick_pretrain(),
        ..Default::default()
    };
    config.data.store = store_path.clone();
    config.sweep.batch_size = vec![16, 32];
    config.sweep.learning_rate = vec![0.001, 0.01];
    config.sweep.parallel_runs = 2;
    config.runtime.seed = Some(3);
    config.runtime.workers = 2;

    let runs = config.expand().unwrap();
    assert_eq!(runs.len(), 4);
    let poisoned_id = runs[1].id();

    let store: Arc<dyn SampleStore> = Arc::new(MmapStore::open(&store_path).unwrap());
    let split = DataSplit::generate(store.len(), 0.2, None, 3).unwrap();
    let healthy = RunInputs {
        config: config.clone(),
        store: Arc::clone(&store),
        split: split.clone(),
        notifier: Arc::new(NullNotifier),
    };
    let poisoned = RunInputs {
        store: Arc::new(PoisonedStore { inner: store }),
        ..healthy.clone()
    };

    let context = RunContext::new(&config.runtime).unwrap();
    let report = run_sweep(&config, &runs, &context, Arc::new(NullNotifier), |params, run, ctx| {
        if params.id() == poisoned_id {
            poisoned.execute(params, run, ctx)
        } else {
            healthy.execute(params, run, ctx)
        }
    })
    .unwrap();

    assert_eq!(report.runs.len(), 4);
    assert_eq!(report.completed().count(), 3);
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].params.id(), poisoned_id);
    assert!(matches!(failed[0].status, RunStatus::Failed { diverged: true, .. }));

    let mut dirs = HashSet::new();
    let mut curves = Vec::new();
    for record in report.completed() {
        assert!(dirs.insert(record.directory.clone()));
        let run = RunDirectory::open(&record.directory).unwrap();
        assert!(run.config_path().exists());
        assert!(run.autoencoder_path(Stage::Final).exists());
        let history: History = run.read_json("history.json").unwrap();
        assert_eq!(history.run_id, record.params.id());
        assert!(!history.pretrain.is_empty());
        curves.push(history.pretrain.iter().map(|e| e.train_loss).collect::<Vec<f32>>());
    }
    for i in 0..curves.len() {
        for j in i + 1..curves.len() {
            assert_ne!(curves[i], curves[j]);
        }
    }

    let failed_dir = dir.path().join("runs").join(&poisoned_id);
    assert!(failed_dir.join("config.json").exists());
    assert!(!failed_dir.join("autoencoder_final.ckpt").exists());
    assert!(dir.path().join("runs").join("sweep.json").exists());
}

#[test]
fn test_sweep_isolates_a_run_diverging_in_fine_tuning() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("synthetic.sspg");
    write_store(&store_path, 200, 3);

    let mut rng = ChaCha8Rng::seed_from_u64(13);
    let ae_path = dir.path().join("autoencoder_final.ckpt");
    save_snapshot(
        &ae_path,
        &Snapshot {
            model: Autoencoder::new(64, &small_model(), &mut rng).unwrap(),
            transform: TransformKind::Center,
            shape: (8, 8),
            epoch: 0,
        },
    )
    .unwrap();

    let mut config = RunConfig {
        mode: Mode::Train,
        output_dir: dir.path().join("runs"),
        model: small_model(),
        ..Default::default()
    };
    config.data.store = store_path.clone();
    config.sweep.batch_size = vec![16, 32];
    config.sweep.learning_rate = vec![0.001, 0.01];
    config.sweep.n_clusters = vec![3];
    config.sweep.parallel_runs = 2;
    config.dec.epochs = 3;
    config.dec.pretrained = Some(ae_path);
    config.runtime.seed = Some(4);
    config.runtime.workers = 2;

    let runs = config.expand().unwrap();
    assert_eq!(runs.len(), 4);
    let exploding_id = runs[2].id();

    let store: Arc<dyn SampleStore> = Arc::new(MmapStore::open(&store_path).unwrap());
    let inputs = RunInputs {
        config: config.clone(),
        store: Arc::clone(&store),
        split: DataSplit::generate(store.len(), 0.2, None, 4).unwrap(),
        notifier: Arc::new(NullNotifier),
    };

    let context = RunContext::new(&config.runtime).unwrap();
    let report = run_sweep(&config, &runs, &context, Arc::new(NullNotifier), |params, run, ctx| {
        if params.id() == exploding_id {
            let exploding = RunParams {
                learning_rate: 1e38,
                ..params.clone()
            };
            inputs.execute(&exploding, run, ctx)
        } else {
            inputs.execute(params, run, ctx)
        }
    })
    .unwrap();

    assert_eq!(report.completed().count(), 3);
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].params.id(), exploding_id);
    match &failed[0].status {
        RunStatus::Failed { error, diverged } => {
            assert!(diverged);
            assert!(error.contains("during dec:"), "{}", error);
        }
        other => panic!("unexpected status {:?}", other),
    }

    let failed_run = RunDirectory::open(dir.path().join("runs").join(&exploding_id)).unwrap();
    assert!(failed_run.dec_path(Stage::Initial).exists());
    assert!(!failed_run.dec_path(Stage::Final).exists());
    for record in report.completed() {
        let run = RunDirectory::open(&record.directory).unwrap();
        let snapshot: Snapshot<DecModel> = load_snapshot(run.dec_path(Stage::Final)).unwrap();
        assert!(snapshot.model.is_finite());
    }
}

#[test]
fn test_inference_covers_every_sample_once() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("large.sspg");
    write_store(&store_path, 10_000, 4);
    let store: Arc<dyn SampleStore> = Arc::new(MmapStore::open(&store_path).unwrap());

    let mut rng = ChaCha8Rng::seed_from_u64(21);
    let autoencoder = Autoencoder::new(64, &small_model(), &mut rng).unwrap();
    let centroids = array![
        [0.0, 0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0]
    ];
    let model = DecModel::from_autoencoder(autoencoder, centroids, 1.0).unwrap();
    let model_path = dir.path().join("dec_final.ckpt");
    save_snapshot(
        &model_path,
        &Snapshot {
            model,
            transform: TransformKind::Center,
            shape: (8, 8),
            epoch: 0,
        },
    )
    .unwrap();

    let run = RunDirectory::create(dir.path(), "predict").unwrap();
    let config = PredictConfig {
        model: Some(model_path),
        batch_size: 1024,
        soft_assignments: true,
        latents: true,
    };
    let summary = predict_to_directory(&config, store, &run, RunContext::with_seed(5, 4, 2).unwrap()).unwrap();
    assert_eq!(summary.samples, 10_000);
    assert_eq!(summary.batches, 10);

    let rows = read_results(run.predictions_path()).unwrap();
    assert_eq!(rows.len(), 10_000);
    let unique: HashSet<usize> = rows.iter().map(|r| r.index).collect();
    assert_eq!(unique.len(), 10_000);
    assert!(unique.iter().all(|&i| i < 10_000));
    for row in &rows {
        assert!(row.label < 4);
        assert_eq!(row.scores.len(), 4);
        assert!((row.scores.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    }

    let latents = std::fs::read_to_string(run.latents_path()).unwrap();
    assert_eq!(latents.lines().count(), 10_001);

    let mut summary_csv = csv::Reader::from_path(run.summary_path()).unwrap();
    let total: usize = summary_csv
        .records()
        .map(|r| r.unwrap()[1].parse::<usize>().unwrap())
        .sum();
    assert_eq!(total, 10_000);
}

#[test]
fn test_train_from_pretrained_snapshot() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("synthetic.sspg");
    write_store(&store_path, 300, 3);

    let mut config = RunConfig {
        mode: Mode::Pretrain,
        output_dir: dir.path().join("runs"),
        model: small_model(),
        pretrain: quick_pretrain(),
        ..Default::default()
    };
    config.data.store = store_path;
    config.sweep.batch_size = vec![32];
    config.sweep.learning_rate = vec![0.001];
    config.runtime.seed = Some(9);
    config.runtime.workers = 1;

    let pretrained = seisdec::train::run(&config).unwrap();
    assert!(pretrained.runs[0].is_completed());
    let ae_path = RunDirectory::open(&pretrained.runs[0].directory)
        .unwrap()
        .autoencoder_path(Stage::Final);

    config.mode = Mode::Train;
    config.sweep.n_clusters = vec![2, 3];
    config.dec.epochs = 5;
    config.dec.pretrained = Some(ae_path);
    let report = seisdec::train::run(&config).unwrap();
    assert_eq!(report.runs.len(), 2);
    for record in &report.runs {
        assert!(record.is_completed(), "{:?}", record.status);
        let run = RunDirectory::open(&record.directory).unwrap();
        // Fine-tuning from a snapshot skips pretraining.
        assert!(!run.autoencoder_path(Stage::Initial).exists());
        let snapshot: Snapshot<DecModel> = load_snapshot(run.dec_path(Stage::Final)).unwrap();
        assert_eq!(Some(snapshot.model.n_clusters()), record.params.n_clusters);
    }
}

#[test]
fn test_invalid_configuration_fails_before_any_run() {
    let dir = tempdir().unwrap();
    let mut config = RunConfig {
        mode: Mode::Train,
        output_dir: dir.path().join("runs"),
        ..Default::default()
    };
    config.sweep.n_clusters = vec![];
    config.data.store = dir.path().join("missing.sspg");
    let err = seisdec::train::run(&config).unwrap_err();
    assert!(matches!(err, seisdec::SeisdecError::Config(_)));
    assert!(!dir.path().join("runs").exists());
}
