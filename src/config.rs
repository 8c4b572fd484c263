//! Configuration for the seisdec pipeline.
//!
//! A [`RunConfig`] is the whole declarative surface of one invocation. Every
//! swept hyperparameter is a list; [`RunConfig::expand`] validates the config
//! and turns the lists into one [`RunParams`] per combination before any
//! compute starts.

use crate::data::TransformKind;
use crate::error::{Result, SeisdecError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// What a run does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Train the autoencoder on reconstruction error.
    Pretrain,
    /// Initialise centroids and fine-tune the joint DEC model.
    Train,
    /// Label the full store with a trained model.
    Predict,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Pretrain => write!(f, "pretrain"),
            Mode::Train => write!(f, "train"),
            Mode::Predict => write!(f, "predict"),
        }
    }
}

/// How often the target distribution is recomputed during fine-tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateInterval {
    /// Once at the start of every epoch.
    Epoch,
    /// Every `n` mini-batches, independent of epoch boundaries.
    Batches(usize),
}

impl Default for UpdateInterval {
    fn default() -> Self {
        UpdateInterval::Epoch
    }
}

/// Clustering heuristic used to seed the centroid set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CentroidInit {
    /// k-means++ followed by Lloyd iterations.
    #[serde(rename = "kmeans")]
    KMeans,
    /// Diagonal Gaussian mixture fitted with EM.
    #[serde(rename = "gmm")]
    Gmm,
}

impl Default for CentroidInit {
    fn default() -> Self {
        CentroidInit::KMeans
    }
}

/// Autoencoder architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Hidden layer widths of the encoder, input side first.
    /// The decoder mirrors them.
    /// Default: [256, 64].
    pub hidden: Vec<usize>,

    /// Latent dimension D.
    /// Default: 10.
    pub latent_dim: usize,

    /// Student's-t degrees of freedom.
    /// Default: 1.0.
    pub alpha: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden: vec![256, 64],
            latent_dim: 10,
            alpha: 1.0,
        }
    }
}

/// Dataset access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Spectrogram store file.
    pub store: PathBuf,

    /// Where the train/validation split is persisted.
    /// Default: `<output_dir>/split.json`.
    pub split_path: Option<PathBuf>,

    /// Fraction of the sampled indices held out for validation.
    /// Default: 0.2.
    pub validation_fraction: f64,

    /// Maximum number of samples drawn from the store for training.
    /// Default: None (whole store).
    pub sample_budget: Option<usize>,

    /// Per-sample transform applied on read.
    /// Default: center.
    pub transform: TransformKind,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            store: PathBuf::from("spectrograms.sspg"),
            split_path: None,
            validation_fraction: 0.2,
            sample_budget: None,
            transform: TransformKind::Center,
        }
    }
}

/// Autoencoder pretraining.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PretrainConfig {
    /// Epoch budget.
    /// Default: 100.
    pub epochs: usize,

    /// Stop when validation loss stalls.
    /// Default: true.
    pub early_stopping: bool,

    /// Epochs without validation improvement before stopping.
    /// Default: 10.
    pub patience: usize,

    /// Write reconstruction previews every this many epochs (0 disables).
    /// Default: 10.
    pub preview_every: usize,

    /// Number of validation samples shown in each preview.
    /// Default: 4.
    pub preview_samples: usize,
}

impl Default for PretrainConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            early_stopping: true,
            patience: 10,
            preview_every: 10,
            preview_samples: 4,
        }
    }
}

/// Joint DEC fine-tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecConfig {
    /// Epoch budget.
    /// Default: 50.
    pub epochs: usize,

    /// Target distribution refresh interval.
    /// Default: every epoch.
    pub update_interval: UpdateInterval,

    /// Stop when the fraction of changed labels drops below this.
    /// Default: 0.001.
    pub tolerance: f64,

    /// Centroid initialisation strategy.
    /// Default: kmeans.
    pub init: CentroidInit,

    /// Number of k-means/EM restarts.
    /// Default: 10.
    pub init_restarts: usize,

    /// Pretrained autoencoder snapshot to start from. When unset, each
    /// train run pretrains its own autoencoder first.
    pub pretrained: Option<PathBuf>,
}

impl Default for DecConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            update_interval: UpdateInterval::Epoch,
            tolerance: 0.001,
            init: CentroidInit::KMeans,
            init_restarts: 10,
            pretrained: None,
        }
    }
}

/// Inference over the whole store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictConfig {
    /// Trained DEC snapshot.
    pub model: Option<PathBuf>,

    /// Inference batch size.
    /// Default: 1024.
    pub batch_size: usize,

    /// Add per-cluster soft-assignment columns to the results table.
    /// Default: true.
    pub soft_assignments: bool,

    /// Also write latent vectors to `latents.csv`.
    /// Default: false.
    pub latents: bool,
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            model: None,
            batch_size: 1024,
            soft_assignments: true,
            latents: false,
        }
    }
}

/// Hyperparameters that may be swept. One run is launched per combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Mini-batch sizes.
    /// Default: [256].
    pub batch_size: Vec<usize>,

    /// Adam learning rates.
    /// Default: [0.001].
    pub learning_rate: Vec<f32>,

    /// Cluster counts K (ignored by pretraining).
    /// Default: [8].
    pub n_clusters: Vec<usize>,

    /// How many runs may execute at the same time.
    /// Default: 1.
    pub parallel_runs: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            batch_size: vec![256],
            learning_rate: vec![0.001],
            n_clusters: vec![8],
            parallel_runs: 1,
        }
    }
}

/// Process resources handed to each run through [`crate::RunContext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Data loading worker threads.
    /// Default: 4.
    pub workers: usize,

    /// Bounded queue depth between loader and compute loop.
    /// Default: 4.
    pub prefetch: usize,

    /// Random seed for reproducibility.
    /// Default: None (random).
    pub seed: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            prefetch: 4,
            seed: None,
        }
    }
}

/// Best-effort completion notifications.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Append one line per event to this file.
    pub file: Option<PathBuf>,

    /// Also log every event.
    pub log: bool,
}

/// Complete configuration of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Mode of operation.
    pub mode: Mode,

    /// Root directory for run directories and outputs.
    pub output_dir: PathBuf,

    /// Dataset access.
    pub data: DataConfig,

    /// Model architecture.
    pub model: ModelConfig,

    /// Pretraining options.
    pub pretrain: PretrainConfig,

    /// Fine-tuning options.
    pub dec: DecConfig,

    /// Inference options.
    pub predict: PredictConfig,

    /// Swept hyperparameters.
    pub sweep: SweepConfig,

    /// Process resources.
    pub runtime: RuntimeConfig,

    /// Notifications.
    pub notify: NotifyConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Pretrain,
            output_dir: PathBuf::from("runs"),
            data: DataConfig::default(),
            model: ModelConfig::default(),
            pretrain: PretrainConfig::default(),
            dec: DecConfig::default(),
            predict: PredictConfig::default(),
            sweep: SweepConfig::default(),
            runtime: RuntimeConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

/// One concrete combination of swept hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    /// Mode this run executes.
    pub mode: Mode,
    /// Mini-batch size.
    pub batch_size: usize,
    /// Learning rate.
    pub learning_rate: f32,
    /// Number of clusters (None for pretraining).
    pub n_clusters: Option<usize>,
}

impl RunParams {
    /// Stable identifier, also used as the run directory name.
    pub fn id(&self) -> String {
        match self.n_clusters {
            Some(k) => format!("bs{}_lr{}_k{}", self.batch_size, self.learning_rate, k),
            None => format!("bs{}_lr{}", self.batch_size, self.learning_rate),
        }
    }
}

impl RunConfig {
    /// Loads a configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SeisdecError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Writes the configuration as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Path of the persisted train/validation split.
    pub fn split_path(&self) -> PathBuf {
        self.data
            .split_path
            .clone()
            .unwrap_or_else(|| self.output_dir.join("split.json"))
    }

    /// Checks every option the selected mode depends on.
    pub fn validate(&self) -> Result<()> {
        let cfg = |msg: String| Err(SeisdecError::Config(msg));

        if self.runtime.workers == 0 {
            return cfg("runtime.workers must be at least 1".to_string());
        }
        if self.runtime.prefetch == 0 {
            return cfg("runtime.prefetch must be at least 1".to_string());
        }
        if self.model.latent_dim == 0 {
            return cfg("model.latent_dim must be at least 1".to_string());
        }
        if self.model.hidden.iter().any(|&h| h == 0) {
            return cfg(format!("model.hidden contains a zero width: {:?}", self.model.hidden));
        }
        if !(self.model.alpha.is_finite() && self.model.alpha > 0.0) {
            return cfg(format!("model.alpha must be positive, got {}", self.model.alpha));
        }

        match self.mode {
            Mode::Pretrain | Mode::Train => self.validate_training()?,
            Mode::Predict => {
                if self.predict.model.is_none() {
                    return cfg("predict mode requires predict.model".to_string());
                }
                if self.predict.batch_size == 0 {
                    return cfg("predict.batch_size must be at least 1".to_string());
                }
            }
        }

        Ok(())
    }

    fn validate_training(&self) -> Result<()> {
        let cfg = |msg: String| Err(SeisdecError::Config(msg));
        let sweep = &self.sweep;

        if sweep.batch_size.is_empty() || sweep.learning_rate.is_empty() {
            return cfg("sweep.batch_size and sweep.learning_rate must not be empty".to_string());
        }
        if let Some(bs) = sweep.batch_size.iter().find(|&&bs| bs == 0) {
            return cfg(format!("invalid batch size {}", bs));
        }
        if let Some(lr) = sweep
            .learning_rate
            .iter()
            .find(|lr| !(lr.is_finite() && **lr > 0.0))
        {
            return cfg(format!("invalid learning rate {}", lr));
        }
        if sweep.parallel_runs == 0 {
            return cfg("sweep.parallel_runs must be at least 1".to_string());
        }
        if !(0.0..1.0).contains(&self.data.validation_fraction) {
            return cfg(format!(
                "data.validation_fraction must be in [0, 1), got {}",
                self.data.validation_fraction
            ));
        }
        if self.data.sample_budget == Some(0) {
            return cfg("data.sample_budget must be at least 1".to_string());
        }

        let pretrains = self.mode == Mode::Pretrain || self.dec.pretrained.is_none();
        if pretrains {
            let p = &self.pretrain;
            if p.epochs == 0 {
                return cfg("pretrain.epochs must be at least 1".to_string());
            }
            if p.early_stopping && p.patience == 0 {
                return cfg("pretrain.patience must be at least 1".to_string());
            }
            if p.early_stopping && self.data.validation_fraction == 0.0 {
                return cfg("early stopping needs a validation split".to_string());
            }
        }

        match self.mode {
            Mode::Pretrain | Mode::Predict => {}
            Mode::Train => {
                let d = &self.dec;
                if sweep.n_clusters.is_empty() {
                    return cfg("sweep.n_clusters must not be empty".to_string());
                }
                if sweep.n_clusters.iter().any(|&k| k == 0) {
                    return cfg("sweep.n_clusters must be at least 1".to_string());
                }
                if d.epochs == 0 {
                    return cfg("dec.epochs must be at least 1".to_string());
                }
                if d.update_interval == UpdateInterval::Batches(0) {
                    return cfg("dec.update_interval must be at least one batch".to_string());
                }
                if !(0.0..=1.0).contains(&d.tolerance) {
                    return cfg(format!("dec.tolerance must be in [0, 1], got {}", d.tolerance));
                }
                if d.init_restarts == 0 {
                    return cfg("dec.init_restarts must be at least 1".to_string());
                }
            }
        }

        Ok(())
    }

    /// Validates the configuration and expands the sweep into concrete runs.
    ///
    /// Pretraining ignores `n_clusters`, so duplicate combinations collapse.
    /// Predict mode yields a single run at the inference batch size.
    pub fn expand(&self) -> Result<Vec<RunParams>> {
        self.validate()?;

        if self.mode == Mode::Predict {
            return Ok(vec![RunParams {
                mode: Mode::Predict,
                batch_size: self.predict.batch_size,
                learning_rate: 0.0,
                n_clusters: None,
            }]);
        }

        let clusters: Vec<Option<usize>> = match self.mode {
            Mode::Train => self.sweep.n_clusters.iter().map(|&k| Some(k)).collect(),
            _ => vec![None],
        };

        let mut seen = HashSet::new();
        let mut runs = Vec::new();
        for &batch_size in &self.sweep.batch_size {
            for &learning_rate in &self.sweep.learning_rate {
                for &n_clusters in &clusters {
                    let params = RunParams {
                        mode: self.mode,
                        batch_size,
                        learning_rate,
                        n_clusters,
                    };
                    if seen.insert(params.id()) {
                        runs.push(params);
                    }
                }
            }
        }

        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn train_config() -> RunConfig {
        RunConfig {
            mode: Mode::Train,
            dec: DecConfig {
                pretrained: Some(PathBuf::from("ae.ckpt")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.mode, Mode::Pretrain);
        assert_eq!(config.model.latent_dim, 10);
        assert_eq!(config.dec.update_interval, UpdateInterval::Epoch);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_expand_cartesian_product() {
        let mut config = train_config();
        config.sweep.batch_size = vec![32, 64];
        config.sweep.learning_rate = vec![0.001, 0.01];
        config.sweep.n_clusters = vec![3, 5, 7];

        let runs = config.expand().unwrap();
        assert_eq!(runs.len(), 12);
        let ids: HashSet<String> = runs.iter().map(|r| r.id()).collect();
        assert_eq!(ids.len(), 12);
        assert!(ids.contains("bs64_lr0.01_k5"));
    }

    #[test]
    fn test_pretrain_ignores_clusters() {
        let mut config = RunConfig::default();
        config.sweep.batch_size = vec![32, 64];
        config.sweep.learning_rate = vec![0.001];
        config.sweep.n_clusters = vec![3, 5];

        let runs = config.expand().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.n_clusters.is_none()));
        assert_eq!(runs[0].id(), "bs32_lr0.001");
    }

    #[test]
    fn test_invalid_learning_rate_rejected() {
        let mut config = RunConfig::default();
        config.sweep.learning_rate = vec![0.001, -1.0];
        assert!(matches!(config.expand(), Err(SeisdecError::Config(_))));
    }

    #[test]
    fn test_train_without_pretrained_checks_pretraining() {
        let mut config = train_config();
        config.dec.pretrained = None;
        assert!(config.validate().is_ok());
        config.pretrain.epochs = 0;
        assert!(matches!(config.validate(), Err(SeisdecError::Config(_))));

        config.dec.pretrained = Some(PathBuf::from("ae.ckpt"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_interval_rejected() {
        let mut config = train_config();
        config.dec.update_interval = UpdateInterval::Batches(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_predict_single_run() {
        let config = RunConfig {
            mode: Mode::Predict,
            predict: PredictConfig {
                model: Some(PathBuf::from("dec.ckpt")),
                batch_size: 512,
                ..Default::default()
            },
            ..Default::default()
        };
        let runs = config.expand().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].batch_size, 512);
    }

    #[test]
    fn test_update_interval_json() {
        let epoch: UpdateInterval = serde_json::from_str("\"epoch\"").unwrap();
        assert_eq!(epoch, UpdateInterval::Epoch);
        let batches: UpdateInterval = serde_json::from_str("{\"batches\": 40}").unwrap();
        assert_eq!(batches, UpdateInterval::Batches(40));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "mode": "train",
            "dec": { "pretrained": "ae.ckpt", "init": "gmm" },
            "sweep": { "n_clusters": [4] }
        }"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.mode, Mode::Train);
        assert_eq!(config.dec.init, CentroidInit::Gmm);
        assert_eq!(config.dec.epochs, 50);
        assert_eq!(config.sweep.batch_size, vec![256]);
        assert!(config.validate().is_ok());
    }
}
