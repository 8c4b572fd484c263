//! # Seisdec - Deep Embedded Clustering for seismic spectrograms
//!
//! Seisdec groups seismic event spectrograms into clusters without labels.
//! An autoencoder first learns to compress each spectrogram into a small
//! latent vector; a Student's-t clustering head is then placed on top of the
//! encoder and both are refined jointly by minimising the KL divergence
//! between the soft assignments and a sharpened target distribution.
//!
//! ## Overview
//!
//! - **Sample store** - memory-mapped spectrograms with catalogue metadata
//! - **Pretraining** - reconstruction training with early stopping and previews
//! - **DEC fine-tuning** - periodic target updates until the labels stop moving
//! - **Sweeps** - one isolated run directory per hyperparameter combination
//! - **Inference** - streaming predictions joined back to the catalogue
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use seisdec::{Mode, RunConfig};
//!
//! let mut config = RunConfig::from_file("train.json")?;
//! config.mode = Mode::Train;
//! let report = seisdec::train::run(&config)?;
//! for run in report.failed() {
//!     eprintln!("{} failed", run.params.id());
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`data`] - sample stores, transforms, splits and prefetching loaders
//! - [`nn`] - dense layers, Adam, the autoencoder and the clustering head
//! - [`cluster`] - k-means, Gaussian mixtures and K-selection metrics
//! - [`train`] - pretraining, the DEC controller and sweeps
//! - [`storage`] - checkpoints, run directories and results tables
//! - [`inference`] - streaming prediction and cluster statistics

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod inference;
pub mod nn;
pub mod storage;
pub mod train;

// Re-export commonly used types
pub use config::{
    CentroidInit, DataConfig, DecConfig, Mode, ModelConfig, NotifyConfig, PredictConfig, PretrainConfig, RunConfig,
    RunParams, RuntimeConfig, SweepConfig, UpdateInterval,
};
pub use context::RunContext;
pub use data::{BatchLoader, DataSplit, InMemoryStore, MmapStore, SampleMetadata, SampleStore, TransformKind};
pub use error::{Result, SeisdecError};
pub use inference::{ClusterStatistics, InferenceEngine, PredictionSink};
pub use nn::{Autoencoder, ClusteringLayer, DecModel};
pub use storage::{RunDirectory, Snapshot, Stage};
pub use train::{AutoencoderTrainer, DecTrainer, StopReason, SweepReport};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default Student's-t degrees of freedom.
pub const DEFAULT_ALPHA: f32 = 1.0;
