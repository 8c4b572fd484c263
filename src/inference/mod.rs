//! Inference over the full store and cluster statistics.

pub mod engine;
pub mod stats;

pub use engine::{
    compare_models, CollectSink, Contingency, FanoutSink, InferenceEngine, InferenceSummary, PredictionBatch,
    PredictionSink,
};
pub use stats::{ClusterStatistics, ClusterSummary};

use crate::config::PredictConfig;
use crate::context::RunContext;
use crate::data::SampleStore;
use crate::error::{Result, SeisdecError};
use crate::nn::DecModel;
use crate::storage::{load_snapshot, LatentWriter, ResultsWriter, RunDirectory, Snapshot};
use log::info;
use std::sync::Arc;

/// Loads the configured DEC snapshot and writes the predictions table, the
/// optional latent table and the cluster summary into `run`.
pub fn predict_to_directory(
    config: &PredictConfig,
    store: Arc<dyn SampleStore>,
    run: &RunDirectory,
    context: RunContext,
) -> Result<InferenceSummary> {
    let path = config
        .model
        .as_ref()
        .ok_or_else(|| SeisdecError::Config("predict mode requires predict.model".to_string()))?;
    let snapshot: Snapshot<DecModel> = load_snapshot(path)?;
    if snapshot.shape != store.shape() {
        return Err(SeisdecError::Shape {
            expected: format!("{:?} spectrograms", snapshot.shape),
            actual: format!("{:?} spectrograms", store.shape()),
        });
    }
    let model = snapshot.model;
    info!(
        "[{}] Predicting {} samples with {} (K={}, epoch {})",
        run.run_id(),
        store.len(),
        path.display(),
        model.n_clusters(),
        snapshot.epoch
    );

    let engine = InferenceEngine::new(config.batch_size, context);
    let mut results = ResultsWriter::create(run.predictions_path(), model.n_clusters(), config.soft_assignments)?;
    let mut stats = ClusterStatistics::new(Arc::clone(&store), model.n_clusters());
    let mut latents = if config.latents {
        Some(LatentWriter::create(run.latents_path(), model.latent_dim())?)
    } else {
        None
    };

    let summary = {
        let mut fanout = FanoutSink::default();
        fanout.push(&mut results);
        fanout.push(&mut stats);
        if let Some(latents) = latents.as_mut() {
            fanout.push(latents);
        }
        engine.run(&model, store, snapshot.transform, &mut fanout)?
    };

    let rows = results.finish()?;
    info!("[{}] wrote {} prediction rows", run.run_id(), rows);
    if let Some(latents) = latents {
        latents.finish()?;
    }
    stats.write_csv(run.summary_path())?;
    for cluster in stats.clusters() {
        info!(
            "[{}] cluster {}: {} samples, dominant station {}",
            run.run_id(),
            cluster.label,
            cluster.count,
            cluster.dominant_station().unwrap_or("-")
        );
    }
    Ok(summary)
}
