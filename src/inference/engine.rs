//! Streaming inference over a whole store.

use crate::context::RunContext;
use crate::data::{BatchLoader, SampleStore, TransformKind};
use crate::error::{Result, SeisdecError};
use crate::nn::{DecModel, Prediction};
use crate::storage::{LatentWriter, ResultsWriter};
use log::{debug, info};
use ndarray::Array2;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Predictions for one batch, keyed by store index.
#[derive(Debug, Clone, Copy)]
pub struct PredictionBatch<'a> {
    /// Store indices, one per row.
    pub indices: &'a [usize],
    /// Latents, soft assignments and labels.
    pub prediction: &'a Prediction,
}

impl PredictionBatch<'_> {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Returns true if the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Consumer of streamed predictions.
pub trait PredictionSink {
    /// Handles one batch.
    fn consume(&mut self, batch: &PredictionBatch<'_>) -> Result<()>;

    /// Called once after the last batch.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl PredictionSink for ResultsWriter {
    fn consume(&mut self, batch: &PredictionBatch<'_>) -> Result<()> {
        let p = batch.prediction;
        for (row, &index) in batch.indices.iter().enumerate() {
            let q = p.q.row(row);
            match q.as_slice() {
                Some(scores) => self.write_row(index, p.labels[row], scores)?,
                None => self.write_row(index, p.labels[row], &q.to_vec())?,
            }
        }
        Ok(())
    }
}

impl PredictionSink for LatentWriter {
    fn consume(&mut self, batch: &PredictionBatch<'_>) -> Result<()> {
        for (row, &index) in batch.indices.iter().enumerate() {
            let z = batch.prediction.latents.row(row).to_vec();
            self.write_row(index, &z)?;
        }
        Ok(())
    }
}

/// Keeps every prediction in memory.
#[derive(Debug, Clone, Default)]
pub struct CollectSink {
    /// Store indices in arrival order.
    pub indices: Vec<usize>,
    /// Labels.
    pub labels: Vec<usize>,
    /// Soft assignments.
    pub soft: Vec<Vec<f32>>,
    /// Latent vectors.
    pub latents: Vec<Vec<f32>>,
}

impl CollectSink {
    /// Number of collected rows.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Returns true if nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Label of every store index.
    pub fn labels_by_index(&self) -> HashMap<usize, usize> {
        self.indices.iter().copied().zip(self.labels.iter().copied()).collect()
    }
}

impl PredictionSink for CollectSink {
    fn consume(&mut self, batch: &PredictionBatch<'_>) -> Result<()> {
        let p = batch.prediction;
        self.indices.extend_from_slice(batch.indices);
        self.labels.extend_from_slice(&p.labels);
        self.soft.extend(p.q.rows().into_iter().map(|r| r.to_vec()));
        self.latents.extend(p.latents.rows().into_iter().map(|r| r.to_vec()));
        Ok(())
    }
}

/// Forwards every batch to several sinks in order.
#[derive(Default)]
pub struct FanoutSink<'a> {
    sinks: Vec<&'a mut dyn PredictionSink>,
}

impl<'a> FanoutSink<'a> {
    /// Adds a sink.
    pub fn push(&mut self, sink: &'a mut dyn PredictionSink) {
        self.sinks.push(sink);
    }
}

impl PredictionSink for FanoutSink<'_> {
    fn consume(&mut self, batch: &PredictionBatch<'_>) -> Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.consume(batch)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.finish()?;
        }
        Ok(())
    }
}

/// Totals of an inference pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceSummary {
    /// Samples predicted.
    pub samples: usize,
    /// Batches processed.
    pub batches: usize,
}

/// Runs a trained model over a store in fixed-size batches.
#[derive(Debug, Clone)]
pub struct InferenceEngine {
    batch_size: usize,
    context: RunContext,
}

impl InferenceEngine {
    /// Creates an engine.
    pub fn new(batch_size: usize, context: RunContext) -> Self {
        Self {
            batch_size: batch_size.max(1),
            context,
        }
    }

    /// Batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Predicts every sample of `store` in index order and feeds `sink`.
    ///
    /// `transform` must be the one the model was trained with.
    pub fn run(
        &self,
        model: &DecModel,
        store: Arc<dyn SampleStore>,
        transform: TransformKind,
        sink: &mut dyn PredictionSink,
    ) -> Result<InferenceSummary> {
        let (h, w) = store.shape();
        if TransformKind::output_len((h, w)) != model.input_dim() {
            return Err(SeisdecError::Shape {
                expected: format!("{} inputs", model.input_dim()),
                actual: format!("{}x{} spectrograms", h, w),
            });
        }
        if store.is_empty() {
            return Err(SeisdecError::EmptyInput("store holds no samples".to_string()));
        }

        let loader = BatchLoader::full(store, self.batch_size, transform, self.context.clone());
        let start = Instant::now();
        let mut summary = InferenceSummary { samples: 0, batches: 0 };
        for batch in loader.iter()? {
            let batch = batch?;
            let prediction = model.predict(&batch.data)?;
            sink.consume(&PredictionBatch {
                indices: &batch.indices,
                prediction: &prediction,
            })?;
            summary.samples += batch.len();
            summary.batches += 1;
            debug!("predicted batch {} ({} samples)", summary.batches, summary.samples);
        }
        sink.finish()?;

        info!(
            "Predicted {} samples in {} batches ({:.2?})",
            summary.samples,
            summary.batches,
            start.elapsed()
        );
        Ok(summary)
    }
}

/// Label agreement between two models over the same samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Contingency {
    /// `counts[[a, b]]` samples labelled `a` by the first model and `b` by the
    /// second.
    pub counts: Array2<usize>,
}

impl Contingency {
    /// Number of compared samples.
    pub fn total(&self) -> usize {
        self.counts.sum()
    }

    /// Fraction of samples whose first-model cluster maps to their
    /// second-model cluster under the majority mapping.
    pub fn purity(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let matched: usize = self
            .counts
            .rows()
            .into_iter()
            .map(|row| row.iter().copied().max().unwrap_or(0))
            .sum();
        matched as f64 / total as f64
    }
}

/// Runs both models over `store` and cross-tabulates their labels.
pub fn compare_models(
    engine: &InferenceEngine,
    before: &DecModel,
    after: &DecModel,
    store: Arc<dyn SampleStore>,
    transform: TransformKind,
) -> Result<Contingency> {
    let mut first = CollectSink::default();
    engine.run(before, Arc::clone(&store), transform, &mut first)?;
    let mut second = CollectSink::default();
    engine.run(after, store, transform, &mut second)?;

    let second_labels = second.labels_by_index();
    let mut counts = Array2::zeros((before.n_clusters(), after.n_clusters()));
    for (index, &a) in first.indices.iter().zip(&first.labels) {
        if let Some(&b) = second_labels.get(index) {
            counts[[a, b]] += 1;
        }
    }
    Ok(Contingency { counts })
}
