//! Prefetching mini-batch loader.
//!
//! A producer thread walks the visitation order, assembles each batch on the
//! run's worker pool (reading and transforming samples in parallel) and hands
//! it to the compute loop through a bounded channel. When the channel is full
//! the producer blocks; when it is empty the consumer blocks.

use crate::context::RunContext;
use crate::data::store::SampleStore;
use crate::data::transform::TransformKind;
use crate::error::{Result, SeisdecError};
use ndarray::Array2;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

/// A transformed mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Positions within the loader's index list.
    pub positions: Vec<usize>,
    /// Store indices of the rows.
    pub indices: Vec<usize>,
    /// One transformed sample per row.
    pub data: Array2<f32>,
}

impl Batch {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Returns true if the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Streams batches of a fixed subset of a store.
#[derive(Clone)]
pub struct BatchLoader {
    store: Arc<dyn SampleStore>,
    indices: Arc<Vec<usize>>,
    batch_size: usize,
    transform: TransformKind,
    context: RunContext,
}

impl BatchLoader {
    /// Creates a loader over `indices` of `store`.
    pub fn new(
        store: Arc<dyn SampleStore>,
        indices: Vec<usize>,
        batch_size: usize,
        transform: TransformKind,
        context: RunContext,
    ) -> Self {
        Self {
            store,
            indices: Arc::new(indices),
            batch_size: batch_size.max(1),
            transform,
            context,
        }
    }

    /// Creates a loader over every sample of `store`, in index order.
    pub fn full(
        store: Arc<dyn SampleStore>,
        batch_size: usize,
        transform: TransformKind,
        context: RunContext,
    ) -> Self {
        let indices = (0..store.len()).collect();
        Self::new(store, indices, batch_size, transform, context)
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Returns true if the loader has no samples.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Store indices in loader order.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches per pass.
    pub fn num_batches(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }

    /// Width of a transformed sample.
    pub fn feature_dim(&self) -> usize {
        TransformKind::output_len(self.store.shape())
    }

    /// Spectrogram shape of the underlying store.
    pub fn shape(&self) -> (usize, usize) {
        self.store.shape()
    }

    /// Transform applied to each sample.
    pub fn transform(&self) -> TransformKind {
        self.transform
    }

    /// Streams all batches in loader order.
    pub fn iter(&self) -> Result<BatchStream> {
        let order: Vec<usize> = (0..self.indices.len()).collect();
        self.stream(order)
    }

    /// Streams all batches in a freshly shuffled order.
    pub fn shuffled<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<BatchStream> {
        let mut order: Vec<usize> = (0..self.indices.len()).collect();
        order.shuffle(rng);
        self.stream(order)
    }

    /// Assembles one batch synchronously from loader positions.
    pub fn load_positions(&self, positions: &[usize]) -> Result<Batch> {
        assemble(
            self.store.as_ref(),
            &self.indices,
            positions,
            self.transform,
            self.feature_dim(),
        )
    }

    fn stream(&self, order: Vec<usize>) -> Result<BatchStream> {
        let (tx, rx) = mpsc::sync_channel(self.context.prefetch());
        let store = Arc::clone(&self.store);
        let indices = Arc::clone(&self.indices);
        let pool = Arc::clone(self.context.pool());
        let batch_size = self.batch_size;
        let transform = self.transform;
        let dim = self.feature_dim();

        let handle = thread::Builder::new()
            .name("seisdec-prefetch".to_string())
            .spawn(move || {
                for chunk in order.chunks(batch_size) {
                    let batch = pool.install(|| assemble(store.as_ref(), &indices, chunk, transform, dim));
                    let failed = batch.is_err();
                    if tx.send(batch).is_err() || failed {
                        return;
                    }
                }
            })?;

        Ok(BatchStream {
            rx: Some(rx),
            handle: Some(handle),
        })
    }
}

fn assemble(
    store: &dyn SampleStore,
    indices: &[usize],
    positions: &[usize],
    transform: TransformKind,
    dim: usize,
) -> Result<Batch> {
    let batch_indices: Vec<usize> = positions
        .iter()
        .map(|&p| {
            indices.get(p).copied().ok_or(SeisdecError::IndexOutOfBounds {
                index: p,
                len: indices.len(),
            })
        })
        .collect::<Result<_>>()?;

    let rows: Vec<Vec<f32>> = batch_indices
        .par_iter()
        .map(|&idx| store.spectrogram(idx).map(|spec| transform.apply(&spec)))
        .collect::<Result<_>>()?;

    let mut flat = Vec::with_capacity(rows.len() * dim);
    for row in &rows {
        if row.len() != dim {
            return Err(SeisdecError::DataAccess(format!(
                "sample has {} values, expected {}",
                row.len(),
                dim
            )));
        }
        flat.extend_from_slice(row);
    }
    let data = Array2::from_shape_vec((rows.len(), dim), flat)
        .map_err(|e| SeisdecError::DataAccess(e.to_string()))?;

    Ok(Batch {
        positions: positions.to_vec(),
        indices: batch_indices,
        data,
    })
}

/// Iterator over prefetched batches.
///
/// A read error is yielded once and ends the stream.
pub struct BatchStream {
    rx: Option<Receiver<Result<Batch>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Iterator for BatchStream {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        // Disconnect first so a producer blocked on a full queue wakes up.
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::{InMemoryStore, SampleMetadata};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn store(n: usize) -> Arc<dyn SampleStore> {
        let mut store = InMemoryStore::new((2, 2));
        for i in 0..n {
            store
                .push(Array2::from_elem((2, 2), i as f32), SampleMetadata::new("ST", i as i64, 0.0, i as u64))
                .unwrap();
        }
        Arc::new(store)
    }

    fn ctx() -> RunContext {
        RunContext::with_seed(1, 2, 2).unwrap()
    }

    #[test]
    fn test_iter_covers_all_in_order() {
        let loader = BatchLoader::full(store(10), 4, TransformKind::Identity, ctx());
        assert_eq!(loader.num_batches(), 3);

        let batches: Vec<Batch> = loader.iter().unwrap().map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 2);

        let seen: Vec<usize> = batches.iter().flat_map(|b| b.indices.clone()).collect();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(batches[1].data[[0, 0]], 4.0);
    }

    #[test]
    fn test_shuffled_is_permutation() {
        let loader = BatchLoader::new(store(20), (5..20).collect(), 4, TransformKind::Identity, ctx());
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut seen: Vec<usize> = loader
            .shuffled(&mut rng)
            .unwrap()
            .flat_map(|b| b.unwrap().indices)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (5..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_positions_map_to_indices() {
        let loader = BatchLoader::new(store(10), vec![9, 3, 7], 2, TransformKind::Identity, ctx());
        let batch = loader.load_positions(&[2, 0]).unwrap();
        assert_eq!(batch.indices, vec![7, 9]);
        assert_eq!(batch.positions, vec![2, 0]);
        assert_eq!(batch.data[[0, 0]], 7.0);
    }

    #[test]
    fn test_read_error_ends_stream() {
        let loader = BatchLoader::new(store(3), vec![0, 1, 50, 2], 2, TransformKind::Identity, ctx());
        let results: Vec<Result<Batch>> = loader.iter().unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(SeisdecError::IndexOutOfBounds { .. })));
    }

    #[test]
    fn test_early_drop_does_not_hang() {
        let loader = BatchLoader::full(store(100), 1, TransformKind::Identity, ctx());
        let mut stream = loader.iter().unwrap();
        assert!(stream.next().is_some());
        drop(stream);
    }
}
