//! Random-access sample stores.

use crate::error::{Result, SeisdecError};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Catalogue information attached to a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleMetadata {
    /// Station code.
    pub station: String,
    /// Channel code.
    pub channel: String,
    /// Event time as unix seconds.
    pub timestamp: i64,
    /// Peak absolute amplitude of the raw waveform.
    pub peak_amplitude: f64,
    /// Row of the source catalogue this sample was cut from.
    pub catalogue_row: u64,
}

impl SampleMetadata {
    /// Creates metadata for a catalogue row.
    pub fn new(station: impl Into<String>, timestamp: i64, peak_amplitude: f64, catalogue_row: u64) -> Self {
        Self {
            station: station.into(),
            channel: String::new(),
            timestamp,
            peak_amplitude,
            catalogue_row,
        }
    }
}

/// One spectrogram and its metadata.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Position in the store.
    pub index: usize,
    /// Frequency x time spectrogram.
    pub spectrogram: Array2<f32>,
    /// Catalogue information.
    pub metadata: SampleMetadata,
}

/// Read-only, randomly addressable collection of fixed-shape samples.
///
/// Implementations are shared between loader threads, so they must be
/// `Send + Sync` and must not require `&mut self` to read.
pub trait SampleStore: Send + Sync {
    /// Number of samples.
    fn len(&self) -> usize;

    /// Spectrogram shape (frequency bins, time bins).
    fn shape(&self) -> (usize, usize);

    /// Reads the spectrogram at `index`.
    fn spectrogram(&self, index: usize) -> Result<Array2<f32>>;

    /// Reads the metadata at `index`.
    fn metadata(&self, index: usize) -> Result<SampleMetadata>;

    /// Returns true if the store holds no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads a full sample.
    fn get(&self, index: usize) -> Result<Sample> {
        Ok(Sample {
            index,
            spectrogram: self.spectrogram(index)?,
            metadata: self.metadata(index)?,
        })
    }
}

/// Store backed by vectors in memory.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    shape: (usize, usize),
    spectrograms: Vec<Array2<f32>>,
    metadata: Vec<SampleMetadata>,
}

impl InMemoryStore {
    /// Creates an empty store for spectrograms of the given shape.
    pub fn new(shape: (usize, usize)) -> Self {
        Self {
            shape,
            spectrograms: Vec::new(),
            metadata: Vec::new(),
        }
    }

    /// Appends a sample and returns its index.
    pub fn push(&mut self, spectrogram: Array2<f32>, metadata: SampleMetadata) -> Result<usize> {
        if spectrogram.dim() != self.shape {
            return Err(SeisdecError::Shape {
                expected: format!("{:?}", self.shape),
                actual: format!("{:?}", spectrogram.dim()),
            });
        }
        self.spectrograms.push(spectrogram);
        self.metadata.push(metadata);
        Ok(self.spectrograms.len() - 1)
    }

    /// Iterates over spectrograms and metadata in index order.
    pub fn iter(&self) -> impl Iterator<Item = (&Array2<f32>, &SampleMetadata)> {
        self.spectrograms.iter().zip(self.metadata.iter())
    }

    fn check(&self, index: usize) -> Result<()> {
        if index >= self.spectrograms.len() {
            return Err(SeisdecError::IndexOutOfBounds {
                index,
                len: self.spectrograms.len(),
            });
        }
        Ok(())
    }
}

impl SampleStore for InMemoryStore {
    fn len(&self) -> usize {
        self.spectrograms.len()
    }

    fn shape(&self) -> (usize, usize) {
        self.shape
    }

    fn spectrogram(&self, index: usize) -> Result<Array2<f32>> {
        self.check(index)?;
        Ok(self.spectrograms[index].clone())
    }

    fn metadata(&self, index: usize) -> Result<SampleMetadata> {
        self.check(index)?;
        Ok(self.metadata[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_get() {
        let mut store = InMemoryStore::new((2, 3));
        let idx = store
            .push(Array2::from_elem((2, 3), 1.5), SampleMetadata::new("ST01", 100, 2.0, 7))
            .unwrap();
        assert_eq!(idx, 0);
        assert_eq!(store.len(), 1);

        let sample = store.get(0).unwrap();
        assert_eq!(sample.spectrogram[[1, 2]], 1.5);
        assert_eq!(sample.metadata.station, "ST01");
        assert_eq!(sample.metadata.catalogue_row, 7);
    }

    #[test]
    fn test_shape_mismatch() {
        let mut store = InMemoryStore::new((2, 3));
        let result = store.push(Array2::zeros((3, 2)), SampleMetadata::new("ST01", 0, 0.0, 0));
        assert!(matches!(result, Err(SeisdecError::Shape { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn test_out_of_range() {
        let store = InMemoryStore::new((2, 2));
        assert!(matches!(
            store.get(0),
            Err(SeisdecError::IndexOutOfBounds { index: 0, len: 0 })
        ));
    }
}
