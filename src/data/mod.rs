//! Sample access: stores, per-sample transforms, splits and batch loading.
//!
//! - [`store`] - the [`SampleStore`] contract and an in-memory store
//! - [`format`] - the memory-mapped spectrogram file
//! - [`transform`] - reordering and normalisation applied on read
//! - [`split`] - persisted train/validation partition
//! - [`loader`] - prefetching mini-batch streams
//! - [`synthetic`] - labelled synthetic datasets

pub mod format;
pub mod loader;
pub mod split;
pub mod store;
pub mod synthetic;
pub mod transform;

pub use format::{MmapStore, SpectrogramWriter, StoreHeader};
pub use loader::{Batch, BatchLoader, BatchStream};
pub use split::DataSplit;
pub use store::{InMemoryStore, Sample, SampleMetadata, SampleStore};
pub use synthetic::{SyntheticConfig, SyntheticDataset};
pub use transform::TransformKind;
