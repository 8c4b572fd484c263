//! Neural network building blocks.
//!
//! Everything here is plain `ndarray` arithmetic with hand-written backward
//! passes: dense layers, the Adam optimiser, the autoencoder, the
//! Student's-t clustering head and the joint DEC model.

pub mod adam;
pub mod autoencoder;
pub mod clustering;
pub mod dec;
pub mod dense;
pub mod simd;

pub use adam::{Adam, AdamConfig};
pub use autoencoder::{Autoencoder, AutoencoderOptimizer};
pub use clustering::{assignment_delta, hard_labels, ClusterGrads, ClusteringLayer};
pub use dec::{DecModel, DecOptimizer, Prediction};
pub use dense::{Activation, Dense, Stack};
