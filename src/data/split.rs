//! Persisted train/validation split.
//!
//! The split is drawn once per dataset and sample budget and then reused by
//! every run, so that pretraining, fine-tuning and sweep siblings all see the
//! same partition.

use crate::error::{Result, SeisdecError};
use log::info;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Disjoint train and validation index sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSplit {
    /// Store length the split was drawn from.
    pub dataset_len: usize,
    /// Requested sample budget.
    pub sample_budget: Option<usize>,
    /// Seed used for the draw.
    pub seed: u64,
    /// Training indices, ascending.
    pub train: Vec<usize>,
    /// Validation indices, ascending.
    pub validation: Vec<usize>,
}

impl DataSplit {
    /// Draws a split.
    ///
    /// At most `sample_budget` indices are sampled from `0..dataset_len`, and
    /// `validation_fraction` of them go to validation. A non-zero fraction
    /// always yields at least one validation sample, and at least one sample
    /// always remains for training.
    pub fn generate(
        dataset_len: usize,
        validation_fraction: f64,
        sample_budget: Option<usize>,
        seed: u64,
    ) -> Result<Self> {
        if dataset_len == 0 {
            return Err(SeisdecError::EmptyInput("cannot split an empty store".to_string()));
        }
        if !(0.0..1.0).contains(&validation_fraction) {
            return Err(SeisdecError::Config(format!(
                "validation fraction must be in [0, 1), got {}",
                validation_fraction
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut indices: Vec<usize> = (0..dataset_len).collect();
        indices.shuffle(&mut rng);
        let n = sample_budget.map_or(dataset_len, |b| b.min(dataset_len));
        indices.truncate(n);

        let mut n_val = (n as f64 * validation_fraction).round() as usize;
        if validation_fraction > 0.0 && n_val == 0 && n > 1 {
            n_val = 1;
        }
        n_val = n_val.min(n - 1);

        let mut validation = indices[..n_val].to_vec();
        let mut train = indices[n_val..].to_vec();
        validation.sort_unstable();
        train.sort_unstable();

        Ok(Self {
            dataset_len,
            sample_budget,
            seed,
            train,
            validation,
        })
    }

    /// Loads a split from JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SeisdecError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Saves the split as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    /// Reuses the split stored at `path` when it was drawn for the same
    /// dataset length and budget, otherwise draws and saves a new one.
    pub fn load_or_generate<P: AsRef<Path>>(
        path: P,
        dataset_len: usize,
        validation_fraction: f64,
        sample_budget: Option<usize>,
        seed: u64,
    ) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let existing = Self::load(path)?;
            if existing.dataset_len == dataset_len && existing.sample_budget == sample_budget {
                info!(
                    "Reusing split {} ({} train / {} validation)",
                    path.display(),
                    existing.train.len(),
                    existing.validation.len()
                );
                return Ok(existing);
            }
            info!("Split {} was drawn for another dataset, regenerating", path.display());
        }

        let split = Self::generate(dataset_len, validation_fraction, sample_budget, seed)?;
        split.save(path)?;
        info!(
            "Generated split {} ({} train / {} validation)",
            path.display(),
            split.train.len(),
            split.validation.len()
        );
        Ok(split)
    }

    /// Total number of sampled indices.
    pub fn len(&self) -> usize {
        self.train.len() + self.validation.len()
    }

    /// Returns true if the split holds no indices.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
