//! Training: autoencoder pretraining, DEC fine-tuning and sweeps.
//!
//! - [`pretrain`] - reconstruction training with early stopping
//! - [`dec`] - the target-update / gradient state machine
//! - [`sweep`] - one isolated run per hyperparameter combination
//! - [`history`] - per-run loss and delta records
//! - [`notify`] - fire-and-forget progress events

pub mod dec;
pub mod history;
pub mod notify;
pub mod pretrain;
pub mod sweep;

pub use dec::{full_soft_assign, is_converged, DecOutcome, DecState, DecTrainer, StopReason};
pub use history::{DecEpoch, History, PretrainEpoch, TargetUpdate};
pub use notify::{FanoutNotifier, FileNotifier, LogNotifier, Notifier, NullNotifier, TrainingEvent};
pub use pretrain::{evaluate, write_preview, AutoencoderTrainer, PretrainOutcome};
pub use sweep::{run, run_sweep, run_with_store, RunInputs, RunRecord, RunStatus, SweepReport};
