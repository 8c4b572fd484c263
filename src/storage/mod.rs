//! Run persistence: weight snapshots, run directories and results tables.

pub mod checkpoint;
pub mod results;

pub use checkpoint::{
    load_snapshot, read_header, save_snapshot, CheckpointHeader, ModelKind, RunDirectory, Snapshot, SnapshotModel,
    Stage,
};
pub use results::{read_results, LatentWriter, ResultRow, ResultsWriter};
