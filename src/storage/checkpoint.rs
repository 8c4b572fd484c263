//! Weight snapshots and the per-run directory layout.
//!
//! ## Snapshot Layout
//!
//! ```text
//! +------------------+
//! | Header (32 bytes)|
//! +------------------+
//! | Payload          |
//! | (bincode)        |
//! +------------------+
//! ```
//!
//! ### Header (32 bytes)
//! - Magic number (4 bytes): "SDCK"
//! - Version (2 bytes)
//! - Model kind (2 bytes): 1 = autoencoder, 2 = DEC
//! - Payload length (8 bytes)
//! - Epoch (4 bytes)
//! - Reserved (12 bytes)
//!
//! Snapshots are written to a temporary file and renamed into place, so a
//! killed run never leaves a torn checkpoint behind.

use crate::data::TransformKind;
use crate::error::{Result, SeisdecError};
use crate::nn::{Autoencoder, DecModel};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Magic number for snapshot files.
const MAGIC: &[u8; 4] = b"SDCK";

/// Current snapshot version.
const VERSION: u16 = 1;

/// Header size in bytes.
const HEADER_SIZE: usize = 32;

/// Which model a snapshot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Encoder and decoder.
    Autoencoder,
    /// Encoder and clustering head.
    Dec,
}

impl ModelKind {
    fn code(self) -> u16 {
        match self {
            ModelKind::Autoencoder => 1,
            ModelKind::Dec => 2,
        }
    }

    fn from_code(code: u16) -> Result<Self> {
        match code {
            1 => Ok(ModelKind::Autoencoder),
            2 => Ok(ModelKind::Dec),
            other => Err(SeisdecError::InvalidFormat(format!("Unknown model kind: {}", other))),
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelKind::Autoencoder => write!(f, "autoencoder"),
            ModelKind::Dec => write!(f, "dec"),
        }
    }
}

/// Snapshot file header.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointHeader {
    /// Format version.
    pub version: u16,
    /// Model kind.
    pub kind: ModelKind,
    /// Length of the bincode payload.
    pub payload_len: u64,
    /// Epoch the snapshot was taken at.
    pub epoch: u32,
}

impl CheckpointHeader {
    /// Writes the header to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(MAGIC);
        bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.kind.code().to_le_bytes());
        bytes[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.epoch.to_le_bytes());
        bytes
    }

    /// Reads a header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(SeisdecError::InvalidFormat("Checkpoint header too short".to_string()));
        }
        if &bytes[0..4] != MAGIC {
            return Err(SeisdecError::InvalidFormat("Invalid checkpoint magic number".to_string()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(SeisdecError::InvalidFormat(format!(
                "Unsupported checkpoint version: {}",
                version
            )));
        }
        let kind = ModelKind::from_code(u16::from_le_bytes([bytes[6], bytes[7]]))?;
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[8..16]);
        let epoch = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);

        Ok(Self {
            version,
            kind,
            payload_len: u64::from_le_bytes(len),
            epoch,
        })
    }
}

/// A model together with what is needed to feed it raw samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot<M> {
    /// The model weights.
    pub model: M,
    /// Transform the model was trained with.
    pub transform: TransformKind,
    /// Spectrogram shape `(H, W)` the model expects.
    pub shape: (usize, usize),
    /// Epoch the snapshot was taken at.
    pub epoch: usize,
}

/// Models that can be snapshotted.
pub trait SnapshotModel: Serialize + DeserializeOwned {
    /// Kind written into the header.
    const KIND: ModelKind;
}

impl SnapshotModel for Autoencoder {
    const KIND: ModelKind = ModelKind::Autoencoder;
}

impl SnapshotModel for DecModel {
    const KIND: ModelKind = ModelKind::Dec;
}

/// Writes a snapshot.
pub fn save_snapshot<M: SnapshotModel, P: AsRef<Path>>(path: P, snapshot: &Snapshot<M>) -> Result<()> {
    let path = path.as_ref();
    let payload = bincode::serialize(snapshot)?;
    let header = CheckpointHeader {
        version: VERSION,
        kind: M::KIND,
        payload_len: payload.len() as u64,
        epoch: snapshot.epoch as u32,
    };

    let tmp = path.with_extension("ckpt.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_all(&header.to_bytes())?;
        writer.write_all(&payload)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads only the header of a snapshot.
pub fn read_header<P: AsRef<Path>>(path: P) -> Result<CheckpointHeader> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(SeisdecError::FileNotFound(path.to_path_buf()));
    }
    let mut bytes = [0u8; HEADER_SIZE];
    File::open(path)?.read_exact(&mut bytes)?;
    CheckpointHeader::from_bytes(&bytes)
}

/// Loads a snapshot, checking that it holds the expected model kind.
pub fn load_snapshot<M: SnapshotModel, P: AsRef<Path>>(path: P) -> Result<Snapshot<M>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(SeisdecError::FileNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    let header = CheckpointHeader::from_bytes(&bytes)?;
    if header.kind != M::KIND {
        return Err(SeisdecError::InvalidFormat(format!(
            "{} holds a {} snapshot, expected {}",
            path.display(),
            header.kind,
            M::KIND
        )));
    }
    let end = HEADER_SIZE + header.payload_len as usize;
    if bytes.len() < end {
        return Err(SeisdecError::InvalidFormat(format!(
            "{} is truncated: {} of {} bytes",
            path.display(),
            bytes.len(),
            end
        )));
    }
    Ok(bincode::deserialize(&bytes[HEADER_SIZE..end])?)
}

/// Initial or final snapshot of a training phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Before the phase's first update.
    Initial,
    /// At the end of the phase.
    Final,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Initial => "initial",
            Stage::Final => "final",
        }
    }
}

/// Directory owned by a single run.
///
/// ```text
/// <output_dir>/<run_id>/
///   config.json
///   history.json
///   autoencoder_initial.ckpt
///   autoencoder_final.ckpt
///   dec_initial.ckpt
///   dec_final.ckpt
///   previews/
/// ```
#[derive(Debug, Clone)]
pub struct RunDirectory {
    root: PathBuf,
    run_id: String,
}

impl RunDirectory {
    /// Creates (or reopens) the directory of `run_id` under `output_dir`.
    pub fn create<P: AsRef<Path>>(output_dir: P, run_id: &str) -> Result<Self> {
        let root = output_dir.as_ref().join(run_id);
        fs::create_dir_all(root.join("previews"))?;
        Ok(Self {
            root,
            run_id: run_id.to_string(),
        })
    }

    /// Opens an existing run directory.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(SeisdecError::FileNotFound(root));
        }
        let run_id = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self { root, run_id })
    }

    /// Run identifier.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Directory path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hyperparameters of the run.
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Loss and delta history.
    pub fn history_path(&self) -> PathBuf {
        self.root.join("history.json")
    }

    /// Autoencoder snapshot.
    pub fn autoencoder_path(&self, stage: Stage) -> PathBuf {
        self.root.join(format!("autoencoder_{}.ckpt", stage.name()))
    }

    /// DEC snapshot.
    pub fn dec_path(&self, stage: Stage) -> PathBuf {
        self.root.join(format!("dec_{}.ckpt", stage.name()))
    }

    /// Reconstruction previews.
    pub fn previews_dir(&self) -> PathBuf {
        self.root.join("previews")
    }

    /// Per-sample predictions.
    pub fn predictions_path(&self) -> PathBuf {
        self.root.join("predictions.csv")
    }

    /// Per-sample latent vectors.
    pub fn latents_path(&self) -> PathBuf {
        self.root.join("latents.csv")
    }

    /// Per-cluster summary.
    pub fn summary_path(&self) -> PathBuf {
        self.root.join("clusters.csv")
    }

    /// Writes any serialisable value as pretty JSON under the run root.
    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let path = self.root.join(name);
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&path, json)?;
        Ok(path)
    }

    /// Reads a JSON file under the run root.
    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.root.join(name);
        if !path.exists() {
            return Err(SeisdecError::FileNotFound(path));
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }
}
