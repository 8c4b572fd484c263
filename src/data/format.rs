//! Binary spectrogram store.
//!
//! Samples are stored densely so that any index can be read straight out of
//! a memory map without touching the rest of the file.
//!
//! ## Format Layout
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | Sample Data      |
//! | (N * H * W f32)  |
//! +------------------+
//! | Metadata         |
//! | (bincode)        |
//! +------------------+
//! ```
//!
//! ### Header (64 bytes)
//! - Magic number (4 bytes): "SSPG"
//! - Version (2 bytes)
//! - Flags (2 bytes), reserved
//! - Height / frequency bins (4 bytes)
//! - Width / time bins (4 bytes)
//! - Number of samples (8 bytes)
//! - Sample data offset (8 bytes)
//! - Metadata offset (8 bytes)
//! - Metadata length (8 bytes)
//! - Reserved (16 bytes)
//!
//! All integers and samples are little-endian.

use crate::data::store::{SampleMetadata, SampleStore};
use crate::error::{Result, SeisdecError};
use memmap2::{Mmap, MmapOptions};
use ndarray::Array2;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic number for spectrogram store files.
const MAGIC: &[u8; 4] = b"SSPG";

/// Current format version.
const VERSION: u16 = 1;

/// Header size in bytes.
const HEADER_SIZE: usize = 64;

/// Store file header.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreHeader {
    /// Frequency bins.
    pub height: u32,
    /// Time bins.
    pub width: u32,
    /// Number of samples.
    pub num_samples: u64,
    /// Offset of the first sample.
    pub data_offset: u64,
    /// Offset of the metadata block.
    pub metadata_offset: u64,
    /// Length of the metadata block.
    pub metadata_len: u64,
    /// Format version.
    pub version: u16,
}

impl StoreHeader {
    /// Creates a header for an empty store.
    pub fn new(height: u32, width: u32) -> Self {
        Self {
            height,
            width,
            num_samples: 0,
            data_offset: HEADER_SIZE as u64,
            metadata_offset: 0,
            metadata_len: 0,
            version: VERSION,
        }
    }

    /// Bytes occupied by one sample.
    #[inline]
    pub fn sample_bytes(&self) -> usize {
        self.height as usize * self.width as usize * 4
    }

    /// Writes the header to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(MAGIC);
        bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
        // bytes 6..8: flags, unused
        bytes[8..12].copy_from_slice(&self.height.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.width.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.num_samples.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.data_offset.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.metadata_offset.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.metadata_len.to_le_bytes());
        bytes
    }

    /// Reads a header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(SeisdecError::InvalidFormat("Store header too short".to_string()));
        }
        if &bytes[0..4] != MAGIC {
            return Err(SeisdecError::InvalidFormat(
                "Invalid store magic number".to_string(),
            ));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(SeisdecError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version
            )));
        }

        let u32_at = |o: usize| u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        let u64_at = |o: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[o..o + 8]);
            u64::from_le_bytes(buf)
        };

        Ok(Self {
            height: u32_at(8),
            width: u32_at(12),
            num_samples: u64_at(16),
            data_offset: u64_at(24),
            metadata_offset: u64_at(32),
            metadata_len: u64_at(40),
            version,
        })
    }
}

/// Streaming writer for store files.
///
/// Samples go to disk as they are appended; only metadata is buffered until
/// [`SpectrogramWriter::finish`].
pub struct SpectrogramWriter {
    writer: BufWriter<File>,
    header: StoreHeader,
    metadata: Vec<SampleMetadata>,
    path: PathBuf,
}

impl SpectrogramWriter {
    /// Creates a store file for spectrograms of shape `(height, width)`.
    pub fn create<P: AsRef<Path>>(path: P, height: usize, width: usize) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(SeisdecError::Config(format!(
                "spectrogram shape must be non-empty, got {}x{}",
                height, width
            )));
        }
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        let header = StoreHeader::new(height as u32, width as u32);
        writer.write_all(&header.to_bytes())?;

        Ok(Self {
            writer,
            header,
            metadata: Vec::new(),
            path,
        })
    }

    /// Appends one sample.
    pub fn append(&mut self, spectrogram: &Array2<f32>, metadata: SampleMetadata) -> Result<usize> {
        let expected = (self.header.height as usize, self.header.width as usize);
        if spectrogram.dim() != expected {
            return Err(SeisdecError::Shape {
                expected: format!("{:?}", expected),
                actual: format!("{:?}", spectrogram.dim()),
            });
        }

        for v in spectrogram.iter() {
            self.writer.write_all(&v.to_le_bytes())?;
        }
        self.metadata.push(metadata);
        self.header.num_samples += 1;
        Ok(self.header.num_samples as usize - 1)
    }

    /// Copies every sample of another store.
    pub fn append_store(&mut self, store: &dyn SampleStore) -> Result<()> {
        for i in 0..store.len() {
            let sample = store.get(i)?;
            self.append(&sample.spectrogram, sample.metadata)?;
        }
        Ok(())
    }

    /// Writes the metadata block, patches the header and closes the file.
    pub fn finish(mut self) -> Result<StoreHeader> {
        let meta_bytes = bincode::serialize(&self.metadata)?;
        self.header.metadata_offset =
            self.header.data_offset + self.header.num_samples * self.header.sample_bytes() as u64;
        self.header.metadata_len = meta_bytes.len() as u64;

        self.writer.write_all(&meta_bytes)?;
        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&self.header.to_bytes())?;
        self.writer.flush()?;

        log::debug!(
            "Wrote {} samples ({}x{}) to {}",
            self.header.num_samples,
            self.header.height,
            self.header.width,
            self.path.display()
        );
        Ok(self.header)
    }
}

/// Memory-mapped, read-only spectrogram store.
pub struct MmapStore {
    mmap: Mmap,
    header: StoreHeader,
    metadata: Vec<SampleMetadata>,
}

impl MmapStore {
    /// Opens a store file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SeisdecError::FileNotFound(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        let header = StoreHeader::from_bytes(&mmap)?;

        let data_end = header.data_offset as usize + header.num_samples as usize * header.sample_bytes();
        let meta_start = header.metadata_offset as usize;
        let meta_end = meta_start + header.metadata_len as usize;
        if data_end > mmap.len() || meta_start < data_end || meta_end > mmap.len() {
            return Err(SeisdecError::DataAccess(format!(
                "{} is truncated: expected at least {} bytes, found {}",
                path.display(),
                meta_end.max(data_end),
                mmap.len()
            )));
        }

        let metadata: Vec<SampleMetadata> = bincode::deserialize(&mmap[meta_start..meta_end])?;
        if metadata.len() as u64 != header.num_samples {
            return Err(SeisdecError::InvalidFormat(format!(
                "metadata has {} rows for {} samples",
                metadata.len(),
                header.num_samples
            )));
        }

        Ok(Self { mmap, header, metadata })
    }

    /// File header.
    pub fn header(&self) -> &StoreHeader {
        &self.header
    }

    fn check(&self, index: usize) -> Result<()> {
        if index >= self.metadata.len() {
            return Err(SeisdecError::IndexOutOfBounds {
                index,
                len: self.metadata.len(),
            });
        }
        Ok(())
    }
}

impl SampleStore for MmapStore {
    fn len(&self) -> usize {
        self.metadata.len()
    }

    fn shape(&self) -> (usize, usize) {
        (self.header.height as usize, self.header.width as usize)
    }

    fn spectrogram(&self, index: usize) -> Result<Array2<f32>> {
        self.check(index)?;
        let size = self.header.sample_bytes();
        let start = self.header.data_offset as usize + index * size;
        let values: Vec<f32> = self.mmap[start..start + size]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Array2::from_shape_vec(self.shape(), values)
            .map_err(|e| SeisdecError::DataAccess(e.to_string()))
    }

    fn metadata(&self, index: usize) -> Result<SampleMetadata> {
        self.check(index)?;
        Ok(self.metadata[index].clone())
    }
}
