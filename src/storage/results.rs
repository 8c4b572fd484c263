//! CSV results tables.
//!
//! The predictions table has one row per sample, keyed by store index:
//!
//! ```text
//! index,label,q_0,q_1,...
//! ```
//!
//! The soft-assignment columns are optional. Latent vectors go to a separate
//! `index,z_0,z_1,...` table.

use crate::error::{Result, SeisdecError};
use std::fs::File;
use std::path::Path;

/// One row of a predictions table.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    /// Store index.
    pub index: usize,
    /// Predicted cluster.
    pub label: usize,
    /// Soft assignments, empty if the table has none.
    pub scores: Vec<f32>,
}

/// Streaming writer for the predictions table.
pub struct ResultsWriter {
    writer: csv::Writer<File>,
    n_clusters: usize,
    soft: bool,
    rows: usize,
}

impl ResultsWriter {
    /// Creates the file and writes the header.
    pub fn create<P: AsRef<Path>>(path: P, n_clusters: usize, soft: bool) -> Result<Self> {
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec!["index".to_string(), "label".to_string()];
        if soft {
            header.extend((0..n_clusters).map(|k| format!("q_{}", k)));
        }
        writer.write_record(&header)?;
        Ok(Self {
            writer,
            n_clusters,
            soft,
            rows: 0,
        })
    }

    /// Appends one row. `scores` is ignored unless the table is soft.
    pub fn write_row(&mut self, index: usize, label: usize, scores: &[f32]) -> Result<()> {
        let mut record = Vec::with_capacity(2 + self.n_clusters);
        record.push(index.to_string());
        record.push(label.to_string());
        if self.soft {
            if scores.len() != self.n_clusters {
                return Err(SeisdecError::Shape {
                    expected: format!("{} scores", self.n_clusters),
                    actual: format!("{} scores", scores.len()),
                });
            }
            record.extend(scores.iter().map(|q| format!("{:.6}", q)));
        }
        self.writer.write_record(&record)?;
        self.rows += 1;
        Ok(())
    }

    /// Flushes the table.
    pub fn finish(mut self) -> Result<usize> {
        self.writer.flush()?;
        Ok(self.rows)
    }
}

/// Reads a predictions table back.
pub fn read_results<P: AsRef<Path>>(path: P) -> Result<Vec<ResultRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let index = parse_usize(column(&record, 0)?)?;
        let label = parse_usize(column(&record, 1)?)?;
        let scores = record
            .iter()
            .skip(2)
            .map(|s| {
                s.parse::<f32>()
                    .map_err(|e| SeisdecError::InvalidFormat(format!("bad score {:?}: {}", s, e)))
            })
            .collect::<Result<Vec<f32>>>()?;
        rows.push(ResultRow { index, label, scores });
    }
    Ok(rows)
}

fn column(record: &csv::StringRecord, i: usize) -> Result<&str> {
    record
        .get(i)
        .ok_or_else(|| SeisdecError::InvalidFormat(format!("missing column {} in results row", i)))
}

fn parse_usize(s: &str) -> Result<usize> {
    s.parse::<usize>()
        .map_err(|e| SeisdecError::InvalidFormat(format!("bad integer {:?}: {}", s, e)))
}

/// Streaming writer for latent vectors.
pub struct LatentWriter {
    writer: csv::Writer<File>,
    dim: usize,
}

impl LatentWriter {
    /// Creates the file and writes the header.
    pub fn create<P: AsRef<Path>>(path: P, dim: usize) -> Result<Self> {
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec!["index".to_string()];
        header.extend((0..dim).map(|j| format!("z_{}", j)));
        writer.write_record(&header)?;
        Ok(Self { writer, dim })
    }

    /// Appends one latent vector.
    pub fn write_row(&mut self, index: usize, latent: &[f32]) -> Result<()> {
        if latent.len() != self.dim {
            return Err(SeisdecError::Shape {
                expected: format!("{} latent values", self.dim),
                actual: format!("{} latent values", latent.len()),
            });
        }
        let mut record = Vec::with_capacity(1 + self.dim);
        record.push(index.to_string());
        record.extend(latent.iter().map(|v| v.to_string()));
        self.writer.write_record(&record)?;
        Ok(())
    }

    /// Flushes the table.
    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_soft_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("predictions.csv");
        let mut writer = ResultsWriter::create(&path, 2, true).unwrap();
        writer.write_row(4, 1, &[0.25, 0.75]).unwrap();
        writer.write_row(9, 0, &[0.9, 0.1]).unwrap();
        assert!(writer.write_row(10, 0, &[1.0]).is_err());
        assert_eq!(writer.finish().unwrap(), 2);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("index,label,q_0,q_1\n"));

        let rows = read_results(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].index, 4);
        assert_eq!(rows[0].label, 1);
        assert!((rows[0].scores[1] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_hard_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("predictions.csv");
        let mut writer = ResultsWriter::create(&path, 3, false).unwrap();
        writer.write_row(0, 2, &[]).unwrap();
        writer.finish().unwrap();
        let rows = read_results(&path).unwrap();
        assert_eq!(rows, vec![ResultRow { index: 0, label: 2, scores: vec![] }]);
    }

    #[test]
    fn test_latent_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("latents.csv");
        let mut writer = LatentWriter::create(&path, 2).unwrap();
        writer.write_row(3, &[0.5, -1.0]).unwrap();
        assert!(writer.write_row(4, &[0.5]).is_err());
        writer.finish().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "index,z_0,z_1\n3,0.5,-1\n");
    }
}
