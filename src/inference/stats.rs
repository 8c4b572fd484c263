//! Per-cluster statistics joined through sample metadata.

use crate::data::SampleStore;
use crate::error::Result;
use crate::inference::engine::{PredictionBatch, PredictionSink};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Aggregates of one cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterSummary {
    /// Cluster label.
    pub label: usize,
    /// Number of samples.
    pub count: usize,
    /// Samples per station.
    pub stations: BTreeMap<String, usize>,
    /// Earliest event time.
    pub first_timestamp: Option<i64>,
    /// Latest event time.
    pub last_timestamp: Option<i64>,
    amplitude_sum: f64,
}

impl ClusterSummary {
    fn add(&mut self, station: &str, timestamp: i64, peak_amplitude: f64) {
        self.count += 1;
        *self.stations.entry(station.to_string()).or_insert(0) += 1;
        self.first_timestamp = Some(self.first_timestamp.map_or(timestamp, |t| t.min(timestamp)));
        self.last_timestamp = Some(self.last_timestamp.map_or(timestamp, |t| t.max(timestamp)));
        self.amplitude_sum += peak_amplitude;
    }

    /// Mean peak amplitude, None for an empty cluster.
    pub fn mean_peak_amplitude(&self) -> Option<f64> {
        (self.count > 0).then(|| self.amplitude_sum / self.count as f64)
    }

    /// Station with the most samples. Ties go to the smallest code.
    pub fn dominant_station(&self) -> Option<&str> {
        self.stations
            .iter()
            .fold(None, |best: Option<(&String, usize)>, (s, &n)| match best {
                Some((_, m)) if m >= n => best,
                _ => Some((s, n)),
            })
            .map(|(s, _)| s.as_str())
    }
}

/// Sink that tallies predicted labels against sample metadata.
pub struct ClusterStatistics {
    store: Arc<dyn SampleStore>,
    clusters: Vec<ClusterSummary>,
}

impl ClusterStatistics {
    /// Creates empty statistics for `n_clusters` clusters over `store`.
    pub fn new(store: Arc<dyn SampleStore>, n_clusters: usize) -> Self {
        let clusters = (0..n_clusters)
            .map(|label| ClusterSummary {
                label,
                ..Default::default()
            })
            .collect();
        Self { store, clusters }
    }

    /// Per-cluster aggregates, by label.
    pub fn clusters(&self) -> &[ClusterSummary] {
        &self.clusters
    }

    /// Number of tallied samples.
    pub fn total(&self) -> usize {
        self.clusters.iter().map(|c| c.count).sum()
    }

    /// Share of the tallied samples in each cluster.
    pub fn fractions(&self) -> Vec<f64> {
        let total = self.total().max(1) as f64;
        self.clusters.iter().map(|c| c.count as f64 / total).collect()
    }

    /// Writes one row per cluster:
    /// `label,count,fraction,first_timestamp,last_timestamp,mean_peak_amplitude,dominant_station,stations`.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "label",
            "count",
            "fraction",
            "first_timestamp",
            "last_timestamp",
            "mean_peak_amplitude",
            "dominant_station",
            "stations",
        ])?;
        for (cluster, fraction) in self.clusters.iter().zip(self.fractions()) {
            let stations = cluster
                .stations
                .iter()
                .map(|(s, n)| format!("{}:{}", s, n))
                .collect::<Vec<_>>()
                .join(";");
            writer.write_record([
                cluster.label.to_string(),
                cluster.count.to_string(),
                format!("{:.6}", fraction),
                opt(cluster.first_timestamp),
                opt(cluster.last_timestamp),
                opt(cluster.mean_peak_amplitude()),
                cluster.dominant_station().unwrap_or_default().to_string(),
                stations,
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl PredictionSink for ClusterStatistics {
    fn consume(&mut self, batch: &PredictionBatch<'_>) -> Result<()> {
        for (&index, &label) in batch.indices.iter().zip(&batch.prediction.labels) {
            let meta = self.store.metadata(index)?;
            if label >= self.clusters.len() {
                self.clusters.resize_with(label + 1, Default::default);
                for (k, c) in self.clusters.iter_mut().enumerate() {
                    c.label = k;
                }
            }
            self.clusters[label].add(&meta.station, meta.timestamp, meta.peak_amplitude);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{InMemoryStore, SampleMetadata};
    use crate::nn::Prediction;
    use ndarray::Array2;

    fn store() -> Arc<dyn SampleStore> {
        let mut store = InMemoryStore::new((2, 2));
        let rows = [("AAA", 100, 1.0), ("BBB", 50, 3.0), ("AAA", 300, 2.0), ("BBB", 200, 4.0)];
        for (i, (station, ts, amp)) in rows.into_iter().enumerate() {
            store
                .push(Array2::zeros((2, 2)), SampleMetadata::new(station, ts, amp, i as u64))
                .unwrap();
        }
        Arc::new(store)
    }

    fn feed(stats: &mut ClusterStatistics, indices: &[usize], labels: Vec<usize>) {
        let n = labels.len();
        let prediction = Prediction {
            latents: Array2::zeros((n, 1)),
            q: Array2::zeros((n, 2)),
            labels,
        };
        stats
            .consume(&PredictionBatch {
                indices,
                prediction: &prediction,
            })
            .unwrap();
    }

    #[test]
    fn test_join_through_metadata() {
        let mut stats = ClusterStatistics::new(store(), 2);
        feed(&mut stats, &[0, 1, 2], vec![0, 1, 0]);
        feed(&mut stats, &[3], vec![0]);

        assert_eq!(stats.total(), 4);
        assert_eq!(stats.fractions(), vec![0.75, 0.25]);
        let c0 = &stats.clusters()[0];
        assert_eq!(c0.count, 3);
        assert_eq!(c0.first_timestamp, Some(100));
        assert_eq!(c0.last_timestamp, Some(300));
        assert_eq!(c0.dominant_station(), Some("AAA"));
        assert!((c0.mean_peak_amplitude().unwrap() - 7.0 / 3.0).abs() < 1e-12);
        assert_eq!(stats.clusters()[1].stations.get("BBB"), Some(&1));
    }

    #[test]
    fn test_empty_cluster_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.csv");
        let mut stats = ClusterStatistics::new(store(), 3);
        feed(&mut stats, &[0, 1], vec![1, 1]);
        stats.write_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "0,0,0.000000,,,,,");
        assert!(lines[2].starts_with("1,2,1.000000,50,100,2,AAA,AAA:1;BBB:1"));
    }
}
