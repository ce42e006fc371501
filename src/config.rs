//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Distance metric used by both ANN indexes.
///
/// `L2` surfaces squared euclidean distance (ascending = closer);
/// `InnerProduct` surfaces the raw dot product (descending = closer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Metric {
    L2,
    InnerProduct,
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "L2" => Ok(Metric::L2),
            "INNER_PRODUCT" | "IP" => Ok(Metric::InnerProduct),
            other => Err(format!(
                "unknown metric {other:?} (expected L2 or INNER_PRODUCT)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Vector dimension used to initialize every index.
    pub dim: usize,
    /// Live-point capacity for the graph index.
    pub max_elements: usize,
    pub metric: Metric,
    /// redb database file backing the scalar store.
    pub db_path: PathBuf,
    /// Append-only WAL file.
    pub wal_path: PathBuf,
    /// Directory snapshots are written into.
    pub snapshot_dir: PathBuf,
    /// Sidecar file recording the last snapshotted WAL seq.
    pub snapshot_seq_path: PathBuf,
}

impl DbConfig {
    /// Derive the standard on-disk layout under a single data directory.
    pub fn from_data_dir(data_dir: impl Into<PathBuf>, dim: usize) -> Self {
        let data_dir = data_dir.into();
        Self {
            dim,
            max_elements: 100_000,
            metric: Metric::L2,
            db_path: data_dir.join("scalar.redb"),
            wal_path: data_dir.join("wal.log"),
            snapshot_dir: data_dir.join("snapshots"),
            snapshot_seq_path: data_dir.join("lastSnapshotID"),
        }
    }
}
