//! Index registry: one typed slot per index kind.
//!
//! The registry is an explicitly constructed value owned by the database
//! facade (tests build their own), not a process-wide singleton. `init` is
//! idempotent per kind; the first initialization wins and later calls are
//! ignored.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::config::Metric;
use crate::error::{DbError, Result};
use crate::filter::FilterIndex;
use crate::flat::FlatIndex;
use crate::hnsw::HnswIndex;
use crate::storage::ScalarStore;

/// The physically distinct index implementations. Ordinals are the
/// on-disk snapshot file names (`<ordinal>.index`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Flat = 0,
    Hnsw = 1,
    Filter = 2,
}

impl IndexKind {
    pub fn ordinal(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Flat => "FLAT",
            IndexKind::Hnsw => "HNSW",
            IndexKind::Filter => "FILTER",
        }
    }

    /// Parse the wire name of an ANN kind. `FILTER` is not addressable
    /// from requests.
    pub fn from_request(s: &str) -> Result<Self> {
        match s {
            "FLAT" => Ok(IndexKind::Flat),
            "HNSW" => Ok(IndexKind::Hnsw),
            other => Err(DbError::UnknownIndexType(other.to_string())),
        }
    }

    fn file_name(self) -> String {
        format!("{}.index", self.ordinal())
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
pub struct IndexRegistry {
    flat: Option<FlatIndex>,
    graph: Option<HnswIndex>,
    filter: Option<FilterIndex>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize the given kind. Re-initializing an occupied slot is
    /// ignored.
    pub fn init(&mut self, kind: IndexKind, dim: usize, capacity: usize, metric: Metric) {
        match kind {
            IndexKind::Flat => {
                if self.flat.is_none() {
                    self.flat = Some(FlatIndex::new(dim, metric));
                } else {
                    debug!(%kind, "index already initialized, ignoring");
                }
            }
            IndexKind::Hnsw => {
                if self.graph.is_none() {
                    self.graph = Some(HnswIndex::new(dim, capacity, metric));
                } else {
                    debug!(%kind, "index already initialized, ignoring");
                }
            }
            IndexKind::Filter => {
                if self.filter.is_none() {
                    self.filter = Some(FilterIndex::new());
                } else {
                    debug!(%kind, "index already initialized, ignoring");
                }
            }
        }
    }

    pub fn flat(&self) -> Option<&FlatIndex> {
        self.flat.as_ref()
    }

    pub fn flat_mut(&mut self) -> Option<&mut FlatIndex> {
        self.flat.as_mut()
    }

    pub fn graph(&self) -> Option<&HnswIndex> {
        self.graph.as_ref()
    }

    pub fn graph_mut(&mut self) -> Option<&mut HnswIndex> {
        self.graph.as_mut()
    }

    pub fn filter(&self) -> Option<&FilterIndex> {
        self.filter.as_ref()
    }

    pub fn filter_mut(&mut self) -> Option<&mut FilterIndex> {
        self.filter.as_mut()
    }

    /// Dump every initialized index into `dir`. File-backed indexes are
    /// written to a temp path and renamed into place so a crash mid-dump
    /// never leaves a truncated `<ordinal>.index`; the filter index routes
    /// through the scalar KV under the `dir/2.index` key.
    pub fn save_all(&self, dir: &Path, store: &ScalarStore) -> Result<()> {
        create_snapshot_dir(dir)?;

        if let Some(flat) = &self.flat {
            let final_path = dir.join(IndexKind::Flat.file_name());
            let tmp_path = tmp_sibling(&final_path);
            flat.save(&tmp_path)?;
            std::fs::rename(&tmp_path, &final_path)?;
        }
        if let Some(graph) = &self.graph {
            let final_path = dir.join(IndexKind::Hnsw.file_name());
            let tmp_path = tmp_sibling(&final_path);
            graph.save(&tmp_path)?;
            std::fs::rename(&tmp_path, &final_path)?;
        }
        sync_dir(dir)?;

        if let Some(filter) = &self.filter {
            let key = dir.join(IndexKind::Filter.file_name());
            filter.save(store, &key.to_string_lossy())?;
        }

        debug!(dir = %dir.display(), "saved all indexes");
        Ok(())
    }

    /// Counterpart of [`Self::save_all`]. Each component tolerates its own
    /// file being absent.
    pub fn load_all(&mut self, dir: &Path, store: &ScalarStore) -> Result<()> {
        if let Some(flat) = &mut self.flat {
            flat.load(&dir.join(IndexKind::Flat.file_name()))?;
        }
        if let Some(graph) = &mut self.graph {
            graph.load(&dir.join(IndexKind::Hnsw.file_name()))?;
        }
        if self.filter.is_some() {
            let key = dir.join(IndexKind::Filter.file_name());
            self.filter = Some(FilterIndex::load(store, &key.to_string_lossy())?);
        }
        Ok(())
    }
}

fn create_snapshot_dir(dir: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(dir).map_err(|e| {
        error!(dir = %dir.display(), "failed to create snapshot directory: {e}");
        DbError::SnapshotDirCreate {
            path: dir.to_path_buf(),
            source: e,
        }
    })
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn sync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
