//! Graph persistence.
//!
//! Little-endian binary layout:
//! - magic `LSGRAPH1`
//! - header: dim u32, metric u8, m u32, ef_construction u32, ef_search u32,
//!   max_elements u64, entry slot u32 (`u32::MAX` = none), max_layer u8,
//!   node count u64
//! - tombstones: byte length u32, portable roaring bitmap bytes
//! - per node: label u64, `dim` f32 vector values, top layer u8, then per
//!   layer a neighbor count u32 and that many slot u32s

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use roaring::RoaringBitmap;
use tracing::warn;

use super::index::HnswIndex;
use super::node::Node;
use crate::config::Metric;
use crate::error::{DbError, Result};

const MAGIC: &[u8; 8] = b"LSGRAPH1";

impl HnswIndex {
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);

        w.write_all(MAGIC)?;
        w.write_all(&(self.dim as u32).to_le_bytes())?;
        w.write_all(&[match self.metric {
            Metric::L2 => 0u8,
            Metric::InnerProduct => 1u8,
        }])?;
        w.write_all(&(self.m as u32).to_le_bytes())?;
        w.write_all(&(self.ef_construction as u32).to_le_bytes())?;
        w.write_all(&(self.ef_search as u32).to_le_bytes())?;
        w.write_all(&(self.max_elements as u64).to_le_bytes())?;
        w.write_all(&self.entry_point.unwrap_or(u32::MAX).to_le_bytes())?;
        w.write_all(&[self.max_layer as u8])?;
        w.write_all(&(self.nodes.len() as u64).to_le_bytes())?;

        let mut dead = Vec::with_capacity(self.dead.serialized_size());
        self.dead.serialize_into(&mut dead).map_err(DbError::Io)?;
        w.write_all(&(dead.len() as u32).to_le_bytes())?;
        w.write_all(&dead)?;

        for node in &self.nodes {
            w.write_all(&node.label.to_le_bytes())?;
            for &v in &node.vector {
                w.write_all(&v.to_le_bytes())?;
            }
            w.write_all(&[(node.layers.len() - 1) as u8])?;
            for layer in &node.layers {
                w.write_all(&(layer.len() as u32).to_le_bytes())?;
                for &slot in layer {
                    w.write_all(&slot.to_le_bytes())?;
                }
            }
        }
        w.flush()?;
        Ok(())
    }

    /// Load from `path`, replacing this index's contents. A missing file
    /// is a warning, not an error; the in-memory index is left as-is.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            warn!(path = %path.display(), "graph index file not found, skipping load");
            return Ok(());
        }
        let file = File::open(path)?;
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(DbError::corrupt("graph index magic mismatch"));
        }

        let dim = read_u32(&mut r)? as usize;
        if dim != self.dim {
            return Err(DbError::DimensionMismatch {
                expected: self.dim,
                got: dim,
            });
        }
        let metric = match read_u8(&mut r)? {
            0 => Metric::L2,
            1 => Metric::InnerProduct,
            other => return Err(DbError::corrupt(format!("unknown metric tag {other}"))),
        };
        let m = read_u32(&mut r)? as usize;
        let ef_construction = read_u32(&mut r)? as usize;
        let ef_search = read_u32(&mut r)? as usize;
        let max_elements = read_u64(&mut r)? as usize;
        let entry_raw = read_u32(&mut r)?;
        let max_layer = read_u8(&mut r)? as usize;
        let count = read_u64(&mut r)? as usize;

        let dead_len = read_u32(&mut r)? as usize;
        let mut dead_bytes = vec![0u8; dead_len];
        r.read_exact(&mut dead_bytes)?;
        let dead = RoaringBitmap::deserialize_from(&dead_bytes[..])
            .map_err(|e| DbError::corrupt(format!("graph tombstones: {e}")))?;

        let mut nodes = Vec::with_capacity(count);
        let mut label_to_slot = HashMap::with_capacity(count);
        for slot in 0..count {
            let label = read_u64(&mut r)?;
            let mut vector = Vec::with_capacity(dim);
            for _ in 0..dim {
                vector.push(read_f32(&mut r)?);
            }
            let top_layer = read_u8(&mut r)? as usize;
            let mut layers = Vec::with_capacity(top_layer + 1);
            for _ in 0..=top_layer {
                let neighbor_count = read_u32(&mut r)? as usize;
                let mut neighbors = Vec::with_capacity(neighbor_count);
                for _ in 0..neighbor_count {
                    neighbors.push(read_u32(&mut r)?);
                }
                layers.push(neighbors);
            }
            if !dead.contains(slot as u32) {
                label_to_slot.insert(label, slot as u32);
            }
            nodes.push(Node {
                label,
                vector,
                layers,
            });
        }

        self.metric = metric;
        self.m = m;
        self.m0 = m * 2;
        self.ml = 1.0 / (m as f64).ln();
        self.ef_construction = ef_construction;
        self.ef_search = ef_search;
        self.max_elements = max_elements;
        self.entry_point = if entry_raw == u32::MAX {
            None
        } else {
            Some(entry_raw)
        };
        self.max_layer = max_layer;
        self.dead = dead;
        self.nodes = nodes;
        self.label_to_slot = label_to_slot;
        Ok(())
    }
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32<R: Read>(r: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn save_load_preserves_results_and_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.index");

        let mut rng = StdRng::seed_from_u64(17);
        let vectors: Vec<Vec<f32>> = (0..80)
            .map(|_| (0..16).map(|_| rng.gen::<f32>() - 0.5).collect())
            .collect();

        let mut index = HnswIndex::new(16, 200, Metric::L2);
        for (i, v) in vectors.iter().enumerate() {
            index.insert(v, i as u64).unwrap();
        }
        index.remove(&[3, 4]);
        index.save(&path).unwrap();

        let mut restored = HnswIndex::new(16, 200, Metric::L2);
        restored.load(&path).unwrap();

        assert_eq!(restored.len(), 78);
        assert!(!restored.contains(3));

        let original = index.search(&vectors[10], 5, None).unwrap();
        let reloaded = restored.search(&vectors[10], 5, None).unwrap();
        assert_eq!(original[0].0, reloaded[0].0);
        assert_eq!(reloaded[0].0, 10);
    }

    #[test]
    fn load_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = HnswIndex::new(8, 16, Metric::L2);
        index.load(&dir.path().join("absent.index")).unwrap();
        assert!(index.is_empty());
    }
}
