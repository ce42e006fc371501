//! Exact brute-force index.
//!
//! Id-mapped flat storage scanned in full on every search. Distances come
//! from the SIMD kernels; results order ascending by squared L2 or
//! descending by inner product, with ties broken by ascending id. The
//! result list is padded to exactly `k` entries with the sentinel id `-1`
//! so callers can rely on a fixed shape.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use roaring::RoaringBitmap;
use tracing::warn;

use crate::config::Metric;
use crate::error::{DbError, Result};
use crate::simd::{dot, l2_squared};

const MAGIC: &[u8; 8] = b"LSFLAT01";

pub struct FlatIndex {
    dim: usize,
    metric: Metric,
    /// Row-major vector storage, `dim` floats per slot.
    data: Vec<f32>,
    ids: Vec<u64>,
    id_to_slot: HashMap<u64, usize>,
}

impl FlatIndex {
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self {
            dim,
            metric,
            data: Vec::new(),
            ids: Vec::new(),
            id_to_slot: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.id_to_slot.contains_key(&id)
    }

    /// Add one vector under `id`. Re-inserting an existing id overwrites
    /// its vector in place.
    pub fn insert(&mut self, vector: &[f32], id: u64) -> Result<()> {
        if vector.len() != self.dim {
            return Err(DbError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }

        if let Some(&slot) = self.id_to_slot.get(&id) {
            self.data[slot * self.dim..(slot + 1) * self.dim].copy_from_slice(vector);
            return Ok(());
        }

        let slot = self.ids.len();
        self.ids.push(id);
        self.data.extend_from_slice(vector);
        self.id_to_slot.insert(id, slot);
        Ok(())
    }

    /// Remove each id if present; unknown ids are a no-op.
    pub fn remove(&mut self, ids: &[u64]) {
        for &id in ids {
            let Some(slot) = self.id_to_slot.remove(&id) else {
                continue;
            };
            let last = self.ids.len() - 1;
            if slot != last {
                let moved_id = self.ids[last];
                self.ids.swap(slot, last);
                let (head, tail) = self.data.split_at_mut(last * self.dim);
                head[slot * self.dim..(slot + 1) * self.dim]
                    .copy_from_slice(&tail[..self.dim]);
                self.id_to_slot.insert(moved_id, slot);
            }
            self.ids.pop();
            self.data.truncate(self.ids.len() * self.dim);
        }
    }

    fn vector(&self, slot: usize) -> &[f32] {
        &self.data[slot * self.dim..(slot + 1) * self.dim]
    }

    /// Brute-force top-k. When `filter` is supplied, only member ids are
    /// eligible. Returns exactly `k` (id, distance) pairs, the tail padded
    /// with -1 sentinels when fewer matches exist.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&RoaringBitmap>,
    ) -> Result<(Vec<i64>, Vec<f32>)> {
        if query.len() != self.dim {
            return Err(DbError::DimensionMismatch {
                expected: self.dim,
                got: query.len(),
            });
        }

        let mut hits: Vec<(u64, f32)> = Vec::new();
        for (slot, &id) in self.ids.iter().enumerate() {
            if let Some(bitmap) = filter {
                if !bitmap.contains(id as u32) {
                    continue;
                }
            }
            let score = match self.metric {
                Metric::L2 => l2_squared(query, self.vector(slot)),
                Metric::InnerProduct => dot(query, self.vector(slot)),
            };
            hits.push((id, score));
        }

        let ascending = matches!(self.metric, Metric::L2);
        hits.sort_by(|a, b| {
            let by_score = if ascending {
                a.1.partial_cmp(&b.1)
            } else {
                b.1.partial_cmp(&a.1)
            };
            by_score
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        hits.truncate(k);

        let pad = match self.metric {
            Metric::L2 => f32::INFINITY,
            Metric::InnerProduct => f32::NEG_INFINITY,
        };
        let mut ids = Vec::with_capacity(k);
        let mut distances = Vec::with_capacity(k);
        for (id, score) in &hits {
            ids.push(*id as i64);
            distances.push(*score);
        }
        while ids.len() < k {
            ids.push(-1);
            distances.push(pad);
        }
        Ok((ids, distances))
    }

    /// Binary serialization:
    /// magic, dim u32, metric u8, count u64, then per slot: id u64 and
    /// `dim` f32 values, all little-endian.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);

        w.write_all(MAGIC)?;
        w.write_all(&(self.dim as u32).to_le_bytes())?;
        w.write_all(&[metric_tag(self.metric)])?;
        w.write_all(&(self.ids.len() as u64).to_le_bytes())?;
        for (slot, &id) in self.ids.iter().enumerate() {
            w.write_all(&id.to_le_bytes())?;
            for &v in self.vector(slot) {
                w.write_all(&v.to_le_bytes())?;
            }
        }
        w.flush()?;
        Ok(())
    }

    /// Load from `path`. A missing file is a warning, not an error; the
    /// in-memory index is left empty.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            warn!(path = %path.display(), "flat index file not found, skipping load");
            return Ok(());
        }
        let file = File::open(path)?;
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(DbError::corrupt("flat index magic mismatch"));
        }

        let dim = read_u32(&mut r)? as usize;
        if dim != self.dim {
            return Err(DbError::DimensionMismatch {
                expected: self.dim,
                got: dim,
            });
        }
        let metric = parse_metric_tag(read_u8(&mut r)?)?;
        let count = read_u64(&mut r)? as usize;

        let mut ids = Vec::with_capacity(count);
        let mut data = Vec::with_capacity(count * dim);
        let mut id_to_slot = HashMap::with_capacity(count);
        for slot in 0..count {
            let id = read_u64(&mut r)?;
            for _ in 0..dim {
                data.push(read_f32(&mut r)?);
            }
            ids.push(id);
            id_to_slot.insert(id, slot);
        }

        self.metric = metric;
        self.ids = ids;
        self.data = data;
        self.id_to_slot = id_to_slot;
        Ok(())
    }
}

fn metric_tag(metric: Metric) -> u8 {
    match metric {
        Metric::L2 => 0,
        Metric::InnerProduct => 1,
    }
}

fn parse_metric_tag(tag: u8) -> Result<Metric> {
    match tag {
        0 => Ok(Metric::L2),
        1 => Ok(Metric::InnerProduct),
        other => Err(DbError::corrupt(format!("unknown metric tag {other}"))),
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

    fn unit_axes() -> FlatIndex {
        let mut index = FlatIndex::new(3, Metric::L2);
        index.insert(&[1.0, 0.0, 0.0], 1).unwrap();
        index.insert(&[0.0, 1.0, 0.0], 2).unwrap();
        index.insert(&[0.0, 0.0, 1.0], 3).unwrap();
        index
    }

    #[test]
    fn l2_search_orders_by_distance() {
        let index = unit_axes();
        let (ids, distances) = index.search(&[1.0, 0.0, 0.0], 2, None).unwrap();

        assert_eq!(ids, vec![1, 2]);
        assert!(distances[0].abs() < 1e-6);
        assert!((distances[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn oversized_k_pads_with_sentinels() {
        let index = unit_axes();
        let (ids, _) = index.search(&[1.0, 0.0, 0.0], 5, None).unwrap();

        assert_eq!(ids.len(), 5);
        assert_eq!(ids[0], 1);
        assert_eq!(&ids[3..], &[-1, -1]);
    }

    #[test]
    fn bitmap_restricts_eligibility() {
        let index = unit_axes();
        let mut bitmap = RoaringBitmap::new();
        bitmap.insert(2);
        bitmap.insert(3);

        let (ids, _) = index.search(&[1.0, 0.0, 0.0], 3, Some(&bitmap)).unwrap();
        assert_eq!(&ids[..2], &[2, 3]);
        assert_eq!(ids[2], -1);
    }

    #[test]
    fn ties_break_by_ascending_id() {
        let mut index = FlatIndex::new(2, Metric::L2);
        index.insert(&[1.0, 0.0], 9).unwrap();
        index.insert(&[1.0, 0.0], 4).unwrap();

        let (ids, _) = index.search(&[1.0, 0.0], 2, None).unwrap();
        assert_eq!(ids, vec![4, 9]);
    }

    #[test]
    fn inner_product_orders_descending() {
        let mut index = FlatIndex::new(2, Metric::InnerProduct);
        index.insert(&[0.2, 0.0], 1).unwrap();
        index.insert(&[0.9, 0.0], 2).unwrap();

        let (ids, distances) = index.search(&[1.0, 0.0], 2, None).unwrap();
        assert_eq!(ids, vec![2, 1]);
        assert!(distances[0] > distances[1]);
    }

    #[test]
    fn remove_then_reinsert() {
        let mut index = unit_axes();
        index.remove(&[2, 99]);
        assert_eq!(index.len(), 2);
        assert!(!index.contains(2));

        let (ids, _) = index.search(&[0.0, 1.0, 0.0], 3, None).unwrap();
        assert!(!ids.contains(&2));

        index.insert(&[0.0, 1.0, 0.0], 2).unwrap();
        let (ids, _) = index.search(&[0.0, 1.0, 0.0], 1, None).unwrap();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn reinsert_overwrites_vector() {
        let mut index = FlatIndex::new(2, Metric::L2);
        index.insert(&[1.0, 0.0], 1).unwrap();
        index.insert(&[0.0, 1.0], 1).unwrap();
        assert_eq!(index.len(), 1);

        let (_, distances) = index.search(&[0.0, 1.0], 1, None).unwrap();
        assert!(distances[0].abs() < 1e-6);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut index = FlatIndex::new(3, Metric::L2);
        assert!(matches!(
            index.insert(&[1.0, 0.0], 1),
            Err(DbError::DimensionMismatch { .. })
        ));
        assert!(index.search(&[1.0], 1, None).is_err());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.index");

        let index = unit_axes();
        index.save(&path).unwrap();

        let mut restored = FlatIndex::new(3, Metric::L2);
        restored.load(&path).unwrap();
        assert_eq!(restored.len(), 3);

        let (ids, _) = restored.search(&[0.0, 0.0, 1.0], 1, None).unwrap();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn load_missing_file_leaves_index_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = FlatIndex::new(3, Metric::L2);
        index.load(&dir.path().join("absent.index")).unwrap();
        assert!(index.is_empty());
    }
}
