//! Scalar-attribute filter index.
//!
//! Two-level mapping `field name → value → bitmap of record ids`, used to
//! restrict ANN searches to records whose integer fields match an
//! equality / inequality predicate. Bitmaps are compressed roaring sets of
//! u32; record ids are narrowed at this boundary.

use std::collections::{BTreeMap, HashMap};

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DbError, Result};
use crate::storage::ScalarStore;

/// Supported filter predicates. Range operators are deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=", alias = "EQUAL")]
    Equal,
    #[serde(rename = "!=", alias = "NOT_EQUAL")]
    NotEqual,
}

#[derive(Debug, Clone, Default)]
pub struct FilterIndex {
    fields: HashMap<String, BTreeMap<i64, RoaringBitmap>>,
}

impl FilterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` into the bucket for (`field`, `value`), creating the
    /// bucket if needed.
    pub fn add(&mut self, field: &str, value: i64, id: u64) {
        self.fields
            .entry(field.to_string())
            .or_default()
            .entry(value)
            .or_default()
            .insert(id as u32);
        debug!(field, value, id, "filter add");
    }

    /// Move `id` from its old bucket (when known) into the bucket for
    /// `new_value`. An entirely unknown field degenerates to [`Self::add`].
    pub fn update(&mut self, field: &str, old_value: Option<i64>, new_value: i64, id: u64) {
        let Some(values) = self.fields.get_mut(field) else {
            self.add(field, new_value, id);
            return;
        };

        if let Some(old) = old_value {
            if let Some(bitmap) = values.get_mut(&old) {
                bitmap.remove(id as u32);
            }
        }
        values.entry(new_value).or_default().insert(id as u32);
        debug!(field, ?old_value, new_value, id, "filter update");
    }

    /// OR the matching buckets into `out`.
    ///
    /// EQUAL unions the single bucket for `value` (nothing when absent);
    /// NOT_EQUAL unions every other bucket of the field.
    pub fn query(&self, field: &str, op: FilterOp, value: i64, out: &mut RoaringBitmap) {
        let Some(values) = self.fields.get(field) else {
            return;
        };

        match op {
            FilterOp::Equal => {
                if let Some(bitmap) = values.get(&value) {
                    *out |= bitmap;
                }
            }
            FilterOp::NotEqual => {
                for (bucket_value, bitmap) in values {
                    if *bucket_value != value {
                        *out |= bitmap;
                    }
                }
            }
        }
    }

    /// Serialize to the length-prefixed entry format:
    /// `field|value|byte_len|` in ASCII, then exactly `byte_len` portable
    /// bitmap bytes, then a newline. The prefix keeps the binary bitmap
    /// payload unambiguous even when it contains `|` or `\n`.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for (field, values) in &self.fields {
            if field.contains('|') || field.contains('\n') {
                return Err(DbError::invalid(format!(
                    "filter field name {field:?} contains a framing delimiter"
                )));
            }
            for (value, bitmap) in values {
                let mut bytes = Vec::with_capacity(bitmap.serialized_size());
                bitmap.serialize_into(&mut bytes).map_err(DbError::Io)?;
                out.extend_from_slice(field.as_bytes());
                out.push(b'|');
                out.extend_from_slice(value.to_string().as_bytes());
                out.push(b'|');
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b'|');
                out.extend_from_slice(&bytes);
                out.push(b'\n');
            }
        }
        Ok(out)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut index = FilterIndex::new();
        let mut pos = 0usize;

        while pos < data.len() {
            let field = read_delimited(data, &mut pos)?;
            let value: i64 = read_delimited(data, &mut pos)?
                .parse()
                .map_err(|e| DbError::corrupt(format!("filter entry value: {e}")))?;
            let len: usize = read_delimited(data, &mut pos)?
                .parse()
                .map_err(|e| DbError::corrupt(format!("filter entry length: {e}")))?;

            let end = pos
                .checked_add(len)
                .filter(|end| *end < data.len())
                .ok_or_else(|| DbError::corrupt("filter entry truncated"))?;
            let bitmap = RoaringBitmap::deserialize_from(&data[pos..end])
                .map_err(|e| DbError::corrupt(format!("filter bitmap: {e}")))?;
            if data[end] != b'\n' {
                return Err(DbError::corrupt("filter entry missing terminator"));
            }
            pos = end + 1;

            index
                .fields
                .entry(field)
                .or_default()
                .insert(value, bitmap);
        }

        Ok(index)
    }

    /// Persist the serialized form through the scalar KV under `key`.
    pub fn save(&self, store: &ScalarStore, key: &str) -> Result<()> {
        store.put(key, &self.serialize()?)
    }

    /// Load from the scalar KV. An absent key yields an empty index.
    pub fn load(store: &ScalarStore, key: &str) -> Result<Self> {
        match store.get(key)? {
            Some(bytes) => Self::deserialize(&bytes),
            None => {
                warn!(key, "no persisted filter index, starting empty");
                Ok(Self::new())
            }
        }
    }

    #[cfg(test)]
    fn bucket(&self, field: &str, value: i64) -> Option<&RoaringBitmap> {
        self.fields.get(field)?.get(&value)
    }
}

/// Read up to the next `|`, advancing `pos` past it.
fn read_delimited(data: &[u8], pos: &mut usize) -> Result<String> {
    let start = *pos;
    let rel = data[start..]
        .iter()
        .position(|b| *b == b'|')
        .ok_or_else(|| DbError::corrupt("filter entry missing delimiter"))?;
    let text = std::str::from_utf8(&data[start..start + rel])
        .map_err(|e| DbError::corrupt(format!("filter entry not utf-8: {e}")))?
        .to_string();
    *pos = start + rel + 1;
    Ok(text)
}
