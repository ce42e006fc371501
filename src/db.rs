//! The vector database facade.
//!
//! Owns the index registry, the scalar store and the WAL behind a single
//! reader/writer lock: mutating operations (upsert, snapshot, replay) hold
//! the write lock for their full duration, while query and search share
//! read locks. Within one search, the filter bitmap and the ANN traversal
//! therefore see one consistent state.
//!
//! Write path: WAL append first, then index inserts, filter updates, and
//! finally the scalar-store overwrite — the scalar store is the
//! authoritative record.

use parking_lot::RwLock;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::DbConfig;
use crate::error::{DbError, Result};
use crate::filter::FilterOp;
use crate::registry::{IndexKind, IndexRegistry};
use crate::storage::ScalarStore;
use crate::wal::{Wal, WAL_VERSION};

/// Search request shape consumed by [`VectorDatabase::search`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    /// One query vector of the configured dimension.
    pub vectors: Vec<f32>,
    pub k: usize,
    #[serde(rename = "indexType")]
    pub index_type: String,
    #[serde(default)]
    pub filter: Option<FilterSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(rename = "fieldName")]
    pub field_name: String,
    pub op: FilterOp,
    pub value: i64,
}

pub struct VectorDatabase {
    dim: usize,
    inner: RwLock<DbInner>,
}

struct DbInner {
    registry: IndexRegistry,
    storage: ScalarStore,
    wal: Wal,
}

impl VectorDatabase {
    /// Open the scalar store and WAL (both fatal on failure) and
    /// initialize every index kind. The database starts empty; call
    /// [`Self::reload_database`] to recover persisted state.
    pub fn open(config: &DbConfig) -> Result<Self> {
        let storage = ScalarStore::open(&config.db_path)?;
        let wal = Wal::open(
            &config.wal_path,
            &config.snapshot_dir,
            &config.snapshot_seq_path,
        )?;

        let mut registry = IndexRegistry::new();
        registry.init(IndexKind::Flat, config.dim, config.max_elements, config.metric);
        registry.init(IndexKind::Hnsw, config.dim, config.max_elements, config.metric);
        registry.init(IndexKind::Filter, config.dim, config.max_elements, config.metric);

        Ok(Self {
            dim: config.dim,
            inner: RwLock::new(DbInner {
                registry,
                storage,
                wal,
            }),
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Insert or update one record.
    ///
    /// The WAL line is appended and flushed before any in-memory effect.
    /// If the append fails the write still applies (it is simply
    /// non-durable) and the failure is surfaced to the caller afterwards.
    pub fn upsert(&self, id: u64, doc: &Value, kind: IndexKind) -> Result<()> {
        let mut inner = self.inner.write();
        let DbInner {
            registry,
            storage,
            wal,
        } = &mut *inner;

        let wal_result = wal.append("upsert", doc, WAL_VERSION);
        if let Err(e) = &wal_result {
            warn!(id, "continuing non-durable upsert after WAL failure: {e}");
        }

        apply_upsert(registry, storage, self.dim, id, doc, kind)?;
        wal_result.map(|_| ())
    }

    /// The stored document for `id`, `Value::Null` when unknown.
    pub fn query(&self, id: u64) -> Result<Value> {
        let inner = self.inner.read();
        inner.storage.get_scalar(id)
    }

    /// Nearest-neighbor search over the requested index, optionally
    /// restricted by a scalar-field predicate.
    ///
    /// The returned ids may contain -1 sentinels from the exact index;
    /// response formatting drops them.
    pub fn search(&self, req: &Value) -> Result<(Vec<i64>, Vec<f32>)> {
        let request: SearchRequest = serde_json::from_value(req.clone())?;
        let kind = IndexKind::from_request(&request.index_type)?;
        if request.vectors.len() != self.dim {
            return Err(DbError::DimensionMismatch {
                expected: self.dim,
                got: request.vectors.len(),
            });
        }

        let inner = self.inner.read();

        let bitmap = match &request.filter {
            Some(spec) => {
                let mut bitmap = RoaringBitmap::new();
                match inner.registry.filter() {
                    Some(filter) => {
                        filter.query(&spec.field_name, spec.op, spec.value, &mut bitmap)
                    }
                    None => error!("filter index not initialized, ignoring search filter"),
                }
                Some(bitmap)
            }
            None => None,
        };

        let result = match kind {
            IndexKind::Flat => match inner.registry.flat() {
                Some(flat) => flat.search(&request.vectors, request.k, bitmap.as_ref())?,
                None => {
                    error!("flat index not initialized, returning empty result");
                    (Vec::new(), Vec::new())
                }
            },
            IndexKind::Hnsw => match inner.registry.graph() {
                Some(graph) => {
                    let hits = match &bitmap {
                        Some(bitmap) => {
                            let member = |label: u64| bitmap.contains(label as u32);
                            graph.search(&request.vectors, request.k, Some(&member))?
                        }
                        None => graph.search(&request.vectors, request.k, None)?,
                    };
                    let mut ids = Vec::with_capacity(hits.len());
                    let mut distances = Vec::with_capacity(hits.len());
                    for (label, distance) in hits {
                        ids.push(label as i64);
                        distances.push(distance);
                    }
                    (ids, distances)
                }
                None => {
                    error!("graph index not initialized, returning empty result");
                    (Vec::new(), Vec::new())
                }
            },
            IndexKind::Filter => return Err(DbError::UnknownIndexType("FILTER".to_string())),
        };

        Ok(result)
    }

    /// Append an arbitrary operation line to the WAL (the HTTP layer's
    /// side of the collaborator contract).
    pub fn write_wal(&self, op: &str, payload: &Value) -> Result<()> {
        let mut inner = self.inner.write();
        inner.wal.append(op, payload, WAL_VERSION).map(|_| ())
    }

    /// Dump all indexes and advance the snapshot watermark.
    pub fn take_snapshot(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let DbInner {
            registry,
            storage,
            wal,
        } = &mut *inner;
        wal.take_snapshot(registry, storage)
    }

    /// Startup recovery: load the snapshot, then re-apply every WAL entry
    /// past the watermark. Replay is best-effort; an entry that fails to
    /// apply is logged and skipped.
    pub fn reload_database(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let DbInner {
            registry,
            storage,
            wal,
        } = &mut *inner;

        info!("reloading database from snapshot and WAL");
        wal.load_snapshot(registry, storage)?;

        let mut replayed = 0usize;
        while let Some((op, payload)) = wal.replay_next()? {
            if op != "upsert" {
                warn!(op, "unhandled wal operation, skipping");
                continue;
            }
            let Some(id) = payload.get("id").and_then(Value::as_u64) else {
                warn!("wal upsert without id, skipping");
                continue;
            };
            let kind = match payload
                .get("indexType")
                .and_then(Value::as_str)
                .map(IndexKind::from_request)
            {
                Some(Ok(kind)) => kind,
                _ => {
                    warn!(id, "wal upsert without a known indexType, skipping");
                    continue;
                }
            };
            if let Err(e) = apply_upsert(registry, storage, self.dim, id, &payload, kind) {
                warn!(id, "failed to re-apply wal upsert: {e}");
                continue;
            }
            replayed += 1;
        }

        info!(
            replayed,
            current_seq = wal.current_seq(),
            last_snapshot_seq = wal.last_snapshot_seq(),
            "database reload complete"
        );
        Ok(())
    }

    /// Last seq handed out by the WAL.
    pub fn current_seq(&self) -> u64 {
        self.inner.read().wal.current_seq()
    }

    /// Seq covered by the most recent snapshot.
    pub fn last_snapshot_seq(&self) -> u64 {
        self.inner.read().wal.last_snapshot_seq()
    }
}

/// Upsert steps 2-5: old-index removal, new-index insert, filter update,
/// scalar overwrite. Shared between the write path and WAL replay (which
/// must not re-append).
fn apply_upsert(
    registry: &mut IndexRegistry,
    storage: &ScalarStore,
    dim: usize,
    id: u64,
    doc: &Value,
    kind: IndexKind,
) -> Result<()> {
    let Some(members) = doc.as_object() else {
        return Err(DbError::invalid("upsert document must be a JSON object"));
    };

    let existing = storage.get_scalar(id)?;
    let existing_members = existing.as_object();

    // Remove the old vector from the index the existing record lives in,
    // so a changed indexType moves the point rather than duplicating it.
    if let Some(old) = existing_members {
        let old_kind = old
            .get("indexType")
            .and_then(Value::as_str)
            .and_then(|s| IndexKind::from_request(s).ok())
            .unwrap_or(kind);
        match old_kind {
            IndexKind::Flat => match registry.flat_mut() {
                Some(flat) => flat.remove(&[id]),
                None => error!("flat index not initialized, cannot remove old vector"),
            },
            IndexKind::Hnsw => match registry.graph_mut() {
                Some(graph) => graph.remove(&[id]),
                None => error!("graph index not initialized, cannot remove old vector"),
            },
            IndexKind::Filter => {}
        }
    }

    let vector = parse_vectors(doc, dim)?;
    match kind {
        IndexKind::Flat => match registry.flat_mut() {
            Some(flat) => flat.insert(&vector, id)?,
            None => error!("flat index not initialized, dropping insert"),
        },
        IndexKind::Hnsw => match registry.graph_mut() {
            Some(graph) => graph.insert(&vector, id)?,
            None => error!("graph index not initialized, dropping insert"),
        },
        IndexKind::Filter => {
            return Err(DbError::invalid("FILTER is not an upsert target"));
        }
    }

    match registry.filter_mut() {
        Some(filter) => {
            for (field, value) in members {
                let Some(new_value) = value.as_i64() else {
                    continue;
                };
                if field == "id" {
                    continue;
                }
                let old_value = existing_members
                    .and_then(|old| old.get(field))
                    .and_then(Value::as_i64);
                filter.update(field, old_value, new_value, id);
            }
        }
        None => error!("filter index not initialized, dropping scalar-field update"),
    }

    storage.insert_scalar(id, doc)
}

/// Extract `doc.vectors` as a `dim`-length f32 array.
fn parse_vectors(doc: &Value, dim: usize) -> Result<Vec<f32>> {
    let values = doc
        .get("vectors")
        .and_then(Value::as_array)
        .ok_or_else(|| DbError::invalid("missing or non-array \"vectors\" member"))?;
    if values.len() != dim {
        return Err(DbError::DimensionMismatch {
            expected: dim,
            got: values.len(),
        });
    }
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| DbError::invalid("non-numeric entry in \"vectors\""))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn open_db(dir: &std::path::Path, dim: usize) -> VectorDatabase {
        let config = DbConfig::from_data_dir(dir, dim);
        VectorDatabase::open(&config).unwrap()
    }

    #[test]
    fn upsert_then_query_roundtrips() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 3);

        let doc = json!({"id": 1, "vectors": [1.0, 0.0, 0.0], "indexType": "FLAT"});
        db.upsert(1, &doc, IndexKind::Flat).unwrap();

        assert_eq!(db.query(1).unwrap(), doc);
        assert_eq!(db.query(2).unwrap(), Value::Null);
    }

    #[test]
    fn search_request_parses_wire_ops() {
        let req: SearchRequest = serde_json::from_value(json!({
            "vectors": [0.1, 0.2],
            "k": 5,
            "indexType": "FLAT",
            "filter": {"fieldName": "category", "op": "=", "value": 7}
        }))
        .unwrap();
        assert_eq!(req.filter.unwrap().op, FilterOp::Equal);

        let req: SearchRequest = serde_json::from_value(json!({
            "vectors": [0.1, 0.2],
            "k": 5,
            "indexType": "HNSW",
            "filter": {"fieldName": "category", "op": "NOT_EQUAL", "value": 7}
        }))
        .unwrap();
        assert_eq!(req.filter.unwrap().op, FilterOp::NotEqual);
    }

    #[test]
    fn search_rejects_unknown_index_type() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 2);
        let err = db
            .search(&json!({"vectors": [0.0, 0.0], "k": 1, "indexType": "IVF"}))
            .unwrap_err();
        assert!(matches!(err, DbError::UnknownIndexType(_)));
    }

    #[test]
    fn search_rejects_wrong_dimension() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 3);
        let err = db
            .search(&json!({"vectors": [0.0], "k": 1, "indexType": "FLAT"}))
            .unwrap_err();
        assert!(matches!(err, DbError::DimensionMismatch { .. }));
    }

    #[test]
    fn upsert_rejects_missing_vectors() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 3);
        let err = db
            .upsert(1, &json!({"id": 1, "indexType": "FLAT"}), IndexKind::Flat)
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidRequest(_)));
    }

    #[test]
    fn write_wal_advances_seq() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 2);
        let before = db.current_seq();
        db.write_wal("upsert", &json!({"id": 1})).unwrap();
        assert!(db.current_seq() > before);
    }
}
