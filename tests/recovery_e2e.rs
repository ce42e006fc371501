//! Restart and recovery: WAL replay with and without snapshots must
//! reproduce the pre-restart state, and the snapshot watermark must
//! bound what replay re-applies.

use serde_json::json;
use tempfile::tempdir;

use lodestone::{DbConfig, IndexKind, VectorDatabase};

fn config(dir: &std::path::Path, dim: usize) -> DbConfig {
    DbConfig::from_data_dir(dir, dim)
}

fn doc(id: u64, vector: [f32; 3], kind: &str) -> serde_json::Value {
    json!({"id": id, "vectors": vector, "indexType": kind, "bucket": (id % 3) as i64})
}

fn upsert(db: &VectorDatabase, id: u64, vector: [f32; 3], kind: &str) {
    let kind_enum = match kind {
        "FLAT" => IndexKind::Flat,
        _ => IndexKind::Hnsw,
    };
    db.upsert(id, &doc(id, vector, kind), kind_enum).unwrap();
}

fn vector_for(id: u64) -> [f32; 3] {
    let x = id as f32;
    [x, x * 0.5, 1.0 - x * 0.01]
}

#[test]
fn replay_without_snapshot_restores_everything() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 3);

    {
        let db = VectorDatabase::open(&cfg).unwrap();
        for id in 0..20 {
            upsert(&db, id, vector_for(id), "FLAT");
        }
        // No snapshot, simulated crash: the facade is just dropped.
    }

    let db = VectorDatabase::open(&cfg).unwrap();
    db.reload_database().unwrap();

    for id in 0..20 {
        let stored = db.query(id).unwrap();
        assert_eq!(stored["id"], id);

        let (ids, distances) = db
            .search(&json!({"vectors": vector_for(id), "k": 1, "indexType": "FLAT"}))
            .unwrap();
        assert_eq!(ids, vec![id as i64]);
        assert!(distances[0].abs() < 1e-4);
    }
}

#[test]
fn snapshot_then_tail_replay_restores_all_records() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 3);

    let (watermark, seq_at_crash) = {
        let db = VectorDatabase::open(&cfg).unwrap();
        for id in 1..=100 {
            upsert(&db, id, vector_for(id), "FLAT");
        }
        db.take_snapshot().unwrap();
        let watermark = db.last_snapshot_seq();

        for id in 101..=150 {
            upsert(&db, id, vector_for(id), "FLAT");
        }
        (watermark, db.current_seq())
    };

    let db = VectorDatabase::open(&cfg).unwrap();
    db.reload_database().unwrap();

    // Both the snapshotted prefix and the WAL tail are visible.
    for id in [1u64, 50, 100, 101, 150] {
        assert_eq!(db.query(id).unwrap()["id"], id);
        let (ids, _) = db
            .search(&json!({"vectors": vector_for(id), "k": 1, "indexType": "FLAT"}))
            .unwrap();
        assert_eq!(ids, vec![id as i64]);
    }

    assert_eq!(db.last_snapshot_seq(), watermark);
    assert_eq!(db.current_seq(), seq_at_crash);
}

#[test]
fn post_restart_state_is_indistinguishable_for_filters() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 3);

    let before = {
        let db = VectorDatabase::open(&cfg).unwrap();
        for id in 0..30 {
            upsert(&db, id, vector_for(id), "FLAT");
        }
        db.take_snapshot().unwrap();
        db.search(&json!({
            "vectors": vector_for(9),
            "k": 5,
            "indexType": "FLAT",
            "filter": {"fieldName": "bucket", "op": "=", "value": 0}
        }))
        .unwrap()
    };

    let db = VectorDatabase::open(&cfg).unwrap();
    db.reload_database().unwrap();

    let after = db
        .search(&json!({
            "vectors": vector_for(9),
            "k": 5,
            "indexType": "FLAT",
            "filter": {"fieldName": "bucket", "op": "=", "value": 0}
        }))
        .unwrap();

    assert_eq!(before, after);
}

#[test]
fn hnsw_records_survive_snapshot_and_replay() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 3);

    {
        let db = VectorDatabase::open(&cfg).unwrap();
        for id in 0..40 {
            upsert(&db, id, vector_for(id), "HNSW");
        }
        db.take_snapshot().unwrap();
        for id in 40..60 {
            upsert(&db, id, vector_for(id), "HNSW");
        }
    }

    let db = VectorDatabase::open(&cfg).unwrap();
    db.reload_database().unwrap();

    for id in [0u64, 20, 39, 40, 59] {
        let (ids, distances) = db
            .search(&json!({"vectors": vector_for(id), "k": 1, "indexType": "HNSW"}))
            .unwrap();
        assert_eq!(ids, vec![id as i64]);
        assert!(distances[0].abs() < 1e-4);
    }
}

#[test]
fn duplicate_upserts_across_snapshot_appear_once() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 3);

    {
        let db = VectorDatabase::open(&cfg).unwrap();
        upsert(&db, 7, [1.0, 2.0, 3.0], "FLAT");
        db.take_snapshot().unwrap();
        // Same id, same vector, after the snapshot.
        upsert(&db, 7, [1.0, 2.0, 3.0], "FLAT");
        db.take_snapshot().unwrap();
        upsert(&db, 7, [1.0, 2.0, 3.0], "FLAT");
    }

    let db = VectorDatabase::open(&cfg).unwrap();
    db.reload_database().unwrap();

    let (ids, _) = db
        .search(&json!({"vectors": [1.0, 2.0, 3.0], "k": 5, "indexType": "FLAT"}))
        .unwrap();
    let live: Vec<i64> = ids.into_iter().filter(|id| *id >= 0).collect();
    assert_eq!(live, vec![7], "record must appear exactly once in the index");
}

#[test]
fn watermark_strictly_increases_across_snapshots() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 3);
    let db = VectorDatabase::open(&cfg).unwrap();

    upsert(&db, 1, [0.0, 0.0, 0.0], "FLAT");
    db.take_snapshot().unwrap();
    let first = db.last_snapshot_seq();
    assert!(first > 0);

    upsert(&db, 2, [0.0, 0.0, 1.0], "FLAT");
    db.take_snapshot().unwrap();
    assert!(db.last_snapshot_seq() > first);
}

#[test]
fn reload_on_fresh_directory_is_a_no_op() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 3);

    let db = VectorDatabase::open(&cfg).unwrap();
    // Neither snapshot files nor WAL entries exist yet.
    db.reload_database().unwrap();

    let (ids, _) = db
        .search(&json!({"vectors": [0.0, 0.0, 0.0], "k": 1, "indexType": "FLAT"}))
        .unwrap();
    assert_eq!(ids, vec![-1]);
}

#[test]
fn cross_kind_move_survives_restart() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 3);

    {
        let db = VectorDatabase::open(&cfg).unwrap();
        upsert(&db, 5, [1.0, 2.0, 3.0], "FLAT");
        upsert(&db, 5, [1.0, 2.0, 3.0], "HNSW");
    }

    let db = VectorDatabase::open(&cfg).unwrap();
    db.reload_database().unwrap();

    let (flat_ids, _) = db
        .search(&json!({"vectors": [1.0, 2.0, 3.0], "k": 1, "indexType": "FLAT"}))
        .unwrap();
    assert!(flat_ids.iter().all(|id| *id == -1));

    let (hnsw_ids, _) = db
        .search(&json!({"vectors": [1.0, 2.0, 3.0], "k": 1, "indexType": "HNSW"}))
        .unwrap();
    assert_eq!(hnsw_ids, vec![5]);
}
