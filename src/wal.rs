//! Write-ahead log and snapshot watermark.
//!
//! One text line per mutating operation: `seq|version|op_type|payload`
//! with the payload as canonical one-line JSON (never contains a raw
//! newline). Seqs are strictly increasing across the life of the store,
//! restarts included. Snapshots never truncate the file; they only advance
//! `last_snapshot_seq`, below which replay skips.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{DbError, Result};
use crate::registry::IndexRegistry;
use crate::storage::ScalarStore;

/// Schema version stamped into every entry.
pub const WAL_VERSION: &str = "1.0";

pub struct Wal {
    path: PathBuf,
    snapshot_dir: PathBuf,
    sidecar_path: PathBuf,
    file: File,
    /// Replay cursor, opened lazily on the first `replay_next`.
    reader: Option<BufReader<File>>,
    current_seq: u64,
    last_snapshot_seq: u64,
}

impl Wal {
    /// Open the log read+write+append, creating it if absent. Failure to
    /// open is fatal. The snapshot watermark is restored from the sidecar
    /// when one exists.
    pub fn open(
        path: impl Into<PathBuf>,
        snapshot_dir: impl Into<PathBuf>,
        sidecar_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DbError::WalOpen {
                    path: path.clone(),
                    source: e,
                })?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| DbError::WalOpen {
                path: path.clone(),
                source: e,
            })?;

        let sidecar_path = sidecar_path.into();
        let last_snapshot_seq = load_sidecar(&sidecar_path);

        Ok(Self {
            path,
            snapshot_dir: snapshot_dir.into(),
            sidecar_path,
            file,
            reader: None,
            // Seqs handed out must stay above everything the snapshot
            // already covers, even when the log tail predates it.
            current_seq: last_snapshot_seq.max(1),
            last_snapshot_seq,
        })
    }

    /// Last seq handed out (or restored).
    pub fn current_seq(&self) -> u64 {
        self.current_seq
    }

    pub fn last_snapshot_seq(&self) -> u64 {
        self.last_snapshot_seq
    }

    /// Pre-increment and return the next seq. Callers serialize writes.
    fn next_seq(&mut self) -> u64 {
        self.current_seq += 1;
        self.current_seq
    }

    /// Append one entry and flush it to the OS. On failure the entry is
    /// non-durable: the error is logged and surfaced, and the caller is
    /// expected to continue without rolling back.
    pub fn append(&mut self, op_type: &str, payload: &Value, version: &str) -> Result<u64> {
        let seq = self.next_seq();
        let line = format!("{seq}|{version}|{op_type}|{payload}\n");

        let write = self
            .file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush());
        match write {
            Ok(()) => {
                debug!(seq, op_type, "wal entry appended");
                Ok(seq)
            }
            Err(e) => {
                error!(seq, op_type, "wal append failed: {e}");
                Err(DbError::WalWrite(e))
            }
        }
    }

    /// Next replayable entry, or `None` at end of log.
    ///
    /// Entries at or below the snapshot watermark are skipped (their
    /// effects are already in the snapshot), but every line read lifts
    /// `current_seq` so new appends continue past the persisted tail.
    /// Malformed lines are skipped with a warning.
    pub fn replay_next(&mut self) -> Result<Option<(String, Value)>> {
        if self.reader.is_none() {
            let file = File::open(&self.path).map_err(|e| DbError::WalOpen {
                path: self.path.clone(),
                source: e,
            })?;
            self.reader = Some(BufReader::new(file));
        }
        // The reader moves out while the loop also updates seq state.
        let mut reader = self.reader.take().expect("replay reader just opened");
        let result = self.read_replayable(&mut reader);
        self.reader = Some(reader);
        result
    }

    fn read_replayable(
        &mut self,
        reader: &mut BufReader<File>,
    ) -> Result<Option<(String, Value)>> {
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                debug!("no more wal entries to replay");
                return Ok(None);
            }
            let trimmed = line.trim_end_matches('\n');
            if trimmed.is_empty() {
                continue;
            }

            let mut parts = trimmed.splitn(4, '|');
            let (Some(seq_str), Some(_version), Some(op_type), Some(payload_str)) = (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
            ) else {
                warn!(line = trimmed, "malformed wal line, skipping");
                continue;
            };

            let seq: u64 = match seq_str.parse() {
                Ok(seq) => seq,
                Err(e) => {
                    warn!(line = trimmed, "unparseable wal seq ({e}), skipping");
                    continue;
                }
            };
            if seq > self.current_seq {
                self.current_seq = seq;
            }

            if seq <= self.last_snapshot_seq {
                debug!(seq, "wal entry below snapshot watermark, skipping");
                continue;
            }

            match serde_json::from_str::<Value>(payload_str) {
                Ok(payload) => {
                    debug!(seq, op_type, "replaying wal entry");
                    return Ok(Some((op_type.to_string(), payload)));
                }
                Err(e) => {
                    warn!(seq, "unparseable wal payload ({e}), skipping");
                    continue;
                }
            }
        }
    }

    /// Dump every registered index, then advance and persist the snapshot
    /// watermark. If the dump fails the watermark is left untouched, so
    /// replay still covers the operations the failed snapshot missed.
    pub fn take_snapshot(&mut self, registry: &IndexRegistry, store: &ScalarStore) -> Result<()> {
        let seq = self.current_seq;
        registry.save_all(&self.snapshot_dir, store)?;

        self.last_snapshot_seq = seq;
        self.save_sidecar()?;
        debug!(seq, "snapshot taken");
        Ok(())
    }

    pub fn load_snapshot(&mut self, registry: &mut IndexRegistry, store: &ScalarStore) -> Result<()> {
        registry.load_all(&self.snapshot_dir, store)
    }

    fn save_sidecar(&self) -> Result<()> {
        let tmp = self.sidecar_path.with_extension("tmp");
        std::fs::write(&tmp, self.last_snapshot_seq.to_string())?;
        std::fs::rename(&tmp, &self.sidecar_path)?;
        if let Some(parent) = self.sidecar_path.parent() {
            if !parent.as_os_str().is_empty() {
                sync_dir(parent)?;
            }
        }
        Ok(())
    }
}

fn load_sidecar(path: &Path) -> u64 {
    match std::fs::read_to_string(path) {
        Ok(text) => match text.trim().parse() {
            Ok(seq) => {
                debug!(seq, "loaded last snapshot seq");
                seq
            }
            Err(e) => {
                warn!(path = %path.display(), "unparseable snapshot sidecar ({e}), assuming 0");
                0
            }
        },
        Err(_) => {
            debug!(path = %path.display(), "no snapshot sidecar, starting from 0");
            0
        }
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn open_wal(dir: &Path) -> Wal {
        Wal::open(
            dir.join("wal.log"),
            dir.join("snapshots"),
            dir.join("lastSnapshotID"),
        )
        .unwrap()
    }

    #[test]
    fn seqs_strictly_increase() {
        let dir = tempdir().unwrap();
        let mut wal = open_wal(dir.path());

        let a = wal.append("upsert", &json!({"id": 1}), WAL_VERSION).unwrap();
        let b = wal.append("upsert", &json!({"id": 2}), WAL_VERSION).unwrap();
        assert!(b > a);
        assert_eq!(wal.current_seq(), b);
    }

    #[test]
    fn replay_returns_entries_in_order() {
        let dir = tempdir().unwrap();
        let mut wal = open_wal(dir.path());
        wal.append("upsert", &json!({"id": 1}), WAL_VERSION).unwrap();
        wal.append("upsert", &json!({"id": 2}), WAL_VERSION).unwrap();

        let mut wal = open_wal(dir.path());
        let (op, payload) = wal.replay_next().unwrap().unwrap();
        assert_eq!(op, "upsert");
        assert_eq!(payload["id"], 1);
        let (_, payload) = wal.replay_next().unwrap().unwrap();
        assert_eq!(payload["id"], 2);
        assert!(wal.replay_next().unwrap().is_none());
    }

    #[test]
    fn replay_restores_seq_counter_across_restart() {
        let dir = tempdir().unwrap();
        let last = {
            let mut wal = open_wal(dir.path());
            wal.append("upsert", &json!({"id": 1}), WAL_VERSION).unwrap();
            wal.append("upsert", &json!({"id": 2}), WAL_VERSION).unwrap()
        };

        let mut wal = open_wal(dir.path());
        while wal.replay_next().unwrap().is_some() {}
        assert_eq!(wal.current_seq(), last);

        let next = wal.append("upsert", &json!({"id": 3}), WAL_VERSION).unwrap();
        assert_eq!(next, last + 1);
    }

    #[test]
    fn payloads_containing_pipes_survive_replay() {
        let dir = tempdir().unwrap();
        let mut wal = open_wal(dir.path());
        wal.append("upsert", &json!({"id": 1, "tag": "a|b|c"}), WAL_VERSION)
            .unwrap();

        let mut wal = open_wal(dir.path());
        let (_, payload) = wal.replay_next().unwrap().unwrap();
        assert_eq!(payload["tag"], "a|b|c");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let mut wal = open_wal(dir.path());
        wal.append("upsert", &json!({"id": 1}), WAL_VERSION).unwrap();
        drop(wal);

        // Corrupt the tail, then add a valid entry after it.
        let path = dir.path().join("wal.log");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"not-a-seq|1.0|upsert|{}\n").unwrap();
        file.write_all(b"garbage line\n").unwrap();
        file.write_all(b"9|1.0|upsert|{broken json\n").unwrap();
        drop(file);

        let mut wal = open_wal(dir.path());
        wal.append("upsert", &json!({"id": 2}), WAL_VERSION).unwrap();
        drop(wal);

        let mut wal = open_wal(dir.path());
        let mut ids = Vec::new();
        while let Some((_, payload)) = wal.replay_next().unwrap() {
            ids.push(payload["id"].as_u64().unwrap());
        }
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn snapshot_watermark_skips_replay_and_persists() {
        let dir = tempdir().unwrap();
        let store = ScalarStore::open(dir.path().join("scalar.redb")).unwrap();
        let registry = IndexRegistry::new();

        let mut wal = open_wal(dir.path());
        wal.append("upsert", &json!({"id": 1}), WAL_VERSION).unwrap();
        wal.take_snapshot(&registry, &store).unwrap();
        let watermark = wal.last_snapshot_seq();
        assert!(watermark > 0);
        wal.append("upsert", &json!({"id": 2}), WAL_VERSION).unwrap();
        drop(wal);

        let mut wal = open_wal(dir.path());
        assert_eq!(wal.last_snapshot_seq(), watermark);

        let mut ids = Vec::new();
        while let Some((_, payload)) = wal.replay_next().unwrap() {
            ids.push(payload["id"].as_u64().unwrap());
        }
        assert_eq!(ids, vec![2], "entries below the watermark are skipped");
    }

    #[test]
    fn watermark_advances_monotonically() {
        let dir = tempdir().unwrap();
        let store = ScalarStore::open(dir.path().join("scalar.redb")).unwrap();
        let registry = IndexRegistry::new();

        let mut wal = open_wal(dir.path());
        wal.append("upsert", &json!({"id": 1}), WAL_VERSION).unwrap();
        wal.take_snapshot(&registry, &store).unwrap();
        let first = wal.last_snapshot_seq();

        wal.append("upsert", &json!({"id": 2}), WAL_VERSION).unwrap();
        wal.take_snapshot(&registry, &store).unwrap();
        assert!(wal.last_snapshot_seq() > first);
    }

    #[test]
    fn seq_counter_respects_watermark_without_log_tail() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("lastSnapshotID"), "40").unwrap();

        let mut wal = open_wal(dir.path());
        assert!(wal.replay_next().unwrap().is_none());
        let seq = wal.append("upsert", &json!({"id": 9}), WAL_VERSION).unwrap();
        assert_eq!(seq, 41);
    }
}
