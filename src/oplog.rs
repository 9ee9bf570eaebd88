//! Persistent op log: an ordered map from HLC strings to operations.
//!
//! The in-memory `BTreeMap` is the authority for iteration; a storage
//! directory mirrors it as an append-only JSON-lines file, alongside the
//! single SQL snapshot slot and a small key/value meta store. Keys sort in
//! causal-consistent order, so `since(cursor)` is a range scan past a key
//! the log knows; a cursor it does not know falls back to the whole log.
//! Append-only in this version; no compaction.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::ops::Operation;

const OPS_FILE: &str = "ops.log";
const SNAPSHOT_FILE: &str = "db.snapshot";
const META_FILE: &str = "meta.json";

pub struct OpLog {
    entries: BTreeMap<String, Operation>,
    meta: HashMap<String, String>,
    storage: Option<LogStorage>,
    /// Snapshot slot when running without a storage directory.
    snapshot_mem: Option<Vec<u8>>,
}

struct LogStorage {
    dir: PathBuf,
    ops_file: BufWriter<File>,
}

impl OpLog {
    /// Volatile log for tests and throwaway nodes.
    pub fn in_memory() -> Self {
        Self {
            entries: BTreeMap::new(),
            meta: HashMap::new(),
            storage: None,
            snapshot_mem: None,
        }
    }

    /// Opens (or creates) a storage directory and replays the op file into
    /// memory. Later records win on duplicate keys.
    pub fn open(dir: &Path) -> SyncResult<Self> {
        std::fs::create_dir_all(dir)?;

        let mut entries = BTreeMap::new();
        let ops_path = dir.join(OPS_FILE);
        if ops_path.exists() {
            let reader = BufReader::new(File::open(&ops_path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Operation>(&line) {
                    Ok(op) => {
                        entries.insert(op.version(), op);
                    }
                    Err(e) => warn!("skipping unreadable op log line: {e}"),
                }
            }
        }

        let meta_path = dir.join(META_FILE);
        let meta = if meta_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?
        } else {
            HashMap::new()
        };

        let ops_file = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&ops_path)?,
        );

        info!(
            dir = %dir.display(),
            ops = entries.len(),
            "op log opened"
        );
        Ok(Self {
            entries,
            meta,
            storage: Some(LogStorage {
                dir: dir.to_path_buf(),
                ops_file,
            }),
            snapshot_mem: None,
        })
    }

    /// Appends one operation, keyed by its HLC string. Duplicate keys are a
    /// no-op (the payload for a given key never differs). Returns whether
    /// the entry was new. Durable before returning.
    pub fn append(&mut self, op: &Operation) -> SyncResult<bool> {
        let key = op.version();
        if self.entries.contains_key(&key) {
            debug!(key = %key, "duplicate op append ignored");
            return Ok(false);
        }
        if let Some(storage) = &mut self.storage {
            serde_json::to_writer(&mut storage.ops_file, op)?;
            storage.ops_file.write_all(b"\n")?;
            storage.ops_file.flush()?;
        }
        self.entries.insert(key, op.clone());
        Ok(true)
    }

    /// Entries with key strictly greater than `cursor`, in key order.
    /// `None` yields the whole log, and so does a cursor that is not a
    /// known key: the requester's view cannot be trusted, so the full log
    /// is the fallback that guarantees convergence.
    pub fn since<'a>(
        &'a self,
        cursor: Option<&str>,
    ) -> impl Iterator<Item = &'a Operation> + 'a {
        let lower = match cursor {
            Some(c) if self.entries.contains_key(c) => Bound::Excluded(c.to_string()),
            _ => Bound::Unbounded,
        };
        self.entries
            .range((lower, Bound::Unbounded))
            .map(|(_, op)| op)
    }

    pub fn count(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Operation> {
        self.entries.get(key)
    }

    /// Greatest key in the log, i.e. the node's current version.
    pub fn latest_version(&self) -> Option<String> {
        self.entries.keys().next_back().cloned()
    }

    /// Writes the SQL snapshot slot (temp file + atomic rename on disk).
    pub fn snapshot_db(&mut self, bytes: &[u8]) -> SyncResult<()> {
        match &self.storage {
            Some(storage) => {
                let tmp = storage.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
                std::fs::write(&tmp, bytes)?;
                std::fs::rename(&tmp, storage.dir.join(SNAPSHOT_FILE))?;
            }
            None => self.snapshot_mem = Some(bytes.to_vec()),
        }
        Ok(())
    }

    pub fn load_db(&self) -> SyncResult<Option<Vec<u8>>> {
        match &self.storage {
            Some(storage) => {
                let path = storage.dir.join(SNAPSHOT_FILE);
                if path.exists() {
                    Ok(Some(std::fs::read(path)?))
                } else {
                    Ok(None)
                }
            }
            None => Ok(self.snapshot_mem.clone()),
        }
    }

    pub fn meta_get(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(|v| v.as_str())
    }

    pub fn meta_set(&mut self, key: &str, value: &str) -> SyncResult<()> {
        self.meta.insert(key.to_string(), value.to_string());
        if let Some(storage) = &self.storage {
            let tmp = storage.dir.join(format!("{META_FILE}.tmp"));
            std::fs::write(&tmp, serde_json::to_string(&self.meta)?)?;
            std::fs::rename(&tmp, storage.dir.join(META_FILE))?;
        }
        Ok(())
    }
}
