//! Provides store (component C4, spec §4.4) and the logical provides
//! view layered on top of it (spec §3 "Provides store").
//!
//! Grounded on `lib/src/store/mod.rs`'s `Storage` wrapper (a struct that
//! owns the crash-relevant handle and exposes narrow accessors) and on
//! the teacher's general preference for `anyhow::Context`-annotated IO.
//! The backing engine is `redb`, a B-tree-backed, ACID, fsync-on-commit
//! embedded database — the closest idiomatic match to spec §4.4's
//! "crash-safe embedded key/value store (B-tree-backed)" requirement
//! that the teacher's own dependency stack does not otherwise provide.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fn_error_context::context;
use redb::{Database, ReadableTable, TableDefinition};
use rustix::fs::{flock, FlockOperation};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::state_machine::State;

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Current on-disk schema version for [`StateData`]; bumped whenever its
/// shape changes in a way older readers can't tolerate (spec §9).
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

const KEY_ARTIFACT_NAME: &str = "artifact-name";
const KEY_ARTIFACT_GROUP: &str = "artifact-group";
const KEY_ARTIFACT_PROVIDES: &str = "artifact-provides";
const KEY_STATE: &str = "state";
const KEY_STATE_UNCOMMITTED: &str = "state-uncommitted";
const KEY_STANDALONE_STATE: &str = "standalone-state";

/// The persistent key/value database (spec §4.4) plus the process-local
/// advisory lock that keeps a concurrently-running CLI verb and daemon
/// from mutating it at the same time (spec §5).
pub struct ProvidesStore {
    db: Database,
    _lock: File,
}

impl ProvidesStore {
    /// Open (creating if necessary) the store rooted at `datastore_dir`.
    #[context("Opening provides store at {datastore_dir:?}")]
    pub fn open(datastore_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(datastore_dir)
            .with_context(|| format!("creating datastore dir {datastore_dir:?}"))?;
        let lock = acquire_lock(datastore_dir)?;
        let db_path = datastore_dir.join("store.db");
        let db = Database::create(&db_path)
            .with_context(|| format!("opening database {db_path:?}"))?;
        // Ensure the table exists even on a brand new database.
        let txn = db.begin_write()?;
        {
            txn.open_table(TABLE)?;
        }
        txn.commit()?;
        Ok(Self { db, _lock: lock })
    }

    /// Durably write `value` under `key`; visible to all future opens
    /// once this call returns (spec §4.4).
    pub fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TABLE)?;
            table.insert(key, value)?;
        }
        txn.commit().map_err(|e| EngineError::StorageError(e.to_string()))?;
        Ok(())
    }

    /// Read the value stored under `key`, if any.
    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    /// Remove `key`; returns whether it was present.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let existed = {
            let mut table = txn.open_table(TABLE)?;
            let removed = table.remove(key)?;
            removed.is_some()
        };
        txn.commit().map_err(|e| EngineError::StorageError(e.to_string()))?;
        Ok(existed)
    }

    /// Run `f` against a consistent snapshot, committing its write set
    /// atomically on success and persisting nothing on error (spec
    /// §4.4's `transaction` contract; used for the commit step of §4.5).
    pub fn transaction<T>(&self, f: impl FnOnce(&mut StoreTxn) -> Result<T>) -> Result<T> {
        let txn = self.db.begin_write()?;
        let result = {
            let mut wrapper = StoreTxn { txn: &txn };
            f(&mut wrapper)
        };
        match result {
            Ok(value) => {
                txn.commit().map_err(|e| EngineError::StorageError(e.to_string()))?;
                Ok(value)
            }
            Err(e) => {
                // Dropping an uncommitted redb WriteTransaction discards
                // its write set; nothing further to do.
                Err(e)
            }
        }
    }

    /// Load the logical provides view (spec §3): reserved keys plus the
    /// free-form application provides map.
    pub fn load_provides(&self) -> Result<Provides> {
        let artifact_name = self
            .read(KEY_ARTIFACT_NAME)?
            .map(bytes_to_string)
            .transpose()?
            .unwrap_or_default();
        let artifact_group = self.read(KEY_ARTIFACT_GROUP)?.map(bytes_to_string).transpose()?;
        let extra = match self.read(KEY_ARTIFACT_PROVIDES)? {
            Some(bytes) => serde_json::from_slice(&bytes).context("decoding artifact-provides")?,
            None => BTreeMap::new(),
        };
        Ok(Provides {
            artifact_name,
            artifact_group,
            extra,
        })
    }

    /// Read the current checkpoint, if any. Per spec §3's invariant, the
    /// uncommitted record wins when both are present.
    pub fn read_state_data(&self) -> Result<Option<StateData>> {
        if let Some(bytes) = self.read(KEY_STATE_UNCOMMITTED)? {
            return Ok(Some(serde_json::from_slice(&bytes).context("decoding state-uncommitted")?));
        }
        if let Some(bytes) = self.read(KEY_STATE)? {
            return Ok(Some(serde_json::from_slice(&bytes).context("decoding state")?));
        }
        Ok(None)
    }

    /// Persist a checkpoint. If the currently-committed `state` record
    /// carries a schema this process doesn't understand, writes are
    /// shadowed into `state-uncommitted` instead of clobbering it (spec
    /// §9's resolution for schema evolution).
    pub fn write_state_data(&self, data: &StateData) -> Result<()> {
        let shadow = match self.read(KEY_STATE)? {
            Some(bytes) => {
                let existing: serde_json::Value =
                    serde_json::from_slice(&bytes).context("decoding state for schema check")?;
                existing
                    .get("schema_version")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as u32 > CURRENT_SCHEMA_VERSION)
                    .unwrap_or(false)
            }
            None => false,
        };
        let key = if shadow { KEY_STATE_UNCOMMITTED } else { KEY_STATE };
        self.write(key, &serde_json::to_vec(data)?)
    }

    /// Clear both checkpoint records (return to `Idle`, nothing in
    /// progress). The uncommitted record is always discarded on commit
    /// per spec §3's invariant.
    pub fn clear_state_data(&self) -> Result<()> {
        self.remove(KEY_STATE)?;
        self.remove(KEY_STATE_UNCOMMITTED)?;
        Ok(())
    }

    /// Standalone-CLI scratch data (spec §3 "standalone_data").
    pub fn read_standalone_data(&self) -> Result<Option<Vec<u8>>> {
        self.read(KEY_STANDALONE_STATE)
    }

    /// Persist standalone-CLI scratch data.
    pub fn write_standalone_data(&self, data: &[u8]) -> Result<()> {
        self.write(KEY_STANDALONE_STATE, data)
    }

    /// Clear standalone-CLI scratch data.
    pub fn clear_standalone_data(&self) -> Result<()> {
        self.remove(KEY_STANDALONE_STATE)?;
        Ok(())
    }
}

/// A write transaction in progress; exposes the same narrow put/delete
/// surface as [`ProvidesStore`] so the depends-resolver commit logic
/// (spec §4.5) doesn't need to know it's inside one.
pub struct StoreTxn<'a> {
    txn: &'a redb::WriteTransaction,
}

impl StoreTxn<'_> {
    /// Write `value` under `key` as part of the enclosing transaction.
    pub fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let mut table = self.txn.open_table(TABLE)?;
        table.insert(key, value)?;
        Ok(())
    }

    /// Delete `key` as part of the enclosing transaction.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        let mut table = self.txn.open_table(TABLE)?;
        table.remove(key)?;
        Ok(())
    }

    /// Persist the full logical [`Provides`] view (spec §4.5 commit
    /// rule 2/3: merge provides, overwrite name/group).
    pub fn put_provides(&mut self, provides: &Provides) -> Result<()> {
        self.put(KEY_ARTIFACT_NAME, provides.artifact_name.as_bytes())?;
        match &provides.artifact_group {
            Some(g) => self.put(KEY_ARTIFACT_GROUP, g.as_bytes())?,
            None => self.delete(KEY_ARTIFACT_GROUP)?,
        }
        self.put(KEY_ARTIFACT_PROVIDES, &serde_json::to_vec(&provides.extra)?)?;
        Ok(())
    }
}

/// The logical flat key/value provides view spec §3 describes: reserved
/// `artifact_name`/`artifact_group` plus application-defined keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provides {
    /// The currently-booted artifact's name.
    pub artifact_name: String,
    /// The currently-booted artifact's group, if any.
    pub artifact_group: Option<String>,
    /// Application-defined provides contributed by sub-header payloads.
    pub extra: BTreeMap<String, String>,
}

impl Provides {
    /// Look up any key, reserved or application-defined.
    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "artifact_name" => Some(self.artifact_name.as_str()),
            "artifact_group" => self.artifact_group.as_deref(),
            other => self.extra.get(other).map(String::as_str),
        }
    }

    /// Iterate every key/value, reserved keys first, for `show-provides`.
    pub fn iter(&self) -> impl Iterator<Item = (String, String)> + '_ {
        let reserved = std::iter::once(("artifact_name".to_string(), self.artifact_name.clone()))
            .chain(
                self.artifact_group
                    .clone()
                    .map(|g| ("artifact_group".to_string(), g)),
            );
        reserved.chain(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())))
    }

    /// Remove every key matching any of `patterns`, in declared order
    /// (spec §4.5 commit rule 1: "effects compound").
    pub fn apply_clears(&mut self, patterns: &[String]) -> Result<()> {
        for pattern in patterns {
            self.extra.retain(|k, _| !crate::glob::matches(pattern, k).unwrap_or(false));
        }
        Ok(())
    }

    /// Merge `provides` into `self.extra` (spec §4.5 commit rule 2).
    pub fn merge(&mut self, provides: &BTreeMap<String, String>) {
        for (k, v) in provides {
            self.extra.insert(k.clone(), v.clone());
        }
    }
}

/// The persisted state-machine checkpoint (spec §3 "state_data", §9
/// schema evolution).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateData {
    /// Schema version this record was written with.
    pub schema_version: u32,
    /// The state the engine will resume into.
    pub state: State,
    /// Which payload index is in progress.
    pub payload_index: usize,
    /// The artifact name being installed, for diagnostics.
    pub update_name: Option<String>,
    /// True if the transition that wrote this checkpoint declared
    /// itself safe to resume across an unplanned reboot (spec §4.9
    /// "Spontaneous-reboot detection").
    pub reboot_safe: bool,
    /// The in-progress artifact's parsed header, serialized, so a
    /// `commit`/`rollback` issued from a fresh process (after a crash or
    /// a manual reboot) can reconstruct the installer and re-run the
    /// depends commit rule without re-parsing the artifact.
    pub header_json: Option<Vec<u8>>,
}

impl StateData {
    /// Build a checkpoint for the current schema version.
    pub fn new(
        state: State,
        payload_index: usize,
        update_name: Option<String>,
        reboot_safe: bool,
        header_json: Option<Vec<u8>>,
    ) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            state,
            payload_index,
            update_name,
            reboot_safe,
            header_json,
        }
    }
}

fn bytes_to_string(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).context("store value is not valid UTF-8")
}

fn acquire_lock(datastore_dir: &Path) -> Result<File> {
    let lock_path: PathBuf = datastore_dir.join(".supdated.lock");
    let lock = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("opening lock file {lock_path:?}"))?;
    flock(&lock, FlockOperation::NonBlockingLockExclusive)
        .map_err(|_| EngineError::StorageError("store is locked by another process".into()))?;
    Ok(lock)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_store() -> (tempfile::TempDir, ProvidesStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProvidesStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn write_read_remove_roundtrip() {
        let (_dir, store) = tmp_store();
        store.write("k", b"v").unwrap();
        assert_eq!(store.read("k").unwrap(), Some(b"v".to_vec()));
        assert!(store.remove("k").unwrap());
        assert_eq!(store.read("k").unwrap(), None);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let (_dir, store) = tmp_store();
        let result: Result<()> = store.transaction(|txn| {
            txn.put("k", b"v")?;
            anyhow::bail!("boom")
        });
        assert!(result.is_err());
        assert_eq!(store.read("k").unwrap(), None);
    }

    #[test]
    fn transaction_commits_on_success() {
        let (_dir, store) = tmp_store();
        store
            .transaction(|txn| {
                txn.put("k", b"v")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.read("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn uncommitted_state_wins_on_read() {
        let (_dir, store) = tmp_store();
        let committed = StateData::new(State::Idle, 0, None, true, None);
        store.write(KEY_STATE, &serde_json::to_vec(&committed).unwrap()).unwrap();
        let uncommitted = StateData::new(State::ArtifactInstall, 0, Some("foo".into()), false, None);
        store
            .write(KEY_STATE_UNCOMMITTED, &serde_json::to_vec(&uncommitted).unwrap())
            .unwrap();
        let read = store.read_state_data().unwrap().unwrap();
        assert_eq!(read.state, State::ArtifactInstall);
    }

    #[test]
    fn provides_clears_then_merge_compounds() {
        let mut p = Provides::default();
        p.extra.insert("rootfs-image.version".into(), "1".into());
        p.apply_clears(&["rootfs-image.*".to_string()]).unwrap();
        assert!(p.extra.is_empty());
        p.merge(&BTreeMap::from([("rootfs-image.checksum".to_string(), "abc".to_string())]));
        assert_eq!(p.extra.get("rootfs-image.checksum"), Some(&"abc".to_string()));
    }
}
