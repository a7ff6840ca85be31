//! Durable change storage.
//!
//! One store may hold many spaces; each space owns an append-only set of
//! changes keyed by `(actor, seq)` plus an optional snapshot blob. The
//! RocksDB implementation lives in `echo-collab`; [`MemoryStore`] backs
//! tests and ephemeral spaces.

use crate::change::Change;
use crate::ids::{ActorId, SpaceId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Persistence backend for change logs and snapshots.
///
/// `append_change` must not return before the change is durable.
pub trait ChangeStore: Send + Sync {
    fn append_change(&self, space: SpaceId, change: &Change) -> Result<(), StorageError>;

    /// Every stored change of a space, ordered by `(actor, seq)`.
    fn load_changes(&self, space: SpaceId) -> Result<Vec<Change>, StorageError>;

    fn save_snapshot(&self, space: SpaceId, snapshot: &[u8]) -> Result<(), StorageError>;

    fn load_snapshot(&self, space: SpaceId) -> Result<Option<Vec<u8>>, StorageError>;

    /// Forgets a space locally.
    fn delete_space(&self, space: SpaceId) -> Result<(), StorageError>;

    fn list_spaces(&self) -> Result<Vec<SpaceId>, StorageError>;

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SpaceRecords {
    changes: BTreeMap<(ActorId, u64), Change>,
    snapshot: Option<Vec<u8>>,
}

/// In-memory [`ChangeStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    spaces: Mutex<HashMap<SpaceId, SpaceRecords>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later write fail with an I/O error, like a full disk.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn change_count(&self, space: SpaceId) -> usize {
        self.spaces
            .lock()
            .map(|s| s.get(&space).map_or(0, |r| r.changes.len()))
            .unwrap_or(0)
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StorageError::Io("write rejected: device full".into()));
        }
        Ok(())
    }
}

impl ChangeStore for MemoryStore {
    fn append_change(&self, space: SpaceId, change: &Change) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut spaces = self.spaces.lock().map_err(|_| StorageError::Poisoned)?;
        spaces
            .entry(space)
            .or_default()
            .changes
            .insert((change.actor, change.seq), change.clone());
        Ok(())
    }

    fn load_changes(&self, space: SpaceId) -> Result<Vec<Change>, StorageError> {
        let spaces = self.spaces.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(spaces
            .get(&space)
            .map(|r| r.changes.values().cloned().collect())
            .unwrap_or_default())
    }

    fn save_snapshot(&self, space: SpaceId, snapshot: &[u8]) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut spaces = self.spaces.lock().map_err(|_| StorageError::Poisoned)?;
        spaces.entry(space).or_default().snapshot = Some(snapshot.to_vec());
        Ok(())
    }

    fn load_snapshot(&self, space: SpaceId) -> Result<Option<Vec<u8>>, StorageError> {
        let spaces = self.spaces.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(spaces.get(&space).and_then(|r| r.snapshot.clone()))
    }

    fn delete_space(&self, space: SpaceId) -> Result<(), StorageError> {
        let mut spaces = self.spaces.lock().map_err(|_| StorageError::Poisoned)?;
        spaces.remove(&space);
        Ok(())
    }

    fn list_spaces(&self) -> Result<Vec<SpaceId>, StorageError> {
        let spaces = self.spaces.lock().map_err(|_| StorageError::Poisoned)?;
        let mut ids: Vec<_> = spaces.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeBuilder;
    use crate::ids::Identity;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let space = SpaceId::new();
        let id = Identity::from_seed([1; 32]);
        let c2 = ChangeBuilder::new(2).sign(&id).unwrap();
        let c1 = ChangeBuilder::new(1).sign(&id).unwrap();
        store.append_change(space, &c2).unwrap();
        store.append_change(space, &c1).unwrap();

        let loaded = store.load_changes(space).unwrap();
        assert_eq!(loaded, vec![c1, c2]);
        assert_eq!(store.list_spaces().unwrap(), vec![space]);
    }

    #[test]
    fn test_snapshot_and_delete() {
        let store = MemoryStore::new();
        let space = SpaceId::new();
        assert_eq!(store.load_snapshot(space).unwrap(), None);
        store.save_snapshot(space, b"snap").unwrap();
        assert_eq!(store.load_snapshot(space).unwrap(), Some(b"snap".to_vec()));
        store.delete_space(space).unwrap();
        assert_eq!(store.load_snapshot(space).unwrap(), None);
        assert!(store.list_spaces().unwrap().is_empty());
    }

    #[test]
    fn test_failing_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let id = Identity::from_seed([1; 32]);
        let err = store
            .append_change(SpaceId::new(), &ChangeBuilder::new(1).sign(&id).unwrap())
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }
}
