//! In-memory reference implementation of the transactional store.
//!
//! Rows live in ordered maps guarded by one store-level mutex; transactions
//! buffer their writes and apply them atomically on commit. Isolation is
//! optimistic: each dictionary carries a commit version, a transaction
//! records the version of every dictionary it touches, and commit fails with
//! a retryable conflict when any touched dictionary was committed to in the
//! meantime. The engine's retry loops absorb those conflicts; a replicated
//! store with pessimistic row locks satisfies the same trait contract.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Dictionary, EnumerationMode, StateStore, StoreError, Transaction};

#[derive(Default)]
struct DictState {
    rows: BTreeMap<String, Vec<u8>>,
    /// Bumped on every commit that writes this dictionary.
    version: u64,
}

#[derive(Default)]
struct StoreInner {
    dictionaries: Mutex<BTreeMap<String, DictState>>,
}

/// Transactional in-memory store of named ordered dictionaries.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Arc<StoreInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn open_dictionary(&self, name: &str) -> Result<Dictionary, StoreError> {
        let mut dicts = self.inner.dictionaries.lock().await;
        dicts.entry(name.to_string()).or_default();
        Ok(Dictionary::new(name))
    }

    async fn try_open_dictionary(&self, name: &str) -> Result<Option<Dictionary>, StoreError> {
        let dicts = self.inner.dictionaries.lock().await;
        Ok(dicts.contains_key(name).then(|| Dictionary::new(name)))
    }

    async fn remove_dictionary(&self, name: &str) -> Result<(), StoreError> {
        let mut dicts = self.inner.dictionaries.lock().await;
        dicts.remove(name);
        Ok(())
    }

    async fn enumerate_dictionaries(&self) -> Result<Vec<String>, StoreError> {
        let dicts = self.inner.dictionaries.lock().await;
        Ok(dicts.keys().cloned().collect())
    }

    async fn begin_transaction(&self) -> Box<dyn Transaction> {
        Box::new(InMemoryTransaction {
            inner: self.inner.clone(),
            observed: HashMap::new(),
            writes: HashMap::new(),
        })
    }
}

struct InMemoryTransaction {
    inner: Arc<StoreInner>,
    /// Dictionary name -> version at first access in this transaction.
    observed: HashMap<String, u64>,
    /// Buffered writes per dictionary; `None` is a tombstone.
    writes: HashMap<String, BTreeMap<String, Option<Vec<u8>>>>,
}

impl InMemoryTransaction {
    fn observe(
        &mut self,
        dicts: &BTreeMap<String, DictState>,
        name: &str,
        operation: &str,
    ) -> Result<(), StoreError> {
        let state = dicts
            .get(name)
            .ok_or_else(|| StoreError::permanent(operation, format!("unknown dictionary: {name}")))?;
        self.observed.entry(name.to_string()).or_insert(state.version);
        Ok(())
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn try_get(&mut self, dict: &Dictionary, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let store = self.inner.clone();
        let dicts = store.dictionaries.lock().await;
        self.observe(&dicts, dict.name(), "try_get")?;
        if let Some(buffered) = self.writes.get(dict.name()).and_then(|w| w.get(key)) {
            return Ok(buffered.clone());
        }
        Ok(dicts
            .get(dict.name())
            .and_then(|s| s.rows.get(key))
            .cloned())
    }

    async fn set(&mut self, dict: &Dictionary, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let store = self.inner.clone();
        let dicts = store.dictionaries.lock().await;
        self.observe(&dicts, dict.name(), "set")?;
        drop(dicts);
        self.writes
            .entry(dict.name().to_string())
            .or_default()
            .insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn try_remove(&mut self, dict: &Dictionary, key: &str) -> Result<bool, StoreError> {
        let store = self.inner.clone();
        let dicts = store.dictionaries.lock().await;
        self.observe(&dicts, dict.name(), "try_remove")?;
        let existed = match self.writes.get(dict.name()).and_then(|w| w.get(key)) {
            Some(buffered) => buffered.is_some(),
            None => dicts
                .get(dict.name())
                .map(|s| s.rows.contains_key(key))
                .unwrap_or(false),
        };
        drop(dicts);
        self.writes
            .entry(dict.name().to_string())
            .or_default()
            .insert(key.to_string(), None);
        Ok(existed)
    }

    async fn enumerate(
        &mut self,
        dict: &Dictionary,
        _mode: EnumerationMode,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        // Committed snapshot only; buffered writes are invisible here.
        let store = self.inner.clone();
        let dicts = store.dictionaries.lock().await;
        self.observe(&dicts, dict.name(), "enumerate")?;
        let state = dicts
            .get(dict.name())
            .ok_or_else(|| StoreError::permanent("enumerate", format!("unknown dictionary: {}", dict.name())))?;
        Ok(state.rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut dicts = self.inner.dictionaries.lock().await;

        for (name, observed_version) in &self.observed {
            match dicts.get(name) {
                Some(state) if state.version == *observed_version => {}
                _ => {
                    return Err(StoreError::retryable(
                        "commit",
                        format!("transaction conflict on dictionary {name}"),
                    ));
                }
            }
        }

        for (name, writes) in self.writes {
            if writes.is_empty() {
                continue;
            }
            // Validated above: every written dictionary was observed and is live.
            let state = dicts
                .get_mut(&name)
                .ok_or_else(|| StoreError::retryable("commit", format!("transaction conflict on dictionary {name}")))?;
            for (key, value) in writes {
                match value {
                    Some(bytes) => {
                        state.rows.insert(key, bytes);
                    }
                    None => {
                        state.rows.remove(&key);
                    }
                }
            }
            state.version += 1;
        }
        Ok(())
    }
}
