//! Transactional store abstraction.
//!
//! The engine persists everything in named durable dictionaries belonging to
//! one [`StateStore`], and advances state only through multi-dictionary ACID
//! transactions. Any transactional, partitioned K/V store with ordered
//! dictionaries and enumeration can sit behind these traits; the crate ships
//! [`in_memory::InMemoryStore`] as the reference implementation.
//!
//! # Read-your-own-writes hazard
//!
//! Point lookups (`try_get`) observe writes buffered in the same
//! transaction. **Enumeration does not**: it reads the last committed
//! snapshot only. Callers must not rely on seeing their own uncommitted rows
//! when enumerating; in particular, a dictionary must be opened before the
//! transaction that first writes to it.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

pub mod in_memory;

/// Enumeration order over a dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationMode {
    /// Keys in ascending lexicographic order.
    Ordered,
    /// Any order the store finds cheapest.
    Unordered,
}

/// Store-level error with retry classification.
///
/// Retryable errors (commit conflicts, timeouts, transient unavailability)
/// are absorbed by the dispatchers' capped-backoff retry loops; permanent
/// errors (missing dictionaries, corrupt rows) abort the cycle and surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    /// Operation that failed (e.g. "commit", "enumerate").
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl StoreError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub(crate) fn corrupt_row(dictionary: &str, key: &str, err: impl std::fmt::Display) -> Self {
        Self::permanent(
            "deserialize",
            format!("corrupt row {dictionary}[{key}]: {err}"),
        )
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for StoreError {}

/// Handle to a named durable dictionary.
///
/// Cheap to clone; holds no store reference. All data access goes through a
/// [`Transaction`] with the handle naming the target dictionary.
#[derive(Debug, Clone)]
pub struct Dictionary {
    name: Arc<str>,
}

impl Dictionary {
    /// Handle for `name`. Store implementations mint these from
    /// `open_dictionary`; a handle does not imply the dictionary exists.
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Transactional store of named durable dictionaries.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Idempotent get-or-create of a named dictionary.
    async fn open_dictionary(&self, name: &str) -> Result<Dictionary, StoreError>;

    /// Open an existing dictionary, or `None` if it was never created.
    ///
    /// Read paths that probe for dictionaries (archive lookups) use this so
    /// a miss does not mint an empty dictionary.
    async fn try_open_dictionary(&self, name: &str) -> Result<Option<Dictionary>, StoreError>;

    /// Durably delete a dictionary and all its rows.
    async fn remove_dictionary(&self, name: &str) -> Result<(), StoreError>;

    /// Names of all live dictionaries.
    async fn enumerate_dictionaries(&self) -> Result<Vec<String>, StoreError>;

    /// Begin a transaction spanning any dictionaries of this store.
    async fn begin_transaction(&self) -> Box<dyn Transaction>;
}

/// One ACID unit of work across the store's dictionaries.
///
/// Writes are buffered until [`Transaction::commit`]; a failed commit leaves
/// the store unchanged. Dropping a transaction without committing discards
/// all buffered writes.
#[async_trait]
pub trait Transaction: Send {
    /// Point lookup. Observes writes buffered in this transaction.
    async fn try_get(&mut self, dict: &Dictionary, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Insert or overwrite a row.
    async fn set(&mut self, dict: &Dictionary, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove a row; returns whether a row was visible to remove.
    async fn try_remove(&mut self, dict: &Dictionary, key: &str) -> Result<bool, StoreError>;

    /// Enumerate the dictionary's rows from the last committed snapshot.
    ///
    /// Does NOT observe writes buffered in this transaction.
    async fn enumerate(
        &mut self,
        dict: &Dictionary,
        mode: EnumerationMode,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Atomically apply all buffered writes.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Serde-typed view over a [`Dictionary`].
#[derive(Debug, Clone)]
pub struct TypedDict<V> {
    dict: Dictionary,
    _values: PhantomData<fn() -> V>,
}

impl<V> TypedDict<V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn new(dict: Dictionary) -> Self {
        Self {
            dict,
            _values: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.dict.name()
    }

    pub async fn try_get(&self, txn: &mut dyn Transaction, key: &str) -> Result<Option<V>, StoreError> {
        match txn.try_get(&self.dict, key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::corrupt_row(self.name(), key, e)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, txn: &mut dyn Transaction, key: &str, value: &V) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StoreError::permanent("serialize", format!("{}[{key}]: {e}", self.name())))?;
        txn.set(&self.dict, key, bytes).await
    }

    /// Upsert: insert `insert` when the key is absent, else apply `merge` to
    /// the visible value (including values written earlier in this
    /// transaction) and store the result.
    pub async fn add_or_update(
        &self,
        txn: &mut dyn Transaction,
        key: &str,
        insert: V,
        merge: impl FnOnce(V) -> V + Send,
    ) -> Result<(), StoreError> {
        let next = match self.try_get(txn, key).await? {
            Some(existing) => merge(existing),
            None => insert,
        };
        self.set(txn, key, &next).await
    }

    pub async fn try_remove(&self, txn: &mut dyn Transaction, key: &str) -> Result<bool, StoreError> {
        txn.try_remove(&self.dict, key).await
    }

    /// Enumerate from the committed snapshot (see the module-level hazard).
    pub async fn enumerate(
        &self,
        txn: &mut dyn Transaction,
        mode: EnumerationMode,
    ) -> Result<Vec<(String, V)>, StoreError> {
        let rows = txn.enumerate(&self.dict, mode).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, bytes) in rows {
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::corrupt_row(self.name(), &key, e))?;
            out.push((key, value));
        }
        Ok(out)
    }
}

/// Maximum attempts for the engine's standard retry loop around retryable
/// commit failures (conflicts, transient unavailability).
pub(crate) const COMMIT_MAX_ATTEMPTS: u32 = 5;

/// Backoff before retry attempt `attempt` (0-based): 10 ms doubling.
pub(crate) fn commit_backoff(attempt: u32) -> std::time::Duration {
    std::time::Duration::from_millis(10u64.saturating_mul(1 << attempt.min(10)))
}
