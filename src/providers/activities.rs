//! Activity queue: persistent outbound task messages with lock-and-complete
//! semantics.
//!
//! Entries are keyed by a monotonic id assigned on append, so ordered
//! enumeration yields append order and completion removes the exact row.
//! Delivery is FIFO-ish: under concurrent worker fan-out, activities overlap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::store::{
    commit_backoff, EnumerationMode, StateStore, StoreError, Transaction, TypedDict, COMMIT_MAX_ATTEMPTS,
};
use crate::TaskMessage;

use super::ACTIVITIES_DICTIONARY;

/// Back-off between scans while waiting for a visible entry.
const DEQUEUE_POLL_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ActivityEntry {
    key: u64,
    message: TaskMessage,
    locked: bool,
}

/// A claimed queue entry; `key` identifies the exact row for completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityWorkItem {
    pub key: u64,
    pub message: TaskMessage,
}

struct QueueState {
    dict: TypedDict<ActivityEntry>,
    next_key: AtomicU64,
}

/// Durable activity queue over the `Act_Queue` dictionary.
pub struct ActivitiesProvider {
    store: Arc<dyn StateStore>,
    state: OnceCell<QueueState>,
}

impl ActivitiesProvider {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            state: OnceCell::new(),
        }
    }

    async fn state(&self) -> Result<&QueueState, StoreError> {
        self.state
            .get_or_try_init(|| async {
                let dict = TypedDict::new(self.store.open_dictionary(ACTIVITIES_DICTIONARY).await?);
                // Seed the append counter past any keys that survived a restart.
                let mut txn = self.store.begin_transaction().await;
                let entries: Vec<(String, ActivityEntry)> =
                    dict.enumerate(txn.as_mut(), EnumerationMode::Ordered).await?;
                let next = entries.last().map(|(_, e)| e.key + 1).unwrap_or(0);
                Ok(QueueState {
                    dict,
                    next_key: AtomicU64::new(next),
                })
            })
            .await
    }

    fn row_key(key: u64) -> String {
        format!("{key:020}")
    }

    /// Append messages under the caller's transaction, assigning each a
    /// monotonic key.
    pub async fn append_batch(&self, txn: &mut dyn Transaction, messages: &[TaskMessage]) -> Result<(), StoreError> {
        let state = self.state().await?;
        for message in messages {
            let key = state.next_key.fetch_add(1, Ordering::SeqCst);
            let entry = ActivityEntry {
                key,
                message: message.clone(),
                locked: false,
            };
            state.dict.set(txn, &Self::row_key(key), &entry).await?;
        }
        Ok(())
    }

    /// Poll for the first unlocked entry, claim it, and return it.
    ///
    /// Returns `None` once `receive_timeout` elapses with nothing visible.
    pub async fn get_next_work_item(&self, receive_timeout: Duration) -> Result<Option<ActivityWorkItem>, StoreError> {
        let deadline = Instant::now() + receive_timeout;
        loop {
            match self.try_claim_one().await {
                Ok(Some(item)) => return Ok(Some(item)),
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    debug!(target: "duraflow::providers::activities", error = %e, "claim conflicted; rescanning");
                }
                Err(e) => return Err(e),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(DEQUEUE_POLL_BACKOFF.min(deadline - now)).await;
        }
    }

    async fn try_claim_one(&self) -> Result<Option<ActivityWorkItem>, StoreError> {
        let state = self.state().await?;
        let mut txn = self.store.begin_transaction().await;
        let entries = state.dict.enumerate(txn.as_mut(), EnumerationMode::Ordered).await?;
        for (row, mut entry) in entries {
            if entry.locked {
                continue;
            }
            entry.locked = true;
            state.dict.set(txn.as_mut(), &row, &entry).await?;
            txn.commit().await?;
            return Ok(Some(ActivityWorkItem {
                key: entry.key,
                message: entry.message,
            }));
        }
        Ok(None)
    }

    /// Remove the claimed row under the caller's transaction.
    pub async fn complete_work_item(&self, txn: &mut dyn Transaction, item: &ActivityWorkItem) -> Result<(), StoreError> {
        let state = self.state().await?;
        state.dict.try_remove(txn, &Self::row_key(item.key)).await?;
        Ok(())
    }

    /// Clear the claim so the entry becomes visible again. Runs in its own
    /// transaction.
    pub async fn abandon_work_item(&self, item: &ActivityWorkItem) -> Result<(), StoreError> {
        let state = self.state().await?;
        let row = Self::row_key(item.key);
        let mut attempts = 0;
        loop {
            let mut txn = self.store.begin_transaction().await;
            if let Some(mut entry) = state.dict.try_get(txn.as_mut(), &row).await? {
                entry.locked = false;
                state.dict.set(txn.as_mut(), &row, &entry).await?;
            }
            match txn.commit().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempts < COMMIT_MAX_ATTEMPTS => {
                    tokio::time::sleep(commit_backoff(attempts)).await;
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Lock renewal is not supported: entries are not time-leased, and
    /// crashed owners are recovered by the boot sweep.
    pub async fn renew_work_item_lock(&self, _item: &ActivityWorkItem) -> Result<(), StoreError> {
        Err(StoreError::permanent(
            "renew_work_item_lock",
            "unsupported: activity claims are not time-leased",
        ))
    }

    /// Boot sweep: reclaim entries whose owner crashed by clearing every
    /// persisted claim.
    pub async fn boot_sweep(&self) -> Result<(), StoreError> {
        let state = self.state().await?;
        let mut attempts = 0;
        loop {
            let mut txn = self.store.begin_transaction().await;
            let entries = state.dict.enumerate(txn.as_mut(), EnumerationMode::Unordered).await?;
            let mut reclaimed = 0usize;
            for (row, mut entry) in entries {
                if entry.locked {
                    entry.locked = false;
                    state.dict.set(txn.as_mut(), &row, &entry).await?;
                    reclaimed += 1;
                }
            }
            match txn.commit().await {
                Ok(()) => {
                    info!(target: "duraflow::providers::activities", reclaimed, "activity boot sweep finished");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempts < COMMIT_MAX_ATTEMPTS => {
                    tokio::time::sleep(commit_backoff(attempts)).await;
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
