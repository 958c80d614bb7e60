//! Fault-injection store for testing error handling and recovery.
//!
//! Wraps any [`StateStore`] and fails a configured number of upcoming commits
//! with a retryable error, without applying the buffered writes. Used to
//! prove that a failed commit leaves no partial state and that retries
//! produce single-copy effects.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use duraflow::store::{Dictionary, EnumerationMode, StateStore, StoreError, Transaction};

pub struct FlakyStore {
    inner: Arc<dyn StateStore>,
    failing_commits: Arc<AtomicU32>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            failing_commits: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Arm the next `count` commits (across all transactions) to fail.
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    pub fn pending_failures(&self) -> u32 {
        self.failing_commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn open_dictionary(&self, name: &str) -> Result<Dictionary, StoreError> {
        self.inner.open_dictionary(name).await
    }

    async fn try_open_dictionary(&self, name: &str) -> Result<Option<Dictionary>, StoreError> {
        self.inner.try_open_dictionary(name).await
    }

    async fn remove_dictionary(&self, name: &str) -> Result<(), StoreError> {
        self.inner.remove_dictionary(name).await
    }

    async fn enumerate_dictionaries(&self) -> Result<Vec<String>, StoreError> {
        self.inner.enumerate_dictionaries().await
    }

    async fn begin_transaction(&self) -> Box<dyn Transaction> {
        Box::new(FlakyTransaction {
            inner: self.inner.begin_transaction().await,
            failing_commits: self.failing_commits.clone(),
        })
    }
}

struct FlakyTransaction {
    inner: Box<dyn Transaction>,
    failing_commits: Arc<AtomicU32>,
}

#[async_trait]
impl Transaction for FlakyTransaction {
    async fn try_get(&mut self, dict: &Dictionary, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.try_get(dict, key).await
    }

    async fn set(&mut self, dict: &Dictionary, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.inner.set(dict, key, value).await
    }

    async fn try_remove(&mut self, dict: &Dictionary, key: &str) -> Result<bool, StoreError> {
        self.inner.try_remove(dict, key).await
    }

    async fn enumerate(
        &mut self,
        dict: &Dictionary,
        mode: EnumerationMode,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.inner.enumerate(dict, mode).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        // Decrement-if-positive; the buffered writes are dropped with `inner`.
        let mut current = self.failing_commits.load(Ordering::SeqCst);
        while current > 0 {
            match self.failing_commits.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Err(StoreError::retryable("commit", "injected commit failure"));
                }
                Err(observed) => current = observed,
            }
        }
        self.inner.commit().await
    }
}
