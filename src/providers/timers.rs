//! Timer scheduler: ordered set of future-dated messages.
//!
//! Entries sort by `(fire_at, target_instance, event_id)` so simultaneous
//! timers fire in a deterministic order. A background loop sleeps until the
//! earliest fire time (capped by the runtime tick), then moves every expired
//! entry into its target session under one transaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OnceCell};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::store::{
    commit_backoff, EnumerationMode, StateStore, StoreError, Transaction, TypedDict, COMMIT_MAX_ATTEMPTS,
};
use crate::{EventKind, TaskMessage};

use super::sessions::SessionsProvider;
use super::TIMERS_DICTIONARY;

/// Upper bound on entries released per firing transaction.
const MAX_FIRE_BATCH: usize = 128;

/// Reported by [`TimerScheduler::wake_delay`] when the set is empty.
const EMPTY_WAKE_DELAY: Duration = Duration::from_secs(60 * 60);

/// A future-dated message awaiting its fire time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerEntry {
    pub fire_at_ms: u64,
    pub message: TaskMessage,
}

impl TimerEntry {
    /// Wrap a `TimerFired` task message into a schedulable entry.
    pub fn for_message(message: TaskMessage) -> Result<Self, StoreError> {
        match message.event.kind {
            EventKind::TimerFired { fire_at_ms } => Ok(Self { fire_at_ms, message }),
            ref other => Err(StoreError::permanent(
                "schedule",
                format!("timer message must carry TimerFired, got {other:?}"),
            )),
        }
    }

    /// Sort key: ascending fire time, then target instance, then event id.
    fn key(&self) -> String {
        format!(
            "{:020}:{}:{:020}",
            self.fire_at_ms,
            self.message.target.instance_id,
            self.message.event.event_id.max(0)
        )
    }
}

/// Durable timer set over the `Timer_Set` dictionary.
pub struct TimerScheduler {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    dict: OnceCell<TypedDict<TimerEntry>>,
    wake: Notify,
}

impl TimerScheduler {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            dict: OnceCell::new(),
            wake: Notify::new(),
        }
    }

    async fn dictionary(&self) -> Result<&TypedDict<TimerEntry>, StoreError> {
        self.dict
            .get_or_try_init(|| async {
                let dict = self.store.open_dictionary(TIMERS_DICTIONARY).await?;
                Ok(TypedDict::new(dict))
            })
            .await
    }

    /// Insert entries under the caller's transaction.
    pub async fn schedule(&self, txn: &mut dyn Transaction, entries: &[TimerEntry]) -> Result<(), StoreError> {
        let dict = self.dictionary().await?;
        for entry in entries {
            dict.set(txn, &entry.key(), entry).await?;
        }
        Ok(())
    }

    /// Wake the firing loop early; called after a commit that scheduled
    /// timers so a short timer does not wait out the full tick.
    pub fn interrupt(&self) {
        self.wake.notify_one();
    }

    /// Time until the earliest committed fire time, or a sentinel when the
    /// set is empty.
    pub async fn wake_delay(&self, now_ms: u64) -> Result<Duration, StoreError> {
        let dict = self.dictionary().await?;
        let mut txn = self.store.begin_transaction().await;
        let entries = dict.enumerate(txn.as_mut(), EnumerationMode::Ordered).await?;
        Ok(match entries.first() {
            Some((_, first)) => Duration::from_millis(first.fire_at_ms.saturating_sub(now_ms)),
            None => EMPTY_WAKE_DELAY,
        })
    }

    /// Remove and return up to `max_batch` entries whose fire time has
    /// passed, in firing order, under the caller's transaction.
    pub async fn pop_fired(
        &self,
        txn: &mut dyn Transaction,
        now_ms: u64,
        max_batch: usize,
    ) -> Result<Vec<TimerEntry>, StoreError> {
        let dict = self.dictionary().await?;
        let entries = dict.enumerate(txn, EnumerationMode::Ordered).await?;
        let mut fired = Vec::new();
        for (key, entry) in entries {
            if entry.fire_at_ms > now_ms || fired.len() >= max_batch {
                break;
            }
            dict.try_remove(txn, &key).await?;
            fired.push(entry);
        }
        Ok(fired)
    }

    /// Background firing loop: sleep until the earliest fire time (capped by
    /// `tick_cap`, interruptible by [`TimerScheduler::interrupt`]), then move
    /// expired entries into their target sessions atomically.
    pub async fn run(
        self: Arc<Self>,
        sessions: Arc<SessionsProvider>,
        shutdown: Arc<AtomicBool>,
        tick_cap: Duration,
    ) {
        while !shutdown.load(Ordering::Relaxed) {
            let delay = match self.wake_delay(self.clock.now_ms()).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(target: "duraflow::providers::timers", error = %e, "wake_delay failed");
                    Duration::from_secs(1)
                }
            };
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay.min(tick_cap)) => {}
            }
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = self.fire_due(&sessions).await {
                warn!(target: "duraflow::providers::timers", error = %e, "timer firing failed; backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    /// One firing pass: pop expired entries and append each to its target
    /// session, in a single transaction.
    pub async fn fire_due(&self, sessions: &SessionsProvider) -> Result<usize, StoreError> {
        let mut attempts = 0;
        loop {
            let now_ms = self.clock.now_ms();
            let mut txn = self.store.begin_transaction().await;
            let fired = self.pop_fired(txn.as_mut(), now_ms, MAX_FIRE_BATCH).await?;
            if fired.is_empty() {
                return Ok(0);
            }
            let count = fired.len();
            for entry in fired {
                sessions.append_message(txn.as_mut(), entry.message).await?;
            }
            match txn.commit().await {
                Ok(()) => {
                    debug!(target: "duraflow::providers::timers", count, "released fired timers");
                    return Ok(count);
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
