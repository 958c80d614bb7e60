//! Session store: durable per-instance sessions with at-most-one in-flight
//! lock.
//!
//! A session is created by the first message addressed to its instance,
//! mutated only under store transactions, and removed when its runtime state
//! reaches a terminal status and the dispatcher releases it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::store::{
    commit_backoff, EnumerationMode, StateStore, StoreError, Transaction, TypedDict, COMMIT_MAX_ATTEMPTS,
};
use crate::{HistoryEvent, TaskMessage};

use super::timers::{TimerEntry, TimerScheduler};
use super::{LockableTaskMessage, PersistentSession, SESSIONS_DICTIONARY};

/// Back-off between scans while waiting for an acceptable session.
const ACCEPT_POLL_BACKOFF: Duration = Duration::from_millis(100);

/// Durable session store over the `Sess_Orchestrations` dictionary.
pub struct SessionsProvider {
    store: Arc<dyn StateStore>,
    timers: Arc<TimerScheduler>,
    dict: OnceCell<TypedDict<PersistentSession>>,
}

impl SessionsProvider {
    pub fn new(store: Arc<dyn StateStore>, timers: Arc<TimerScheduler>) -> Self {
        Self {
            store,
            timers,
            dict: OnceCell::new(),
        }
    }

    async fn dictionary(&self) -> Result<&TypedDict<PersistentSession>, StoreError> {
        self.dict
            .get_or_try_init(|| async {
                let dict = self.store.open_dictionary(SESSIONS_DICTIONARY).await?;
                Ok(TypedDict::new(dict))
            })
            .await
    }

    /// Poll for an unlocked session with visible messages and claim it.
    ///
    /// On success the session's `locked` bit is committed and every
    /// currently-visible message is marked in-flight for this cycle. Returns
    /// `None` once `receive_timeout` elapses without an acceptable session.
    pub async fn accept_session(&self, receive_timeout: Duration) -> Result<Option<PersistentSession>, StoreError> {
        let deadline = Instant::now() + receive_timeout;
        loop {
            match self.try_accept_one().await {
                Ok(Some(session)) => return Ok(Some(session)),
                Ok(None) => {}
                // A claim race with another dispatcher; rescan.
                Err(e) if e.is_retryable() => {
                    debug!(target: "duraflow::providers::sessions", error = %e, "accept claim conflicted; rescanning");
                }
                Err(e) => return Err(e),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(ACCEPT_POLL_BACKOFF.min(deadline - now)).await;
        }
    }

    /// One O(N) scan over the committed sessions; claims the first eligible.
    async fn try_accept_one(&self) -> Result<Option<PersistentSession>, StoreError> {
        let dict = self.dictionary().await?;
        let mut txn = self.store.begin_transaction().await;
        let sessions = dict.enumerate(txn.as_mut(), EnumerationMode::Unordered).await?;
        for (key, session) in sessions {
            if session.locked || !session.has_visible_messages() {
                continue;
            }
            let claimed = session.claim_visible();
            dict.set(txn.as_mut(), &key, &claimed).await?;
            txn.commit().await?;
            return Ok(Some(claimed));
        }
        Ok(None)
    }

    /// Messages claimed by the last accept of `session`, in append order.
    pub fn get_session_messages(&self, session: &PersistentSession) -> Vec<TaskMessage> {
        session.claimed_messages()
    }

    /// Commit one transition: replace the runtime state, drop the claimed
    /// messages, schedule `timer_messages` into the timer set under the same
    /// transaction, and clear the session lock.
    ///
    /// Terminal runtime states stay in the dictionary until
    /// [`SessionsProvider::release_session`].
    pub async fn complete_and_update_session(
        &self,
        txn: &mut dyn Transaction,
        instance_id: &str,
        new_runtime_state: Vec<HistoryEvent>,
        timer_messages: Vec<TaskMessage>,
    ) -> Result<(), StoreError> {
        let dict = self.dictionary().await?;
        let session = dict
            .try_get(txn, instance_id)
            .await?
            .ok_or_else(|| StoreError::permanent("complete_and_update_session", format!("no session for {instance_id}")))?;

        if !timer_messages.is_empty() {
            let mut entries = Vec::with_capacity(timer_messages.len());
            for message in timer_messages {
                entries.push(TimerEntry::for_message(message)?);
            }
            self.timers.schedule(txn, &entries).await?;
        }

        dict.set(txn, instance_id, &session.completed(new_runtime_state)).await
    }

    /// Upsert the target session with `message` appended to its queue,
    /// creating the session if this is the first message for the instance.
    pub async fn append_message(&self, txn: &mut dyn Transaction, message: TaskMessage) -> Result<(), StoreError> {
        let dict = self.dictionary().await?;
        let instance_id = message.target.instance_id.clone();
        let fresh = PersistentSession::new(&instance_id).with_message(message.clone());
        dict.add_or_update(txn, &instance_id, fresh, move |existing| existing.with_message(message))
            .await
    }

    /// Append a batch of messages, each to its own target session.
    pub async fn append_message_batch(
        &self,
        txn: &mut dyn Transaction,
        messages: Vec<TaskMessage>,
    ) -> Result<(), StoreError> {
        for message in messages {
            self.append_message(txn, message).await?;
        }
        Ok(())
    }

    /// Release after a committed transition: remove the session entirely if
    /// its runtime state is terminal, else clear the lock.
    pub async fn release_session(&self, txn: &mut dyn Transaction, instance_id: &str) -> Result<(), StoreError> {
        let dict = self.dictionary().await?;
        let Some(session) = dict.try_get(txn, instance_id).await? else {
            return Ok(());
        };
        if session.is_terminal() {
            dict.try_remove(txn, instance_id).await?;
        } else {
            let released = session.released();
            dict.set(txn, instance_id, &released).await?;
        }
        Ok(())
    }

    /// Clear the in-flight claim after a failed cycle so the session becomes
    /// acceptable again. Runs in its own transaction.
    pub async fn abandon_session(&self, instance_id: &str) -> Result<(), StoreError> {
        let dict = self.dictionary().await?;
        let mut attempts = 0;
        loop {
            let mut txn = self.store.begin_transaction().await;
            if let Some(session) = dict.try_get(txn.as_mut(), instance_id).await? {
                let released = session.released();
                dict.set(txn.as_mut(), instance_id, &released).await?;
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

    /// Boot sweep: clear every stale lock left by a crashed owner and remove
    /// sessions whose runtime state is already terminal.
    pub async fn boot_sweep(&self) -> Result<(), StoreError> {
        let dict = self.dictionary().await?;
        let mut attempts = 0;
        loop {
            let mut txn = self.store.begin_transaction().await;
            let sessions = dict.enumerate(txn.as_mut(), EnumerationMode::Unordered).await?;
            let mut released = 0usize;
            let mut removed = 0usize;
            for (key, session) in sessions {
                if session.is_terminal() {
                    dict.try_remove(txn.as_mut(), &key).await?;
                    removed += 1;
                } else if session.locked || session.messages.iter().any(|m: &LockableTaskMessage| m.locked) {
                    let swept = session.released();
                    dict.set(txn.as_mut(), &key, &swept).await?;
                    released += 1;
                }
            }
            match txn.commit().await {
                Ok(()) => {
                    info!(
                        target: "duraflow::providers::sessions",
                        released, removed, "session boot sweep finished"
                    );
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

    /// Lock renewal is not supported: the session lock is not time-bounded.
    /// A failover drops the in-process claim and the boot sweep repairs the
    /// persisted bit.
    pub async fn renew_session_lock(&self, _instance_id: &str) -> Result<(), StoreError> {
        Err(StoreError::permanent(
            "renew_session_lock",
            "unsupported: session locks are not time-bounded",
        ))
    }

    /// Read one session from the committed snapshot (status checks, tests).
    pub async fn read_session(&self, instance_id: &str) -> Result<Option<PersistentSession>, StoreError> {
        let dict = self.dictionary().await?;
        let mut txn = self.store.begin_transaction().await;
        dict.try_get(txn.as_mut(), instance_id).await
    }
}

/// Build a session store together with the timer scheduler it schedules into.
pub fn session_stack(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> (Arc<SessionsProvider>, Arc<TimerScheduler>) {
    let timers = Arc::new(TimerScheduler::new(store.clone(), clock));
    let sessions = Arc::new(SessionsProvider::new(store, timers.clone()));
    (sessions, timers)
}
