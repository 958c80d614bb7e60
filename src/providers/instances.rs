//! Instance store: latest state snapshot per execution, with hourly cold
//! archives and a background reaper.
//!
//! Running state lives in `InstSt_Current`; terminal state migrates, under
//! the same transaction that advances the session, into the archive bucket
//! of the commit's UTC hour (`InstSt_<yyyy-MM-dd-HH>`). Reads probe at most
//! the current and previous hour, so terminal results age out of sight within
//! two hours; the reaper deletes buckets past the retention window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::store::{StateStore, StoreError, Transaction, TypedDict};
use crate::{OrchestrationState, OrchestrationStatus};

use super::{EXECUTIONS_DICTIONARY, INSTANCES_DICTIONARY, INSTANCE_STORE_PREFIX};

const HOUR_MS: u64 = 60 * 60 * 1000;
const BUCKET_HOUR_FORMAT: &str = "%Y-%m-%d-%H";

struct InstanceDicts {
    /// `(instance_id, execution_id)` -> latest state, Pending/Running only.
    instances: TypedDict<OrchestrationState>,
    /// `instance_id` -> most recent execution id, updated on Pending writes.
    executions: TypedDict<String>,
}

/// Reaper cadence and retention, lifted from the runtime configuration.
#[derive(Debug, Clone)]
pub struct ReaperOptions {
    pub initial_delay: Duration,
    pub success_interval: Duration,
    pub failure_interval: Duration,
    pub retention: Duration,
}

/// Counters from one reaper pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapStats {
    pub scanned: usize,
    pub deleted: usize,
}

/// Durable orchestration state snapshots over the `InstSt_*` dictionaries.
pub struct InstanceStore {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    dicts: OnceCell<InstanceDicts>,
}

impl InstanceStore {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            dicts: OnceCell::new(),
        }
    }

    async fn dicts(&self) -> Result<&InstanceDicts, StoreError> {
        self.dicts
            .get_or_try_init(|| async {
                Ok(InstanceDicts {
                    instances: TypedDict::new(self.store.open_dictionary(INSTANCES_DICTIONARY).await?),
                    executions: TypedDict::new(self.store.open_dictionary(EXECUTIONS_DICTIONARY).await?),
                })
            })
            .await
    }

    fn state_key(instance_id: &str, execution_id: &str) -> String {
        format!("{instance_id}#{execution_id}")
    }

    /// Archive bucket name for the UTC hour containing `at_ms`.
    fn bucket_name(at_ms: u64) -> String {
        let stamp = DateTime::<Utc>::from_timestamp_millis(at_ms as i64)
            .unwrap_or_default()
            .format(BUCKET_HOUR_FORMAT);
        format!("{INSTANCE_STORE_PREFIX}{stamp}")
    }

    /// Parse the bucket-hour start from a dictionary name; `None` for the hot
    /// dictionaries and anything else that is not an archive bucket.
    fn bucket_hour_start_ms(name: &str) -> Option<u64> {
        let suffix = name.strip_prefix(INSTANCE_STORE_PREFIX)?;
        let (date, hour) = suffix.rsplit_once('-')?;
        let hour: u32 = hour.parse().ok()?;
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        let start = date.and_hms_opt(hour, 0, 0)?;
        u64::try_from(start.and_utc().timestamp_millis()).ok()
    }

    /// Persist state snapshots under the caller's transaction.
    ///
    /// Pending/Running states upsert the hot dictionary (Pending also
    /// advances the latest-execution pointer); terminal states move into the
    /// current hour's archive bucket and leave the hot dictionary. Stamps
    /// `last_updated` (and `completed_at` on first terminal write) so every
    /// committed snapshot is self-consistent.
    pub async fn write_entities(
        &self,
        txn: &mut dyn Transaction,
        states: &[OrchestrationState],
    ) -> Result<(), StoreError> {
        let dicts = self.dicts().await?;
        let now_ms = self.clock.now_ms();
        for state in states {
            let mut state = state.clone();
            state.last_updated_ms = now_ms;
            let key = Self::state_key(&state.instance.instance_id, &state.instance.execution_id);
            if !state.status.is_terminal() {
                dicts.instances.set(txn, &key, &state).await?;
                if state.status == OrchestrationStatus::Pending {
                    dicts
                        .executions
                        .set(txn, &state.instance.instance_id, &state.instance.execution_id)
                        .await?;
                }
            } else {
                if state.completed_at_ms.is_none() {
                    state.completed_at_ms = Some(now_ms);
                }
                // Bucket open must stay outside the caller's transaction: an
                // enumeration-backed open inside it would not observe the
                // transaction's own writes.
                let bucket = self.store.open_dictionary(&Self::bucket_name(now_ms)).await?;
                TypedDict::new(bucket).set(txn, &key, &state).await?;
                dicts.instances.try_remove(txn, &key).await?;
            }
        }
        Ok(())
    }

    /// Most recent execution id recorded for an instance.
    pub async fn latest_execution_id(&self, instance_id: &str) -> Result<Option<String>, StoreError> {
        let dicts = self.dicts().await?;
        let mut txn = self.store.begin_transaction().await;
        dicts.executions.try_get(txn.as_mut(), instance_id).await
    }

    /// Latest execution's state for an instance, if trackable.
    pub async fn get_state(&self, instance_id: &str) -> Result<Option<OrchestrationState>, StoreError> {
        let Some(execution_id) = self.latest_execution_id(instance_id).await? else {
            return Ok(None);
        };
        self.get_state_of(instance_id, &execution_id).await
    }

    /// State for one specific execution: hot dictionary first, then the
    /// current and previous hour's archive buckets. Older terminal results
    /// are not surfaced.
    pub async fn get_state_of(
        &self,
        instance_id: &str,
        execution_id: &str,
    ) -> Result<Option<OrchestrationState>, StoreError> {
        let dicts = self.dicts().await?;
        let key = Self::state_key(instance_id, execution_id);

        let mut txn = self.store.begin_transaction().await;
        if let Some(state) = dicts.instances.try_get(txn.as_mut(), &key).await? {
            return Ok(Some(state));
        }

        let now_ms = self.clock.now_ms();
        for at_ms in [now_ms, now_ms.saturating_sub(HOUR_MS)] {
            let name = Self::bucket_name(at_ms);
            if let Some(bucket) = self.store.try_open_dictionary(&name).await? {
                if let Some(state) = TypedDict::<OrchestrationState>::new(bucket).try_get(txn.as_mut(), &key).await? {
                    return Ok(Some(state));
                }
            }
        }
        Ok(None)
    }

    /// Delete archive buckets older than `retention`.
    pub async fn purge_expired(&self, retention: Duration) -> Result<ReapStats, StoreError> {
        let now_ms = self.clock.now_ms();
        let retention_ms = retention.as_millis() as u64;
        let names = self.store.enumerate_dictionaries().await?;
        let mut stats = ReapStats { scanned: 0, deleted: 0 };
        for name in names {
            let Some(start_ms) = Self::bucket_hour_start_ms(&name) else {
                continue;
            };
            stats.scanned += 1;
            if now_ms.saturating_sub(start_ms) > retention_ms {
                self.store.remove_dictionary(&name).await?;
                stats.deleted += 1;
            }
        }
        Ok(stats)
    }

    /// Background reaper: first pass after `initial_delay`, then every
    /// `success_interval` (or `failure_interval` after an error).
    pub async fn run_reaper(self: Arc<Self>, shutdown: Arc<AtomicBool>, options: ReaperOptions) {
        if !sleep_unless_shutdown(options.initial_delay, &shutdown).await {
            return;
        }
        loop {
            let started = std::time::Instant::now();
            let next_sleep = match self.purge_expired(options.retention).await {
                Ok(stats) => {
                    info!(
                        target: "duraflow::providers::instances",
                        scanned = stats.scanned,
                        deleted = stats.deleted,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "archive reaper pass finished"
                    );
                    options.success_interval
                }
                Err(e) => {
                    warn!(target: "duraflow::providers::instances", error = %e, "archive reaper pass failed");
                    options.failure_interval
                }
            };
            if !sleep_unless_shutdown(next_sleep, &shutdown).await {
                return;
            }
        }
    }
}

/// Sleep in short slices so shutdown is observed promptly. Returns false if
/// shutdown was requested.
async fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(250);
    let deadline = tokio::time::Instant::now() + total;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep(SLICE.min(deadline - now)).await;
    }
}
