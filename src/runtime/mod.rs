//! Runtime lifecycle: boot sweep, dispatcher workers, background loops.
//!
//! A runtime owns the two dispatcher loops (orchestration and activity), the
//! timer firing loop, and the instance-store reaper, all running over one
//! shared [`StateStore`]. The store is the only synchronization point between
//! loops; no mutable in-memory state is shared across dispatcher cycles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::{Clock, UtcClock};
use crate::providers::instances::ReaperOptions;
use crate::providers::sessions::session_stack;
use crate::providers::{ActivitiesProvider, InstanceStore, SessionsProvider, TimerScheduler};
use crate::store::{StateStore, StoreError};

pub mod dispatchers;
pub mod executor;
pub mod registry;

use executor::OrchestrationExecutor;
use registry::ActivityRegistry;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Worker fan-out of the activity dispatcher.
    pub max_concurrent_activities: usize,
    /// Worker fan-out of the orchestration dispatcher. The baseline design
    /// runs one in-flight orchestration per partition.
    pub max_concurrent_orchestrations: usize,
    /// How long accept/dequeue calls poll before reporting empty.
    pub receive_timeout: Duration,
    /// Upper bound on the timer loop's sleep between firing passes.
    pub timer_tick_cap: Duration,
    /// How long terminal-state archive buckets are retained.
    pub archive_retention: Duration,
    pub reaper_initial_delay: Duration,
    pub reaper_success_interval: Duration,
    pub reaper_failure_interval: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_concurrent_activities: 4,
            max_concurrent_orchestrations: 1,
            receive_timeout: Duration::from_millis(500),
            timer_tick_cap: Duration::from_secs(1),
            archive_retention: Duration::from_secs(24 * 60 * 60),
            reaper_initial_delay: Duration::from_secs(5 * 60),
            reaper_success_interval: Duration::from_secs(60 * 60),
            reaper_failure_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Orchestration engine bound to one state store.
pub struct Runtime {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) sessions: Arc<SessionsProvider>,
    pub(crate) activities_queue: Arc<ActivitiesProvider>,
    pub(crate) timers: Arc<TimerScheduler>,
    pub(crate) instance_store: Arc<InstanceStore>,
    pub(crate) executor: Arc<dyn OrchestrationExecutor>,
    pub(crate) activity_registry: Arc<ActivityRegistry>,
    pub(crate) options: RuntimeOptions,
    pub(crate) shutdown_flag: Arc<AtomicBool>,
    pub(crate) runtime_id: String,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Start a runtime over `store` with the system UTC clock.
    pub async fn start_with_store(
        store: Arc<dyn StateStore>,
        executor: Arc<dyn OrchestrationExecutor>,
        activity_registry: Arc<ActivityRegistry>,
        options: RuntimeOptions,
    ) -> Result<Arc<Self>, StoreError> {
        Self::start_with_store_and_clock(store, executor, activity_registry, options, Arc::new(UtcClock)).await
    }

    /// Start a runtime with an explicit clock (tests drive a manual clock).
    pub async fn start_with_store_and_clock(
        store: Arc<dyn StateStore>,
        executor: Arc<dyn OrchestrationExecutor>,
        activity_registry: Arc<ActivityRegistry>,
        options: RuntimeOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, StoreError> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let (sessions, timers) = session_stack(store.clone(), clock.clone());
        let activities_queue = Arc::new(ActivitiesProvider::new(store.clone()));
        let instance_store = Arc::new(InstanceStore::new(store.clone(), clock));

        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

        let runtime = Arc::new(Self {
            store,
            sessions,
            activities_queue,
            timers,
            instance_store,
            executor,
            activity_registry,
            options,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            runtime_id,
            joins: Mutex::new(Vec::new()),
        });

        // Boot sweep: reclaim claims whose owner crashed, release terminal
        // sessions that never saw their release transaction.
        runtime.sessions.boot_sweep().await?;
        runtime.activities_queue.boot_sweep().await?;

        let mut joins = runtime.joins.lock().await;
        joins.push(runtime.clone().start_orchestration_dispatcher());
        joins.push(runtime.clone().start_work_dispatcher());
        joins.push(tokio::spawn(runtime.timers.clone().run(
            runtime.sessions.clone(),
            runtime.shutdown_flag.clone(),
            runtime.options.timer_tick_cap,
        )));
        joins.push(tokio::spawn(runtime.instance_store.clone().run_reaper(
            runtime.shutdown_flag.clone(),
            ReaperOptions {
                initial_delay: runtime.options.reaper_initial_delay,
                success_interval: runtime.options.reaper_success_interval,
                failure_interval: runtime.options.reaper_failure_interval,
                retention: runtime.options.archive_retention,
            },
        )));
        drop(joins);

        info!(
            target: "duraflow::runtime",
            runtime_id = %runtime.runtime_id,
            orchestration_workers = runtime.options.max_concurrent_orchestrations,
            activity_workers = runtime.options.max_concurrent_activities,
            "runtime started"
        );
        Ok(runtime)
    }

    /// Signal all loops to stop and await them. Commits in flight always run
    /// to completion before their loop observes the flag.
    pub async fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        self.timers.interrupt();
        let mut joins = self.joins.lock().await;
        for handle in joins.drain(..) {
            let _ = handle.await;
        }
        info!(target: "duraflow::runtime", runtime_id = %self.runtime_id, "runtime stopped");
    }
}
