//! Worker (activity) dispatcher implementation for Runtime
//!
//! This module contains the worker dispatcher logic that:
//! - Spawns concurrent activity workers
//! - Claims activity queue entries and invokes user activity code
//! - Commits the queue removal and the response message atomically

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::providers::ActivityWorkItem;
use crate::runtime::registry::ActivityContext;
use crate::runtime::Runtime;
use crate::store::{commit_backoff, StoreError, COMMIT_MAX_ATTEMPTS};
use crate::{EventKind, HistoryEvent, TaskMessage};

use super::TRANSIENT_ERROR_BACKOFF;

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers.
    ///
    /// Activities are independent work units; workers share nothing but the
    /// store.
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.max_concurrent_activities;
        let shutdown = self.shutdown_flag.clone();

        tokio::spawn(async move {
            let mut worker_handles = Vec::new();

            for worker_idx in 0..concurrency {
                let rt = self.clone();
                let shutdown = shutdown.clone();
                let worker_id = format!("work-{worker_idx}-{}", rt.runtime_id);
                let handle = tokio::spawn(async move {
                    loop {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        match rt.activities_queue.get_next_work_item(rt.options.receive_timeout).await {
                            Ok(Some(item)) => rt.process_activity(item, &worker_id).await,
                            Ok(None) => {}
                            Err(e) => {
                                warn!(target: "duraflow::runtime", worker_id = %worker_id, error = %e, "activity fetch failed; backing off");
                                tokio::time::sleep(TRANSIENT_ERROR_BACKOFF).await;
                            }
                        }
                    }
                });
                worker_handles.push(handle);
            }

            for handle in worker_handles {
                let _ = handle.await;
            }
        })
    }

    /// Execute one claimed activity and commit its response.
    async fn process_activity(self: &Arc<Self>, item: ActivityWorkItem, worker_id: &str) {
        let target = item.message.target.clone();
        let scheduled_id = item.message.event.event_id;

        let (name, version, input) = match &item.message.event.kind {
            EventKind::TaskScheduled { name, version, input } => {
                (name.clone(), version.clone(), input.clone())
            }
            other => {
                // State corruption: only TaskScheduled belongs on this queue.
                // Shed the poison row so the queue keeps draining.
                error!(
                    target: "duraflow::runtime",
                    worker_id = %worker_id,
                    key = item.key,
                    event = ?other,
                    "unexpected event in activity queue; removing poison entry"
                );
                if let Err(e) = self.remove_work_item(&item).await {
                    warn!(target: "duraflow::runtime", key = item.key, error = %e, "failed to remove poison entry");
                }
                return;
            }
        };

        let response_kind = match self.activity_registry.resolve(&name, version.as_deref()) {
            None => {
                error!(
                    target: "duraflow::runtime",
                    instance_id = %target.instance_id,
                    activity_name = %name,
                    activity_version = version.as_deref().unwrap_or("latest"),
                    worker_id = %worker_id,
                    "activity type missing"
                );
                EventKind::TaskFailed {
                    task_scheduled_id: scheduled_id,
                    reason: "TypeMissing".to_string(),
                    details: Some(format!("no activity registered for {name}")),
                }
            }
            Some(handler) => {
                let ctx = ActivityContext {
                    instance_id: target.instance_id.clone(),
                    execution_id: target.execution_id.clone(),
                    activity_name: name.clone(),
                    task_scheduled_id: scheduled_id,
                    worker_id: worker_id.to_string(),
                };
                debug!(
                    target: "duraflow::runtime",
                    instance_id = %target.instance_id,
                    activity_name = %name,
                    task_scheduled_id = scheduled_id,
                    worker_id = %worker_id,
                    "activity started"
                );
                let started = std::time::Instant::now();

                // Run in a child task so a panicking activity is contained
                // and converted into a TaskFailed response.
                let invocation = tokio::spawn(async move { handler.invoke(ctx, input).await });
                match invocation.await {
                    Ok(Ok(output)) => {
                        debug!(
                            target: "duraflow::runtime",
                            instance_id = %target.instance_id,
                            activity_name = %name,
                            task_scheduled_id = scheduled_id,
                            worker_id = %worker_id,
                            duration_ms = started.elapsed().as_millis() as u64,
                            "activity completed"
                        );
                        EventKind::TaskCompleted {
                            task_scheduled_id: scheduled_id,
                            output: Some(output),
                        }
                    }
                    Ok(Err(failure)) => {
                        warn!(
                            target: "duraflow::runtime",
                            instance_id = %target.instance_id,
                            activity_name = %name,
                            task_scheduled_id = scheduled_id,
                            worker_id = %worker_id,
                            duration_ms = started.elapsed().as_millis() as u64,
                            reason = %failure.reason,
                            "activity failed (application error)"
                        );
                        EventKind::TaskFailed {
                            task_scheduled_id: scheduled_id,
                            reason: failure.reason,
                            details: failure.details,
                        }
                    }
                    Err(join_err) => {
                        let reason = if join_err.is_panic() {
                            panic_message(join_err.into_panic())
                        } else {
                            "activity task was cancelled".to_string()
                        };
                        error!(
                            target: "duraflow::runtime",
                            instance_id = %target.instance_id,
                            activity_name = %name,
                            task_scheduled_id = scheduled_id,
                            worker_id = %worker_id,
                            reason = %reason,
                            "activity failed (unhandled)"
                        );
                        EventKind::TaskFailed {
                            task_scheduled_id: scheduled_id,
                            reason,
                            details: None,
                        }
                    }
                }
            }
        };

        let response = TaskMessage::new(target.clone(), HistoryEvent::new(response_kind));

        let mut attempts = 0u32;
        loop {
            let mut txn = self.store.begin_transaction().await;
            let staged = async {
                self.activities_queue.complete_work_item(txn.as_mut(), &item).await?;
                self.sessions.append_message(txn.as_mut(), response.clone()).await?;
                Ok::<(), StoreError>(())
            }
            .await;
            let result = match staged {
                Ok(()) => txn.commit().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return,
                Err(e) if e.is_retryable() && attempts < COMMIT_MAX_ATTEMPTS => {
                    warn!(target: "duraflow::runtime", instance_id = %target.instance_id, attempts, error = %e, "activity ack failed; retrying");
                    tokio::time::sleep(commit_backoff(attempts)).await;
                    attempts += 1;
                }
                Err(e) => {
                    // Give the entry back; redelivery re-runs the activity
                    // (at-least-once).
                    warn!(target: "duraflow::runtime", instance_id = %target.instance_id, error = %e, "activity ack failed; abandoning work item");
                    if let Err(abandon_err) = self.activities_queue.abandon_work_item(&item).await {
                        warn!(target: "duraflow::runtime", key = item.key, error = %abandon_err, "abandon failed");
                    }
                    return;
                }
            }
        }
    }

    /// Remove a queue entry outside a dispatcher commit (poison shedding).
    async fn remove_work_item(&self, item: &ActivityWorkItem) -> Result<(), StoreError> {
        let mut attempts = 0u32;
        loop {
            let mut txn = self.store.begin_transaction().await;
            self.activities_queue.complete_work_item(txn.as_mut(), item).await?;
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
}

/// Best-effort extraction of a panic payload message.
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "activity panicked".to_string()
    }
}
