//! Orchestration dispatcher implementation for Runtime
//!
//! This module contains the orchestration dispatcher logic that:
//! - Spawns concurrent orchestration workers
//! - Accepts locked sessions and hands them to the external executor
//! - Commits each transition atomically: activity appends, session update,
//!   timer inserts, orchestrator messages, and the instance snapshot

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::providers::PersistentSession;
use crate::runtime::executor::OrchestrationWorkItem;
use crate::runtime::Runtime;
use crate::store::{commit_backoff, StoreError, COMMIT_MAX_ATTEMPTS};

use super::TRANSIENT_ERROR_BACKOFF;

/// Consecutive executor failures tolerated before the worker backs off.
const MAX_CONSECUTIVE_EXECUTOR_FAILURES: u32 = 5;

/// How one dispatcher cycle ended.
enum CycleOutcome {
    Committed,
    ExecutorFailed,
    /// The transition requested an unsupported feature; the session stays
    /// locked until a restart.
    Unsupported,
}

impl Runtime {
    /// Start the orchestration dispatcher with N concurrent workers.
    ///
    /// The session lock prevents concurrent processing of the same instance,
    /// so workers only contend on distinct sessions.
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.max_concurrent_orchestrations;
        let shutdown = self.shutdown_flag.clone();

        tokio::spawn(async move {
            let mut worker_handles = Vec::new();

            for worker_idx in 0..concurrency {
                let rt = self.clone();
                let shutdown = shutdown.clone();
                let worker_id = format!("orch-{}-{}", worker_idx, rt.runtime_id);
                let handle = tokio::spawn(async move {
                    let mut consecutive_executor_failures = 0u32;
                    loop {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        match rt.sessions.accept_session(rt.options.receive_timeout).await {
                            Ok(Some(session)) => match rt.process_session(session, &worker_id).await {
                                CycleOutcome::Committed | CycleOutcome::Unsupported => {
                                    consecutive_executor_failures = 0;
                                }
                                CycleOutcome::ExecutorFailed => {
                                    // Immediate re-lock reproduces the same inputs;
                                    // a deterministic executor fails the same way,
                                    // so cap the hot retries.
                                    consecutive_executor_failures += 1;
                                    if consecutive_executor_failures >= MAX_CONSECUTIVE_EXECUTOR_FAILURES {
                                        warn!(
                                            target: "duraflow::runtime",
                                            worker_id = %worker_id,
                                            failures = consecutive_executor_failures,
                                            "executor keeps failing; backing off"
                                        );
                                        tokio::time::sleep(TRANSIENT_ERROR_BACKOFF).await;
                                        consecutive_executor_failures = 0;
                                    }
                                }
                            },
                            Ok(None) => {}
                            Err(e) => {
                                warn!(target: "duraflow::runtime", worker_id = %worker_id, error = %e, "accept_session failed; backing off");
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

    /// Process one accepted session through fetch → execute → commit.
    async fn process_session(self: &Arc<Self>, session: PersistentSession, worker_id: &str) -> CycleOutcome {
        let instance_id = session.session_id.clone();

        // A terminal session can still be accepted when messages arrived
        // after completion, or when a crash skipped the release transaction.
        // Release it (dropping the lingering messages) without executing.
        if session.is_terminal() {
            warn!(
                target: "duraflow::runtime",
                instance_id = %instance_id,
                worker_id = %worker_id,
                "session is terminal; releasing without processing"
            );
            if let Err(e) = self.release_with_retry(&instance_id).await {
                warn!(target: "duraflow::runtime", instance_id = %instance_id, error = %e, "terminal release failed");
            }
            return CycleOutcome::Committed;
        }

        let messages = self.sessions.get_session_messages(&session);
        debug!(
            target: "duraflow::runtime",
            instance_id = %instance_id,
            worker_id = %worker_id,
            messages = messages.len(),
            history_events = session.runtime_state.len(),
            "orchestration cycle started"
        );

        let work_item = OrchestrationWorkItem {
            instance_id: instance_id.clone(),
            runtime_state: session.runtime_state.clone(),
            new_messages: messages,
        };

        let transition = match self.executor.execute(work_item).await {
            Ok(t) => t,
            Err(e) => {
                error!(target: "duraflow::runtime", instance_id = %instance_id, worker_id = %worker_id, error = %e, "executor failed; abandoning session");
                if let Err(abandon_err) = self.sessions.abandon_session(&instance_id).await {
                    warn!(target: "duraflow::runtime", instance_id = %instance_id, error = %abandon_err, "abandon after executor failure failed");
                }
                return CycleOutcome::ExecutorFailed;
            }
        };

        if transition.continue_as_new.is_some() {
            // Explicitly unsupported in the core. The session stays locked so
            // the same poisoned transition is not re-executed in a loop; the
            // boot sweep reclaims it after a restart.
            error!(
                target: "duraflow::runtime",
                instance_id = %instance_id,
                worker_id = %worker_id,
                "ContinueAsNew is unsupported; session stays locked until restart"
            );
            return CycleOutcome::Unsupported;
        }

        // Snapshot size mirrors the serialized runtime state being committed.
        let mut state = transition.state.clone();
        state.size = serde_json::to_vec(&transition.new_runtime_state)
            .map(|b| b.len() as u64)
            .unwrap_or(0);
        let terminal = state.status.is_terminal();

        let mut attempts = 0u32;
        loop {
            let mut txn = self.store.begin_transaction().await;
            let staged = async {
                self.activities_queue
                    .append_batch(txn.as_mut(), &transition.activity_messages)
                    .await?;
                self.sessions
                    .complete_and_update_session(
                        txn.as_mut(),
                        &instance_id,
                        transition.new_runtime_state.clone(),
                        transition.timer_messages.clone(),
                    )
                    .await?;
                if !transition.orchestrator_messages.is_empty() {
                    self.sessions
                        .append_message_batch(txn.as_mut(), transition.orchestrator_messages.clone())
                        .await?;
                }
                self.instance_store.write_entities(txn.as_mut(), &[state.clone()]).await?;
                Ok::<(), StoreError>(())
            }
            .await;

            let result = match staged {
                Ok(()) => txn.commit().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempts < COMMIT_MAX_ATTEMPTS => {
                    warn!(target: "duraflow::runtime", instance_id = %instance_id, attempts, error = %e, "transition commit failed; retrying");
                    tokio::time::sleep(commit_backoff(attempts)).await;
                    attempts += 1;
                }
                Err(e) => {
                    error!(target: "duraflow::runtime", instance_id = %instance_id, error = %e, "transition commit failed; abandoning session");
                    if let Err(abandon_err) = self.sessions.abandon_session(&instance_id).await {
                        warn!(target: "duraflow::runtime", instance_id = %instance_id, error = %abandon_err, "abandon after commit failure failed");
                    }
                    return CycleOutcome::Committed;
                }
            }
        }

        if !transition.timer_messages.is_empty() {
            self.timers.interrupt();
        }

        debug!(
            target: "duraflow::runtime",
            instance_id = %instance_id,
            worker_id = %worker_id,
            status = %state.status,
            "orchestration cycle committed"
        );

        // Release runs in its own transaction. A crash between the two leaves
        // a terminal session behind; the next accept or the boot sweep
        // releases it.
        if terminal {
            if let Err(e) = self.release_with_retry(&instance_id).await {
                warn!(target: "duraflow::runtime", instance_id = %instance_id, error = %e, "terminal release failed; boot sweep will repair");
            }
        }
        CycleOutcome::Committed
    }

    async fn release_with_retry(&self, instance_id: &str) -> Result<(), StoreError> {
        let mut attempts = 0u32;
        loop {
            let mut txn = self.store.begin_transaction().await;
            self.sessions.release_session(txn.as_mut(), instance_id).await?;
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
