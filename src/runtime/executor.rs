//! Seam to the deterministic orchestration executor.
//!
//! The executor is an external collaborator: a pure function of the recorded
//! history and the newly claimed messages. It performs no I/O and makes no
//! scheduling decisions of its own: the dispatcher feeds it a
//! [`OrchestrationWorkItem`] and commits the returned [`Transition`]
//! atomically.

use async_trait::async_trait;

use crate::{HistoryEvent, OrchestrationState, TaskMessage};

/// One claimed batch of work for a single orchestration instance.
#[derive(Debug, Clone)]
pub struct OrchestrationWorkItem {
    pub instance_id: String,
    /// Complete recorded history for the instance's execution.
    pub runtime_state: Vec<HistoryEvent>,
    /// Messages claimed by this cycle, in append order.
    pub new_messages: Vec<TaskMessage>,
}

/// Output of one executor invocation: the new history plus all outbound
/// effects, committed by the dispatcher in a single transaction.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Replacement runtime state (full history, not a delta).
    pub new_runtime_state: Vec<HistoryEvent>,
    /// `TaskScheduled` messages bound for the activity queue.
    pub activity_messages: Vec<TaskMessage>,
    /// Messages for this or other orchestrator sessions (sub-orchestration
    /// starts, completions routed to parents).
    pub orchestrator_messages: Vec<TaskMessage>,
    /// `TimerFired` messages to surface at their fire time.
    pub timer_messages: Vec<TaskMessage>,
    /// Reserved: a continue-as-new restart request. The core rejects
    /// transitions that carry one.
    pub continue_as_new: Option<TaskMessage>,
    /// State snapshot reflecting `new_runtime_state`.
    pub state: OrchestrationState,
}

/// Error raised by the executor itself (not by user code it replays).
///
/// Deterministic executors fail the same way on the same inputs, so the
/// dispatcher re-locks without backoff but caps consecutive retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorError {
    pub message: String,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ExecutorError {}

/// Deterministic orchestration executor.
#[async_trait]
pub trait OrchestrationExecutor: Send + Sync {
    async fn execute(&self, item: OrchestrationWorkItem) -> Result<Transition, ExecutorError>;
}
