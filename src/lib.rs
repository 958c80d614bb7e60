//! # Duraflow: durable task orchestration over a transactional K/V store
//!
//! Duraflow executes user-defined *orchestrations*, deterministic programs
//! that schedule *activities*, wait on *timers*, and progress through a
//! replayable history, on top of any transactional key-value store that can
//! offer named dictionaries and multi-dictionary ACID commits.
//!
//! The crate is the persistence and dispatch core, not the deterministic
//! replay engine. The executor is an external collaborator behind
//! [`OrchestrationExecutor`]: it consumes `(history, new_messages)` and
//! produces a [`Transition`]: new history, outbound activity messages,
//! timers, and the instance state snapshot. Duraflow's job is to make every
//! transition durable in exactly one transaction and to redeliver work after
//! crashes without losing or duplicating visible effects.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use duraflow::store::in_memory::InMemoryStore;
//! use duraflow::runtime::registry::ActivityRegistry;
//! use duraflow::{Client, Runtime, RuntimeOptions};
//! use std::sync::Arc;
//!
//! # async fn example(executor: Arc<dyn duraflow::OrchestrationExecutor>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryStore::new());
//!
//! let activities = ActivityRegistry::builder()
//!     .register("GetUser", |_ctx, name: String| async move { Ok(name) })
//!     .build();
//!
//! let rt = Runtime::start_with_store(
//!     store.clone(), executor, Arc::new(activities), RuntimeOptions::default(),
//! ).await?;
//!
//! let client = Client::new(store.clone());
//! let instance = client.create_instance("Greet", "1.0.0", Some("inst-1".into()), "\"Alice\"", None).await?;
//! let state = client.wait_for_instance(&instance.instance_id, std::time::Duration::from_secs(30)).await?;
//! println!("{:?}: {:?}", state.status, state.output);
//! rt.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Durability model
//!
//! - **Sessions** hold each instance's runtime state plus its inbound message
//!   queue, with an at-most-one in-flight lock per session.
//! - **The activity queue** persists outbound task messages with
//!   lock-and-complete semantics.
//! - **The timer set** buffers future-dated messages ordered by fire time and
//!   releases them into their target session on expiry.
//! - **The instance store** keeps the latest state snapshot per execution,
//!   migrating terminal states into hourly cold archives reaped after 24 h.
//!
//! Every orchestration turn commits its session update, activity appends,
//! timer inserts, cross-session messages, and state snapshot in a single
//! store transaction; a reader never observes a partial transition.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod client;
pub mod clock;
pub mod providers;
pub mod runtime;
pub mod store;

pub use client::{Client, ClientError};
pub use runtime::executor::{ExecutorError, OrchestrationExecutor, OrchestrationWorkItem, Transition};
pub use runtime::registry::{ActivityContext, ActivityRegistry};
pub use runtime::{Runtime, RuntimeOptions};

/// Event id carried by messages that are not yet part of a history.
///
/// The executor assigns non-negative sequence numbers when it folds a message
/// into the runtime state; everything produced outside the executor (activity
/// responses, raised events, start messages) travels with this sentinel.
pub const NO_EVENT_ID: i64 = -1;

/// Identity of one execution of an orchestration instance.
///
/// `instance_id` is the stable, caller-visible identifier; `execution_id`
/// distinguishes restarts of the same instance. The current core runs a
/// single execution per instance (`ContinueAsNew` is rejected), but the pair
/// is kept on every message and state row so completions route unambiguously.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrchestrationInstance {
    pub instance_id: String,
    pub execution_id: String,
}

impl OrchestrationInstance {
    pub fn new(instance_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
        }
    }
}

impl std::fmt::Display for OrchestrationInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.instance_id, self.execution_id)
    }
}

/// One entry of an orchestration history.
///
/// `event_id` is the sequence number inside the execution history
/// ([`NO_EVENT_ID`] until the executor folds the event in); `timestamp_ms`
/// is wall-clock epoch milliseconds at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

impl HistoryEvent {
    /// Create a fresh (not-yet-historized) event stamped with the current time.
    pub fn new(kind: EventKind) -> Self {
        Self::with_timestamp(crate::clock::wall_clock_ms(), kind)
    }

    pub fn with_timestamp(timestamp_ms: u64, kind: EventKind) -> Self {
        Self {
            event_id: NO_EVENT_ID,
            timestamp_ms,
            kind,
        }
    }

    /// True for events that end an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ExecutionCompleted { .. }
                | EventKind::ExecutionFailed { .. }
                | EventKind::ExecutionTerminated { .. }
        )
    }
}

/// Tagged history event variants.
///
/// Scheduling events and their completions are paired through
/// `task_scheduled_id`, the `event_id` of the originating scheduling event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Execution was created by name with input.
    ExecutionStarted {
        name: String,
        version: String,
        input: String,
        parent_instance: Option<OrchestrationInstance>,
        parent_task_id: Option<i64>,
    },

    /// Execution finished with a final result.
    ExecutionCompleted { result: Option<String> },

    /// Execution finished with a final error.
    ExecutionFailed {
        reason: String,
        details: Option<String>,
    },

    /// Execution was terminated by an external caller.
    ExecutionTerminated { reason: String },

    /// Activity was scheduled.
    TaskScheduled {
        name: String,
        version: Option<String>,
        input: String,
    },

    /// Activity completed successfully.
    TaskCompleted {
        task_scheduled_id: i64,
        output: Option<String>,
    },

    /// Activity failed.
    TaskFailed {
        task_scheduled_id: i64,
        reason: String,
        details: Option<String>,
    },

    /// Timer was created and will logically fire at `fire_at_ms`.
    TimerCreated { fire_at_ms: u64 },

    /// Timer fired at logical time `fire_at_ms`.
    TimerFired { fire_at_ms: u64 },

    /// Child orchestration was scheduled.
    SubOrchestrationInstanceCreated {
        name: String,
        version: Option<String>,
        instance_id: String,
        input: String,
    },

    /// Child orchestration completed and returned a result to the parent.
    SubOrchestrationInstanceCompleted {
        task_scheduled_id: i64,
        output: Option<String>,
    },

    /// Child orchestration failed and returned the error to the parent.
    SubOrchestrationInstanceFailed {
        task_scheduled_id: i64,
        reason: String,
        details: Option<String>,
    },

    /// Child orchestration could not be started.
    SubOrchestrationInstanceStartFailed { task_scheduled_id: i64, cause: String },

    /// External event was raised against the instance.
    EventRaised { name: String, input: Option<String> },
}

/// Envelope routing a history event to an orchestration instance's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub target: OrchestrationInstance,
    pub event: HistoryEvent,
}

impl TaskMessage {
    pub fn new(target: OrchestrationInstance, event: HistoryEvent) -> Self {
        Self { target, event }
    }
}

/// Disposition of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Completed,
    ContinuedAsNew,
    Failed,
    Canceled,
    Terminated,
}

impl OrchestrationStatus {
    /// True once the execution can never progress again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrchestrationStatus::Pending | OrchestrationStatus::Running)
    }
}

impl std::fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrchestrationStatus::Pending => "Pending",
            OrchestrationStatus::Running => "Running",
            OrchestrationStatus::Completed => "Completed",
            OrchestrationStatus::ContinuedAsNew => "ContinuedAsNew",
            OrchestrationStatus::Failed => "Failed",
            OrchestrationStatus::Canceled => "Canceled",
            OrchestrationStatus::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// Latest known state snapshot of one execution.
///
/// Written by the instance store under the same transaction that advances the
/// session, so readers always observe a snapshot consistent with the last
/// committed transition. `output` carries the result on success or the
/// serialized failure on terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub instance: OrchestrationInstance,
    pub name: String,
    pub version: String,
    pub input: String,
    pub output: Option<String>,
    pub status: OrchestrationStatus,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub last_updated_ms: u64,
    /// Serialized size of the runtime state backing this snapshot, in bytes.
    pub size: u64,
    pub tags: HashMap<String, String>,
}

/// Typed failure produced by user activity code.
///
/// A `TaskFailure` is a business outcome, not an infrastructure error: the
/// activity dispatcher converts it into a `TaskFailed` history event and the
/// cycle commits normally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub reason: String,
    pub details: Option<String>,
}

impl TaskFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            details: None,
        }
    }

    pub fn with_details(reason: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            details: Some(details.into()),
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.details {
            Some(d) => write!(f, "{}: {}", self.reason, d),
            None => f.write_str(&self.reason),
        }
    }
}

impl std::error::Error for TaskFailure {}
