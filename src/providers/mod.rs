//! Durable state providers backing the dispatch core.
//!
//! Each provider owns one slice of the reserved dictionary layout and exposes
//! transaction-scoped operations so a dispatcher cycle can combine session
//! updates, queue appends, timer inserts, and state snapshots into a single
//! atomic commit:
//!
//! | Dictionary | Owner |
//! |---|---|
//! | `Sess_Orchestrations` | [`sessions::SessionsProvider`] |
//! | `Act_Queue` | [`activities::ActivitiesProvider`] |
//! | `Timer_Set` | [`timers::TimerScheduler`] |
//! | `InstSt_Current`, `InstSt_ExecutionId`, `InstSt_<yyyy-MM-dd-HH>` | [`instances::InstanceStore`] |
//!
//! Dictionary handles are initialized lazily behind a one-shot guard and
//! never mutated afterwards; the replicated store stays the single source of
//! truth between dispatcher cycles.

use serde::{Deserialize, Serialize};

use crate::{HistoryEvent, TaskMessage};

pub mod activities;
pub mod instances;
pub mod sessions;
pub mod timers;

pub use activities::{ActivitiesProvider, ActivityWorkItem};
pub use instances::InstanceStore;
pub use sessions::SessionsProvider;
pub use timers::{TimerEntry, TimerScheduler};

/// Reserved dictionary names.
pub const SESSIONS_DICTIONARY: &str = "Sess_Orchestrations";
pub const ACTIVITIES_DICTIONARY: &str = "Act_Queue";
pub const TIMERS_DICTIONARY: &str = "Timer_Set";
pub const INSTANCES_DICTIONARY: &str = "InstSt_Current";
pub const EXECUTIONS_DICTIONARY: &str = "InstSt_ExecutionId";
/// Prefix shared by every instance-store dictionary, including the hourly
/// archive buckets `InstSt_<yyyy-MM-dd-HH>`.
pub const INSTANCE_STORE_PREFIX: &str = "InstSt_";

/// A task message inside a session queue, with its in-flight claim bit.
///
/// `locked = true` means the message was claimed by a dispatcher cycle and is
/// hidden from subsequent accept attempts until completed or abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockableTaskMessage {
    pub message: TaskMessage,
    pub locked: bool,
}

impl LockableTaskMessage {
    pub fn unlocked(message: TaskMessage) -> Self {
        Self {
            message,
            locked: false,
        }
    }
}

/// Durable per-instance session: runtime state plus inbound message queue.
///
/// Immutable value type: mutators return a new session. The persisted
/// `locked` bit enforces at-most-one in-flight dispatcher cycle per session;
/// it is not time-bounded, and stale bits left by a crash are repaired by the
/// boot sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentSession {
    pub session_id: String,
    pub runtime_state: Vec<HistoryEvent>,
    pub messages: Vec<LockableTaskMessage>,
    pub locked: bool,
}

impl PersistentSession {
    /// Fresh session created by the first message addressed to an instance.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            runtime_state: Vec::new(),
            messages: Vec::new(),
            locked: false,
        }
    }

    /// Session with `message` appended to its queue.
    pub fn with_message(mut self, message: TaskMessage) -> Self {
        self.messages.push(LockableTaskMessage::unlocked(message));
        self
    }

    /// True when any queued message is visible (not claimed).
    pub fn has_visible_messages(&self) -> bool {
        self.messages.iter().any(|m| !m.locked)
    }

    /// Claim the session and every currently-visible message for one
    /// dispatcher cycle.
    pub fn claim_visible(mut self) -> Self {
        self.locked = true;
        for m in &mut self.messages {
            m.locked = true;
        }
        self
    }

    /// Messages claimed by the last [`PersistentSession::claim_visible`], in
    /// append order.
    pub fn claimed_messages(&self) -> Vec<TaskMessage> {
        self.messages
            .iter()
            .filter(|m| m.locked)
            .map(|m| m.message.clone())
            .collect()
    }

    /// Session after a committed transition: new runtime state, claimed
    /// messages dropped, lock cleared.
    pub fn completed(mut self, new_runtime_state: Vec<HistoryEvent>) -> Self {
        self.runtime_state = new_runtime_state;
        self.messages.retain(|m| !m.locked);
        self.locked = false;
        self
    }

    /// Session with all claim bits cleared (abandon / boot sweep).
    pub fn released(mut self) -> Self {
        self.locked = false;
        for m in &mut self.messages {
            m.locked = false;
        }
        self
    }

    /// True when the runtime state has reached a terminal event.
    pub fn is_terminal(&self) -> bool {
        self.runtime_state.iter().any(HistoryEvent::is_terminal)
    }
}
