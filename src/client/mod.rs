//! Client façade for starting, signalling, and observing orchestrations.
//!
//! The client communicates with the runtime **only through the shared state
//! store**: it appends messages into sessions and reads state snapshots, so
//! it can run in any process, including one without a running `Runtime`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::clock::{Clock, UtcClock};
use crate::providers::instances::InstanceStore;
use crate::providers::sessions::{session_stack, SessionsProvider};
use crate::store::{commit_backoff, StateStore, StoreError, COMMIT_MAX_ATTEMPTS};
use crate::{
    EventKind, HistoryEvent, OrchestrationInstance, OrchestrationState, OrchestrationStatus, TaskMessage,
};

// Constants for polling behavior in wait_for_instance
/// Initial delay between status polls (5ms)
const INITIAL_POLL_DELAY_MS: u64 = 5;

/// Maximum delay between status polls (100ms)
const MAX_POLL_DELAY_MS: u64 = 100;

/// Multiplier for exponential backoff
const POLL_DELAY_MULTIPLIER: u64 = 2;

/// Client-facing error type.
#[derive(Debug, Clone)]
pub enum ClientError {
    /// Store operation failed (wraps [`StoreError`]).
    Store(StoreError),

    /// `create_instance` targeted an instance that is still Pending/Running.
    InstanceAlreadyExists { instance_id: String },

    /// The instance has no recorded execution.
    InstanceNotFound { instance_id: String },

    /// `wait_for_instance` ran out of time.
    Timeout,
}

impl ClientError {
    /// Check if this error is retryable (only applies to store errors).
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Store(e) => e.is_retryable(),
            ClientError::InstanceAlreadyExists { .. } => false,
            ClientError::InstanceNotFound { .. } => false,
            ClientError::Timeout => true,
        }
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Store(e) => write!(f, "{e}"),
            ClientError::InstanceAlreadyExists { instance_id } => {
                write!(f, "instance {instance_id} already exists and is not terminal")
            }
            ClientError::InstanceNotFound { instance_id } => write!(f, "instance {instance_id} not found"),
            ClientError::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        ClientError::Store(e)
    }
}

/// Client for orchestration control-plane operations.
///
/// `Client` is cheap to clone and can be shared across threads; all state
/// lives in the store.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn StateStore>,
    sessions: Arc<SessionsProvider>,
    instances: Arc<InstanceStore>,
    clock: Arc<dyn Clock>,
}

impl Client {
    /// Create a client bound to a state store (the same store the runtime
    /// uses).
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_clock(store, Arc::new(UtcClock))
    }

    /// Create a client with an explicit clock (tests drive a manual clock).
    pub fn with_clock(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        let (sessions, _timers) = session_stack(store.clone(), clock.clone());
        let instances = Arc::new(InstanceStore::new(store.clone(), clock.clone()));
        Self {
            store,
            sessions,
            instances,
            clock,
        }
    }

    /// Start a new orchestration instance.
    ///
    /// Appends an `ExecutionStarted` message into the target session and
    /// writes the Pending state snapshot under one transaction. The
    /// execution id is generated when not supplied through `instance_id`
    /// reuse; starting an instance whose latest execution is still running
    /// fails with [`ClientError::InstanceAlreadyExists`].
    pub async fn create_instance(
        &self,
        name: &str,
        version: &str,
        instance_id: Option<String>,
        input: &str,
        tags: Option<HashMap<String, String>>,
    ) -> Result<OrchestrationInstance, ClientError> {
        let instance_id = instance_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let execution_id = uuid::Uuid::new_v4().simple().to_string();
        let instance = OrchestrationInstance::new(&instance_id, &execution_id);

        if let Some(existing) = self.instances.get_state(&instance_id).await? {
            if !existing.status.is_terminal() {
                return Err(ClientError::InstanceAlreadyExists { instance_id });
            }
        }

        let now_ms = self.clock.now_ms();
        let start = TaskMessage::new(
            instance.clone(),
            HistoryEvent::with_timestamp(
                now_ms,
                EventKind::ExecutionStarted {
                    name: name.to_string(),
                    version: version.to_string(),
                    input: input.to_string(),
                    parent_instance: None,
                    parent_task_id: None,
                },
            ),
        );
        let state = OrchestrationState {
            instance: instance.clone(),
            name: name.to_string(),
            version: version.to_string(),
            input: input.to_string(),
            output: None,
            status: OrchestrationStatus::Pending,
            created_at_ms: now_ms,
            completed_at_ms: None,
            last_updated_ms: now_ms,
            size: 0,
            tags: tags.unwrap_or_default(),
        };

        let mut attempts = 0u32;
        loop {
            let mut txn = self.store.begin_transaction().await;
            let staged = async {
                self.sessions.append_message(txn.as_mut(), start.clone()).await?;
                self.instances.write_entities(txn.as_mut(), &[state.clone()]).await?;
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
                    debug!(target: "duraflow::client", attempts, error = %e, "create_instance commit failed; retrying");
                    tokio::time::sleep(commit_backoff(attempts)).await;
                    attempts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        debug!(
            target: "duraflow::client",
            instance_id = %instance.instance_id,
            execution_id = %instance.execution_id,
            orchestration_name = %name,
            "instance created"
        );
        Ok(instance)
    }

    /// Raise an external event against a running instance.
    pub async fn raise_event(
        &self,
        instance_id: &str,
        event_name: &str,
        input: Option<String>,
    ) -> Result<(), ClientError> {
        let event = EventKind::EventRaised {
            name: event_name.to_string(),
            input,
        };
        self.append_to_latest(instance_id, event).await
    }

    /// Request termination of a running instance.
    pub async fn terminate_instance(&self, instance_id: &str, reason: &str) -> Result<(), ClientError> {
        let event = EventKind::ExecutionTerminated {
            reason: reason.to_string(),
        };
        self.append_to_latest(instance_id, event).await
    }

    async fn append_to_latest(&self, instance_id: &str, kind: EventKind) -> Result<(), ClientError> {
        let Some(execution_id) = self.instances.latest_execution_id(instance_id).await? else {
            return Err(ClientError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        };
        let message = TaskMessage::new(
            OrchestrationInstance::new(instance_id, execution_id),
            HistoryEvent::with_timestamp(self.clock.now_ms(), kind),
        );
        let mut attempts = 0u32;
        loop {
            let mut txn = self.store.begin_transaction().await;
            let staged = self.sessions.append_message(txn.as_mut(), message.clone()).await;
            let result = match staged {
                Ok(()) => txn.commit().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempts < COMMIT_MAX_ATTEMPTS => {
                    debug!(target: "duraflow::client", attempts, error = %e, "append commit failed; retrying");
                    tokio::time::sleep(commit_backoff(attempts)).await;
                    attempts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Latest execution's state for the instance.
    pub async fn get_state(&self, instance_id: &str) -> Result<Option<OrchestrationState>, ClientError> {
        Ok(self.instances.get_state(instance_id).await?)
    }

    /// State of one specific execution.
    pub async fn get_state_of(
        &self,
        instance_id: &str,
        execution_id: &str,
    ) -> Result<Option<OrchestrationState>, ClientError> {
        Ok(self.instances.get_state_of(instance_id, execution_id).await?)
    }

    /// Poll until the instance reaches a terminal status or `timeout`
    /// elapses.
    pub async fn wait_for_instance(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<OrchestrationState, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay_ms = INITIAL_POLL_DELAY_MS;
        loop {
            if let Some(state) = self.instances.get_state(instance_id).await? {
                if state.status.is_terminal() {
                    return Ok(state);
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout);
            }
            let sleep = Duration::from_millis(delay_ms).min(deadline - now);
            tokio::time::sleep(sleep).await;
            delay_ms = (delay_ms * POLL_DELAY_MULTIPLIER).min(MAX_POLL_DELAY_MS);
        }
    }
}
