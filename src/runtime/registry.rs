//! Registry of user activity implementations.
//!
//! Activities are resolved by `(name, version)` when the activity dispatcher
//! picks up a `TaskScheduled` message. A scheduled version must match a
//! registered version exactly; messages without a version resolve to the
//! highest registered version of the name.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::TaskFailure;

/// Version assumed for activities registered without one.
const DEFAULT_VERSION: &str = "1.0.0";

/// Per-invocation context handed to activity code.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub instance_id: String,
    pub execution_id: String,
    pub activity_name: String,
    /// `event_id` of the `TaskScheduled` event this invocation answers.
    pub task_scheduled_id: i64,
    pub worker_id: String,
}

/// Trait implemented by activity handlers invoked by the worker dispatcher.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, TaskFailure>;
}

/// Function wrapper that implements [`ActivityHandler`].
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, TaskFailure>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, TaskFailure>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, TaskFailure> {
        (self.0)(ctx, input).await
    }
}

/// Immutable map of activity names to versioned handlers.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    inner: Arc<HashMap<String, BTreeMap<String, Arc<dyn ActivityHandler>>>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder {
            map: HashMap::new(),
        }
    }

    /// Resolve a handler for `(name, version)`.
    ///
    /// An explicit version must match exactly; `None` picks the highest
    /// registered version. `None` result means the type is missing and the
    /// dispatcher synthesizes a `TaskFailed { reason: "TypeMissing" }`.
    pub fn resolve(&self, name: &str, version: Option<&str>) -> Option<Arc<dyn ActivityHandler>> {
        let versions = self.inner.get(name)?;
        match version {
            Some(v) => versions.get(v).cloned(),
            None => versions.values().next_back().cloned(),
        }
    }

    pub fn activity_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

/// Builder for [`ActivityRegistry`].
pub struct ActivityRegistryBuilder {
    map: HashMap<String, BTreeMap<String, Arc<dyn ActivityHandler>>>,
}

impl ActivityRegistryBuilder {
    /// Register an activity at the default version.
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, TaskFailure>> + Send + 'static,
    {
        self.register_versioned(name, DEFAULT_VERSION, f)
    }

    /// Register an activity at an explicit version.
    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, TaskFailure>> + Send + 'static,
    {
        self.map
            .entry(name.into())
            .or_default()
            .insert(version.into(), Arc::new(FnActivity(f)));
        self
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
}
