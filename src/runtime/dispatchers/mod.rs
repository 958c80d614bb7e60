//! Dispatcher implementations for Runtime
//!
//! This module contains the dispatcher logic split into separate concerns:
//! - `orchestration`: fetches sessions, runs the executor, commits transitions
//! - `worker`: fetches activity work items and executes user activities

mod orchestration;
mod worker;

/// Back-off applied after a transient store error before the next cycle.
pub(crate) const TRANSIENT_ERROR_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);
