//! Shared test fixtures: a deterministic scripted executor, the activity
//! registry used by the end-to-end scenarios, and runtime setup helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use duraflow::runtime::registry::ActivityRegistry;
use duraflow::store::in_memory::InMemoryStore;
use duraflow::{
    Client, EventKind, ExecutorError, HistoryEvent, OrchestrationInstance, OrchestrationState,
    OrchestrationStatus, OrchestrationWorkItem, Runtime, RuntimeOptions, TaskFailure, TaskMessage, Transition,
};

pub mod fault_injection;

/// Deterministic executor covering the test orchestrations.
///
/// Folds the claimed messages into the history (assigning sequence ids), then
/// decides the next scheduling step per orchestration name. Pure with respect
/// to its inputs: re-running a cycle on the same history and messages yields
/// the same transition.
pub struct ScriptedExecutor;

/// Append `event` to `history` with the next sequence id; returns the stamped
/// event.
fn push_event(history: &mut Vec<HistoryEvent>, next_id: &mut i64, mut event: HistoryEvent) -> HistoryEvent {
    event.event_id = *next_id;
    *next_id += 1;
    history.push(event.clone());
    event
}

#[async_trait]
impl duraflow::OrchestrationExecutor for ScriptedExecutor {
    async fn execute(&self, item: OrchestrationWorkItem) -> Result<Transition, ExecutorError> {
        let target = item
            .new_messages
            .first()
            .map(|m| m.target.clone())
            .unwrap_or_else(|| OrchestrationInstance::new(item.instance_id.clone(), "unknown"));

        let mut history = item.runtime_state.clone();
        let mut next_id = history.iter().map(|e| e.event_id).max().unwrap_or(0) + 1;

        for message in &item.new_messages {
            push_event(&mut history, &mut next_id, message.event.clone());
        }

        let mut activity_messages = Vec::new();
        let mut timer_messages = Vec::new();
        let mut continue_as_new = None;

        let started = history.iter().find_map(|e| match &e.kind {
            EventKind::ExecutionStarted {
                name, version, input, ..
            } => Some((name.clone(), version.clone(), input.clone(), e.timestamp_ms)),
            _ => None,
        });

        let Some((name, version, input, started_at_ms)) = started else {
            // Message for an instance that no longer exists (e.g. a timer
            // surviving termination): terminate the orphaned session.
            let reason = "orphaned message".to_string();
            push_event(
                &mut history,
                &mut next_id,
                HistoryEvent::new(EventKind::ExecutionTerminated { reason: reason.clone() }),
            );
            let state = snapshot(&target, "unknown", "0.0.0", "", Some(reason), OrchestrationStatus::Terminated, 0);
            return Ok(Transition {
                new_runtime_state: history,
                activity_messages,
                orchestrator_messages: Vec::new(),
                timer_messages,
                continue_as_new,
                state,
            });
        };

        let terminal = history.iter().rev().find_map(|e| match &e.kind {
            EventKind::ExecutionCompleted { result } => Some((OrchestrationStatus::Completed, result.clone())),
            EventKind::ExecutionFailed { reason, .. } => Some((OrchestrationStatus::Failed, Some(reason.clone()))),
            EventKind::ExecutionTerminated { reason } => Some((OrchestrationStatus::Terminated, Some(reason.clone()))),
            _ => None,
        });

        let (status, output) = if let Some(terminal) = terminal {
            terminal
        } else {
            let completion = last_task_completion(&history);
            match name.as_str() {
                // S1: one activity, greets its result.
                "Greet" => match completion {
                    None if !any_task_scheduled(&history) => {
                        let scheduled = push_event(
                            &mut history,
                            &mut next_id,
                            HistoryEvent::new(EventKind::TaskScheduled {
                                name: "GetUser".into(),
                                version: None,
                                input: input.clone(),
                            }),
                        );
                        activity_messages.push(TaskMessage::new(target.clone(), scheduled));
                        (OrchestrationStatus::Running, None)
                    }
                    Some(TaskOutcome::Completed(user)) => {
                        let result = format!("Hello, {user}!");
                        push_event(
                            &mut history,
                            &mut next_id,
                            HistoryEvent::new(EventKind::ExecutionCompleted {
                                result: Some(result.clone()),
                            }),
                        );
                        (OrchestrationStatus::Completed, Some(result))
                    }
                    Some(TaskOutcome::Failed(reason, details)) => {
                        push_event(
                            &mut history,
                            &mut next_id,
                            HistoryEvent::new(EventKind::ExecutionFailed {
                                reason: reason.clone(),
                                details,
                            }),
                        );
                        (OrchestrationStatus::Failed, Some(reason))
                    }
                    _ => (OrchestrationStatus::Running, None),
                },

                // S3: catches the typed activity failure and completes.
                "HandleFailure" => match completion {
                    None if !any_task_scheduled(&history) => {
                        let scheduled = push_event(
                            &mut history,
                            &mut next_id,
                            HistoryEvent::new(EventKind::TaskScheduled {
                                name: "Boom".into(),
                                version: None,
                                input: String::new(),
                            }),
                        );
                        activity_messages.push(TaskMessage::new(target.clone(), scheduled));
                        (OrchestrationStatus::Running, None)
                    }
                    Some(TaskOutcome::Failed(reason, _)) => {
                        let result = format!("handled:{reason}");
                        push_event(
                            &mut history,
                            &mut next_id,
                            HistoryEvent::new(EventKind::ExecutionCompleted {
                                result: Some(result.clone()),
                            }),
                        );
                        (OrchestrationStatus::Completed, Some(result))
                    }
                    Some(TaskOutcome::Completed(_)) => {
                        push_event(
                            &mut history,
                            &mut next_id,
                            HistoryEvent::new(EventKind::ExecutionFailed {
                                reason: "expected failure".into(),
                                details: None,
                            }),
                        );
                        (OrchestrationStatus::Failed, Some("expected failure".into()))
                    }
                    _ => (OrchestrationStatus::Running, None),
                },

                // S4 / the panic scenario: one activity, fails on its failure.
                "CallUnknown" | "CallPanicky" => match completion {
                    None if !any_task_scheduled(&history) => {
                        let activity = if name == "CallUnknown" { "UnknownTask" } else { "Panicky" };
                        let scheduled = push_event(
                            &mut history,
                            &mut next_id,
                            HistoryEvent::new(EventKind::TaskScheduled {
                                name: activity.into(),
                                version: None,
                                input: input.clone(),
                            }),
                        );
                        activity_messages.push(TaskMessage::new(target.clone(), scheduled));
                        (OrchestrationStatus::Running, None)
                    }
                    Some(TaskOutcome::Completed(out)) => {
                        push_event(
                            &mut history,
                            &mut next_id,
                            HistoryEvent::new(EventKind::ExecutionCompleted { result: Some(out.clone()) }),
                        );
                        (OrchestrationStatus::Completed, Some(out))
                    }
                    Some(TaskOutcome::Failed(reason, details)) => {
                        let output = match &details {
                            Some(d) => format!("{reason}: {d}"),
                            None => reason.clone(),
                        };
                        push_event(
                            &mut history,
                            &mut next_id,
                            HistoryEvent::new(EventKind::ExecutionFailed { reason, details }),
                        );
                        (OrchestrationStatus::Failed, Some(output))
                    }
                    _ => (OrchestrationStatus::Running, None),
                },

                // S2: waits out one timer, then echoes its input text.
                "TimedEcho" => {
                    let timer_fired = history.iter().any(|e| matches!(e.kind, EventKind::TimerFired { .. }));
                    let timer_created = history.iter().any(|e| matches!(e.kind, EventKind::TimerCreated { .. }));
                    if timer_fired {
                        let text = echo_text(&input);
                        push_event(
                            &mut history,
                            &mut next_id,
                            HistoryEvent::new(EventKind::ExecutionCompleted { result: Some(text.clone()) }),
                        );
                        (OrchestrationStatus::Completed, Some(text))
                    } else if !timer_created {
                        let fire_at_ms = started_at_ms + echo_delay_ms(&input);
                        let created = push_event(
                            &mut history,
                            &mut next_id,
                            HistoryEvent::new(EventKind::TimerCreated { fire_at_ms }),
                        );
                        let mut fired = HistoryEvent::new(EventKind::TimerFired { fire_at_ms });
                        fired.event_id = created.event_id;
                        timer_messages.push(TaskMessage::new(target.clone(), fired));
                        (OrchestrationStatus::Running, None)
                    } else {
                        (OrchestrationStatus::Running, None)
                    }
                }

                // Completes with the payload of the first raised event.
                "EchoEvent" => {
                    let raised = history.iter().find_map(|e| match &e.kind {
                        EventKind::EventRaised { input, .. } => Some(input.clone().unwrap_or_default()),
                        _ => None,
                    });
                    match raised {
                        Some(data) => {
                            push_event(
                                &mut history,
                                &mut next_id,
                                HistoryEvent::new(EventKind::ExecutionCompleted { result: Some(data.clone()) }),
                            );
                            (OrchestrationStatus::Completed, Some(data))
                        }
                        None => (OrchestrationStatus::Running, None),
                    }
                }

                // Exercises the unsupported continue-as-new path.
                "Restarts" => {
                    continue_as_new = Some(TaskMessage::new(
                        target.clone(),
                        HistoryEvent::new(EventKind::ExecutionStarted {
                            name: name.clone(),
                            version: version.clone(),
                            input: input.clone(),
                            parent_instance: None,
                            parent_task_id: None,
                        }),
                    ));
                    (OrchestrationStatus::ContinuedAsNew, None)
                }

                other => {
                    return Err(ExecutorError::new(format!("unknown orchestration: {other}")));
                }
            }
        };

        let state = snapshot(&target, &name, &version, &input, output, status, started_at_ms);
        Ok(Transition {
            new_runtime_state: history,
            activity_messages,
            orchestrator_messages: Vec::new(),
            timer_messages,
            continue_as_new,
            state,
        })
    }
}

enum TaskOutcome {
    Completed(String),
    Failed(String, Option<String>),
}

fn any_task_scheduled(history: &[HistoryEvent]) -> bool {
    history.iter().any(|e| matches!(e.kind, EventKind::TaskScheduled { .. }))
}

fn last_task_completion(history: &[HistoryEvent]) -> Option<TaskOutcome> {
    history.iter().rev().find_map(|e| match &e.kind {
        EventKind::TaskCompleted { output, .. } => {
            Some(TaskOutcome::Completed(output.clone().unwrap_or_default()))
        }
        EventKind::TaskFailed { reason, details, .. } => {
            Some(TaskOutcome::Failed(reason.clone(), details.clone()))
        }
        _ => None,
    })
}

fn snapshot(
    target: &OrchestrationInstance,
    name: &str,
    version: &str,
    input: &str,
    output: Option<String>,
    status: OrchestrationStatus,
    created_at_ms: u64,
) -> OrchestrationState {
    OrchestrationState {
        instance: target.clone(),
        name: name.to_string(),
        version: version.to_string(),
        input: input.to_string(),
        output,
        status,
        created_at_ms,
        completed_at_ms: None,
        last_updated_ms: 0,
        size: 0,
        tags: HashMap::new(),
    }
}

/// `TimedEcho` input: `{"delay_ms": 2000, "text": "hi"}`.
pub fn timed_echo_input(delay_ms: u64, text: &str) -> String {
    serde_json::json!({ "delay_ms": delay_ms, "text": text }).to_string()
}

fn echo_delay_ms(input: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(input)
        .ok()
        .and_then(|v| v.get("delay_ms").and_then(|d| d.as_u64()))
        .unwrap_or(0)
}

fn echo_text(input: &str) -> String {
    serde_json::from_str::<serde_json::Value>(input)
        .ok()
        .and_then(|v| v.get("text").and_then(|t| t.as_str().map(str::to_string)))
        .unwrap_or_default()
}

/// Activity registry backing the end-to-end scenarios.
pub fn scenario_activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("GetUser", |_ctx, input: String| async move { Ok(input) })
        .register("Echo", |_ctx, input: String| async move { Ok(input) })
        .register("Boom", |_ctx, _input: String| async move {
            Err(TaskFailure::new("boom"))
        })
        .register("Panicky", |_ctx, input: String| async move {
            if input != "never" {
                panic!("kaboom");
            }
            Ok(input)
        })
        .build()
}

pub fn test_options() -> RuntimeOptions {
    RuntimeOptions {
        receive_timeout: std::time::Duration::from_millis(100),
        timer_tick_cap: std::time::Duration::from_millis(100),
        ..RuntimeOptions::default()
    }
}

/// Runtime + client over a fresh in-memory store.
pub async fn start_runtime() -> (Arc<Runtime>, Client, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let runtime = start_runtime_with_store(store.clone()).await;
    let client = Client::new(store.clone());
    (runtime, client, store)
}

pub async fn start_runtime_with_store(store: Arc<InMemoryStore>) -> Arc<Runtime> {
    Runtime::start_with_store(
        store,
        Arc::new(ScriptedExecutor),
        Arc::new(scenario_activities()),
        test_options(),
    )
    .await
    .expect("runtime should start")
}
