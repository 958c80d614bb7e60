//! Timer scheduler semantics: monotonic firing order and deterministic
//! tiebreaks, driven by a manual clock.

use std::sync::Arc;
use std::time::Duration;

use duraflow::clock::ManualClock;
use duraflow::providers::sessions::{session_stack, SessionsProvider};
use duraflow::providers::timers::{TimerEntry, TimerScheduler};
use duraflow::store::in_memory::InMemoryStore;
use duraflow::store::StateStore;
use duraflow::{EventKind, HistoryEvent, OrchestrationInstance, TaskMessage};

struct Fixture {
    sessions: Arc<SessionsProvider>,
    timers: Arc<TimerScheduler>,
    store: Arc<dyn StateStore>,
    clock: Arc<ManualClock>,
}

fn fixture(now_ms: u64) -> Fixture {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(now_ms));
    let (sessions, timers) = session_stack(store.clone(), clock.clone());
    Fixture {
        sessions,
        timers,
        store,
        clock,
    }
}

fn timer_message(instance: &str, event_id: i64, fire_at_ms: u64) -> TaskMessage {
    let mut event = HistoryEvent::with_timestamp(0, EventKind::TimerFired { fire_at_ms });
    event.event_id = event_id;
    TaskMessage::new(OrchestrationInstance::new(instance, "exec-1"), event)
}

async fn schedule_all(f: &Fixture, messages: Vec<TaskMessage>) {
    let entries: Vec<TimerEntry> = messages
        .into_iter()
        .map(|m| TimerEntry::for_message(m).unwrap())
        .collect();
    let mut txn = f.store.begin_transaction().await;
    f.timers.schedule(txn.as_mut(), &entries).await.unwrap();
    txn.commit().await.unwrap();
}

fn fire_times(session: &duraflow::providers::PersistentSession) -> Vec<u64> {
    session
        .messages
        .iter()
        .map(|m| match m.message.event.kind {
            EventKind::TimerFired { fire_at_ms } => fire_at_ms,
            ref other => panic!("expected TimerFired, got {other:?}"),
        })
        .collect()
}

#[tokio::test]
async fn expired_timers_inject_in_ascending_fire_order() {
    let f = fixture(0);
    // Scheduled out of order on purpose.
    schedule_all(
        &f,
        vec![
            timer_message("i1", 3, 3_000),
            timer_message("i1", 1, 1_000),
            timer_message("i1", 2, 2_000),
        ],
    )
    .await;

    f.clock.set(5_000);
    let fired = f.timers.fire_due(&f.sessions).await.unwrap();
    assert_eq!(fired, 3);

    let session = f.sessions.read_session("i1").await.unwrap().unwrap();
    assert_eq!(fire_times(&session), vec![1_000, 2_000, 3_000]);
}

#[tokio::test]
async fn unexpired_timers_stay_scheduled() {
    let f = fixture(0);
    schedule_all(
        &f,
        vec![timer_message("i1", 1, 1_000), timer_message("i1", 2, 10_000)],
    )
    .await;

    f.clock.set(1_000);
    assert_eq!(f.timers.fire_due(&f.sessions).await.unwrap(), 1);
    let session = f.sessions.read_session("i1").await.unwrap().unwrap();
    assert_eq!(fire_times(&session), vec![1_000]);

    // Nothing else due yet.
    assert_eq!(f.timers.fire_due(&f.sessions).await.unwrap(), 0);

    f.clock.set(10_000);
    assert_eq!(f.timers.fire_due(&f.sessions).await.unwrap(), 1);
    let session = f.sessions.read_session("i1").await.unwrap().unwrap();
    assert_eq!(fire_times(&session), vec![1_000, 10_000]);
}

#[tokio::test]
async fn simultaneous_timers_break_ties_deterministically() {
    let f = fixture(0);
    // Same fire time everywhere: order must follow (instance, event_id).
    schedule_all(
        &f,
        vec![
            timer_message("b", 1, 1_000),
            timer_message("a", 2, 1_000),
            timer_message("a", 1, 1_000),
        ],
    )
    .await;

    f.clock.set(1_000);
    f.timers.fire_due(&f.sessions).await.unwrap();

    let a = f.sessions.read_session("a").await.unwrap().unwrap();
    let ids: Vec<i64> = a.messages.iter().map(|m| m.message.event.event_id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert!(f.sessions.read_session("b").await.unwrap().is_some());
}

#[tokio::test]
async fn wake_delay_tracks_earliest_entry() {
    let f = fixture(0);
    schedule_all(&f, vec![timer_message("i1", 1, 4_000)]).await;
    assert_eq!(f.timers.wake_delay(1_000).await.unwrap(), Duration::from_millis(3_000));
    // Past-due entries report zero delay.
    assert_eq!(f.timers.wake_delay(9_000).await.unwrap(), Duration::ZERO);
}
