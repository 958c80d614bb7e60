//! Activity queue semantics: append-order claims, exact-row completion,
//! abandon visibility, counter seeding, and the boot sweep.

use std::sync::Arc;
use std::time::Duration;

use duraflow::providers::activities::ActivitiesProvider;
use duraflow::store::in_memory::InMemoryStore;
use duraflow::store::StateStore;
use duraflow::{EventKind, HistoryEvent, OrchestrationInstance, TaskMessage};

fn queue() -> (ActivitiesProvider, Arc<dyn StateStore>) {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
    (ActivitiesProvider::new(store.clone()), store)
}

fn scheduled(instance: &str, n: u64) -> TaskMessage {
    let mut event = HistoryEvent::with_timestamp(
        n,
        EventKind::TaskScheduled {
            name: format!("Task{n}"),
            version: None,
            input: n.to_string(),
        },
    );
    event.event_id = n as i64;
    TaskMessage::new(OrchestrationInstance::new(instance, "exec-1"), event)
}

async fn append_all(queue: &ActivitiesProvider, store: &Arc<dyn StateStore>, messages: &[TaskMessage]) {
    let mut txn = store.begin_transaction().await;
    queue.append_batch(txn.as_mut(), messages).await.unwrap();
    txn.commit().await.unwrap();
}

#[tokio::test]
async fn dequeue_returns_none_on_empty_queue() {
    let (queue, _store) = queue();
    assert!(queue
        .get_next_work_item(Duration::from_millis(150))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn claims_follow_append_order() {
    let (queue, store) = queue();
    append_all(&queue, &store, &[scheduled("i1", 1), scheduled("i1", 2), scheduled("i1", 3)]).await;

    let first = queue.get_next_work_item(Duration::from_millis(200)).await.unwrap().unwrap();
    let second = queue.get_next_work_item(Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(first.message.event.timestamp_ms, 1);
    assert_eq!(second.message.event.timestamp_ms, 2);
    assert!(first.key < second.key);
}

#[tokio::test]
async fn claimed_entries_are_hidden_until_abandoned() {
    let (queue, store) = queue();
    append_all(&queue, &store, &[scheduled("i1", 1)]).await;

    let item = queue.get_next_work_item(Duration::from_millis(200)).await.unwrap().unwrap();
    assert!(queue
        .get_next_work_item(Duration::from_millis(150))
        .await
        .unwrap()
        .is_none());

    queue.abandon_work_item(&item).await.unwrap();
    let redelivered = queue.get_next_work_item(Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(redelivered.key, item.key);
    assert_eq!(redelivered.message, item.message);
}

#[tokio::test]
async fn complete_removes_the_exact_row() {
    let (queue, store) = queue();
    append_all(&queue, &store, &[scheduled("i1", 1), scheduled("i1", 2)]).await;

    let first = queue.get_next_work_item(Duration::from_millis(200)).await.unwrap().unwrap();
    let mut txn = store.begin_transaction().await;
    queue.complete_work_item(txn.as_mut(), &first).await.unwrap();
    txn.commit().await.unwrap();

    // The other entry is still deliverable; the completed one is gone.
    let remaining = queue.get_next_work_item(Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(remaining.message.event.timestamp_ms, 2);
    assert!(queue
        .get_next_work_item(Duration::from_millis(150))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn key_counter_resumes_past_persisted_entries() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
    let first_queue = ActivitiesProvider::new(store.clone());
    append_all(&first_queue, &store, &[scheduled("i1", 1), scheduled("i1", 2)]).await;

    // A fresh provider over the same store must not reuse keys.
    let second_queue = ActivitiesProvider::new(store.clone());
    append_all(&second_queue, &store, &[scheduled("i1", 3)]).await;

    let mut keys = Vec::new();
    loop {
        match second_queue.get_next_work_item(Duration::from_millis(150)).await.unwrap() {
            Some(item) => keys.push(item.key),
            None => break,
        }
    }
    assert_eq!(keys.len(), 3);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn boot_sweep_reclaims_claimed_entries() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
    let queue = ActivitiesProvider::new(store.clone());
    append_all(&queue, &store, &[scheduled("i1", 1), scheduled("i1", 2)]).await;

    // Claim both, then crash without completing.
    let _ = queue.get_next_work_item(Duration::from_millis(200)).await.unwrap().unwrap();
    let _ = queue.get_next_work_item(Duration::from_millis(200)).await.unwrap().unwrap();

    let recovered = ActivitiesProvider::new(store.clone());
    recovered.boot_sweep().await.unwrap();

    let a = recovered.get_next_work_item(Duration::from_millis(200)).await.unwrap();
    let b = recovered.get_next_work_item(Duration::from_millis(200)).await.unwrap();
    assert!(a.is_some() && b.is_some());
}
