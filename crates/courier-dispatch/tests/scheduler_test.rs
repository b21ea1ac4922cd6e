//! Integration tests for the handler pool scheduler.
//!
//! Covers slot accounting, refusal when exhausted, completion routing,
//! double completion, persistence failures and restart rehydration.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use courier_core::{HandlerId, TelemetryEvent};
use courier_dispatch::{
    delivery::mock::ScriptedDelivery,
    scheduler::mock::{Notification, RecordingSink},
    start_scheduler,
    store::mock::MemoryStateStore,
    CompleteOutcome, DeliveryError, DispatchError, SchedulerConfig, SchedulerHandle,
};
use courier_testing::{wait_until, RecordingTelemetry};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const READER: &str = "orders--a--v1";

struct Pool {
    handle: SchedulerHandle,
    task: JoinHandle<()>,
    cancel: CancellationToken,
    sink: Arc<RecordingSink>,
    telemetry: Arc<RecordingTelemetry>,
}

impl Pool {
    async fn stop(self) {
        self.cancel.cancel();
        self.task.await.unwrap();
    }
}

async fn start(pool_size: usize, delivery: ScriptedDelivery, store: MemoryStateStore) -> Pool {
    let sink = Arc::new(RecordingSink::new());
    let telemetry = Arc::new(RecordingTelemetry::new());
    let cancel = CancellationToken::new();
    let config = SchedulerConfig { pool_name: "test".to_string(), pool_size, mailbox_capacity: 64 };
    let (handle, task) = start_scheduler(
        config,
        Arc::new(store),
        Arc::new(delivery),
        sink.clone(),
        telemetry.clone(),
        cancel.clone(),
    )
    .await
    .unwrap();
    Pool { handle, task, cancel, sink, telemetry }
}

fn payload(n: u32) -> Bytes {
    Bytes::from(format!("{{\"n\":{n}}}"))
}

#[tokio::test]
async fn slots_move_between_free_and_busy() {
    let pool = start(20, ScriptedDelivery::held(), MemoryStateStore::new()).await;

    let mut handles = Vec::new();
    for n in 0..3 {
        handles.push(pool.handle.do_work(payload(n), READER).await.unwrap());
    }
    let snapshot = pool.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.free.len(), 17);
    assert_eq!(snapshot.busy.len(), 3);
    assert_eq!(
        snapshot.busy_handlers().into_iter().collect::<Vec<_>>(),
        vec![HandlerId(1), HandlerId(2), HandlerId(3)],
        "lowest free ids are taken first"
    );

    assert_eq!(pool.handle.complete_work(handles[0]).await.unwrap(), CompleteOutcome::Completed);
    let snapshot = pool.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.free.len(), 18);
    assert_eq!(snapshot.busy.len(), 2);
    assert!(snapshot.free.contains(&HandlerId(1)));
    assert_eq!(
        pool.sink.notifications().await,
        vec![Notification::Complete(READER.to_string(), handles[0])]
    );

    pool.stop().await;
}

#[tokio::test]
async fn second_completion_is_ignored() {
    let pool = start(4, ScriptedDelivery::held(), MemoryStateStore::new()).await;
    let handle = pool.handle.do_work(payload(1), READER).await.unwrap();

    pool.handle.complete_work(handle).await.unwrap();
    let before = pool.handle.snapshot().await.unwrap();

    assert_eq!(pool.handle.complete_work(handle).await.unwrap(), CompleteOutcome::Unknown);
    assert_eq!(pool.handle.snapshot().await.unwrap(), before);
    assert_eq!(pool.sink.notifications().await.len(), 1, "the reader is told only once");
    assert_eq!(
        pool.telemetry
            .count(|e| {
                matches!(e, TelemetryEvent::UnknownHandle { unit, handle: h }
                    if unit == "scheduler" && *h == handle)
            })
            .await,
        1
    );

    pool.stop().await;
}

#[tokio::test]
async fn exhausted_pool_refuses_without_queueing() {
    let pool = start(2, ScriptedDelivery::held(), MemoryStateStore::new()).await;
    pool.handle.do_work(payload(1), READER).await.unwrap();
    pool.handle.do_work(payload(2), READER).await.unwrap();

    let err = pool.handle.do_work(payload(3), READER).await.unwrap_err();

    assert_eq!(err, DispatchError::PoolExhausted { pool_size: 2 });
    assert!(err.is_retryable());
    assert_eq!(pool.handle.snapshot().await.unwrap().busy.len(), 2);
    assert_eq!(
        pool.telemetry
            .count(|e| matches!(e, TelemetryEvent::PoolExhausted { pool_size: 2, .. }))
            .await,
        1
    );

    pool.stop().await;
}

#[tokio::test]
async fn successful_delivery_completes_through_the_sink() {
    let delivery = ScriptedDelivery::succeeding();
    let pool = start(2, delivery.clone(), MemoryStateStore::new()).await;

    let handle = pool.handle.do_work(payload(7), READER).await.unwrap();
    let notifications = pool.sink.wait_for(1).await;

    assert_eq!(notifications, vec![Notification::Complete(READER.to_string(), handle)]);
    assert_eq!(delivery.attempts().await, vec![(READER.to_string(), payload(7))]);
    assert_eq!(pool.handle.snapshot().await.unwrap().free.len(), 2);

    pool.stop().await;
}

#[tokio::test]
async fn failed_delivery_abandons_the_message() {
    let delivery = ScriptedDelivery::failing(DeliveryError::server_error(503, "unavailable"));
    let pool = start(2, delivery, MemoryStateStore::new()).await;

    let handle = pool.handle.do_work(payload(1), READER).await.unwrap();
    let notifications = pool.sink.wait_for(1).await;

    assert_eq!(notifications, vec![Notification::Abandon(READER.to_string(), handle)]);
    pool.telemetry
        .wait_for(1, |e| {
            matches!(e, TelemetryEvent::DeliveryFailed { handle: h, .. } if *h == handle)
        })
        .await;
    assert_eq!(pool.handle.snapshot().await.unwrap().free.len(), 2);

    pool.stop().await;
}

#[tokio::test]
async fn persistence_failure_rolls_the_assignment_back() {
    let store = MemoryStateStore::new();
    let pool = start(3, ScriptedDelivery::held(), store.clone()).await;
    store.fail_next_saves(1).await;

    let err = pool.handle.do_work(payload(1), READER).await.unwrap_err();

    assert!(matches!(err, DispatchError::Store { .. }));
    let snapshot = pool.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.free.len(), 3);
    assert!(snapshot.busy.is_empty());

    pool.handle.do_work(payload(2), READER).await.unwrap();
    assert_eq!(pool.handle.snapshot().await.unwrap().busy_handlers().len(), 1);

    pool.stop().await;
}

#[tokio::test]
async fn restart_rehydrates_and_redelivers_busy_work() {
    let store = MemoryStateStore::new();
    let first = start(4, ScriptedDelivery::held(), store.clone()).await;
    let a = first.handle.do_work(payload(1), READER).await.unwrap();
    let b = first.handle.do_work(payload(2), READER).await.unwrap();
    let busy_before = first.handle.snapshot().await.unwrap().busy;
    first.stop().await;

    let held = ScriptedDelivery::held();
    let second = start(4, held.clone(), store.clone()).await;
    let rehydrated = second.handle.snapshot().await.unwrap();
    assert_eq!(rehydrated.busy, busy_before);
    assert_eq!(rehydrated.free.len(), 2);

    held.release(2);
    let mut notified = second.sink.wait_for(2).await;
    notified.sort_by_key(|n| match n {
        Notification::Complete(_, h) | Notification::Abandon(_, h) => *h,
    });
    let mut expected = vec![
        Notification::Complete(READER.to_string(), a),
        Notification::Complete(READER.to_string(), b),
    ];
    expected.sort_by_key(|n| match n {
        Notification::Complete(_, h) | Notification::Abandon(_, h) => *h,
    });
    assert_eq!(notified, expected);

    let handle = second.handle.clone();
    wait_until("slots released after redelivery", Duration::from_secs(2), || {
        let handle = handle.clone();
        async move { handle.snapshot().await.unwrap().free.len() == 4 }
    })
    .await;

    second.stop().await;
}

#[tokio::test]
async fn shrinking_the_pool_drops_work_of_removed_slots() {
    let store = MemoryStateStore::new();
    let first = start(3, ScriptedDelivery::held(), store.clone()).await;
    for n in 0..3 {
        first.handle.do_work(payload(n), READER).await.unwrap();
    }
    first.stop().await;

    let second = start(2, ScriptedDelivery::held(), store).await;
    let snapshot = second.handle.snapshot().await.unwrap();

    assert_eq!(second.handle.pool_size(), 2);
    assert!(snapshot.free.is_empty());
    assert_eq!(
        snapshot.busy_handlers().into_iter().collect::<Vec<_>>(),
        vec![HandlerId(1), HandlerId(2)]
    );

    second.stop().await;
}

#[tokio::test]
async fn stopped_scheduler_reports_stopped() {
    let pool = start(1, ScriptedDelivery::succeeding(), MemoryStateStore::new()).await;
    let handle = pool.handle.clone();
    pool.stop().await;

    assert_eq!(handle.do_work(payload(1), READER).await, Err(DispatchError::Stopped));
}
