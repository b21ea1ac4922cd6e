//! Tests for the in-process fleet host, alone and under the reconciliation
//! engine.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use courier_core::{
    EndpointConfig, ReaderInit, ResolvedSubscriber, SubscriberConfig, TelemetryHandler, TestClock,
};
use courier_dispatch::{
    pump::state_key, queue::mock::InMemoryBroker, start_scheduler, store::mock::MemoryStateStore,
    ClientConfig, EndpointRoutes, HostedReaders, HttpDelivery, LocalFleet, PumpConfig,
    PumpRegistry, SchedulerConfig, HOSTED_READERS_KEY,
};
use courier_fleet::{
    FleetError, FleetManager, ReconciliationEngine, RetryPolicy, DLQ_READER_TYPE, READER_TYPE,
};
use courier_testing::{
    endpoint, wait_until, MockEndpoint, MockServer, RecordingTelemetry, SubscriberBuilder,
};
use tokio_util::sync::CancellationToken;

struct Host {
    fleet: Arc<LocalFleet>,
    broker: InMemoryBroker,
    store: MemoryStateStore,
    telemetry: Arc<RecordingTelemetry>,
    cancel: CancellationToken,
}

impl Drop for Host {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn host() -> Host {
    host_over(MemoryStateStore::new()).await
}

/// Host wired like the binary: routes of recorded readers are registered
/// before the pool rehydrates its work.
async fn host_over(store: MemoryStateStore) -> Host {
    let broker = InMemoryBroker::new();
    let routes = EndpointRoutes::new();
    HostedReaders::load(&store).await.unwrap().register_routes(&routes).await;
    let registry = PumpRegistry::new();
    let telemetry = Arc::new(RecordingTelemetry::new());
    let handler: Arc<dyn TelemetryHandler> = telemetry.clone();
    let cancel = CancellationToken::new();

    let delivery = HttpDelivery::new(ClientConfig::default(), routes.clone()).unwrap();
    let (scheduler, _task) = start_scheduler(
        SchedulerConfig { pool_size: 4, ..SchedulerConfig::default() },
        Arc::new(store.clone()),
        Arc::new(delivery),
        Arc::new(registry.clone()),
        handler.clone(),
        cancel.clone(),
    )
    .await
    .unwrap();

    let pump_config =
        PumpConfig { poll_interval: Duration::from_millis(10), ..PumpConfig::default() };
    let fleet = Arc::new(LocalFleet::new(
        scheduler,
        registry,
        routes,
        Arc::new(broker.clone()),
        Arc::new(store.clone()),
        handler,
        pump_config,
        cancel.clone(),
    ));

    Host { fleet, broker, store, telemetry, cancel }
}

fn init(name: &str, subscriber: SubscriberConfig, endpoints: &[EndpointConfig]) -> Bytes {
    let endpoints = endpoints.iter().map(|e| (e.name.clone(), e.clone())).collect();
    let init = ReaderInit { reader_name: name.to_string(), subscriber, endpoints };
    Bytes::from(init.to_bytes().unwrap())
}

#[tokio::test]
async fn create_list_and_delete_readers() {
    let host = host().await;
    let cancel = CancellationToken::new();
    let subscriber = SubscriberBuilder::new("orders", "a").build();
    let payload =
        init("orders--a--v1", subscriber, &[endpoint("primary", "http://localhost/hook")]);

    host.fleet.create("orders--a--v1", READER_TYPE, payload.clone(), &cancel).await.unwrap();
    assert_eq!(host.fleet.list_names().await.unwrap(), vec!["orders--a--v1".to_string()]);

    let duplicate = host.fleet.create("orders--a--v1", READER_TYPE, payload, &cancel).await;
    assert!(matches!(duplicate, Err(FleetError::Failed { .. })));

    host.fleet.delete("orders--a--v1", &cancel).await.unwrap();
    assert!(host.fleet.list_names().await.unwrap().is_empty());
    assert!(host.store.get(&state_key("orders--a--v1")).await.is_none());

    let missing = host.fleet.delete("orders--a--v1", &cancel).await;
    assert!(matches!(missing, Err(FleetError::Failed { .. })));
}

#[tokio::test]
async fn invalid_create_requests_fail() {
    let host = host().await;
    let cancel = CancellationToken::new();
    let dlq = SubscriberBuilder::new("orders", "a").dead_letter().build();

    let payload = init("orders--a--dlq--v1", dlq.clone(), &[]);
    let wrong_type = host.fleet.create("orders--a--dlq--v1", READER_TYPE, payload, &cancel).await;
    assert!(matches!(wrong_type, Err(FleetError::Failed { .. })));

    let payload = init("orders--a--dlq--v1", dlq, &[]);
    let wrong_name =
        host.fleet.create("orders--a--dlq--v2", DLQ_READER_TYPE, payload, &cancel).await;
    assert!(matches!(wrong_name, Err(FleetError::Failed { .. })));

    let garbage =
        host.fleet.create("x--y--v1", READER_TYPE, Bytes::from_static(b"not json"), &cancel).await;
    assert!(matches!(garbage, Err(FleetError::Failed { .. })));

    host.broker.refuse_connections(true);
    let payload = init("orders--b--v1", SubscriberBuilder::new("orders", "b").build(), &[]);
    let refused = host.fleet.create("orders--b--v1", READER_TYPE, payload, &cancel).await;
    assert!(matches!(refused, Err(FleetError::Failed { .. })));

    assert!(host.fleet.list_names().await.unwrap().is_empty());
    assert!(HostedReaders::load(&host.store).await.unwrap().is_empty());
}

#[tokio::test]
async fn reconciled_readers_deliver_queued_messages() {
    let server = MockServer::start().await;
    server.mock_endpoint(MockEndpoint::success("/orders")).await;
    let host = host().await;

    let primary = endpoint("primary", &server.url_for("/orders"));
    let endpoints: BTreeMap<String, EndpointConfig> =
        BTreeMap::from([("primary".to_string(), primary)]);
    let subscriber = SubscriberBuilder::new("orders", "a").build();
    let resolved = ResolvedSubscriber::resolve(subscriber.clone(), &endpoints);
    let handler: Arc<dyn TelemetryHandler> = host.telemetry.clone();
    let engine = ReconciliationEngine::new(
        host.fleet.clone(),
        Arc::new(TestClock::at_millis(42)),
        RetryPolicy::no_retry(),
        handler,
    );

    let outcome = engine
        .refresh_readers(&[resolved.clone()], &HashMap::new(), &[], &CancellationToken::new())
        .await;
    assert_eq!(outcome.added(), vec!["orders--a--v42".to_string()]);

    let queue = host.broker.queue(&subscriber.key()).await;
    queue.push(r#"{"order":1}"#).await;
    queue.push(r#"{"order":2}"#).await;

    wait_until("messages delivered and acknowledged", Duration::from_secs(5), || {
        let queue = queue.clone();
        async move { queue.completed().await.len() == 2 }
    })
    .await;
    assert_eq!(server.request_count().await, 2);

    let running = host.fleet.list_names().await.unwrap();
    let previous = HashMap::from([(resolved.key(), resolved)]);
    let removal =
        engine.refresh_readers(&[], &previous, &running, &CancellationToken::new()).await;
    assert_eq!(removal.removed(), running);
    assert!(host.fleet.list_names().await.unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_all_keeps_reader_state() {
    let host = host().await;
    let cancel = CancellationToken::new();
    let subscriber = SubscriberBuilder::new("orders", "a").build();
    let payload = init("orders--a--v1", subscriber.clone(), &[]);
    host.fleet.create("orders--a--v1", READER_TYPE, payload, &cancel).await.unwrap();

    // No route: delivery fails and the message is abandoned, not acknowledged.
    let queue = host.broker.queue(&subscriber.key()).await;
    queue.push("{}").await;
    let pump = host.fleet.registry().get("orders--a--v1").await.unwrap();
    pump.poll_now().await.unwrap();

    host.fleet.shutdown_all().await;

    assert!(host.fleet.list_names().await.unwrap().is_empty());
    assert!(!pump.is_running());
    assert!(queue.completed().await.is_empty());
    assert!(host.store.get(&state_key("orders--a--v1")).await.is_some());
    let hosted = HostedReaders::load(&host.store).await.unwrap();
    assert_eq!(hosted.names(), vec!["orders--a--v1".to_string()]);
}

#[tokio::test]
async fn restarted_host_brings_readers_back_under_their_names() {
    let server = MockServer::start().await;
    server.mock_endpoint(MockEndpoint::slow("/orders", Duration::from_secs(60))).await;
    let store = MemoryStateStore::new();
    let cancel = CancellationToken::new();
    let subscriber = SubscriberBuilder::new("orders", "a").build();
    let receiver = endpoint("primary", &server.url_for("/orders"));

    let first = host_over(store.clone()).await;
    let payload = init("orders--a--v1", subscriber.clone(), &[receiver]);
    first.fleet.create("orders--a--v1", READER_TYPE, payload, &cancel).await.unwrap();
    first.broker.queue(&subscriber.key()).await.push(r#"{"order":1}"#).await;
    let pump = first.fleet.registry().get("orders--a--v1").await.unwrap();
    assert_eq!(pump.poll_now().await.unwrap(), 1);
    let in_flight = pump.in_flight().await.unwrap();
    assert_eq!(in_flight.len(), 1);

    first.fleet.shutdown_all().await;
    drop(first);

    let second = host_over(store.clone()).await;
    let hosted = HostedReaders::load(&store).await.unwrap();
    assert_eq!(hosted.len(), 1);
    assert_eq!(second.fleet.restore(hosted).await, 1);

    assert_eq!(second.fleet.list_names().await.unwrap(), vec!["orders--a--v1".to_string()]);
    let pump = second.fleet.registry().get("orders--a--v1").await.unwrap();
    assert_eq!(pump.in_flight().await.unwrap(), in_flight);

    second.fleet.delete("orders--a--v1", &cancel).await.unwrap();
    assert!(store.get(&state_key("orders--a--v1")).await.is_none());
    assert!(HostedReaders::load(&store).await.unwrap().is_empty());
}

#[tokio::test]
async fn readers_that_cannot_be_restored_are_forgotten() {
    let store = MemoryStateStore::new();
    let cancel = CancellationToken::new();
    let first = host_over(store.clone()).await;
    for name in ["a", "b"] {
        let reader = format!("orders--{name}--v1");
        let payload = init(&reader, SubscriberBuilder::new("orders", name).build(), &[]);
        first.fleet.create(&reader, READER_TYPE, payload, &cancel).await.unwrap();
    }
    first.fleet.shutdown_all().await;
    drop(first);

    let second = host_over(store.clone()).await;
    second.broker.refuse_connections(true);
    let restored = second.fleet.restore(HostedReaders::load(&store).await.unwrap()).await;

    assert_eq!(restored, 0);
    assert!(second.fleet.list_names().await.unwrap().is_empty());
    assert!(store.get(&state_key("orders--a--v1")).await.is_none());
    assert_eq!(store.get(HOSTED_READERS_KEY).await, Some(serde_json::json!({})));
}
