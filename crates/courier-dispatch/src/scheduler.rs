//! Fixed-size handler pool shared by every reader.
//!
//! A single actor task owns the partition of handler ids into free and busy.
//! Each dispatch takes the lowest free id, records the work item under a new
//! correlation handle, persists the partition and hands the item to that
//! slot's worker. Completion frees the slot and tells the originating pump to
//! acknowledge (or, after a failed delivery, to drop) its queue message.
//!
//! Refusals are immediate: when no slot is free the caller gets
//! [`DispatchError::PoolExhausted`] and the message simply stays unacknowledged
//! in its queue. Nothing is buffered inside the pool.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{CorrelationHandle, HandlerId, TelemetryEvent, TelemetryHandler};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    delivery::Delivery,
    error::{DispatchError, Result},
    store::{load_json, save_json, StateStore},
};

/// Telemetry unit name used for unknown completions.
const UNIT: &str = "scheduler";

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Name of the pool; selects the state store key.
    pub pool_name: String,
    /// Number of handler slots.
    pub pool_size: usize,
    /// Capacity of the scheduler mailbox.
    pub mailbox_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { pool_name: "default".to_string(), pool_size: 20, mailbox_capacity: 1024 }
    }
}

impl SchedulerConfig {
    /// State store key of the pool.
    pub fn state_key(&self) -> String {
        format!("pool/{}", self.pool_name)
    }
}

/// A busy slot's work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyEntry {
    /// Slot the item is assigned to.
    pub handler: HandlerId,
    /// Reader the message came from.
    pub source: String,
    /// Message body being delivered.
    pub payload: Bytes,
}

/// Point-in-time view of the partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Idle slots.
    pub free: BTreeSet<HandlerId>,
    /// Assigned slots by correlation handle.
    pub busy: BTreeMap<CorrelationHandle, BusyEntry>,
}

impl PoolSnapshot {
    /// Ids of the busy slots.
    pub fn busy_handlers(&self) -> BTreeSet<HandlerId> {
        self.busy.values().map(|entry| entry.handler).collect()
    }
}

/// Result of a completion or abandonment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// The slot was released.
    Completed,
    /// The handle was not busy; nothing changed.
    Unknown,
}

/// Receives completions for the readers that own the messages.
#[async_trait]
pub trait CompletionSink: Send + Sync + std::fmt::Debug {
    /// Delivery succeeded: the reader should acknowledge the message.
    async fn complete_message(&self, source: &str, handle: CorrelationHandle);

    /// Delivery failed: the reader should forget the message without
    /// acknowledging it so the queue redelivers it.
    async fn abandon_message(&self, source: &str, handle: CorrelationHandle);
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedBusy {
    handle: CorrelationHandle,
    handler: HandlerId,
    source: String,
    payload: Bytes,
}

impl PersistedBusy {
    fn new(handle: CorrelationHandle, entry: &BusyEntry) -> Self {
        Self {
            handle,
            handler: entry.handler,
            source: entry.source.clone(),
            payload: entry.payload.clone(),
        }
    }

    fn into_parts(self) -> (CorrelationHandle, BusyEntry) {
        let entry = BusyEntry { handler: self.handler, source: self.source, payload: self.payload };
        (self.handle, entry)
    }
}

/// Durable form of the partition. Free ids are derived from the busy ones.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedPool {
    pool_size: usize,
    busy: Vec<PersistedBusy>,
}

#[derive(Debug)]
struct WorkItem {
    handle: CorrelationHandle,
    payload: Bytes,
    source: String,
}

enum Command {
    DoWork { payload: Bytes, source: String, reply: oneshot::Sender<Result<CorrelationHandle>> },
    CompleteWork { handle: CorrelationHandle, reply: oneshot::Sender<CompleteOutcome> },
    AbandonWork { handle: CorrelationHandle, reply: oneshot::Sender<CompleteOutcome> },
    Snapshot { reply: oneshot::Sender<PoolSnapshot> },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DoWork { source, .. } => {
                f.debug_struct("DoWork").field("source", source).finish()
            },
            Self::CompleteWork { handle, .. } => {
                f.debug_struct("CompleteWork").field("handle", handle).finish()
            },
            Self::AbandonWork { handle, .. } => {
                f.debug_struct("AbandonWork").field("handle", handle).finish()
            },
            Self::Snapshot { .. } => f.write_str("Snapshot"),
        }
    }
}

/// Handle to the running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    pool_size: usize,
}

impl SchedulerHandle {
    /// Assigns `payload` from reader `source` to a free slot.
    ///
    /// Returns as soon as the slot worker has the item; the delivery itself
    /// runs in the background.
    ///
    /// # Errors
    ///
    /// - `PoolExhausted` when every slot is busy
    /// - `Store` when the assignment could not be persisted
    /// - `SlotUnavailable` when the slot worker did not take the item
    /// - `Stopped` after shutdown
    pub async fn do_work(
        &self,
        payload: Bytes,
        source: impl Into<String>,
    ) -> Result<CorrelationHandle> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::DoWork { payload, source: source.into(), reply }).await?;
        rx.await.map_err(|_| DispatchError::Stopped)?
    }

    /// Releases the slot of `handle` and asks its reader to acknowledge.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` after shutdown.
    pub async fn complete_work(&self, handle: CorrelationHandle) -> Result<CompleteOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CompleteWork { handle, reply }).await?;
        rx.await.map_err(|_| DispatchError::Stopped)
    }

    /// Releases the slot of `handle` and asks its reader to drop the message
    /// unacknowledged.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` after shutdown.
    pub async fn abandon_work(&self, handle: CorrelationHandle) -> Result<CompleteOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AbandonWork { handle, reply }).await?;
        rx.await.map_err(|_| DispatchError::Stopped)
    }

    /// Current partition.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` after shutdown.
    pub async fn snapshot(&self) -> Result<PoolSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| DispatchError::Stopped)
    }

    /// Configured number of slots.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| DispatchError::Stopped)
    }
}

/// Starts the scheduler and its slot workers.
///
/// The partition is rehydrated from `store`. Items that were busy when the
/// previous instance stopped are handed to their slot workers again, so a
/// restart redelivers them (at-least-once). If the persisted pool size
/// differs from the configured one, busy items whose slot no longer exists
/// are dropped; their messages come back through queue redelivery.
///
/// # Errors
///
/// Returns `Store` if the persisted partition cannot be loaded.
pub async fn start_scheduler(
    config: SchedulerConfig,
    store: Arc<dyn StateStore>,
    delivery: Arc<dyn Delivery>,
    sink: Arc<dyn CompletionSink>,
    telemetry: Arc<dyn TelemetryHandler>,
    cancel: CancellationToken,
) -> Result<(SchedulerHandle, JoinHandle<()>)> {
    let persisted: Option<PersistedPool> = load_json(&*store, &config.state_key()).await?;
    let (free, busy) = rebuild_partition(config.pool_size, persisted);
    info!(
        pool = %config.pool_name,
        pool_size = config.pool_size,
        busy = busy.len(),
        "starting handler pool"
    );

    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let handle = SchedulerHandle { commands: tx, pool_size: config.pool_size };

    let mut slots = HashMap::with_capacity(config.pool_size);
    let mut workers = Vec::with_capacity(config.pool_size);
    for id in 1..=config.pool_size {
        let handler = HandlerId(u32::try_from(id).unwrap_or(u32::MAX));
        let (work_tx, work_rx) = mpsc::channel(1);
        slots.insert(handler, work_tx);
        workers.push(tokio::spawn(run_slot(
            handler,
            work_rx,
            handle.clone(),
            delivery.clone(),
            telemetry.clone(),
            cancel.clone(),
        )));
    }

    let mut actor = SchedulerActor { config, store, sink, telemetry, free, busy, slots };
    actor.redispatch_rehydrated();

    let task = tokio::spawn(async move {
        actor.run(rx, cancel).await;
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "slot worker panicked");
            }
        }
    });

    Ok((handle, task))
}

fn rebuild_partition(
    pool_size: usize,
    persisted: Option<PersistedPool>,
) -> (BTreeSet<HandlerId>, HashMap<CorrelationHandle, BusyEntry>) {
    let all: BTreeSet<HandlerId> =
        (1..=pool_size).map(|id| HandlerId(u32::try_from(id).unwrap_or(u32::MAX))).collect();
    let mut free = all.clone();
    let mut busy = HashMap::new();

    let Some(persisted) = persisted else {
        return (free, busy);
    };
    if persisted.pool_size != pool_size {
        warn!(
            persisted = persisted.pool_size,
            configured = pool_size,
            "pool size changed; rebuilding partition"
        );
    }

    for (handle, entry) in persisted.busy.into_iter().map(PersistedBusy::into_parts) {
        if !all.contains(&entry.handler) {
            warn!(handle = %handle, handler = %entry.handler, "dropping work for removed slot");
            continue;
        }
        // A slot can only hold one item; later duplicates are discarded.
        if !free.remove(&entry.handler) {
            warn!(handle = %handle, handler = %entry.handler, "dropping duplicate slot assignment");
            continue;
        }
        busy.insert(handle, entry);
    }

    (free, busy)
}

struct SchedulerActor {
    config: SchedulerConfig,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn CompletionSink>,
    telemetry: Arc<dyn TelemetryHandler>,
    free: BTreeSet<HandlerId>,
    busy: HashMap<CorrelationHandle, BusyEntry>,
    slots: HashMap<HandlerId, mpsc::Sender<WorkItem>>,
}

impl SchedulerActor {
    async fn run(&mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        loop {
            let command = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                Command::DoWork { payload, source, reply } => {
                    let _ = reply.send(self.do_work(payload, source).await);
                },
                Command::CompleteWork { handle, reply } => {
                    let _ = reply.send(self.release(handle, true).await);
                },
                Command::AbandonWork { handle, reply } => {
                    let _ = reply.send(self.release(handle, false).await);
                },
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                },
            }
            debug_assert_eq!(self.free.len() + self.busy.len(), self.config.pool_size);
        }

        // Closing the mailbox fails any completion a worker is still sending.
        drop(commands);
        self.slots.clear();
        info!(pool = %self.config.pool_name, busy = self.busy.len(), "handler pool stopped");
    }

    async fn do_work(&mut self, payload: Bytes, source: String) -> Result<CorrelationHandle> {
        let Some(handler) = self.free.pop_first() else {
            self.telemetry
                .handle_event(TelemetryEvent::PoolExhausted {
                    reader: source,
                    pool_size: self.config.pool_size,
                })
                .await;
            return Err(DispatchError::PoolExhausted { pool_size: self.config.pool_size });
        };

        let handle = CorrelationHandle::new();
        self.busy.insert(
            handle,
            BusyEntry { handler, source: source.clone(), payload: payload.clone() },
        );

        if let Err(e) = self.persist().await {
            self.rollback(handle, handler);
            warn!(handler = %handler, error = %e, "failed to persist slot assignment");
            return Err(e);
        }

        let item = WorkItem { handle, payload, source };
        let sent = self.slots.get(&handler).map(|slot| slot.try_send(item));
        if !matches!(sent, Some(Ok(()))) {
            self.rollback(handle, handler);
            if let Err(e) = self.persist().await {
                error!(handler = %handler, error = %e, "failed to persist rollback");
            }
            return Err(DispatchError::SlotUnavailable { handler });
        }

        debug!(handle = %handle, handler = %handler, "work assigned");
        Ok(handle)
    }

    async fn release(&mut self, handle: CorrelationHandle, delivered: bool) -> CompleteOutcome {
        let Some(entry) = self.busy.remove(&handle) else {
            debug!(handle = %handle, "completion for handle that is not busy");
            self.telemetry
                .handle_event(TelemetryEvent::UnknownHandle { unit: UNIT.to_string(), handle })
                .await;
            return CompleteOutcome::Unknown;
        };
        self.free.insert(entry.handler);

        if let Err(e) = self.persist().await {
            error!(handle = %handle, error = %e, "failed to persist slot release");
        }

        if delivered {
            self.sink.complete_message(&entry.source, handle).await;
        } else {
            self.sink.abandon_message(&entry.source, handle).await;
        }
        debug!(handle = %handle, handler = %entry.handler, delivered, "slot released");
        CompleteOutcome::Completed
    }

    fn rollback(&mut self, handle: CorrelationHandle, handler: HandlerId) {
        self.busy.remove(&handle);
        self.free.insert(handler);
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            free: self.free.clone(),
            busy: self.busy.iter().map(|(handle, entry)| (*handle, entry.clone())).collect(),
        }
    }

    fn redispatch_rehydrated(&mut self) {
        let mut failed = Vec::new();
        for (handle, entry) in &self.busy {
            let item = WorkItem {
                handle: *handle,
                payload: entry.payload.clone(),
                source: entry.source.clone(),
            };
            match self.slots.get(&entry.handler).map(|slot| slot.try_send(item)) {
                Some(Ok(())) => {
                    info!(handle = %handle, handler = %entry.handler, "rehydrated work resent");
                },
                _ => failed.push((*handle, entry.handler)),
            }
        }
        for (handle, handler) in failed {
            warn!(handle = %handle, handler = %handler, "could not redispatch rehydrated work");
            self.rollback(handle, handler);
        }
    }

    async fn persist(&self) -> Result<()> {
        let mut busy: Vec<PersistedBusy> = self
            .busy
            .iter()
            .map(|(handle, entry)| PersistedBusy::new(*handle, entry))
            .collect();
        busy.sort_by_key(|b| b.handler);
        let record = PersistedPool { pool_size: self.config.pool_size, busy };
        save_json(&*self.store, &self.config.state_key(), &record).await?;
        Ok(())
    }
}

async fn run_slot(
    handler: HandlerId,
    mut work: mpsc::Receiver<WorkItem>,
    scheduler: SchedulerHandle,
    delivery: Arc<dyn Delivery>,
    telemetry: Arc<dyn TelemetryHandler>,
    cancel: CancellationToken,
) {
    debug!(handler = %handler, "slot worker starting");

    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            item = work.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let span = info_span!(
            "delivery_attempt",
            handler = %handler,
            handle = %item.handle,
            reader = %item.source
        );
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            outcome = delivery.attempt(&item.payload, &item.source).instrument(span) => outcome,
        };

        let released = match outcome {
            Ok(()) => scheduler.complete_work(item.handle).await,
            Err(e) => {
                telemetry
                    .handle_event(TelemetryEvent::DeliveryFailed {
                        handle: item.handle,
                        reader: item.source.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                scheduler.abandon_work(item.handle).await
            },
        };
        if let Err(e) = released {
            debug!(handler = %handler, error = %e, "scheduler gone; slot worker exiting");
            break;
        }
    }

    debug!(handler = %handler, "slot worker stopped");
}

pub mod mock {
    //! Completion sink that records what it is told.

    use async_trait::async_trait;
    use courier_core::CorrelationHandle;
    use tokio::sync::{Mutex, Notify};

    use super::CompletionSink;

    /// What a [`RecordingSink`] was told.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Notification {
        /// `complete_message` was called.
        Complete(String, CorrelationHandle),
        /// `abandon_message` was called.
        Abandon(String, CorrelationHandle),
    }

    /// Sink that records every notification.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        notifications: Mutex<Vec<Notification>>,
        notify: Notify,
    }

    impl RecordingSink {
        /// Creates an empty sink.
        pub fn new() -> Self {
            Self::default()
        }

        /// Notifications received so far.
        pub async fn notifications(&self) -> Vec<Notification> {
            self.notifications.lock().await.clone()
        }

        /// Waits until at least `count` notifications arrived.
        pub async fn wait_for(&self, count: usize) -> Vec<Notification> {
            loop {
                let notified = self.notify.notified();
                {
                    let notifications = self.notifications.lock().await;
                    if notifications.len() >= count {
                        return notifications.clone();
                    }
                }
                notified.await;
            }
        }

        async fn push(&self, notification: Notification) {
            self.notifications.lock().await.push(notification);
            self.notify.notify_waiters();
        }
    }

    #[async_trait]
    impl CompletionSink for RecordingSink {
        async fn complete_message(&self, source: &str, handle: CorrelationHandle) {
            self.push(Notification::Complete(source.to_string(), handle)).await;
        }

        async fn abandon_message(&self, source: &str, handle: CorrelationHandle) {
            self.push(Notification::Abandon(source.to_string(), handle)).await;
        }
    }
}
