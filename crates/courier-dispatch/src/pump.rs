//! Per-subscriber reader pump.
//!
//! A pump owns one queue subscription. On a fixed poll interval it receives a
//! bounded batch, hands each message to the handler pool and remembers which
//! ack token belongs to which correlation handle. It never waits for
//! deliveries: the pool reports back through [`PumpHandle::complete_message`]
//! (acknowledge) or [`PumpHandle::abandon_message`] (leave for redelivery).
//!
//! Messages the pool refuses stay locked in the queue and come back after
//! their lock expires.

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use courier_core::{AckToken, CorrelationHandle, SubscriberConfig, TelemetryEvent, TelemetryHandler};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DispatchError, QueueError, Result},
    heartbeat::HeartbeatAggregator,
    queue::{QueueClient, ReceivedMessage},
    scheduler::SchedulerHandle,
    store::{load_json, save_json, StateStore},
};

/// Pump timing and batching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpConfig {
    /// Time between polls.
    pub poll_interval: Duration,
    /// Upper bound of one receive when the subscriber sets no batch size.
    pub max_batch: usize,
    /// Attempts for each receive or complete call on transient faults.
    pub queue_attempts: u32,
    /// Delay between those attempts.
    pub queue_retry_delay: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_batch: 32,
            queue_attempts: 3,
            queue_retry_delay: Duration::from_millis(50),
        }
    }
}

/// State store key of a reader's in-flight map.
pub fn state_key(reader_name: &str) -> String {
    format!("reader/{reader_name}")
}

#[derive(Debug, Serialize, Deserialize)]
struct InFlightRecord {
    handle: CorrelationHandle,
    ack_token: AckToken,
}

#[derive(Debug)]
enum PumpCommand {
    Complete { handle: CorrelationHandle },
    Abandon { handle: CorrelationHandle },
    PollNow { reply: oneshot::Sender<usize> },
    InFlight { reply: oneshot::Sender<BTreeMap<CorrelationHandle, AckToken>> },
}

/// Handle to a running pump.
#[derive(Debug, Clone)]
pub struct PumpHandle {
    name: String,
    commands: mpsc::UnboundedSender<PumpCommand>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PumpHandle {
    /// Reader name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivery of `handle` succeeded; acknowledge its message.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the pump is gone.
    pub fn complete_message(&self, handle: CorrelationHandle) -> Result<()> {
        self.commands.send(PumpCommand::Complete { handle }).map_err(|_| DispatchError::Stopped)
    }

    /// Delivery of `handle` failed; forget it without acknowledging.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the pump is gone.
    pub fn abandon_message(&self, handle: CorrelationHandle) -> Result<()> {
        self.commands.send(PumpCommand::Abandon { handle }).map_err(|_| DispatchError::Stopped)
    }

    /// Polls immediately instead of waiting for the next tick. Returns the
    /// number of messages received.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the pump is gone.
    pub async fn poll_now(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(PumpCommand::PollNow { reply }).map_err(|_| DispatchError::Stopped)?;
        rx.await.map_err(|_| DispatchError::Stopped)
    }

    /// Current handle → ack token map.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the pump is gone.
    pub async fn in_flight(&self) -> Result<BTreeMap<CorrelationHandle, AckToken>> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(PumpCommand::InFlight { reply }).map_err(|_| DispatchError::Stopped)?;
        rx.await.map_err(|_| DispatchError::Stopped)
    }

    /// Whether the pump task has not finished.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Stops the pump and waits for its task to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(reader = %self.name, error = %e, "pump task panicked");
            }
        }
    }
}

/// A reader pump before it is started.
#[derive(Debug)]
pub struct ReaderPump {
    name: String,
    subscriber: SubscriberConfig,
    config: PumpConfig,
    queue: Arc<dyn QueueClient>,
    scheduler: SchedulerHandle,
    store: Arc<dyn StateStore>,
    telemetry: Arc<dyn TelemetryHandler>,
}

impl ReaderPump {
    /// Creates a pump for reader `name` consuming `queue`.
    pub fn new(
        name: impl Into<String>,
        subscriber: SubscriberConfig,
        config: PumpConfig,
        queue: Arc<dyn QueueClient>,
        scheduler: SchedulerHandle,
        store: Arc<dyn StateStore>,
        telemetry: Arc<dyn TelemetryHandler>,
    ) -> Self {
        Self { name: name.into(), subscriber, config, queue, scheduler, store, telemetry }
    }

    /// Rehydrates the in-flight map and spawns the pump task.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the persisted in-flight map cannot be read.
    pub async fn start(self, cancel: CancellationToken) -> Result<PumpHandle> {
        let records: Option<Vec<InFlightRecord>> =
            load_json(&*self.store, &state_key(&self.name)).await?;
        let in_flight: BTreeMap<CorrelationHandle, AckToken> = records
            .unwrap_or_default()
            .into_iter()
            .map(|record| (record.handle, record.ack_token))
            .collect();

        let heartbeat = if self.subscriber.heartbeat_interval_seconds == 0 {
            HeartbeatAggregator::disabled()
        } else {
            HeartbeatAggregator::new()
        };

        info!(
            reader = %self.name,
            subscriber = %self.subscriber.key(),
            rehydrated = in_flight.len(),
            batch_size = self.batch_size(),
            "starting reader pump"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let name = self.name.clone();
        let actor = PumpActor { pump: self, in_flight, heartbeat };
        let task = tokio::spawn(actor.run(rx, cancel.clone()));

        Ok(PumpHandle { name, commands: tx, cancel, task: Arc::new(Mutex::new(Some(task))) })
    }

    fn batch_size(&self) -> usize {
        self.subscriber
            .batch_size
            .unwrap_or(self.config.max_batch)
            .min(self.scheduler.pool_size())
            .max(1)
    }
}

struct PumpActor {
    pump: ReaderPump,
    in_flight: BTreeMap<CorrelationHandle, AckToken>,
    heartbeat: HeartbeatAggregator,
}

impl PumpActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PumpCommand>,
        cancel: CancellationToken,
    ) {
        let period = self.pump.config.poll_interval;
        let mut poll = interval_at(Instant::now() + period, period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut beat = self.heartbeat.is_enabled().then(|| {
            let period = Duration::from_secs(self.pump.subscriber.heartbeat_interval_seconds);
            let mut beat = interval_at(Instant::now() + period, period);
            beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            beat
        });

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = poll.tick() => {
                    self.tick().await;
                },
                () = next_beat(&mut beat) => self.emit_heartbeat().await,
            }
        }

        info!(reader = %self.pump.name, in_flight = self.in_flight.len(), "reader pump stopped");
    }

    async fn handle_command(&mut self, command: PumpCommand) {
        match command {
            PumpCommand::Complete { handle } => self.complete(handle).await,
            PumpCommand::Abandon { handle } => self.abandon(handle).await,
            PumpCommand::PollNow { reply } => {
                let received = self.tick().await;
                let _ = reply.send(received);
            },
            PumpCommand::InFlight { reply } => {
                let _ = reply.send(self.in_flight.clone());
            },
        }
    }

    /// One poll. Faults are published and count as an empty read.
    async fn tick(&mut self) -> usize {
        if self.pump.queue.is_closed() {
            debug!(reader = %self.pump.name, "queue closed; skipping poll");
            return 0;
        }

        let received = match self.poll_once().await {
            Ok(received) => received,
            Err(e) => {
                warn!(reader = %self.pump.name, error = %e, "poll failed");
                self.fault(e.to_string()).await;
                0
            },
        };
        self.heartbeat.report_messages_read(received);
        received
    }

    async fn poll_once(&mut self) -> Result<usize> {
        let max = self.pump.batch_size();
        let messages = self.receive(max).await?;
        let received = messages.len();

        let mut dispatched = 0;
        let mut fault = None;
        for ReceivedMessage { body, ack_token, delivery_count } in messages {
            match self.pump.scheduler.do_work(body, self.pump.name.as_str()).await {
                Ok(handle) => {
                    let reader = self.pump.name.as_str();
                    debug!(reader, handle = %handle, delivery_count, "message dispatched");
                    self.in_flight.insert(handle, ack_token);
                    dispatched += 1;
                },
                Err(e) if e.is_retryable() => {
                    debug!(reader = %self.pump.name, error = %e, "message left for redelivery");
                },
                Err(e) => {
                    fault = Some(e);
                    break;
                },
            }
        }

        if dispatched > 0 {
            self.persist().await?;
        }
        match fault {
            Some(e) => Err(e),
            None => Ok(received),
        }
    }

    async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>> {
        let queue = &*self.pump.queue;
        let messages =
            with_queue_retry(&self.pump.config, &self.pump.name, move || queue.receive(max)).await?;
        Ok(messages)
    }

    async fn complete(&mut self, handle: CorrelationHandle) {
        let Some(token) = self.in_flight.remove(&handle) else {
            self.unknown(handle).await;
            return;
        };

        let queue = &*self.pump.queue;
        let token = &token;
        let acked = with_queue_retry(&self.pump.config, &self.pump.name, move || {
            queue.complete(token)
        })
        .await;
        match acked {
            Ok(()) => debug!(reader = %self.pump.name, handle = %handle, "message acknowledged"),
            Err(e) => {
                warn!(
                    reader = %self.pump.name,
                    handle = %handle,
                    error = %e,
                    "acknowledgement failed; message will be redelivered"
                );
                self.fault(format!("acknowledging {handle}: {e}")).await;
            },
        }
        self.persist_or_log().await;
    }

    async fn abandon(&mut self, handle: CorrelationHandle) {
        if self.in_flight.remove(&handle).is_none() {
            self.unknown(handle).await;
            return;
        }
        debug!(reader = %self.pump.name, handle = %handle, "message abandoned for redelivery");
        self.persist_or_log().await;
    }

    async fn emit_heartbeat(&mut self) {
        let available = match self.pump.scheduler.snapshot().await {
            Ok(snapshot) => snapshot.free.len(),
            Err(e) => {
                debug!(reader = %self.pump.name, error = %e, "pool snapshot unavailable");
                0
            },
        };
        self.heartbeat.set_gauges(self.in_flight.len(), available);
        let snapshot = self.heartbeat.snapshot();
        self.pump
            .telemetry
            .handle_event(TelemetryEvent::Heartbeat(snapshot.into_event(self.pump.name.as_str())))
            .await;
    }

    async fn unknown(&self, handle: CorrelationHandle) {
        warn!(reader = %self.pump.name, handle = %handle, "completion for unknown handle ignored");
        self.pump
            .telemetry
            .handle_event(TelemetryEvent::UnknownHandle { unit: self.pump.name.clone(), handle })
            .await;
    }

    async fn fault(&self, reason: String) {
        self.pump
            .telemetry
            .handle_event(TelemetryEvent::PumpFault { reader: self.pump.name.clone(), reason })
            .await;
    }

    async fn persist(&self) -> Result<()> {
        let records: Vec<InFlightRecord> = self
            .in_flight
            .iter()
            .map(|(handle, token)| InFlightRecord { handle: *handle, ack_token: token.clone() })
            .collect();
        save_json(&*self.pump.store, &state_key(&self.pump.name), &records).await?;
        Ok(())
    }

    async fn persist_or_log(&self) {
        if let Err(e) = self.persist().await {
            error!(reader = %self.pump.name, error = %e, "failed to persist in-flight map");
            self.fault(e.to_string()).await;
        }
    }
}

async fn next_beat(beat: &mut Option<Interval>) {
    match beat {
        Some(beat) => {
            beat.tick().await;
        },
        None => std::future::pending().await,
    }
}

/// Retries transient queue faults a bounded number of times.
async fn with_queue_retry<T, F, Fut>(
    config: &PumpConfig,
    reader: &str,
    mut op: F,
) -> std::result::Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, QueueError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.queue_attempts => {
                debug!(reader, attempt, error = %e, "transient queue fault; retrying");
                tokio::time::sleep(config.queue_retry_delay).await;
                attempt += 1;
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_state_key_is_namespaced() {
        assert_eq!(state_key("orders--a--v1"), "reader/orders--a--v1");
    }

    #[tokio::test]
    async fn queue_retry_gives_up_after_configured_attempts() {
        let config = PumpConfig {
            queue_attempts: 3,
            queue_retry_delay: Duration::ZERO,
            ..PumpConfig::default()
        };
        let calls = std::sync::atomic::AtomicU32::new(0);

        let result: std::result::Result<(), QueueError> = with_queue_retry(&config, "r", || {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(QueueError::transient("throttled")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_queue_faults_are_not_retried() {
        let config = PumpConfig { queue_retry_delay: Duration::ZERO, ..PumpConfig::default() };
        let calls = std::sync::atomic::AtomicU32::new(0);

        let result: std::result::Result<(), QueueError> = with_queue_retry(&config, "r", || {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(QueueError::fatal("queue deleted")) }
        })
        .await;

        assert!(matches!(result, Err(QueueError::Fatal { .. })));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
