//! Telemetry events and fire-and-forget handlers.
//!
//! Every reconciliation batch, reader create/delete and heartbeat produces a
//! structured [`TelemetryEvent`]. Producers hand events to a
//! [`TelemetryHandler`] and never look at the outcome: a slow or failing
//! observer must not influence reconciliation or delivery.
//!
//! ```text
//! ┌──────────────┐                    ┌─────────────────────┐
//! │ Director     │──┐                 │ MulticastTelemetry  │
//! ├──────────────┤  │ TelemetryEvent  ├─────────────────────┤
//! │ Scheduler    │──┼───────────────▶ │ TracingTelemetry    │
//! ├──────────────┤  │                 │ (other observers)   │
//! │ Reader pumps │──┘                 └─────────────────────┘
//! └──────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{CorrelationHandle, SubscriberKey};

/// Events emitted by fleet reconciliation and message dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TelemetryEvent {
    /// A reconciliation batch finished.
    ReconcileCompleted(ReconcileSummaryEvent),
    /// A reader process was created.
    ReaderCreated(ReaderOperationEvent),
    /// Creating a reader process failed.
    ReaderCreateFailed(ReaderFailureEvent),
    /// A reader process was deleted.
    ReaderDeleted(ReaderOperationEvent),
    /// Deleting a reader process failed.
    ReaderDeleteFailed(ReaderFailureEvent),
    /// A subscriber source could not be loaded; the cycle was aborted.
    ConfigLoadFailed {
        /// Source that failed.
        source: String,
        /// Failure description.
        reason: String,
    },
    /// Periodic throughput report of one reader.
    Heartbeat(HeartbeatEvent),
    /// An unexpected fault inside a pump tick, caught at the turn boundary.
    PumpFault {
        /// Reader whose tick failed.
        reader: String,
        /// Failure description.
        reason: String,
    },
    /// A completion referenced a handle the unit does not track.
    UnknownHandle {
        /// Unit that received the completion (`scheduler` or a reader name).
        unit: String,
        /// The unknown handle.
        handle: CorrelationHandle,
    },
    /// A dispatch was refused because every handler slot was busy.
    PoolExhausted {
        /// Reader whose message was refused.
        reader: String,
        /// Configured pool size.
        pool_size: usize,
    },
    /// A delivery attempt failed; the message is left for redelivery.
    DeliveryFailed {
        /// Handle of the abandoned work item.
        handle: CorrelationHandle,
        /// Reader the message came from.
        reader: String,
        /// Failure description.
        reason: String,
    },
}

/// Aggregate outcome of one reconciliation batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummaryEvent {
    /// Subscribers whose reader was created.
    pub added: Vec<String>,
    /// Subscribers whose readers were removed.
    pub removed: Vec<String>,
    /// Subscribers whose reader was replaced.
    pub changed: Vec<String>,
    /// Number of failed create/delete operations.
    pub failures: usize,
    /// Whether the batch stopped early because it was cancelled.
    pub cancelled: bool,
}

/// A successful create or delete of one reader process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderOperationEvent {
    /// Versioned reader name.
    pub name: String,
    /// Subscriber the reader belongs to, when known.
    pub subscriber: Option<SubscriberKey>,
}

/// A failed create or delete of one reader process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderFailureEvent {
    /// Versioned reader name.
    pub name: String,
    /// Subscriber the reader belongs to, when known.
    pub subscriber: Option<SubscriberKey>,
    /// Failure description.
    pub reason: String,
    /// Whether the fleet manager was still busy after all retries.
    pub busy: bool,
}

/// Windowed throughput counters and gauges of one reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    /// Reader emitting the heartbeat.
    pub reader: String,
    /// Messages received since the previous heartbeat.
    pub messages_read: u64,
    /// Poll ticks that received nothing since the previous heartbeat.
    pub zero_read_ticks: u64,
    /// Messages dispatched but not yet completed.
    pub in_flight: usize,
    /// Free handler slots at the time of the last tick.
    pub available_handlers: usize,
    /// When the heartbeat was emitted.
    pub emitted_at: DateTime<Utc>,
}

/// Observer of telemetry events.
///
/// Implementations must not block the caller for long and must swallow
/// their own failures.
#[async_trait::async_trait]
pub trait TelemetryHandler: Send + Sync + std::fmt::Debug {
    /// Handles one telemetry event.
    async fn handle_event(&self, event: TelemetryEvent);
}

/// Handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpTelemetry;

impl NoOpTelemetry {
    /// Creates a new no-op handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl TelemetryHandler for NoOpTelemetry {
    async fn handle_event(&self, _event: TelemetryEvent) {}
}

/// Handler that writes every event as a structured log record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

#[async_trait::async_trait]
impl TelemetryHandler for TracingTelemetry {
    async fn handle_event(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::ReconcileCompleted(summary) => info!(
                added = summary.added.len(),
                removed = summary.removed.len(),
                changed = summary.changed.len(),
                failures = summary.failures,
                cancelled = summary.cancelled,
                added_names = ?summary.added,
                removed_names = ?summary.removed,
                changed_names = ?summary.changed,
                "reconciliation completed"
            ),
            TelemetryEvent::ReaderCreated(op) => info!(reader = %op.name, "reader created"),
            TelemetryEvent::ReaderDeleted(op) => info!(reader = %op.name, "reader deleted"),
            TelemetryEvent::ReaderCreateFailed(failure) => warn!(
                reader = %failure.name,
                reason = %failure.reason,
                busy = failure.busy,
                "reader creation failed"
            ),
            TelemetryEvent::ReaderDeleteFailed(failure) => warn!(
                reader = %failure.name,
                reason = %failure.reason,
                busy = failure.busy,
                "reader deletion failed"
            ),
            TelemetryEvent::ConfigLoadFailed { source, reason } => {
                warn!(source = %source, reason = %reason, "subscriber source failed to load");
            },
            TelemetryEvent::Heartbeat(beat) => info!(
                reader = %beat.reader,
                messages_read = beat.messages_read,
                zero_read_ticks = beat.zero_read_ticks,
                in_flight = beat.in_flight,
                available_handlers = beat.available_handlers,
                "reader heartbeat"
            ),
            TelemetryEvent::PumpFault { reader, reason } => {
                warn!(reader = %reader, reason = %reason, "pump tick faulted");
            },
            TelemetryEvent::UnknownHandle { unit, handle } => {
                warn!(unit = %unit, handle = %handle, "completion for unknown handle ignored");
            },
            TelemetryEvent::PoolExhausted { reader, pool_size } => {
                warn!(reader = %reader, pool_size, "handler pool exhausted");
            },
            TelemetryEvent::DeliveryFailed { handle, reader, reason } => {
                warn!(handle = %handle, reader = %reader, reason = %reason, "delivery failed");
            },
        }
    }
}

/// Handler that forwards events to multiple observers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastTelemetry {
    handlers: Vec<Arc<dyn TelemetryHandler>>,
}

impl MulticastTelemetry {
    /// Creates a multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds an observer.
    pub fn add_subscriber(&mut self, handler: Arc<dyn TelemetryHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered observers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl TelemetryHandler for MulticastTelemetry {
    async fn handle_event(&self, event: TelemetryEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move { handler.handle_event(event).await }
        });
        futures::future::join_all(futures).await;
    }
}
