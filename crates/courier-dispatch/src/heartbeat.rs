//! Windowed throughput counters for reader heartbeats.
//!
//! Pumps write from their own task while the heartbeat timer reads; the
//! whole aggregate lives behind one mutex so a snapshot and its reset are
//! a single step.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use courier_core::HeartbeatEvent;

/// Counters captured by [`HeartbeatAggregator::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatSnapshot {
    /// Messages received since the previous snapshot.
    pub messages_read: u64,
    /// Poll ticks since the previous snapshot that received nothing.
    pub zero_read_ticks: u64,
    /// In-flight messages at the last gauge update.
    pub in_flight: usize,
    /// Free handler slots at the last gauge update.
    pub available_handlers: usize,
}

impl HeartbeatSnapshot {
    /// Converts into the telemetry event for `reader`.
    pub fn into_event(self, reader: impl Into<String>) -> HeartbeatEvent {
        HeartbeatEvent {
            reader: reader.into(),
            messages_read: self.messages_read,
            zero_read_ticks: self.zero_read_ticks,
            in_flight: self.in_flight,
            available_handlers: self.available_handlers,
            emitted_at: Utc::now(),
        }
    }
}

/// Thread-safe heartbeat counters.
#[derive(Debug, Default)]
pub struct HeartbeatAggregator {
    counters: Option<Mutex<HeartbeatSnapshot>>,
}

impl HeartbeatAggregator {
    /// Creates an enabled aggregator with zeroed counters.
    pub fn new() -> Self {
        Self { counters: Some(Mutex::new(HeartbeatSnapshot::default())) }
    }

    /// Creates an aggregator that ignores every write.
    ///
    /// Used for readers whose heartbeat interval is zero. Taking a snapshot
    /// of a disabled aggregator is a programming error and panics.
    pub fn disabled() -> Self {
        Self { counters: None }
    }

    /// Whether writes are recorded.
    pub fn is_enabled(&self) -> bool {
        self.counters.is_some()
    }

    /// Records the result of one poll tick.
    pub fn report_messages_read(&self, count: usize) {
        if let Some(mut counters) = self.lock() {
            counters.messages_read += count as u64;
            if count == 0 {
                counters.zero_read_ticks += 1;
            }
        }
    }

    /// Updates the backlog gauges.
    pub fn set_gauges(&self, in_flight: usize, available_handlers: usize) {
        if let Some(mut counters) = self.lock() {
            counters.in_flight = in_flight;
            counters.available_handlers = available_handlers;
        }
    }

    /// Returns the current counters and resets the windowed ones. Gauges
    /// keep their last value.
    ///
    /// # Panics
    ///
    /// Panics if the aggregator is disabled.
    #[allow(clippy::panic)]
    pub fn snapshot(&self) -> HeartbeatSnapshot {
        let Some(mut counters) = self.lock() else {
            panic!("snapshot taken from a disabled heartbeat aggregator");
        };
        let snapshot = *counters;
        counters.messages_read = 0;
        counters.zero_read_ticks = 0;
        snapshot
    }

    // Counters stay consistent even if a writer panicked mid-update.
    fn lock(&self) -> Option<MutexGuard<'_, HeartbeatSnapshot>> {
        self.counters.as_ref().map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
