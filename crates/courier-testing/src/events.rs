//! Telemetry recording for deterministic async assertions.

use std::time::Duration;

use courier_core::{TelemetryEvent, TelemetryHandler};
use tokio::sync::{Notify, RwLock};

/// Default timeout when waiting for telemetry in tests.
///
/// Generous enough for slow CI machines while still preventing hangs.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Telemetry handler that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: RwLock<Vec<TelemetryEvent>>,
    notify: Notify,
}

impl RecordingTelemetry {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far.
    pub async fn events(&self) -> Vec<TelemetryEvent> {
        self.events.read().await.clone()
    }

    /// Events matching `pred`.
    pub async fn matching(&self, pred: impl Fn(&TelemetryEvent) -> bool) -> Vec<TelemetryEvent> {
        self.events.read().await.iter().filter(|e| pred(e)).cloned().collect()
    }

    /// Number of events matching `pred`.
    pub async fn count(&self, pred: impl Fn(&TelemetryEvent) -> bool) -> usize {
        self.events.read().await.iter().filter(|e| pred(e)).count()
    }

    /// Forgets all recorded events.
    pub async fn clear(&self) {
        self.events.write().await.clear();
    }

    /// Waits until at least `count` events match `pred`.
    ///
    /// # Panics
    ///
    /// Panics after [`DEFAULT_EVENT_TIMEOUT`].
    pub async fn wait_for(&self, count: usize, pred: impl Fn(&TelemetryEvent) -> bool) {
        let result = tokio::time::timeout(DEFAULT_EVENT_TIMEOUT, async {
            loop {
                let notified = self.notify.notified();
                if self.count(&pred).await >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;

        if result.is_err() {
            panic!(
                "expected {count} matching telemetry events within {:?}, saw {}",
                DEFAULT_EVENT_TIMEOUT,
                self.count(&pred).await
            );
        }
    }
}

#[async_trait::async_trait]
impl TelemetryHandler for RecordingTelemetry {
    async fn handle_event(&self, event: TelemetryEvent) {
        self.events.write().await.push(event);
        self.notify.notify_waiters();
    }
}
