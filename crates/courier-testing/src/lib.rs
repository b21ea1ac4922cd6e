//! Test infrastructure shared across the courier workspace.
//!
//! Provides subscriber and endpoint fixtures, a telemetry handler that
//! records events for assertions, an HTTP mock server for delivery tests and
//! a bounded polling helper so async tests never hang.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{future::Future, time::Duration};

pub mod events;
pub mod fixtures;
pub mod http;

pub use courier_core::TestClock;
pub use events::{RecordingTelemetry, DEFAULT_EVENT_TIMEOUT};
pub use fixtures::{endpoint, snapshot, EndpointBuilder, SubscriberBuilder};
pub use http::{MockEndpoint, MockResponse, MockServer};

/// Polls `condition` every few milliseconds until it holds.
///
/// # Panics
///
/// Panics with `what` when the condition does not hold within `timeout`.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(timeout, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    assert!(result.is_ok(), "condition not reached within {timeout:?}: {what}");
}
