//! Core domain models, telemetry events and time abstraction.
//!
//! Shared vocabulary of the courier workspace: subscriber configuration and
//! keys, reader records, change flags, correlation handles and ack tokens.
//! The fleet crate (reconciliation) and the dispatch crate (pumps and the
//! handler pool) both build on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    HeartbeatEvent, MulticastTelemetry, NoOpTelemetry, ReaderFailureEvent, ReaderOperationEvent,
    ReconcileSummaryEvent, TelemetryEvent, TelemetryHandler, TracingTelemetry,
};
pub use models::{
    AckToken, AuthConfig, ChangeKind, CorrelationHandle, EndpointConfig, HandlerId, ReaderInit,
    ReaderRecord, ResolvedSubscriber, SubscriberConfig, SubscriberKey,
};
pub use time::{Clock, RealClock, TestClock};
