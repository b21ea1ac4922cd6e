//! Message dispatch for courier readers.
//!
//! Each reader runs a [`ReaderPump`] that pulls bounded batches from its
//! subscriber's queue and hands messages to one shared, fixed-size handler
//! pool. The pool's slot workers perform delivery and report back so the
//! pump can acknowledge the source message. Delivery is at-least-once: a
//! message is acknowledged only after its delivery succeeded, and anything
//! refused or failed stays in the queue for redelivery.
//!
//! Unit state (the pool partition, every pump's in-flight map) lives in a
//! [`StateStore`] so a restarted process picks up where it stopped.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod delivery;
pub mod error;
pub mod heartbeat;
pub mod host;
pub mod pump;
pub mod queue;
pub mod scheduler;
pub mod store;

pub use client::{ClientConfig, EndpointRoutes, HttpDelivery};
pub use delivery::Delivery;
pub use error::{DeliveryError, DispatchError, ErrorCategory, QueueError, Result};
pub use heartbeat::{HeartbeatAggregator, HeartbeatSnapshot};
pub use host::{HostedReader, HostedReaders, LocalFleet, PumpRegistry, HOSTED_READERS_KEY};
pub use pump::{PumpConfig, PumpHandle, ReaderPump};
pub use queue::{QueueClient, QueueConnector, ReceivedMessage};
pub use scheduler::{
    start_scheduler, BusyEntry, CompleteOutcome, CompletionSink, PoolSnapshot, SchedulerConfig,
    SchedulerHandle,
};
pub use store::{PostgresStateStore, StateStore, StoreFuture};
