//! Subscriber fleet reconciliation.
//!
//! Keeps a fleet of versioned reader processes in line with the desired
//! subscriber configuration. Two configuration sources are merged into one
//! desired state, diffed against what was last applied and what actually
//! runs, and the differences are applied through a [`FleetManager`] with
//! per-item failure tolerance and bounded retry of busy responses.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod director;
pub mod error;
pub mod fleet;
pub mod merge;
pub mod naming;
pub mod reconcile;
pub mod retry;
pub mod source;

pub use director::{Director, DirectorConfig, DirectorHandle, DirectorPhase, ReloadSummary};
pub use error::{FleetError, LoadError, ReconcileError, ReloadError, Result};
pub use fleet::{FleetManager, DLQ_READER_TYPE, READER_TYPE};
pub use merge::{merge, MergeOutcome};
pub use naming::{base_name, find_old_names, parse_reader_name, ReaderNamer};
pub use reconcile::{
    plan, AppliedState, BatchOutcome, ItemAction, ItemResult, ItemStatus, ReconcilePlan,
    ReconciliationEngine, RefreshOutcome,
};
pub use retry::{retry_busy, BackoffStrategy, RetryPolicy};
pub use source::{JsonFileSource, SourceSnapshot, StaticSource, SubscriberSource};
