//! Director control loop.
//!
//! The director owns the last applied subscriber state and runs one
//! reconciliation pass at a time: load both sources, merge them, reconcile
//! the fleet. Passes are triggered at startup, on a timer and on demand.
//! The pass itself runs in its own task so the director stays responsive
//! and can refuse overlapping reloads immediately.

use std::{collections::HashMap, sync::Arc, time::Duration};

use courier_core::{SubscriberKey, TelemetryEvent, TelemetryHandler};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{JoinError, JoinHandle},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{LoadError, ReloadError},
    merge::merge,
    reconcile::{AppliedState, ReconciliationEngine},
    source::{SourceSnapshot, SubscriberSource},
};

const COMMAND_CAPACITY: usize = 16;

/// What the director is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectorPhase {
    /// Waiting for a trigger.
    #[default]
    Idle,
    /// Loading both subscriber sources.
    Loading,
    /// Merging the loaded snapshots.
    Merging,
    /// Driving the fleet manager.
    Reconciling,
}

/// Director settings.
#[derive(Debug, Clone)]
pub struct DirectorConfig {
    /// Period of the timer trigger.
    pub reload_interval: Duration,
    /// Run a pass as soon as the director starts.
    pub reload_on_start: bool,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self { reload_interval: Duration::from_secs(300), reload_on_start: true }
    }
}

/// Aggregate outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    /// Readers created for new subscribers.
    pub added: Vec<String>,
    /// Readers deleted for removed subscribers and orphans.
    pub removed: Vec<String>,
    /// Replacement readers created for changed subscribers.
    pub changed: Vec<String>,
    /// Number of failed fleet operations.
    pub failures: usize,
    /// Subscribers only the primary source defines.
    pub only_in_primary: Vec<SubscriberKey>,
    /// Subscribers only the secondary source defines.
    pub only_in_secondary: Vec<SubscriberKey>,
    /// Whether cancellation cut the pass short.
    pub cancelled: bool,
}

type ReloadReply = oneshot::Sender<Result<ReloadSummary, ReloadError>>;
type PassResult = Result<(ReloadSummary, AppliedState), ReloadError>;

enum DirectorCommand {
    Reload { reply: ReloadReply },
    LastApplied { reply: oneshot::Sender<AppliedState> },
}

/// Handle for talking to a running director.
#[derive(Debug, Clone)]
pub struct DirectorHandle {
    tx: mpsc::Sender<DirectorCommand>,
    phase: watch::Receiver<DirectorPhase>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DirectorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reload { .. } => f.write_str("Reload"),
            Self::LastApplied { .. } => f.write_str("LastApplied"),
        }
    }
}

impl DirectorHandle {
    /// Runs a reconciliation pass and waits for its summary.
    ///
    /// # Errors
    ///
    /// - `ReloadError::Busy` if a pass is already running
    /// - `ReloadError::ConfigLoad` if a source failed; the previous state is kept
    /// - `ReloadError::Fleet` if running readers could not be listed
    /// - `ReloadError::Stopped` if the director has shut down
    pub async fn reload(&self) -> Result<ReloadSummary, ReloadError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(DirectorCommand::Reload { reply }).await.map_err(|_| ReloadError::Stopped)?;
        rx.await.map_err(|_| ReloadError::Stopped)?
    }

    /// Current phase.
    pub fn phase(&self) -> DirectorPhase {
        *self.phase.borrow()
    }

    /// Receiver notified on every phase change.
    pub fn subscribe_phase(&self) -> watch::Receiver<DirectorPhase> {
        self.phase.clone()
    }

    /// Last successfully applied subscriber state, with the endpoints each
    /// subscriber's readers were created with.
    ///
    /// # Errors
    ///
    /// Returns `ReloadError::Stopped` if the director has shut down.
    pub async fn last_applied(&self) -> Result<AppliedState, ReloadError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DirectorCommand::LastApplied { reply })
            .await
            .map_err(|_| ReloadError::Stopped)?;
        rx.await.map_err(|_| ReloadError::Stopped)
    }

    /// Requests shutdown; an in-flight pass stops between operations.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct PassContext {
    primary: Arc<dyn SubscriberSource>,
    secondary: Arc<dyn SubscriberSource>,
    engine: ReconciliationEngine,
    telemetry: Arc<dyn TelemetryHandler>,
    phase: watch::Sender<DirectorPhase>,
}

struct InFlight {
    task: JoinHandle<PassResult>,
    reply: Option<ReloadReply>,
}

/// Reconciliation control loop.
pub struct Director {
    config: DirectorConfig,
    context: Arc<PassContext>,
    last_applied: AppliedState,
}

impl Director {
    /// Creates a director over two sources and an engine.
    pub fn new(
        config: DirectorConfig,
        primary: Arc<dyn SubscriberSource>,
        secondary: Arc<dyn SubscriberSource>,
        engine: ReconciliationEngine,
        telemetry: Arc<dyn TelemetryHandler>,
    ) -> Self {
        let (phase, _) = watch::channel(DirectorPhase::Idle);
        Self {
            config,
            context: Arc::new(PassContext { primary, secondary, engine, telemetry, phase }),
            last_applied: HashMap::new(),
        }
    }

    /// Spawns the control loop.
    ///
    /// The returned join handle completes once the director has stopped and
    /// any in-flight pass has finished.
    pub fn spawn(self, cancel: CancellationToken) -> (DirectorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = DirectorHandle {
            tx,
            phase: self.context.phase.subscribe(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(self.run(rx, cancel));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DirectorCommand>, cancel: CancellationToken) {
        let period = self.config.reload_interval.max(Duration::from_millis(1));
        let start =
            if self.config.reload_on_start { Instant::now() } else { Instant::now() + period };
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pass: Option<InFlight> = None;
        info!(interval_secs = period.as_secs(), "director started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,

                joined = join_pass(&mut pass), if pass.is_some() => {
                    if let Some(finished) = pass.take() {
                        self.finish_pass(joined, finished.reply);
                    }
                },

                command = rx.recv() => match command {
                    Some(DirectorCommand::Reload { reply }) => {
                        if pass.is_some() {
                            debug!("reload refused, pass in progress");
                            let _ = reply.send(Err(ReloadError::Busy));
                        } else {
                            pass = Some(self.start_pass(Some(reply), &cancel));
                        }
                    },
                    Some(DirectorCommand::LastApplied { reply }) => {
                        let _ = reply.send(self.last_applied.clone());
                    },
                    None => break,
                },

                _ = ticker.tick() => {
                    if pass.is_some() {
                        debug!("timer reload skipped, pass in progress");
                    } else {
                        pass = Some(self.start_pass(None, &cancel));
                    }
                },
            }
        }

        if let Some(in_flight) = pass.take() {
            info!("waiting for in-flight reconciliation pass");
            let joined = in_flight.task.await;
            self.finish_pass(joined, in_flight.reply);
        }
        info!("director stopped");
    }

    fn start_pass(&self, reply: Option<ReloadReply>, cancel: &CancellationToken) -> InFlight {
        let context = self.context.clone();
        let current = self.last_applied.clone();
        let cancel = cancel.child_token();
        debug!(triggered = reply.is_some(), "reconciliation pass starting");
        InFlight { task: tokio::spawn(run_pass(context, current, cancel)), reply }
    }

    fn finish_pass(&mut self, joined: Result<PassResult, JoinError>, reply: Option<ReloadReply>) {
        self.context.phase.send_replace(DirectorPhase::Idle);
        let result = match joined {
            Ok(Ok((summary, applied))) => {
                self.last_applied = applied;
                Ok(summary)
            },
            Ok(Err(e)) => {
                warn!(error = %e, "reconciliation pass aborted, keeping last applied state");
                Err(e)
            },
            Err(e) => {
                error!(error = %e, "reconciliation task failed");
                Err(ReloadError::Aborted(e.to_string()))
            },
        };
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }
}

async fn join_pass(pass: &mut Option<InFlight>) -> Result<PassResult, JoinError> {
    match pass {
        Some(in_flight) => (&mut in_flight.task).await,
        None => std::future::pending().await,
    }
}

async fn load_checked(
    source: &dyn SubscriberSource,
    telemetry: &dyn TelemetryHandler,
) -> Result<SourceSnapshot, LoadError> {
    let result = source.load().await.and_then(|snapshot| {
        if snapshot.has_errors() {
            Err(LoadError::Invalid {
                source_name: source.name().to_string(),
                errors: snapshot.errors,
            })
        } else {
            Ok(snapshot)
        }
    });
    if let Err(e) = &result {
        warn!(source = source.name(), error = %e, "subscriber source rejected");
        telemetry
            .handle_event(TelemetryEvent::ConfigLoadFailed {
                source: e.source_name().to_string(),
                reason: e.to_string(),
            })
            .await;
    }
    result
}

async fn run_pass(
    context: Arc<PassContext>,
    current: AppliedState,
    cancel: CancellationToken,
) -> PassResult {
    context.phase.send_replace(DirectorPhase::Loading);
    let telemetry = &*context.telemetry;
    let (primary, secondary) = tokio::join!(
        load_checked(&*context.primary, telemetry),
        load_checked(&*context.secondary, telemetry)
    );
    let (primary, secondary) = (primary?, secondary?);

    context.phase.send_replace(DirectorPhase::Merging);
    let merged = merge(&primary, &secondary);
    if merged.is_divergent() {
        info!(
            only_in_primary = merged.only_in_primary.len(),
            only_in_secondary = merged.only_in_secondary.len(),
            conflicts = merged.conflicts.len(),
            "subscriber sources diverge"
        );
    }

    context.phase.send_replace(DirectorPhase::Reconciling);
    let desired = merged.resolved();
    let running = context
        .engine
        .list_running(&cancel)
        .await
        .map_err(|e| ReloadError::Fleet(e.to_string()))?;
    let outcome = context
        .engine
        .refresh_readers(&desired, &current, &running, &cancel)
        .await;
    let applied = outcome.applied_state(&current, &desired);

    let summary = ReloadSummary {
        added: outcome.added(),
        removed: outcome.removed(),
        changed: outcome.changed(),
        failures: outcome.failures().count(),
        only_in_primary: merged.only_in_primary,
        only_in_secondary: merged.only_in_secondary,
        cancelled: outcome.cancelled,
    };
    Ok((summary, applied))
}
