//! Reconciliation engine.
//!
//! Diffs the desired subscriber set against the last applied one and the
//! reader processes actually running, then drives the fleet manager towards
//! the desired state. Every create and delete is an independent item: a
//! failure is recorded and the batch carries on. A changed subscriber is
//! replaced by deleting its running instances first and creating a fresh,
//! versioned instance afterwards, so there is at most one active reader per
//! subscriber at any time.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use bytes::Bytes;
use courier_core::{
    ChangeKind, Clock, ReaderFailureEvent, ReaderOperationEvent, ReconcileSummaryEvent,
    ResolvedSubscriber, SubscriberKey, TelemetryEvent, TelemetryHandler,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::ReconcileError,
    fleet::{FleetManager, DLQ_READER_TYPE, READER_TYPE},
    naming::{base_name, find_old_names, parse_reader_name, ReaderNamer},
    retry::{retry_busy, RetryPolicy},
};

/// Subscribers the fleet was last driven towards, by key.
pub type AppliedState = HashMap<SubscriberKey, ResolvedSubscriber>;

/// Per-key changes plus running readers no subscriber accounts for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Change flags by subscriber; unchanged keys are absent.
    pub changes: BTreeMap<SubscriberKey, ChangeKind>,
    /// Running reader names whose base matches neither a desired nor a
    /// previously applied subscriber.
    pub orphans: BTreeSet<String>,
}

impl ReconcilePlan {
    /// Change flags for `key`.
    pub fn change_for(&self, key: &SubscriberKey) -> ChangeKind {
        self.changes.get(key).copied().unwrap_or(ChangeKind::NONE)
    }

    /// Keys whose change is exactly `kind`.
    pub fn keys_with(&self, kind: ChangeKind) -> impl Iterator<Item = &SubscriberKey> {
        self.changes.iter().filter(move |(_, change)| **change == kind).map(|(key, _)| key)
    }

    /// Whether nothing needs to happen.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.orphans.is_empty()
    }
}

/// Computes the change set between `desired`, the last applied state and
/// the running reader names.
///
/// The resolved subscriber is the comparison key: any field difference in
/// the subscriber or in an endpoint it references marks it as changed.
pub fn plan(
    desired: &[ResolvedSubscriber],
    current: &AppliedState,
    running: &[String],
) -> ReconcilePlan {
    let mut changes = BTreeMap::new();
    let desired_keys: HashSet<SubscriberKey> =
        desired.iter().map(ResolvedSubscriber::key).collect();

    for subscriber in desired {
        let key = subscriber.key();
        match current.get(&key) {
            None => {
                changes.insert(key, ChangeKind::TO_BE_CREATED);
            },
            Some(previous) if subscriber.differs_from(previous) => {
                changes.insert(key, ChangeKind::TO_BE_UPDATED);
            },
            Some(_) => {},
        }
    }
    for key in current.keys().filter(|key| !desired_keys.contains(*key)) {
        changes.insert(key.clone(), ChangeKind::TO_BE_REMOVED);
    }

    let known_bases: HashSet<String> =
        desired_keys.iter().chain(current.keys()).map(base_name).collect();
    let orphans = running
        .iter()
        .filter(|name| {
            parse_reader_name(name).is_some_and(|record| !known_bases.contains(&record.base_name))
        })
        .cloned()
        .collect();

    ReconcilePlan { changes, orphans }
}

/// Fleet operation an item result refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemAction {
    /// A reader was (to be) created.
    Create,
    /// A reader was (to be) deleted.
    Delete,
}

/// Outcome of one fleet operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    /// The fleet manager accepted the operation.
    Applied,
    /// Creation was not needed because an instance already runs.
    AlreadyRunning,
    /// The operation failed after retries.
    Failed(ReconcileError),
    /// The operation was not attempted.
    Skipped(String),
}

/// One create or delete in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    /// Reader name operated on.
    pub name: String,
    /// Subscriber the reader belongs to; `None` for orphans.
    pub subscriber: Option<SubscriberKey>,
    /// Operation kind.
    pub action: ItemAction,
    /// What happened.
    pub status: ItemStatus,
}

impl ItemResult {
    /// Whether the fleet now matches what this item asked for.
    pub fn is_ok(&self) -> bool {
        matches!(self.status, ItemStatus::Applied | ItemStatus::AlreadyRunning)
    }

    /// Whether the operation was attempted and failed.
    pub fn is_failure(&self) -> bool {
        matches!(self.status, ItemStatus::Failed(_))
    }

    fn skipped(
        name: impl Into<String>,
        subscriber: Option<SubscriberKey>,
        action: ItemAction,
        reason: impl Into<String>,
    ) -> Self {
        Self { name: name.into(), subscriber, action, status: ItemStatus::Skipped(reason.into()) }
    }
}

fn names_where(results: &[ItemResult], pred: impl Fn(&ItemResult) -> bool) -> Vec<String> {
    results.iter().filter(|r| pred(r)).map(|r| r.name.clone()).collect()
}

/// Results of a create batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Per-item results in execution order.
    pub results: Vec<ItemResult>,
    /// Whether cancellation cut the batch short.
    pub cancelled: bool,
}

impl BatchOutcome {
    /// Names of readers that were created.
    pub fn created(&self) -> Vec<String> {
        names_where(&self.results, |r| {
            r.action == ItemAction::Create && r.status == ItemStatus::Applied
        })
    }

    /// Items that failed.
    pub fn failures(&self) -> impl Iterator<Item = &ItemResult> {
        self.results.iter().filter(|r| r.is_failure())
    }
}

/// Results of executing a [`ReconcilePlan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// The plan that was executed.
    pub plan: ReconcilePlan,
    /// Per-item results in execution order.
    pub results: Vec<ItemResult>,
    /// Whether cancellation cut the pass short.
    pub cancelled: bool,
}

impl RefreshOutcome {
    fn created_for(&self, kind: ChangeKind) -> Vec<String> {
        names_where(&self.results, |r| {
            r.action == ItemAction::Create
                && r.status == ItemStatus::Applied
                && r.subscriber.as_ref().is_some_and(|key| self.plan.change_for(key) == kind)
        })
    }

    /// Readers created for newly added subscribers.
    pub fn added(&self) -> Vec<String> {
        self.created_for(ChangeKind::TO_BE_CREATED)
    }

    /// Replacement readers created for changed subscribers.
    pub fn changed(&self) -> Vec<String> {
        self.created_for(ChangeKind::TO_BE_UPDATED)
    }

    /// Readers deleted for removed subscribers and orphans.
    pub fn removed(&self) -> Vec<String> {
        names_where(&self.results, |r| {
            r.action == ItemAction::Delete
                && r.status == ItemStatus::Applied
                && r.subscriber.as_ref().map_or(true, |key| {
                    self.plan.change_for(key) == ChangeKind::TO_BE_REMOVED
                })
        })
    }

    /// Items that failed.
    pub fn failures(&self) -> impl Iterator<Item = &ItemResult> {
        self.results.iter().filter(|r| r.is_failure())
    }

    /// Items that were not attempted.
    pub fn skipped(&self) -> impl Iterator<Item = &ItemResult> {
        self.results.iter().filter(|r| matches!(r.status, ItemStatus::Skipped(_)))
    }

    /// Aggregate telemetry for this pass.
    pub fn summary(&self) -> ReconcileSummaryEvent {
        ReconcileSummaryEvent {
            added: self.added(),
            removed: self.removed(),
            changed: self.changed(),
            failures: self.failures().count(),
            cancelled: self.cancelled,
        }
    }

    fn all_ok(&self, key: &SubscriberKey, action: ItemAction) -> bool {
        self.results
            .iter()
            .filter(|r| r.action == action && r.subscriber.as_ref() == Some(key))
            .all(ItemResult::is_ok)
    }

    /// Last-applied state after this pass.
    ///
    /// A subscriber whose creation did not happen is left out, so the next
    /// pass sees it as added again. A subscriber whose old instances could
    /// not all be deleted keeps its previous configuration, so the next pass
    /// retries the removal or replacement.
    pub fn applied_state(
        &self,
        previous: &AppliedState,
        desired: &[ResolvedSubscriber],
    ) -> AppliedState {
        let mut next: AppliedState =
            desired.iter().map(|resolved| (resolved.key(), resolved.clone())).collect();

        for (key, change) in &self.plan.changes {
            if change.contains(ChangeKind::TO_BE_REMOVED) && !self.all_ok(key, ItemAction::Delete)
            {
                match previous.get(key) {
                    Some(resolved) => next.insert(key.clone(), resolved.clone()),
                    None => next.remove(key),
                };
                continue;
            }
            if change.contains(ChangeKind::TO_BE_CREATED) && !self.all_ok(key, ItemAction::Create)
            {
                next.remove(key);
            }
        }
        next
    }
}

/// Drives a [`FleetManager`] towards a desired subscriber set.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    fleet: Arc<dyn FleetManager>,
    namer: ReaderNamer,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    telemetry: Arc<dyn TelemetryHandler>,
}

impl ReconciliationEngine {
    /// Creates an engine.
    pub fn new(
        fleet: Arc<dyn FleetManager>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        telemetry: Arc<dyn TelemetryHandler>,
    ) -> Self {
        Self { fleet, namer: ReaderNamer::new(clock.clone()), clock, retry, telemetry }
    }

    /// Lists running reader names, retrying while the fleet manager is busy.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`ReconcileError`] when listing fails.
    pub async fn list_running(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ReconcileError> {
        let fleet = &*self.fleet;
        retry_busy(&self.retry, &*self.clock, cancel, "<list>", move || fleet.list_names()).await
    }

    /// Creates a reader for every subscriber that has no running instance.
    ///
    /// Subscribers already running are reported as
    /// [`ItemStatus::AlreadyRunning`]; failures are collected per item.
    pub async fn create_readers(
        &self,
        subscribers: &[ResolvedSubscriber],
        running: &[String],
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for subscriber in subscribers {
            let key = subscriber.key();
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                outcome.results.push(ItemResult::skipped(
                    base_name(&key),
                    Some(key),
                    ItemAction::Create,
                    "cancelled",
                ));
                continue;
            }
            outcome.results.push(self.ensure_running(subscriber, running, cancel).await);
        }

        self.telemetry
            .handle_event(TelemetryEvent::ReconcileCompleted(ReconcileSummaryEvent {
                added: outcome.created(),
                failures: outcome.failures().count(),
                cancelled: outcome.cancelled,
                ..ReconcileSummaryEvent::default()
            }))
            .await;
        outcome
    }

    /// Executes the plan derived from `desired`, `current` and `running`.
    ///
    /// Deletions run first. Cancellation is observed between operations;
    /// every operation not started is reported as skipped.
    pub async fn refresh_readers(
        &self,
        desired: &[ResolvedSubscriber],
        current: &AppliedState,
        running: &[String],
        cancel: &CancellationToken,
    ) -> RefreshOutcome {
        let plan = plan(desired, current, running);
        let desired_by_key: HashMap<SubscriberKey, &ResolvedSubscriber> =
            desired.iter().map(|resolved| (resolved.key(), resolved)).collect();
        let mut results = Vec::new();

        debug!(
            changes = plan.changes.len(),
            orphans = plan.orphans.len(),
            running = running.len(),
            "reconciliation plan computed"
        );

        for key in plan.keys_with(ChangeKind::TO_BE_REMOVED) {
            for name in find_old_names(key, running) {
                results.push(self.delete_or_skip(Some(key), name, cancel).await);
            }
        }
        for name in &plan.orphans {
            results.push(self.delete_or_skip(None, name.clone(), cancel).await);
        }

        for key in plan.keys_with(ChangeKind::TO_BE_UPDATED) {
            let Some(subscriber) = desired_by_key.get(key) else { continue };
            let mut deleted_all = true;
            for name in find_old_names(key, running) {
                let result = self.delete_or_skip(Some(key), name, cancel).await;
                deleted_all &= result.is_ok();
                results.push(result);
            }
            if !deleted_all {
                warn!(subscriber = %key, "old reader still running, replacement not created");
                results.push(ItemResult::skipped(
                    base_name(key),
                    Some(key.clone()),
                    ItemAction::Create,
                    "previous instance could not be deleted",
                ));
                continue;
            }
            results.push(self.create_or_skip(subscriber, cancel).await);
        }

        for key in plan.keys_with(ChangeKind::TO_BE_CREATED) {
            let Some(subscriber) = desired_by_key.get(key) else { continue };
            results.push(self.create_or_skip_running(subscriber, running, cancel).await);
        }

        let outcome = RefreshOutcome { plan, results, cancelled: cancel.is_cancelled() };
        info!(
            added = outcome.added().len(),
            removed = outcome.removed().len(),
            changed = outcome.changed().len(),
            failures = outcome.failures().count(),
            cancelled = outcome.cancelled,
            "reconciliation pass finished"
        );
        self.telemetry.handle_event(TelemetryEvent::ReconcileCompleted(outcome.summary())).await;
        outcome
    }

    async fn create_or_skip_running(
        &self,
        subscriber: &ResolvedSubscriber,
        running: &[String],
        cancel: &CancellationToken,
    ) -> ItemResult {
        if cancel.is_cancelled() {
            let key = subscriber.key();
            return ItemResult::skipped(base_name(&key), Some(key), ItemAction::Create, "cancelled");
        }
        self.ensure_running(subscriber, running, cancel).await
    }

    async fn ensure_running(
        &self,
        subscriber: &ResolvedSubscriber,
        running: &[String],
        cancel: &CancellationToken,
    ) -> ItemResult {
        let key = subscriber.key();
        if let Some(existing) = find_old_names(&key, running).into_iter().next_back() {
            debug!(subscriber = %key, reader = %existing, "reader already running");
            return ItemResult {
                name: existing,
                subscriber: Some(key),
                action: ItemAction::Create,
                status: ItemStatus::AlreadyRunning,
            };
        }
        self.create_one(subscriber, cancel).await
    }

    async fn create_or_skip(
        &self,
        subscriber: &ResolvedSubscriber,
        cancel: &CancellationToken,
    ) -> ItemResult {
        if cancel.is_cancelled() {
            let key = subscriber.key();
            return ItemResult::skipped(base_name(&key), Some(key), ItemAction::Create, "cancelled");
        }
        self.create_one(subscriber, cancel).await
    }

    async fn create_one(
        &self,
        subscriber: &ResolvedSubscriber,
        cancel: &CancellationToken,
    ) -> ItemResult {
        let key = subscriber.key();
        let name = self.namer.generate_new_name(&key);
        let type_tag = if subscriber.config.dlq_mode { DLQ_READER_TYPE } else { READER_TYPE };
        let init = subscriber.to_init(name.clone());

        let result = match init.to_bytes() {
            Ok(bytes) => {
                let fleet = &*self.fleet;
                let init = Bytes::from(bytes);
                let reader = name.as_str();
                retry_busy(&self.retry, &*self.clock, cancel, reader, move || {
                    fleet.create(reader, type_tag, init.clone(), cancel)
                })
                .await
            },
            Err(e) => Err(ReconcileError::failed(&name, e.to_string())),
        };

        match result {
            Ok(()) => {
                info!(subscriber = %key, reader = %name, type_tag, "reader created");
                self.telemetry
                    .handle_event(TelemetryEvent::ReaderCreated(ReaderOperationEvent {
                        name: name.clone(),
                        subscriber: Some(key.clone()),
                    }))
                    .await;
                ItemResult {
                    name,
                    subscriber: Some(key),
                    action: ItemAction::Create,
                    status: ItemStatus::Applied,
                }
            },
            Err(error) => {
                warn!(subscriber = %key, reader = %name, error = %error, "reader creation failed");
                self.telemetry
                    .handle_event(TelemetryEvent::ReaderCreateFailed(ReaderFailureEvent {
                        name: name.clone(),
                        subscriber: Some(key.clone()),
                        reason: error.to_string(),
                        busy: matches!(error, ReconcileError::Busy { .. }),
                    }))
                    .await;
                ItemResult {
                    name,
                    subscriber: Some(key),
                    action: ItemAction::Create,
                    status: ItemStatus::Failed(error),
                }
            },
        }
    }

    async fn delete_or_skip(
        &self,
        key: Option<&SubscriberKey>,
        name: String,
        cancel: &CancellationToken,
    ) -> ItemResult {
        let subscriber = key.cloned();
        if cancel.is_cancelled() {
            return ItemResult::skipped(name, subscriber, ItemAction::Delete, "cancelled");
        }

        let fleet = &*self.fleet;
        let reader = name.as_str();
        let result = retry_busy(&self.retry, &*self.clock, cancel, reader, move || {
            fleet.delete(reader, cancel)
        })
        .await;

        match result {
            Ok(()) => {
                info!(reader = %name, orphan = subscriber.is_none(), "reader deleted");
                self.telemetry
                    .handle_event(TelemetryEvent::ReaderDeleted(ReaderOperationEvent {
                        name: name.clone(),
                        subscriber: subscriber.clone(),
                    }))
                    .await;
                ItemResult {
                    name,
                    subscriber,
                    action: ItemAction::Delete,
                    status: ItemStatus::Applied,
                }
            },
            Err(error) => {
                warn!(reader = %name, error = %error, "reader deletion failed");
                self.telemetry
                    .handle_event(TelemetryEvent::ReaderDeleteFailed(ReaderFailureEvent {
                        name: name.clone(),
                        subscriber: subscriber.clone(),
                        reason: error.to_string(),
                        busy: matches!(error, ReconcileError::Busy { .. }),
                    }))
                    .await;
                ItemResult {
                    name,
                    subscriber,
                    action: ItemAction::Delete,
                    status: ItemStatus::Failed(error),
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{EndpointConfig, SubscriberConfig};

    use super::*;

    fn endpoints(url: &str) -> BTreeMap<String, EndpointConfig> {
        let primary =
            EndpointConfig { name: "primary".into(), url: url.into(), timeout_seconds: None };
        BTreeMap::from([("primary".to_string(), primary)])
    }

    fn config(event: &str, name: &str) -> ResolvedSubscriber {
        let mut config = SubscriberConfig::new(event, name);
        config.endpoints = vec!["primary".to_string()];
        ResolvedSubscriber::resolve(config, &endpoints("https://hooks.example.com"))
    }

    fn current(subscribers: &[ResolvedSubscriber]) -> AppliedState {
        subscribers.iter().map(|s| (s.key(), s.clone())).collect()
    }

    #[test]
    fn plan_classifies_added_removed_changed_and_orphans() {
        let mut b_changed = config("b", "x");
        b_changed.config.max_delivery_count = 2;
        let desired = vec![config("a", "x"), b_changed, config("c", "x")];
        let previous = current(&[config("a", "x"), config("b", "x"), config("d", "x")]);
        let running = vec![
            "a--x--v1".to_string(),
            "b--x--v1".to_string(),
            "d--x--v1".to_string(),
            "zombie--x--v1".to_string(),
            "not-a-reader".to_string(),
        ];

        let plan = plan(&desired, &previous, &running);

        assert_eq!(plan.change_for(&SubscriberKey::new("a", "x")), ChangeKind::NONE);
        assert_eq!(plan.change_for(&SubscriberKey::new("b", "x")), ChangeKind::TO_BE_UPDATED);
        assert_eq!(plan.change_for(&SubscriberKey::new("c", "x")), ChangeKind::TO_BE_CREATED);
        assert_eq!(plan.change_for(&SubscriberKey::new("d", "x")), ChangeKind::TO_BE_REMOVED);
        assert_eq!(plan.orphans, BTreeSet::from(["zombie--x--v1".to_string()]));
    }

    #[test]
    fn endpoint_edit_marks_only_referencing_subscribers_changed() {
        let mut audited = SubscriberConfig::new("b", "x");
        audited.endpoints = vec!["audit".to_string()];
        let mut before = endpoints("https://hooks.example.com");
        before.insert(
            "audit".to_string(),
            EndpointConfig {
                name: "audit".into(),
                url: "https://audit.example.com".into(),
                timeout_seconds: None,
            },
        );
        let mut after = before.clone();
        after.extend(endpoints("https://moved.example.com"));

        let resolve_all = |endpoints: &BTreeMap<String, EndpointConfig>| {
            vec![
                ResolvedSubscriber::resolve(config("a", "x").config, endpoints),
                ResolvedSubscriber::resolve(audited.clone(), endpoints),
            ]
        };
        let previous = current(&resolve_all(&before));
        let desired = resolve_all(&after);

        let plan = plan(&desired, &previous, &[]);

        assert_eq!(plan.change_for(&SubscriberKey::new("a", "x")), ChangeKind::TO_BE_UPDATED);
        assert_eq!(plan.change_for(&SubscriberKey::new("b", "x")), ChangeKind::NONE);
    }

    #[test]
    fn startup_plan_treats_unknown_readers_as_orphans() {
        let desired = vec![config("a", "x")];
        let running = vec!["a--x--v1".to_string(), "b--x--v1".to_string()];

        let plan = plan(&desired, &HashMap::new(), &running);

        assert_eq!(plan.change_for(&SubscriberKey::new("a", "x")), ChangeKind::TO_BE_CREATED);
        assert_eq!(plan.orphans, BTreeSet::from(["b--x--v1".to_string()]));
    }

    #[test]
    fn applied_state_keeps_failed_deletes_and_drops_failed_creates() {
        let mut a_changed = config("a", "x");
        a_changed.config.max_delivery_count = 1;
        let previous = current(&[config("a", "x"), config("r", "x")]);
        let desired = vec![a_changed, config("n", "x")];

        let a = SubscriberKey::new("a", "x");
        let n = SubscriberKey::new("n", "x");
        let r = SubscriberKey::new("r", "x");
        let outcome = RefreshOutcome {
            plan: ReconcilePlan {
                changes: BTreeMap::from([
                    (a.clone(), ChangeKind::TO_BE_UPDATED),
                    (n.clone(), ChangeKind::TO_BE_CREATED),
                    (r.clone(), ChangeKind::TO_BE_REMOVED),
                ]),
                orphans: BTreeSet::new(),
            },
            results: vec![
                ItemResult {
                    name: "r--x--v1".into(),
                    subscriber: Some(r.clone()),
                    action: ItemAction::Delete,
                    status: ItemStatus::Failed(ReconcileError::failed("r--x--v1", "boom")),
                },
                ItemResult {
                    name: "a--x--v1".into(),
                    subscriber: Some(a.clone()),
                    action: ItemAction::Delete,
                    status: ItemStatus::Failed(ReconcileError::failed("a--x--v1", "boom")),
                },
                ItemResult::skipped(
                    "a--x",
                    Some(a.clone()),
                    ItemAction::Create,
                    "previous instance could not be deleted",
                ),
                ItemResult {
                    name: "n--x--v5".into(),
                    subscriber: Some(n.clone()),
                    action: ItemAction::Create,
                    status: ItemStatus::Failed(ReconcileError::failed("n--x--v5", "quota")),
                },
            ],
            cancelled: false,
        };

        let next = outcome.applied_state(&previous, &desired);

        assert_eq!(next.get(&a), previous.get(&a));
        assert_eq!(next.get(&r), previous.get(&r));
        assert!(!next.contains_key(&n));
        assert_eq!(outcome.failures().count(), 3);
        assert_eq!(outcome.skipped().count(), 1);
    }
}
