//! Combines two subscriber sources into one canonical desired state.

use std::collections::BTreeMap;

use courier_core::{EndpointConfig, ResolvedSubscriber, SubscriberConfig, SubscriberKey};
use tracing::warn;

use crate::source::SourceSnapshot;

/// Result of merging a primary and a secondary snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Desired subscribers, sorted by key.
    pub desired: Vec<SubscriberConfig>,
    /// Endpoints by name.
    pub endpoints: BTreeMap<String, EndpointConfig>,
    /// Keys only the primary source knows about.
    pub only_in_primary: Vec<SubscriberKey>,
    /// Keys only the secondary source knows about.
    pub only_in_secondary: Vec<SubscriberKey>,
    /// Keys both sources define differently; the primary entry was kept.
    pub conflicts: Vec<SubscriberKey>,
}

impl MergeOutcome {
    /// Whether the two sources disagree in any way.
    pub fn is_divergent(&self) -> bool {
        !self.only_in_primary.is_empty()
            || !self.only_in_secondary.is_empty()
            || !self.conflicts.is_empty()
    }

    /// Desired subscribers with their referenced endpoints, sorted by key.
    pub fn resolved(&self) -> Vec<ResolvedSubscriber> {
        self.desired
            .iter()
            .map(|config| ResolvedSubscriber::resolve(config.clone(), &self.endpoints))
            .collect()
    }
}

/// Merges two snapshots keyed by [`SubscriberKey`].
///
/// The primary wins on conflict. Entries present in a single source are kept
/// in the desired state and reported, never dropped. Endpoints are unioned
/// by name with the same precedence.
pub fn merge(primary: &SourceSnapshot, secondary: &SourceSnapshot) -> MergeOutcome {
    let mut endpoints: BTreeMap<String, EndpointConfig> = BTreeMap::new();
    for endpoint in secondary.endpoints.iter().chain(&primary.endpoints) {
        endpoints.insert(endpoint.name.clone(), endpoint.clone());
    }

    let primary_by_key: BTreeMap<SubscriberKey, &SubscriberConfig> =
        primary.subscribers.iter().map(|s| (s.key(), s)).collect();
    let secondary_by_key: BTreeMap<SubscriberKey, &SubscriberConfig> =
        secondary.subscribers.iter().map(|s| (s.key(), s)).collect();

    let mut outcome = MergeOutcome { endpoints, ..MergeOutcome::default() };

    for (key, config) in &primary_by_key {
        match secondary_by_key.get(key) {
            None => outcome.only_in_primary.push(key.clone()),
            Some(other) if config.differs_from(other) => outcome.conflicts.push(key.clone()),
            Some(_) => {},
        }
        outcome.desired.push((*config).clone());
    }
    for (key, config) in &secondary_by_key {
        if !primary_by_key.contains_key(key) {
            outcome.only_in_secondary.push(key.clone());
            outcome.desired.push((*config).clone());
        }
    }
    outcome.desired.sort_by_key(SubscriberConfig::key);

    if !outcome.conflicts.is_empty() {
        warn!(conflicts = outcome.conflicts.len(), "subscriber sources disagree, primary kept");
    }
    outcome
}
