//! Read-only subscriber configuration sources.
//!
//! The subscriber CRUD API and its store are external; the director only
//! sees them as snapshot providers. A snapshot either loads completely or is
//! rejected: reconciliation never runs against a partial read.

use std::{collections::HashSet, path::PathBuf, sync::Arc};

use courier_core::{EndpointConfig, SubscriberConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::LoadError;

/// One source's view of endpoints and subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    /// Endpoint definitions.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// Subscriber definitions.
    #[serde(default)]
    pub subscribers: Vec<SubscriberConfig>,
    /// Validation messages for entries that were skipped.
    #[serde(skip)]
    pub errors: Vec<String>,
}

impl SourceSnapshot {
    /// Creates a snapshot without validation errors.
    pub fn new(endpoints: Vec<EndpointConfig>, subscribers: Vec<SubscriberConfig>) -> Self {
        Self { endpoints, subscribers, errors: Vec::new() }
    }

    /// Whether any entry was rejected while loading.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Drops invalid entries, recording one message per rejected entry.
    ///
    /// Endpoints need a name and a URL; subscribers need both key parts, a
    /// positive max delivery count, at least one endpoint, and may only
    /// reference endpoints defined in the same snapshot. Names and keys must
    /// be unique: every repeat after the first entry is rejected.
    pub fn validated(mut self) -> Self {
        let mut errors = std::mem::take(&mut self.errors);

        let mut endpoint_names = HashSet::new();
        self.endpoints.retain(|endpoint| {
            if endpoint.name.trim().is_empty() || endpoint.url.trim().is_empty() {
                errors.push(format!("endpoint {:?} needs a name and a url", endpoint.name));
                false
            } else if !endpoint_names.insert(endpoint.name.clone()) {
                errors.push(format!("endpoint {} is defined more than once", endpoint.name));
                false
            } else {
                true
            }
        });

        let mut keys = HashSet::new();
        let mut subscribers = Vec::with_capacity(self.subscribers.len());
        for subscriber in self.subscribers {
            let key = subscriber.key();
            if subscriber.event_type.trim().is_empty()
                || subscriber.subscriber_name.trim().is_empty()
            {
                errors.push(format!("subscriber {key} needs an event type and a name"));
            } else if !keys.insert(key.clone()) {
                errors.push(format!("subscriber {key} is defined more than once"));
            } else if subscriber.max_delivery_count == 0 {
                errors.push(format!("subscriber {key} has a zero max delivery count"));
            } else if subscriber.endpoints.is_empty() {
                errors.push(format!("subscriber {key} has no endpoints"));
            } else if let Some(missing) =
                subscriber.endpoints.iter().find(|name| !endpoint_names.contains(name.as_str()))
            {
                errors.push(format!("subscriber {key} references unknown endpoint {missing}"));
            } else {
                subscribers.push(subscriber);
            }
        }

        Self { endpoints: self.endpoints, subscribers, errors }
    }
}

/// Provider of subscriber configuration snapshots.
#[async_trait::async_trait]
pub trait SubscriberSource: Send + Sync + std::fmt::Debug {
    /// Human-readable source name for logs and reports.
    fn name(&self) -> &str;

    /// Loads a full snapshot.
    ///
    /// A snapshot with [`SourceSnapshot::has_errors`] set is returned as-is;
    /// the director decides to reject it.
    async fn load(&self) -> Result<SourceSnapshot, LoadError>;
}

/// Source backed by a JSON document on disk.
///
/// ```json
/// { "endpoints": [{ "name": "primary", "url": "https://example.com/hook" }],
///   "subscribers": [{ "event_type": "order.created", "subscriber_name": "billing",
///                     "endpoints": ["primary"] }] }
/// ```
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    name: String,
    path: PathBuf,
}

impl JsonFileSource {
    /// Creates a source reading `path`.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), path: path.into() }
    }
}

#[async_trait::async_trait]
impl SubscriberSource for JsonFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<SourceSnapshot, LoadError> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| LoadError::Unreachable {
            source_name: self.name.clone(),
            message: format!("{}: {e}", self.path.display()),
        })?;
        let snapshot: SourceSnapshot = serde_json::from_slice(&raw).map_err(|e| {
            LoadError::Malformed { source_name: self.name.clone(), message: e.to_string() }
        })?;
        let snapshot = snapshot.validated();
        debug!(
            source = %self.name,
            endpoints = snapshot.endpoints.len(),
            subscribers = snapshot.subscribers.len(),
            errors = snapshot.errors.len(),
            "subscriber source loaded"
        );
        Ok(snapshot)
    }
}

/// In-memory source whose snapshot can be swapped at runtime.
#[derive(Debug, Clone)]
pub struct StaticSource {
    name: String,
    state: Arc<RwLock<Result<SourceSnapshot, String>>>,
}

impl StaticSource {
    /// Creates a source serving `snapshot`.
    pub fn new(name: impl Into<String>, snapshot: SourceSnapshot) -> Self {
        Self { name: name.into(), state: Arc::new(RwLock::new(Ok(snapshot))) }
    }

    /// Creates a source serving nothing.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, SourceSnapshot::default())
    }

    /// Replaces the served snapshot.
    pub async fn set(&self, snapshot: SourceSnapshot) {
        *self.state.write().await = Ok(snapshot);
    }

    /// Makes subsequent loads fail as unreachable.
    pub async fn fail(&self, message: impl Into<String>) {
        *self.state.write().await = Err(message.into());
    }
}

#[async_trait::async_trait]
impl SubscriberSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<SourceSnapshot, LoadError> {
        match &*self.state.read().await {
            Ok(snapshot) => Ok(snapshot.clone()),
            Err(message) => Err(LoadError::Unreachable {
                source_name: self.name.clone(),
                message: message.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn endpoint(name: &str) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            url: format!("https://example.com/{name}"),
            timeout_seconds: None,
        }
    }

    fn subscriber(event: &str, name: &str, endpoints: &[&str]) -> SubscriberConfig {
        let mut config = SubscriberConfig::new(event, name);
        config.endpoints = endpoints.iter().map(|e| (*e).to_string()).collect();
        config
    }

    #[test]
    fn validation_drops_and_reports_bad_entries() {
        let mut zero_count = subscriber("order.created", "audit", &["primary"]);
        zero_count.max_delivery_count = 0;

        let snapshot = SourceSnapshot::new(
            vec![endpoint("primary"), EndpointConfig { url: String::new(), ..endpoint("broken") }],
            vec![
                subscriber("order.created", "billing", &["primary"]),
                subscriber("order.created", "shipping", &["missing"]),
                subscriber("order.created", "nobody", &[]),
                zero_count,
            ],
        )
        .validated();

        assert_eq!(snapshot.endpoints.len(), 1);
        assert_eq!(snapshot.subscribers.len(), 1);
        assert_eq!(snapshot.errors.len(), 4);
        assert!(snapshot.has_errors());
    }

    #[test]
    fn repeated_keys_and_endpoint_names_are_rejected() {
        let mut retuned = subscriber("order.created", "billing", &["primary"]);
        retuned.max_delivery_count = 3;
        let mut dead_letters = subscriber("order.created", "billing", &["primary"]);
        dead_letters.dlq_mode = true;

        let snapshot = SourceSnapshot::new(
            vec![
                endpoint("primary"),
                EndpointConfig { url: "https://other.example.com".into(), ..endpoint("primary") },
            ],
            vec![
                subscriber("order.created", "billing", &["primary"]),
                retuned,
                dead_letters,
            ],
        )
        .validated();

        assert_eq!(snapshot.endpoints, vec![endpoint("primary")]);
        assert_eq!(snapshot.subscribers.len(), 2);
        assert_eq!(snapshot.subscribers[0].max_delivery_count, 10);
        assert_eq!(snapshot.errors.len(), 2);
        assert!(snapshot.errors.iter().any(|e| e.contains("endpoint primary is defined more")));
        assert!(snapshot.errors.iter().any(|e| e.contains("is defined more than once")));
    }

    #[tokio::test]
    async fn json_file_source_loads_document() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"endpoints":[{{"name":"primary","url":"https://example.com/hook"}}],
                "subscribers":[{{"event_type":"order.created","subscriber_name":"billing",
                                 "endpoints":["primary"]}}]}}"#
        )
        .unwrap();

        let source = JsonFileSource::new("primary", file.path());
        let snapshot = source.load().await.unwrap();

        assert_eq!(snapshot.subscribers.len(), 1);
        assert!(!snapshot.has_errors());
        assert_eq!(source.name(), "primary");
    }

    #[tokio::test]
    async fn json_file_source_distinguishes_missing_and_malformed() {
        let missing = JsonFileSource::new("primary", "/nonexistent/courier/subscribers.json");
        assert!(matches!(missing.load().await, Err(LoadError::Unreachable { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let malformed = JsonFileSource::new("primary", file.path());
        assert!(matches!(malformed.load().await, Err(LoadError::Malformed { .. })));
    }

    #[tokio::test]
    async fn static_source_can_fail_and_recover() {
        let source = StaticSource::empty("secondary");
        source.fail("store offline").await;
        assert!(source.load().await.is_err());

        source.set(SourceSnapshot::new(vec![endpoint("primary")], Vec::new())).await;
        assert_eq!(source.load().await.unwrap().endpoints.len(), 1);
    }
}
