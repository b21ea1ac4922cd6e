//! Core domain models and strongly-typed identifiers.
//!
//! Defines subscribers, endpoints, reader records and the newtype IDs that
//! flow between the reconciliation side (fleet) and the dispatch side
//! (pumps and the handler pool). Everything here is plain data: no I/O.

use std::{
    collections::BTreeMap,
    fmt,
    ops::{BitOr, BitOrAssign},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Natural key of a subscriber.
///
/// Two configurations with the same key describe the same logical consumer,
/// regardless of their endpoint list or delivery settings. Readers are named
/// and diffed by this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberKey {
    /// Event type the subscriber consumes.
    pub event_type: String,
    /// Name of the consumer within the event type.
    pub subscriber_name: String,
    /// Whether this key addresses the dead-letter sub-queue.
    pub dlq: bool,
}

impl SubscriberKey {
    /// Creates a key for the primary queue.
    pub fn new(event_type: impl Into<String>, subscriber_name: impl Into<String>) -> Self {
        Self { event_type: event_type.into(), subscriber_name: subscriber_name.into(), dlq: false }
    }

    /// Returns the same subscriber addressed at its dead-letter sub-queue.
    pub fn dead_letter(mut self) -> Self {
        self.dlq = true;
        self
    }
}

impl fmt::Display for SubscriberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.event_type, self.subscriber_name)?;
        if self.dlq {
            write!(f, " (dlq)")?;
        }
        Ok(())
    }
}

/// Credentials scheme a subscriber uses against its endpoints.
///
/// The core never interprets these values; they travel inside the reader's
/// init payload to the delivery collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication.
    #[default]
    None,
    /// HTTP basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Name of the secret holding the password.
        password_secret: String,
    },
    /// Static bearer token.
    Bearer {
        /// Name of the secret holding the token.
        token_secret: String,
    },
    /// OAuth2 client-credentials grant.
    OAuthClientCredentials {
        /// Token endpoint.
        token_url: String,
        /// OAuth client identifier.
        client_id: String,
        /// Name of the secret holding the client secret.
        client_secret: String,
        /// Requested scope, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    },
}

/// A webhook destination referenced by name from subscriber configurations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique endpoint name.
    pub name: String,
    /// Destination URL.
    pub url: String,
    /// Per-endpoint request timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Full desired state of one subscriber.
///
/// Immutable snapshot for a single reconciliation pass. Its canonical JSON
/// form is the comparison key used to detect changes, so every field
/// participates in change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// Event type the subscriber consumes.
    pub event_type: String,
    /// Name of the consumer within the event type.
    pub subscriber_name: String,
    /// Names of the endpoints this subscriber delivers to.
    pub endpoints: Vec<String>,
    /// Credentials handed to the delivery collaborator.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Consume from the dead-letter sub-queue instead of the primary one.
    #[serde(default)]
    pub dlq_mode: bool,
    /// Maximum delivery count before the queue dead-letters a message.
    #[serde(default = "default_max_delivery_count")]
    pub max_delivery_count: u32,
    /// Seconds between heartbeat emissions.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Receive batch override; the pump never exceeds the pool size anyway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

fn default_max_delivery_count() -> u32 {
    10
}

fn default_heartbeat_interval() -> u64 {
    60
}

impl SubscriberConfig {
    /// Creates a configuration with default delivery settings.
    pub fn new(event_type: impl Into<String>, subscriber_name: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            subscriber_name: subscriber_name.into(),
            endpoints: Vec::new(),
            auth: AuthConfig::None,
            dlq_mode: false,
            max_delivery_count: default_max_delivery_count(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            batch_size: None,
        }
    }

    /// Returns the natural key of this subscriber.
    pub fn key(&self) -> SubscriberKey {
        SubscriberKey {
            event_type: self.event_type.clone(),
            subscriber_name: self.subscriber_name.clone(),
            dlq: self.dlq_mode,
        }
    }

    /// Serializes the configuration into its canonical comparison form.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if the configuration cannot be
    /// represented as JSON.
    pub fn canonical(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Whether two configurations differ in any field.
    ///
    /// Falls back to structural equality when either side cannot be
    /// serialized.
    pub fn differs_from(&self, other: &Self) -> bool {
        match (self.canonical(), other.canonical()) {
            (Ok(a), Ok(b)) => a != b,
            _ => self != other,
        }
    }
}

/// A subscriber together with the endpoint definitions it references.
///
/// This is what a reader is created from, so it is also what
/// reconciliation compares: editing a referenced endpoint changes the
/// resolved form even when the subscriber entry itself is untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSubscriber {
    /// Subscriber entry as loaded.
    pub config: SubscriberConfig,
    /// Referenced endpoints that exist, keyed by name.
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

impl ResolvedSubscriber {
    /// Looks up the endpoints `config` references in `endpoints`.
    ///
    /// Names without a definition are left out.
    pub fn resolve(config: SubscriberConfig, endpoints: &BTreeMap<String, EndpointConfig>) -> Self {
        let endpoints = config
            .endpoints
            .iter()
            .filter_map(|name| endpoints.get(name).map(|e| (name.clone(), e.clone())))
            .collect();
        Self { config, endpoints }
    }

    /// Returns the natural key of the subscriber.
    pub fn key(&self) -> SubscriberKey {
        self.config.key()
    }

    /// Whether the subscriber or any referenced endpoint differs.
    pub fn differs_from(&self, other: &Self) -> bool {
        self.config.differs_from(&other.config) || self.endpoints != other.endpoints
    }

    /// Init payload for a reader named `reader_name`.
    pub fn to_init(&self, reader_name: impl Into<String>) -> ReaderInit {
        ReaderInit {
            reader_name: reader_name.into(),
            subscriber: self.config.clone(),
            endpoints: self.endpoints.clone(),
        }
    }
}

/// A running reader process name split into its parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReaderRecord {
    /// Name with the version suffix stripped.
    pub base_name: String,
    /// Full name as reported by the fleet manager.
    pub versioned_name: String,
    /// Parsed version suffix.
    pub version: u64,
}

/// Reconciliation flags for one subscriber.
///
/// `TO_BE_UPDATED` is the union of create and remove: an update is always
/// executed as a delete followed by a create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChangeKind(u8);

impl ChangeKind {
    /// Nothing to do.
    pub const NONE: Self = Self(0);
    /// Running instances must be deleted.
    pub const TO_BE_REMOVED: Self = Self(0b01);
    /// A new instance must be created.
    pub const TO_BE_CREATED: Self = Self(0b10);
    /// Delete then create.
    pub const TO_BE_UPDATED: Self = Self(0b11);

    /// Whether all flags of `other` are set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no flag is set.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ChangeKind {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChangeKind {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "none"),
            Self::TO_BE_REMOVED => write!(f, "remove"),
            Self::TO_BE_CREATED => write!(f, "create"),
            _ => write!(f, "update"),
        }
    }
}

/// Init payload a reader process is created with.
///
/// A reader's entire state is rehydrated from this payload, which is why
/// configuration changes are applied by replacing the reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderInit {
    /// Versioned reader name.
    pub reader_name: String,
    /// Subscriber the reader serves.
    pub subscriber: SubscriberConfig,
    /// Endpoints referenced by the subscriber, keyed by name.
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

impl ReaderInit {
    /// Serializes the payload for the fleet manager.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` on encoding failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Decodes a payload produced by [`ReaderInit::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` when the bytes are not a valid
    /// payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CoreError::InvalidInput(format!("malformed reader init payload: {e}")))
    }
}

/// Correlation handle linking a pool-slot assignment to an in-flight message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationHandle(pub Uuid);

impl CorrelationHandle {
    /// Creates a new random handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for CorrelationHandle {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Opaque receipt from the queue, presented to mark a message complete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AckToken(pub String);

impl AckToken {
    /// Wraps a queue-issued token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one handler slot in the pool, `1..=pool_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerId(pub u32);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updated_is_union_of_created_and_removed() {
        let kind = ChangeKind::TO_BE_CREATED | ChangeKind::TO_BE_REMOVED;
        assert_eq!(kind, ChangeKind::TO_BE_UPDATED);
        assert!(kind.contains(ChangeKind::TO_BE_CREATED));
        assert!(kind.contains(ChangeKind::TO_BE_REMOVED));
        assert!(!ChangeKind::TO_BE_CREATED.contains(ChangeKind::TO_BE_REMOVED));
        assert!(ChangeKind::NONE.is_none());
    }

    #[test]
    fn key_follows_dlq_mode() {
        let mut config = SubscriberConfig::new("order.created", "billing");
        assert_eq!(config.key(), SubscriberKey::new("order.created", "billing"));

        config.dlq_mode = true;
        assert_eq!(config.key(), SubscriberKey::new("order.created", "billing").dead_letter());
    }

    #[test]
    fn any_field_change_is_detected() {
        let base = SubscriberConfig::new("order.created", "billing");

        let mut interval_only = base.clone();
        interval_only.heartbeat_interval_seconds += 1;
        assert!(base.differs_from(&interval_only));

        let mut endpoints = base.clone();
        endpoints.endpoints.push("primary".to_string());
        assert!(base.differs_from(&endpoints));

        assert!(!base.differs_from(&base.clone()));
    }

    #[test]
    fn resolved_form_tracks_referenced_endpoints_only() {
        let endpoint = |name: &str, url: &str| EndpointConfig {
            name: name.to_string(),
            url: url.to_string(),
            timeout_seconds: None,
        };
        let mut config = SubscriberConfig::new("order.created", "billing");
        config.endpoints = vec!["primary".to_string(), "missing".to_string()];

        let before = BTreeMap::from([
            ("primary".to_string(), endpoint("primary", "https://old.example.com")),
            ("audit".to_string(), endpoint("audit", "https://audit.example.com")),
        ]);
        let resolved = ResolvedSubscriber::resolve(config.clone(), &before);
        assert_eq!(resolved.endpoints.keys().collect::<Vec<_>>(), vec!["primary"]);

        let mut audit_moved = before.clone();
        audit_moved.insert("audit".to_string(), endpoint("audit", "https://new.example.com"));
        assert!(!resolved.differs_from(&ResolvedSubscriber::resolve(config.clone(), &audit_moved)));

        let mut primary_moved = before;
        primary_moved.insert("primary".to_string(), endpoint("primary", "https://new.example.com"));
        let moved = ResolvedSubscriber::resolve(config, &primary_moved);
        assert!(resolved.differs_from(&moved));
        assert_eq!(moved.to_init("r--v1").endpoints["primary"].url, "https://new.example.com");
    }

    #[test]
    fn subscriber_defaults_apply_when_fields_are_missing() {
        let json = r#"{"event_type":"a","subscriber_name":"b","endpoints":["x"]}"#;
        let config: SubscriberConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.max_delivery_count, 10);
        assert_eq!(config.heartbeat_interval_seconds, 60);
        assert_eq!(config.auth, AuthConfig::None);
        assert!(!config.dlq_mode);
    }

    #[test]
    fn reader_init_survives_the_wire() {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(
            "primary".to_string(),
            EndpointConfig {
                name: "primary".to_string(),
                url: "https://example.com/hook".to_string(),
                timeout_seconds: Some(5),
            },
        );
        let init = ReaderInit {
            reader_name: "order-created--billing--v1".to_string(),
            subscriber: SubscriberConfig::new("order.created", "billing"),
            endpoints,
        };

        let decoded = ReaderInit::from_bytes(&init.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, init);

        assert!(matches!(ReaderInit::from_bytes(b"not json"), Err(CoreError::InvalidInput(_))));
    }
}
