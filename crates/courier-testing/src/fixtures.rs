//! Builders for subscriber and endpoint configuration.

use courier_core::{AuthConfig, EndpointConfig, SubscriberConfig};

/// Builder for test subscribers.
///
/// Defaults to a single endpoint named `primary`.
#[derive(Debug, Clone)]
pub struct SubscriberBuilder {
    config: SubscriberConfig,
}

impl SubscriberBuilder {
    /// Starts a subscriber for `event_type` / `subscriber_name`.
    pub fn new(event_type: impl Into<String>, subscriber_name: impl Into<String>) -> Self {
        let mut config = SubscriberConfig::new(event_type, subscriber_name);
        config.endpoints = vec!["primary".to_string()];
        Self { config }
    }

    /// Replaces the endpoint list.
    #[must_use]
    pub fn endpoints<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.endpoints = names.into_iter().map(Into::into).collect();
        self
    }

    /// Consumes from the dead-letter queue.
    #[must_use]
    pub fn dead_letter(mut self) -> Self {
        self.config.dlq_mode = true;
        self
    }

    /// Sets the maximum delivery count.
    #[must_use]
    pub fn max_delivery_count(mut self, count: u32) -> Self {
        self.config.max_delivery_count = count;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval_seconds(mut self, seconds: u64) -> Self {
        self.config.heartbeat_interval_seconds = seconds;
        self
    }

    /// Sets the receive batch override.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = Some(size);
        self
    }

    /// Sets bearer authentication.
    #[must_use]
    pub fn bearer(mut self, secret: impl Into<String>) -> Self {
        self.config.auth = AuthConfig::Bearer { token_secret: secret.into() };
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> SubscriberConfig {
        self.config
    }
}

/// Builder for test endpoints.
#[derive(Debug, Clone)]
pub struct EndpointBuilder {
    name: String,
    url: Option<String>,
    timeout_seconds: Option<u64>,
}

impl EndpointBuilder {
    /// Starts an endpoint called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), url: None, timeout_seconds: None }
    }

    /// Sets the target URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the per-endpoint timeout.
    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Builds the configuration, defaulting the URL from the name.
    pub fn build(self) -> EndpointConfig {
        let url = self.url.unwrap_or_else(|| format!("https://hooks.example.com/{}", self.name));
        EndpointConfig { name: self.name, url, timeout_seconds: self.timeout_seconds }
    }
}

/// Endpoint `name` at `url`.
pub fn endpoint(name: &str, url: &str) -> EndpointConfig {
    EndpointBuilder::new(name).url(url).build()
}

/// JSON document understood by the file source, for writing fixture files.
pub fn snapshot(
    endpoints: &[EndpointConfig],
    subscribers: &[SubscriberConfig],
) -> serde_json::Value {
    serde_json::json!({ "endpoints": endpoints, "subscribers": subscribers })
}
