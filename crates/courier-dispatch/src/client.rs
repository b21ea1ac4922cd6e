//! HTTP webhook delivery.
//!
//! Posts a message body to every endpoint routed for the reader it came
//! from. A message counts as delivered only when every endpoint answered
//! 2xx; otherwise the first failure is reported, categorized for logs and
//! retry decisions.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::EndpointConfig;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{delivery::Delivery, error::DeliveryError};

/// Largest response body kept in a delivery error.
const MAX_ERROR_BODY: usize = 1024;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Default timeout for HTTP requests.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Courier-Webhook-Delivery/1.0".to_string(),
            max_redirects: 3,
        }
    }
}

/// Which endpoints each reader delivers to.
///
/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct EndpointRoutes {
    routes: Arc<RwLock<HashMap<String, Vec<EndpointConfig>>>>,
}

impl EndpointRoutes {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes messages of `reader` to `endpoints`, replacing earlier routes.
    pub async fn register(&self, reader: impl Into<String>, endpoints: Vec<EndpointConfig>) {
        self.routes.write().await.insert(reader.into(), endpoints);
    }

    /// Removes the routes of `reader`.
    pub async fn unregister(&self, reader: &str) {
        self.routes.write().await.remove(reader);
    }

    /// Endpoints of `reader`; empty when none are routed.
    pub async fn endpoints_for(&self, reader: &str) -> Vec<EndpointConfig> {
        self.routes.read().await.get(reader).cloned().unwrap_or_default()
    }
}

/// Delivery over plain HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpDelivery {
    client: reqwest::Client,
    config: ClientConfig,
    routes: EndpointRoutes,
}

impl HttpDelivery {
    /// Creates a delivery client using `routes` to find endpoints.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig, routes: EndpointRoutes) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config, routes })
    }

    /// Route table used by this client.
    pub fn routes(&self) -> &EndpointRoutes {
        &self.routes
    }

    async fn post(
        &self,
        endpoint: &EndpointConfig,
        payload: &Bytes,
        source: &str,
    ) -> Result<(), DeliveryError> {
        let delivery_id = Uuid::new_v4();
        let timeout = endpoint.timeout_seconds.map_or(self.config.timeout, Duration::from_secs);
        let span = info_span!(
            "webhook_delivery",
            reader = %source,
            endpoint = %endpoint.name,
            delivery_id = %delivery_id,
            url = %endpoint.url
        );

        async move {
            let request = self
                .client
                .post(&endpoint.url)
                .timeout(timeout)
                .header("content-type", "application/json")
                .header("X-Courier-Reader", source)
                .header("X-Courier-Delivery-Id", delivery_id.to_string())
                .header("X-Courier-Timestamp", chrono::Utc::now().to_rfc3339())
                .body(payload.clone());

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "request failed");
                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let status = response.status();
            if status.is_success() {
                debug!(status = status.as_u16(), "webhook delivered");
                return Ok(());
            }

            let body = truncated_body(response).await;
            warn!(status = status.as_u16(), "webhook rejected");
            match status.as_u16() {
                code @ 400..=499 => Err(DeliveryError::client_error(code, body)),
                code @ 500..=599 => Err(DeliveryError::server_error(code, body)),
                code => Err(DeliveryError::network(format!("unexpected status {code}"))),
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl Delivery for HttpDelivery {
    async fn attempt(&self, payload: &Bytes, source: &str) -> Result<(), DeliveryError> {
        let endpoints = self.routes.endpoints_for(source).await;
        if endpoints.is_empty() {
            return Err(DeliveryError::NoRoute { reader: source.to_string() });
        }

        let results =
            join_all(endpoints.iter().map(|endpoint| self.post(endpoint, payload, source))).await;
        results.into_iter().collect()
    }
}

async fn truncated_body(response: reqwest::Response) -> String {
    match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_ERROR_BODY => {
            let suffix = "... (truncated)";
            let kept = String::from_utf8_lossy(&bytes[..MAX_ERROR_BODY - suffix.len()]);
            format!("{kept}{suffix}")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("[failed to read response body: {e}]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_replace_and_unregister() {
        let routes = EndpointRoutes::new();
        let endpoint = EndpointConfig {
            name: "primary".to_string(),
            url: "http://localhost/hook".to_string(),
            timeout_seconds: None,
        };

        routes.register("orders--a--v1", vec![endpoint.clone()]).await;
        assert_eq!(routes.endpoints_for("orders--a--v1").await, vec![endpoint]);

        routes.unregister("orders--a--v1").await;
        assert!(routes.endpoints_for("orders--a--v1").await.is_empty());
    }

    #[tokio::test]
    async fn unrouted_reader_is_a_no_route_error() {
        let delivery = HttpDelivery::new(ClientConfig::default(), EndpointRoutes::new()).unwrap();

        let err = delivery.attempt(&Bytes::from_static(b"{}"), "orders--a--v1").await.unwrap_err();

        assert_eq!(err, DeliveryError::NoRoute { reader: "orders--a--v1".to_string() });
        assert!(err.is_retryable());
    }
}
