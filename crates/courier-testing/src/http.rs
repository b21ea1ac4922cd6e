//! HTTP mocking for webhook delivery tests.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use http::StatusCode;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer as WiremockServer, ResponseTemplate,
};

/// HTTP mock server standing in for webhook receivers.
pub struct MockServer {
    server: WiremockServer,
}

impl MockServer {
    /// Starts a server on a random port.
    pub async fn start() -> Self {
        Self { server: WiremockServer::start().await }
    }

    /// Base URL of the server.
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Full URL for `path`.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{path}", self.server.uri())
    }

    /// Mounts a response for POSTs to the endpoint's path.
    pub async fn mock_endpoint(&self, endpoint: MockEndpoint) {
        let response = match endpoint.response {
            MockResponse::Success { status, body } => {
                ResponseTemplate::new(status.as_u16()).set_body_bytes(body.to_vec())
            },
            MockResponse::Failure { status } => ResponseTemplate::new(status.as_u16()),
            MockResponse::Delayed { status, delay } => {
                ResponseTemplate::new(status.as_u16()).set_delay(delay)
            },
        };

        let mut mock = Mock::given(method("POST")).and(path(endpoint.path.as_str()));
        for (key, value) in &endpoint.expected_headers {
            mock = mock.and(header(key.as_str(), value.as_str()));
        }
        mock.respond_with(response).mount(&self.server).await;
    }

    /// Bodies of every request received, in arrival order.
    pub async fn received_bodies(&self) -> Vec<Bytes> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|request| Bytes::from(request.body))
            .collect()
    }

    /// Number of requests received.
    pub async fn request_count(&self) -> usize {
        self.server.received_requests().await.map_or(0, |requests| requests.len())
    }
}

/// Mock configuration for one path.
#[derive(Debug, Clone)]
pub struct MockEndpoint {
    /// Request path to match.
    pub path: String,
    /// Headers the request must carry.
    pub expected_headers: HashMap<String, String>,
    /// Response to send.
    pub response: MockResponse,
}

impl MockEndpoint {
    /// Endpoint answering 200.
    pub fn success(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            expected_headers: HashMap::new(),
            response: MockResponse::Success { status: StatusCode::OK, body: Bytes::new() },
        }
    }

    /// Endpoint answering `status`.
    pub fn failure(path: impl Into<String>, status: StatusCode) -> Self {
        Self {
            path: path.into(),
            expected_headers: HashMap::new(),
            response: MockResponse::Failure { status },
        }
    }

    /// Endpoint answering 200 after `delay`.
    pub fn slow(path: impl Into<String>, delay: Duration) -> Self {
        Self {
            path: path.into(),
            expected_headers: HashMap::new(),
            response: MockResponse::Delayed { status: StatusCode::OK, delay },
        }
    }

    /// Requires a header on matching requests.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.expected_headers.insert(key.into(), value.into());
        self
    }
}

/// Kinds of mocked responses.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Successful response with a body.
    Success {
        /// Status code.
        status: StatusCode,
        /// Response body.
        body: Bytes,
    },
    /// Error response.
    Failure {
        /// Status code.
        status: StatusCode,
    },
    /// Response sent after a delay.
    Delayed {
        /// Status code.
        status: StatusCode,
        /// Delay before responding.
        delay: Duration,
    },
}
