// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::reporter::payload::IntakeRequest;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use tracing::debug;

/// Why a collector request failed.
#[derive(Debug, thiserror::Error)]
pub enum ShippingError {
    #[error("Failed to prepare request: {0}")]
    Request(String),

    #[error("Error shipping data: {0:?} {1}")]
    Destination(Option<StatusCode>, String),
}

impl ShippingError {
    /// Permanent failures are dropped without retrying: requests that could not
    /// be built and 4xx responses other than timeouts and rate limiting.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            ShippingError::Request(_) => true,
            ShippingError::Destination(Some(code), _) => {
                code.is_client_error()
                    && *code != StatusCode::REQUEST_TIMEOUT
                    && *code != StatusCode::TOO_MANY_REQUESTS
            }
            ShippingError::Destination(None, _) => false,
        }
    }
}

/// Delivers serialized requests to the collector.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &IntakeRequest) -> Result<(), ShippingError>;
}

/// HTTP transport posting JSON to the collector.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
}

impl HttpTransport {
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AgentError::ReporterStart(format!("Failed to build HTTP client: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("apm-agent-core/", env!("CARGO_PKG_VERSION"))),
        );
        if let Some(token) = &config.secret_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                AgentError::InvalidConfig(format!("Secret token is not a valid header: {e}"))
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            headers,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &IntakeRequest) -> Result<(), ShippingError> {
        let url = format!("{}{}", self.base_url, request.path);
        debug!("APM | Sending {} items to {}", request.items, url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers.clone())
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    ShippingError::Request(e.to_string())
                } else {
                    ShippingError::Destination(e.status(), e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ShippingError::Destination(Some(status), body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::payload::{IntakeKind, TRANSACTIONS_PATH};

    fn request() -> IntakeRequest {
        IntakeRequest {
            kind: IntakeKind::Transactions,
            path: TRANSACTIONS_PATH,
            body: br#"{"transactions":[]}"#.to_vec(),
            items: 0,
        }
    }

    fn config_for(url: String) -> AgentConfig {
        AgentConfig {
            server_url: url,
            secret_token: Some("s3cr3t".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_permanent_errors() {
        let status = |code| ShippingError::Destination(Some(code), String::new());
        assert!(ShippingError::Request("bad".into()).is_permanent());
        assert!(status(StatusCode::BAD_REQUEST).is_permanent());
        assert!(!status(StatusCode::TOO_MANY_REQUESTS).is_permanent());
        assert!(!status(StatusCode::SERVICE_UNAVAILABLE).is_permanent());
        assert!(!ShippingError::Destination(None, "connection refused".into()).is_permanent());
    }

    #[tokio::test]
    async fn test_http_transport_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", TRANSACTIONS_PATH)
            .match_header("Content-Type", "application/json")
            .match_header("Authorization", "Bearer s3cr3t")
            .match_body(r#"{"transactions":[]}"#)
            .with_status(202)
            .create_async()
            .await;

        let transport = HttpTransport::new(&config_for(server.url())).expect("transport");
        transport.send(&request()).await.expect("send failed");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_transport_reports_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", TRANSACTIONS_PATH)
            .with_status(503)
            .with_body("collector overloaded")
            .create_async()
            .await;

        let transport = HttpTransport::new(&config_for(server.url())).expect("transport");
        match transport.send(&request()).await {
            Err(ShippingError::Destination(Some(status), body)) => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body, "collector overloaded");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unbuildable_request_is_permanent() {
        let transport =
            HttpTransport::new(&config_for("not a url".to_string())).expect("transport");
        let error = transport
            .send(&request())
            .await
            .expect_err("send to a malformed URL succeeded");
        assert!(matches!(error, ShippingError::Request(_)));
        assert!(error.is_permanent());
    }

    #[test]
    fn test_invalid_secret_token() {
        let config = AgentConfig {
            secret_token: Some("line\nbreak".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            HttpTransport::new(&config),
            Err(AgentError::InvalidConfig(_))
        ));
    }
}
