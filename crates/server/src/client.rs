//! HTTP client for a render server.
//!
//! [`RenderService`] is the two-call RPC surface workers depend on.
//! [`RenderClient`] implements it over the server's JSON endpoints using
//! [`reqwest`].

use std::time::Duration;

use async_trait::async_trait;
use renderfarm_core::protocol::{RenderBatchRequest, RenderBatchResponse, UpdateRequest};

/// The render server RPC surface.
#[async_trait]
pub trait RenderService: Send + Sync {
    /// Replace the server's scene configuration. Applies to later batches.
    async fn update(&self, request: &UpdateRequest) -> Result<(), RenderClientError>;

    /// Render one batch and return the raw frames.
    async fn render_batch(
        &self,
        request: &RenderBatchRequest,
    ) -> Result<RenderBatchResponse, RenderClientError>;
}

/// Errors from the render service client.
#[derive(Debug, thiserror::Error)]
pub enum RenderClientError {
    /// The HTTP request itself failed (network, timeout, decode, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-2xx status code.
    #[error("Render server error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The server could not be reached at all.
    #[error("Connection error: {0}")]
    Connection(String),
}

/// HTTP client bound to one render server.
#[derive(Debug)]
pub struct RenderClient {
    client: reqwest::Client,
    base_url: String,
}

impl RenderClient {
    /// Create a client for the server at `host:port`.
    pub fn new(host: &str, port: u16) -> Self {
        Self::with_base_url(format!("http://{host}:{port}"))
    }

    /// Create a client for an explicit base URL, e.g. `http://host:7000`.
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Readiness handshake: `GET /health` must answer 2xx within `timeout`.
    pub async fn health(&self, timeout: Duration) -> Result<(), RenderClientError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(timeout)
            .send()
            .await?;

        Self::ensure_success(response).await?;
        Ok(())
    }

    // ---- private helpers ----

    /// Return the response unchanged on a 2xx status, otherwise an
    /// [`RenderClientError::Api`] carrying the status and body text.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, RenderClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(RenderClientError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl RenderService for RenderClient {
    async fn update(&self, request: &UpdateRequest) -> Result<(), RenderClientError> {
        let response = self
            .client
            .post(format!("{}/update", self.base_url))
            .json(request)
            .send()
            .await?;

        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn render_batch(
        &self,
        request: &RenderBatchRequest,
    ) -> Result<RenderBatchResponse, RenderClientError> {
        let response = self
            .client
            .post(format!("{}/render_batch", self.base_url))
            .json(request)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.json::<RenderBatchResponse>().await?)
    }
}
