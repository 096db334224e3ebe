//! HTTP seam to the chat backend.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::auth::BearerToken;

use super::{ApiError, PreparedRequest};

/// Connect timeout for backend requests.
/// Streams have no overall timeout; the client applies an idle timeout
/// between chunks instead.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Raw response body chunks in arrival order.
pub type ByteStream = BoxStream<'static, Result<Bytes, ApiError>>;

/// Headers the Copilot backend expects from an editor integration.
pub fn copilot_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "copilot-integration-id",
        HeaderValue::from_static("vscode-chat"),
    );
    headers.insert("editor-version", HeaderValue::from_static("vscode/1.97.0"));
    headers.insert(
        "editor-plugin-version",
        HeaderValue::from_static("copilot-chat/0.22.2"),
    );
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_static("GitHubCopilotChat/0.22.2"),
    );
    headers.insert(
        "openai-intent",
        HeaderValue::from_static("conversation-panel"),
    );
    headers.insert(
        "x-github-api-version",
        HeaderValue::from_static("2023-07-07"),
    );
    headers
}

/// Chat backend operations used by the client.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a streaming request. Resolves once response headers arrive;
    /// non-success statuses become errors.
    async fn open_stream(
        &self,
        request: &PreparedRequest,
        bearer: &BearerToken,
    ) -> Result<ByteStream, ApiError>;

    /// Authenticated GET returning a JSON document.
    async fn get_json(&self, url: &str, bearer: &BearerToken) -> Result<Value, ApiError>;
}

/// reqwest-backed transport.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            request_timeout,
        })
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body))
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open_stream(
        &self,
        request: &PreparedRequest,
        bearer: &BearerToken,
    ) -> Result<ByteStream, ApiError> {
        debug!(url = %request.endpoint, model = %request.model, family = %request.family, "Opening chat stream");
        let send = self
            .client
            .post(&request.endpoint)
            .headers(copilot_headers())
            .bearer_auth(bearer.as_str())
            .header(header::ACCEPT, "text/event-stream")
            .json(&request.body)
            .send();

        let response = tokio::time::timeout(self.request_timeout, send)
            .await
            .map_err(|_| {
                ApiError::Connection(format!(
                    "no response within {}s",
                    self.request_timeout.as_secs()
                ))
            })??;
        let response = Self::check_response(response).await?;
        debug!(status = %response.status(), "Chat stream opened");

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ApiError::from))
            .boxed())
    }

    async fn get_json(&self, url: &str, bearer: &BearerToken) -> Result<Value, ApiError> {
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(url)
            .headers(copilot_headers())
            .bearer_auth(bearer.as_str())
            .header(header::ACCEPT, "application/json")
            .timeout(self.request_timeout)
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copilot_headers() {
        let headers = copilot_headers();
        assert_eq!(headers["copilot-integration-id"], "vscode-chat");
        assert_eq!(headers[header::USER_AGENT], "GitHubCopilotChat/0.22.2");
        assert_eq!(headers.len(), 6);
    }
}
