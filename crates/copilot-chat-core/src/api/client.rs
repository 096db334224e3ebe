//! Streaming chat client for the Copilot backend.
//!
//! `ChatClient::send` starts a background task that obtains a bearer token,
//! opens the stream, decodes events, and hands text increments to the
//! returned `ChatStream` through a bounded queue.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, AuthSessionManager, BearerToken};
use crate::config::{Config, Endpoints};
use crate::models::{AssembledRequest, ContextBudget};
use crate::utils::preview;

use super::payload::{self, PreparedRequest, DEFAULT_CLAUDE_MAX_TOKENS};
use super::sse::{SseDecoder, SseEvent};
use super::{ApiError, ChatStream, ChatTransport, HttpTransport, ModelCatalog};

// ============================================================================
// Constants
// ============================================================================

/// Retries for a transport failure before any text has arrived.
/// One retry rides out a dropped connection without hammering the backend.
const MAX_TRANSIENT_RETRIES: u32 = 1;

/// Backoff before retrying a failed connection in milliseconds.
const RETRY_BACKOFF_MS: u64 = 500;

/// Upper bound of random jitter added to the backoff in milliseconds.
const RETRY_JITTER_MS: u64 = 250;

type Sender = mpsc::Sender<Result<String, ApiError>>;

enum Flow {
    Continue,
    Stop,
}

struct ClientInner {
    auth: AuthSessionManager,
    transport: Arc<dyn ChatTransport>,
    endpoints: Endpoints,
    catalog: ModelCatalog,
    queue_depth: usize,
    idle_timeout: Duration,
}

/// Client for the chat backend.
/// Clone is cheap; clones share the session, transport, and model catalog.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

impl ChatClient {
    pub fn new(
        auth: AuthSessionManager,
        transport: Arc<dyn ChatTransport>,
        config: &Config,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                auth,
                transport,
                endpoints: config.endpoints.clone(),
                catalog: ModelCatalog::new(),
                queue_depth: config.queue_depth(),
                idle_timeout: config.request_timeout(),
            }),
        }
    }

    /// Client using the reqwest transport.
    pub fn from_config(config: &Config, auth: AuthSessionManager) -> Result<Self, ApiError> {
        let transport = HttpTransport::new(config.request_timeout())?;
        Ok(Self::new(auth, Arc::new(transport), config))
    }

    pub fn auth(&self) -> &AuthSessionManager {
        &self.inner.auth
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.inner.catalog
    }

    /// Token budget for `model`: the catalog's prompt limit if known,
    /// otherwise the default budget.
    pub fn budget_for(&self, model: &str) -> ContextBudget {
        self.inner
            .catalog
            .get(model)
            .map(|limits| ContextBudget::from_limits(&limits))
            .unwrap_or_default()
    }

    /// Fetch per-model limits into the catalog. On failure the catalog keeps
    /// what it had.
    pub async fn refresh_model_limits(&self) -> Result<usize, ApiError> {
        let bearer = self.inner.auth.get_bearer_token().await?;
        let url = &self.inner.endpoints.models;
        match self.inner.transport.get_json(url, &bearer).await {
            Ok(body) => Ok(self.inner.catalog.ingest(&body)),
            Err(e) => {
                warn!(url = %url, error = %e, "Failed to fetch model list");
                Err(e)
            }
        }
    }

    /// The endpoint and payload `send` would use, without sending anything.
    pub fn preview(&self, request: &AssembledRequest, model: &str) -> PreparedRequest {
        let max_output_tokens = self
            .inner
            .catalog
            .get(model)
            .map(|limits| limits.max_output_tokens)
            .unwrap_or(DEFAULT_CLAUDE_MAX_TOKENS);
        payload::prepare(request, model, &self.inner.endpoints, max_output_tokens)
    }

    /// Stream a reply to `request` from `model`.
    ///
    /// Must be called within a tokio runtime. Failures, including
    /// authentication failures, arrive as the stream's final item.
    pub fn send(&self, request: &AssembledRequest, model: &str) -> ChatStream {
        let prepared = self.preview(request, model);
        info!(
            model = %model,
            family = %prepared.family,
            messages = request.messages().len(),
            tokens = request.total_token_count(),
            "Sending chat request"
        );
        if let Some(last) = request.messages().last() {
            debug!(role = last.role().as_str(), text = %preview(last.content(), 80), "Latest message");
        }

        let (tx, rx) = mpsc::channel(self.inner.queue_depth);
        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => debug!("Chat stream cancelled"),
                _ = inner.stream_reply(&prepared, &tx) => {}
            }
        });

        ChatStream::new(rx, cancel)
    }
}

impl ClientInner {
    async fn stream_reply(&self, prepared: &PreparedRequest, tx: &Sender) {
        let mut partial = String::new();
        let mut transient_retries = 0;
        let mut auth_retried = false;

        loop {
            let bearer = match self.auth.get_bearer_token().await {
                Ok(bearer) => bearer,
                Err(e) => {
                    let _ = tx.send(Err(ApiError::Auth(e))).await;
                    return;
                }
            };

            let err = match self.attempt(prepared, &bearer, tx, &mut partial).await {
                Ok(()) => return,
                Err(e) => e,
            };

            // Text already reached the consumer; a retry would duplicate it
            if !partial.is_empty() {
                warn!(
                    error = %err,
                    received_chars = partial.chars().count(),
                    "Chat stream interrupted"
                );
                let _ = tx
                    .send(Err(ApiError::InterruptedStream {
                        partial,
                        reason: err.to_string(),
                    }))
                    .await;
                return;
            }

            if err.is_auth_rejection() {
                if auth_retried {
                    warn!(error = %err, "Backend rejected refreshed bearer token");
                    let _ = tx.send(Err(ApiError::Auth(AuthError::Rejected))).await;
                    return;
                }
                auth_retried = true;
                warn!(error = %err, "Backend rejected bearer token, refreshing");
                self.auth.invalidate_bearer(&bearer);
                continue;
            }

            if err.is_transient() && transient_retries < MAX_TRANSIENT_RETRIES {
                transient_retries += 1;
                let backoff = retry_backoff();
                warn!(
                    url = %prepared.endpoint,
                    retry = transient_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Chat request failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                continue;
            }

            warn!(url = %prepared.endpoint, error = %err, "Chat request failed");
            let _ = tx.send(Err(err)).await;
            return;
        }
    }

    /// One request. `Ok` means the reply finished or the consumer went away.
    async fn attempt(
        &self,
        prepared: &PreparedRequest,
        bearer: &BearerToken,
        tx: &Sender,
        partial: &mut String,
    ) -> Result<(), ApiError> {
        let mut body = self.transport.open_stream(prepared, bearer).await?;
        let mut decoder = SseDecoder::new();

        loop {
            let chunk = match tokio::time::timeout(self.idle_timeout, body.next()).await {
                Ok(Some(chunk)) => chunk?,
                Ok(None) => {
                    if let Some(event) = decoder.finish() {
                        deliver(event, tx, partial).await?;
                    }
                    debug!(chars = partial.chars().count(), "Chat stream closed by server");
                    return Ok(());
                }
                Err(_) => {
                    return Err(ApiError::Connection(format!(
                        "no data for {}s",
                        self.idle_timeout.as_secs()
                    )))
                }
            };

            for event in decoder.push(&chunk) {
                if let Flow::Stop = deliver(event, tx, partial).await? {
                    return Ok(());
                }
            }
        }
    }
}

async fn deliver(event: SseEvent, tx: &Sender, partial: &mut String) -> Result<Flow, ApiError> {
    match event {
        SseEvent::Delta(text) => {
            partial.push_str(&text);
            if tx.send(Ok(text)).await.is_err() {
                debug!("Chat stream consumer went away");
                return Ok(Flow::Stop);
            }
            Ok(Flow::Continue)
        }
        SseEvent::Done => {
            debug!(chars = partial.chars().count(), "Chat stream complete");
            Ok(Flow::Stop)
        }
        SseEvent::Error(message) => Err(ApiError::Stream(message)),
    }
}

fn retry_backoff() -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=RETRY_JITTER_MS);
    Duration::from_millis(RETRY_BACKOFF_MS + jitter)
}
