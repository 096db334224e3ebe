//! In-memory test doubles for the network seams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::time::Instant;

use crate::api::{ApiError, ByteStream, ChatTransport, PreparedRequest};
use crate::auth::{
    AuthError, AuthSessionManager, BearerToken, CredentialStore, DeviceSession, IdentityProvider,
    IdentityToken, PollOutcome,
};

pub(crate) fn temp_store() -> (TempDir, CredentialStore) {
    let dir = TempDir::new().unwrap();
    let store = CredentialStore::new(dir.path().join("credentials.json"));
    (dir, store)
}

/// A signed-in session manager backed by `provider`.
pub(crate) fn signed_in(provider: &Arc<MockIdentityProvider>) -> (TempDir, AuthSessionManager) {
    let (dir, store) = temp_store();
    store.save(&IdentityToken::new("gho_test_identity")).unwrap();
    let auth = AuthSessionManager::new(provider.clone(), store, chrono::Duration::seconds(60));
    (dir, auth)
}

/// Scripted identity provider.
///
/// Polls return scripted outcomes, then `Pending`. Exchanges return scripted
/// results, then a fresh token `tid=<n>` valid for 30 minutes.
pub(crate) struct MockIdentityProvider {
    device_expires_in: u64,
    exchange_delay: Duration,
    polls: Mutex<VecDeque<Result<PollOutcome, AuthError>>>,
    poll_times: Mutex<Vec<Instant>>,
    exchanges: Mutex<VecDeque<Result<BearerToken, AuthError>>>,
    exchange_count: AtomicUsize,
}

impl MockIdentityProvider {
    pub(crate) fn new() -> Self {
        Self {
            device_expires_in: 900,
            exchange_delay: Duration::ZERO,
            polls: Mutex::new(VecDeque::new()),
            poll_times: Mutex::new(Vec::new()),
            exchanges: Mutex::new(VecDeque::new()),
            exchange_count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_device_expiry(mut self, secs: u64) -> Self {
        self.device_expires_in = secs;
        self
    }

    pub(crate) fn with_exchange_delay(mut self, delay: Duration) -> Self {
        self.exchange_delay = delay;
        self
    }

    pub(crate) fn script_polls(
        &self,
        outcomes: impl IntoIterator<Item = Result<PollOutcome, AuthError>>,
    ) {
        self.polls.lock().unwrap().extend(outcomes);
    }

    pub(crate) fn script_exchanges(
        &self,
        results: impl IntoIterator<Item = Result<BearerToken, AuthError>>,
    ) {
        self.exchanges.lock().unwrap().extend(results);
    }

    pub(crate) fn poll_count(&self) -> usize {
        self.poll_times.lock().unwrap().len()
    }

    pub(crate) fn poll_times(&self) -> Vec<Instant> {
        self.poll_times.lock().unwrap().clone()
    }

    pub(crate) fn exchange_count(&self) -> usize {
        self.exchange_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn request_device_code(&self) -> Result<DeviceSession, AuthError> {
        Ok(DeviceSession {
            device_code: "device-code-1".to_string(),
            user_code: "WDJB-MJHT".to_string(),
            verification_uri: "https://github.com/login/device".to_string(),
            interval: 5,
            expires_in: self.device_expires_in,
        })
    }

    async fn poll_device_token(&self, device_code: &str) -> Result<PollOutcome, AuthError> {
        assert_eq!(device_code, "device-code-1");
        self.poll_times.lock().unwrap().push(Instant::now());
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(PollOutcome::Pending))
    }

    async fn exchange(&self, _identity: &IdentityToken) -> Result<BearerToken, AuthError> {
        let n = self.exchange_count.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.exchange_delay.is_zero() {
            tokio::time::sleep(self.exchange_delay).await;
        }
        let scripted = self.exchanges.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(BearerToken::from_expires_in(format!("tid={}", n), 1800)))
    }
}

/// One scripted reply of `MockChatTransport`.
pub(crate) enum ScriptedResponse {
    Fail(ApiError),
    /// Body chunks; with `hang` the body stays open after the last chunk.
    Stream {
        chunks: Vec<Result<Bytes, ApiError>>,
        hang: bool,
    },
}

impl ScriptedResponse {
    pub(crate) fn stream(chunks: Vec<Result<Bytes, ApiError>>) -> Self {
        ScriptedResponse::Stream {
            chunks,
            hang: false,
        }
    }

    pub(crate) fn hanging(chunks: Vec<Result<Bytes, ApiError>>) -> Self {
        ScriptedResponse::Stream { chunks, hang: true }
    }
}

/// Sets a counter when the body stream it lives in is dropped.
struct CloseGuard(Arc<AtomicUsize>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted chat backend. Records every request and counts body chunks
/// pulled by the client.
pub(crate) struct MockChatTransport {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<(PreparedRequest, String)>>,
    models: Mutex<Option<Value>>,
    pulled: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl MockChatTransport {
    pub(crate) fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            models: Mutex::new(None),
            pulled: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn script(&self, response: ScriptedResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub(crate) fn set_models(&self, body: Value) {
        *self.models.lock().unwrap() = Some(body);
    }

    pub(crate) fn open_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn bearers(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, bearer)| bearer.clone())
            .collect()
    }

    pub(crate) fn last_request(&self) -> PreparedRequest {
        self.requests.lock().unwrap().last().unwrap().0.clone()
    }

    pub(crate) fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }

    /// Body streams dropped so far.
    pub(crate) fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for MockChatTransport {
    async fn open_stream(
        &self,
        request: &PreparedRequest,
        bearer: &BearerToken,
    ) -> Result<ByteStream, ApiError> {
        self.requests
            .lock()
            .unwrap()
            .push((request.clone(), bearer.as_str().to_string()));
        let scripted = self.responses.lock().unwrap().pop_front();
        let (chunks, hang) = match scripted {
            Some(ScriptedResponse::Stream { chunks, hang }) => (chunks, hang),
            Some(ScriptedResponse::Fail(e)) => return Err(e),
            None => return Err(ApiError::Connection("no scripted response".to_string())),
        };

        let pulled = Arc::clone(&self.pulled);
        let guard = CloseGuard(Arc::clone(&self.closed));
        let body = stream::iter(chunks).map(move |chunk| {
            let _ = &guard;
            pulled.fetch_add(1, Ordering::SeqCst);
            chunk
        });
        if hang {
            Ok(body.chain(stream::pending()).boxed())
        } else {
            Ok(body.boxed())
        }
    }

    async fn get_json(&self, _url: &str, _bearer: &BearerToken) -> Result<Value, ApiError> {
        self.models
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ApiError::NotFound("models".to_string()))
    }
}

/// Chat-completions SSE body for `deltas`, ending with `[DONE]`.
pub(crate) fn openai_events(deltas: &[&str]) -> String {
    let mut body = String::new();
    for delta in deltas {
        let event = json!({"choices": [{"index": 0, "delta": {"content": delta}}]});
        body.push_str(&format!("data: {}\n\n", event));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// Messages-endpoint SSE body for `deltas`, ending with `message_stop`.
pub(crate) fn claude_events(deltas: &[&str]) -> String {
    let mut body = String::from("event: message_start\ndata: {\"type\":\"message_start\"}\n\n");
    for delta in deltas {
        let event = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": delta},
        });
        body.push_str(&format!("event: content_block_delta\ndata: {}\n\n", event));
    }
    body.push_str("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    body
}

/// `body` split into chunks of `size` bytes, ignoring character boundaries.
pub(crate) fn chunked(body: &str, size: usize) -> Vec<Result<Bytes, ApiError>> {
    body.as_bytes()
        .chunks(size)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect()
}
