//! Device-flow sign-in and bearer-token lifecycle.
//!
//! `AuthSessionManager` owns all mutable authentication state behind one
//! mutex that is never held across an await. Bearer refreshes are
//! single-flight: the first caller that finds the cached token stale starts
//! an exchange and stores it as a shared future; every concurrent caller
//! awaits that same future and receives the same token or the same error.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;

use super::{
    AuthError, BearerToken, CredentialStore, DeviceAuthorization, GitHubProvider,
    IdentityProvider, IdentityToken, PollOutcome,
};

/// Added to the poll interval on every `slow_down` response.
const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

/// Sign-in state as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    DeviceCodeRequested,
    AwaitingUserApproval,
    Authenticated,
    /// Identity present but the cached bearer is stale or failed to refresh.
    Expired,
    /// The provider refused the stored identity; credentials were cleared.
    Revoked,
}

/// Non-terminal and successful outcomes of one device-flow poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    /// The provider asked us to back off; polling continues at `interval`.
    SlowDown { interval: Duration },
    Authenticated,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<BearerToken, AuthError>>>;

struct DeviceFlow {
    id: u64,
    device_code: String,
    interval: Duration,
    next_poll_at: Instant,
    deadline: Instant,
}

struct SessionState {
    auth: AuthState,
    identity: Option<IdentityToken>,
    bearer: Option<BearerToken>,
    flow: Option<DeviceFlow>,
    /// Id of the most recently started device flow.
    flow_seq: u64,
    refresh: Option<(u64, RefreshFuture)>,
    /// Bumped whenever the identity changes; stale refreshes are discarded.
    generation: u64,
}

impl SessionState {
    /// State to fall back to when no device flow is running.
    fn settled(&self, margin: chrono::Duration) -> AuthState {
        match (&self.identity, &self.bearer) {
            (None, _) => AuthState::Unauthenticated,
            (Some(_), Some(bearer)) if bearer.needs_refresh(margin) => AuthState::Expired,
            (Some(_), _) => AuthState::Authenticated,
        }
    }

    fn end_flow(&mut self, margin: chrono::Duration) {
        self.flow = None;
        self.auth = self.settled(margin);
    }
}

struct Inner {
    provider: Arc<dyn IdentityProvider>,
    store: CredentialStore,
    refresh_margin: chrono::Duration,
    state: Mutex<SessionState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete_refresh(
        &self,
        generation: u64,
        result: Result<BearerToken, AuthError>,
    ) -> Result<BearerToken, AuthError> {
        let mut state = self.lock();
        if state.generation != generation {
            debug!("Discarding bearer refresh for a replaced identity");
            return Err(AuthError::Unauthenticated);
        }
        state.refresh = None;

        match result {
            Ok(mut bearer) => {
                // A skewed provider clock must not hand out an already stale token
                if bearer.needs_refresh(self.refresh_margin) {
                    warn!(
                        expires_at = %bearer.expires_at(),
                        "Exchanged bearer token expires within the refresh margin, using default lifetime"
                    );
                    bearer = BearerToken::with_default_lifetime(bearer.as_str());
                }
                state.bearer = Some(bearer.clone());
                state.auth = AuthState::Authenticated;
                drop(state);
                if let Err(e) = self.store.save_bearer(&bearer) {
                    warn!(error = %e, "Failed to persist bearer token");
                }
                debug!(expires_at = %bearer.expires_at(), "Bearer token refreshed");
                Ok(bearer)
            }
            Err(AuthError::Rejected) => {
                state.identity = None;
                state.bearer = None;
                state.generation += 1;
                state.auth = AuthState::Revoked;
                drop(state);
                warn!("Identity token was rejected, clearing stored credentials");
                if let Err(e) = self.store.clear() {
                    warn!(error = %e, "Failed to clear stored credentials");
                }
                Err(AuthError::Rejected)
            }
            Err(e) => {
                state.auth = AuthState::Expired;
                warn!(error = %e, "Bearer token refresh failed");
                Err(e)
            }
        }
    }
}

/// Drives device-flow sign-in and hands out valid bearer tokens.
///
/// Clone is cheap; clones share the same session.
#[derive(Clone)]
pub struct AuthSessionManager {
    inner: Arc<Inner>,
}

impl AuthSessionManager {
    /// Create a manager, restoring any stored credentials. Unreadable or
    /// corrupt credentials are logged and treated as absent.
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: CredentialStore,
        refresh_margin: chrono::Duration,
    ) -> Self {
        let (identity, bearer) = match store.load() {
            Ok(Some(stored)) => (Some(stored.identity), stored.bearer),
            Ok(None) => (None, None),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable credentials");
                (None, None)
            }
        };

        let mut state = SessionState {
            auth: AuthState::Unauthenticated,
            identity,
            bearer,
            flow: None,
            flow_seq: 0,
            refresh: None,
            generation: 0,
        };
        state.auth = state.settled(refresh_margin);
        debug!(state = ?state.auth, "Restored authentication state");

        Self {
            inner: Arc::new(Inner {
                provider,
                store,
                refresh_margin,
                state: Mutex::new(state),
            }),
        }
    }

    /// Manager talking to GitHub, with credentials in the data directory.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let provider = GitHubProvider::new(config.endpoints.clone())?;
        let store = CredentialStore::new(config.credentials_path()?);
        Ok(Self::new(
            Arc::new(provider),
            store,
            config.refresh_margin(),
        ))
    }

    pub fn state(&self) -> AuthState {
        self.inner.lock().auth
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.lock().identity.is_some()
    }

    /// The cached bearer token, without refreshing.
    pub fn cached_bearer(&self) -> Option<BearerToken> {
        self.inner.lock().bearer.clone()
    }

    // ========================================================================
    // Device flow
    // ========================================================================

    /// Request a device code. The returned code and URL are shown to the user;
    /// then `poll_once` or `run_device_flow` waits for approval. Starting a new
    /// flow abandons any flow already in progress.
    pub async fn start_device_flow(&self) -> Result<DeviceAuthorization, AuthError> {
        let id = {
            let mut state = self.inner.lock();
            state.flow_seq += 1;
            state.flow = None;
            state.auth = AuthState::DeviceCodeRequested;
            state.flow_seq
        };

        let result = self.inner.provider.request_device_code().await;

        let mut state = self.inner.lock();
        if state.flow_seq != id {
            return Err(AuthError::Cancelled);
        }
        match result {
            Ok(session) => {
                let interval = Duration::from_secs(session.interval.max(1));
                let now = Instant::now();
                state.flow = Some(DeviceFlow {
                    id,
                    device_code: session.device_code.clone(),
                    interval,
                    next_poll_at: now + interval,
                    deadline: now + Duration::from_secs(session.expires_in),
                });
                state.auth = AuthState::AwaitingUserApproval;
                info!(
                    user_code = %session.user_code,
                    verification_uri = %session.verification_uri,
                    "Waiting for user approval"
                );
                Ok(DeviceAuthorization::from(&session))
            }
            Err(e) => {
                state.auth = state.settled(self.inner.refresh_margin);
                warn!(error = %e, "Device code request failed");
                Err(e)
            }
        }
    }

    /// Wait until the next poll is due, then poll the provider once.
    ///
    /// Never polls faster than the provider's interval. Dropping the returned
    /// future before it completes leaves the flow unchanged.
    pub async fn poll_once(&self) -> Result<PollStatus, AuthError> {
        let margin = self.inner.refresh_margin;
        let (id, device_code, next_poll_at, deadline) = {
            let state = self.inner.lock();
            let flow = state.flow.as_ref().ok_or(AuthError::NoDeviceFlow)?;
            (
                flow.id,
                flow.device_code.clone(),
                flow.next_poll_at,
                flow.deadline,
            )
        };

        tokio::time::sleep_until(next_poll_at).await;

        {
            let mut state = self.inner.lock();
            if !state.flow.as_ref().is_some_and(|f| f.id == id) {
                debug!("Device flow cancelled while waiting to poll");
                return Err(AuthError::Cancelled);
            }
            if Instant::now() >= deadline {
                state.end_flow(margin);
                info!("Device code expired");
                return Err(AuthError::Expired);
            }
        }

        let outcome = self.inner.provider.poll_device_token(&device_code).await;

        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let Some(flow) = state.flow.as_mut().filter(|f| f.id == id) else {
            return Err(AuthError::Cancelled);
        };
        let now = Instant::now();

        match outcome {
            Ok(PollOutcome::Pending) => {
                flow.next_poll_at = now + flow.interval;
                debug!("Authorization pending");
                Ok(PollStatus::Pending)
            }
            Ok(PollOutcome::SlowDown(server_interval)) => {
                let bumped = flow.interval + SLOW_DOWN_INCREMENT;
                flow.interval = server_interval
                    .map(Duration::from_secs)
                    .filter(|secs| *secs > bumped)
                    .unwrap_or(bumped);
                flow.next_poll_at = now + flow.interval;
                debug!(interval_secs = flow.interval.as_secs(), "Provider asked to slow down");
                Ok(PollStatus::SlowDown {
                    interval: flow.interval,
                })
            }
            Ok(PollOutcome::Denied) => {
                state.end_flow(margin);
                info!("Sign-in denied by user");
                Err(AuthError::Denied)
            }
            Ok(PollOutcome::Expired) => {
                state.end_flow(margin);
                info!("Device code expired");
                Err(AuthError::Expired)
            }
            Ok(PollOutcome::Granted(identity)) => {
                state.flow = None;
                state.identity = Some(identity.clone());
                state.bearer = None;
                state.refresh = None;
                state.generation += 1;
                state.auth = AuthState::Authenticated;
                drop(guard);

                if let Err(e) = self.inner.store.save(&identity) {
                    warn!(error = %e, "Failed to persist identity token");
                }
                info!("Signed in");
                Ok(PollStatus::Authenticated)
            }
            Err(e @ AuthError::Provider(_)) => {
                state.end_flow(margin);
                warn!(error = %e, "Unexpected device token response, sign-in abandoned");
                Err(e)
            }
            Err(e) => {
                flow.next_poll_at = now + flow.interval;
                Err(e)
            }
        }
    }

    /// Poll until the user approves, denies, the code expires, or `cancel`
    /// fires. Transient network failures are logged and polling continues.
    pub async fn run_device_flow(&self, cancel: CancellationToken) -> Result<(), AuthError> {
        loop {
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel_device_flow();
                    return Err(AuthError::Cancelled);
                }
                status = self.poll_once() => status,
            };

            match status {
                Ok(PollStatus::Authenticated) => return Ok(()),
                Ok(PollStatus::Pending) | Ok(PollStatus::SlowDown { .. }) => {}
                Err(AuthError::Network(e)) => {
                    warn!(error = %e, "Device token poll failed, will retry");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Abandon the device flow in progress, if any. Nothing is persisted.
    pub fn cancel_device_flow(&self) {
        let mut state = self.inner.lock();
        state.flow_seq += 1;
        if state.flow.is_some() || state.auth == AuthState::DeviceCodeRequested {
            state.end_flow(self.inner.refresh_margin);
            debug!("Device flow cancelled");
        }
    }

    // ========================================================================
    // Bearer tokens
    // ========================================================================

    /// A bearer token valid beyond the refresh margin.
    ///
    /// Returns the cached token without I/O when it is fresh. Otherwise joins
    /// or starts the single in-flight exchange.
    pub async fn get_bearer_token(&self) -> Result<BearerToken, AuthError> {
        let refresh = {
            let mut state = self.inner.lock();
            if let Some(bearer) = &state.bearer {
                if !bearer.needs_refresh(self.inner.refresh_margin) {
                    return Ok(bearer.clone());
                }
            }

            let generation = state.generation;
            let in_flight = state
                .refresh
                .as_ref()
                .filter(|(refresh_generation, _)| *refresh_generation == generation)
                .map(|(_, refresh)| refresh.clone());
            match in_flight {
                Some(refresh) => refresh,
                None => {
                    let identity = state
                        .identity
                        .clone()
                        .ok_or(AuthError::Unauthenticated)?;
                    let refresh = refresh_bearer(
                        Arc::downgrade(&self.inner),
                        Arc::clone(&self.inner.provider),
                        identity,
                        generation,
                    )
                    .boxed()
                    .shared();
                    state.refresh = Some((generation, refresh.clone()));
                    refresh
                }
            }
        };

        refresh.await
    }

    /// Drop `rejected` from the cache if it is still the cached token, so the
    /// next `get_bearer_token` performs an exchange.
    pub fn invalidate_bearer(&self, rejected: &BearerToken) {
        let mut state = self.inner.lock();
        if state.bearer.as_ref() == Some(rejected) {
            state.bearer = None;
            debug!("Cached bearer token invalidated");
        }
    }

    /// Discard the cached bearer and exchange for a new one.
    pub async fn force_refresh(&self) -> Result<BearerToken, AuthError> {
        self.inner.lock().bearer = None;
        self.get_bearer_token().await
    }

    /// Forget all credentials, in memory and on disk.
    pub fn sign_out(&self) -> Result<(), super::PersistenceError> {
        {
            let mut state = self.inner.lock();
            state.identity = None;
            state.bearer = None;
            state.flow = None;
            state.flow_seq += 1;
            state.refresh = None;
            state.generation += 1;
            state.auth = AuthState::Unauthenticated;
        }
        info!("Signed out");
        self.inner.store.clear()
    }
}

async fn refresh_bearer(
    inner: Weak<Inner>,
    provider: Arc<dyn IdentityProvider>,
    identity: IdentityToken,
    generation: u64,
) -> Result<BearerToken, AuthError> {
    debug!("Exchanging identity token for bearer token");
    let result = provider.exchange(&identity).await;
    match inner.upgrade() {
        Some(inner) => inner.complete_refresh(generation, result),
        None => result,
    }
}
