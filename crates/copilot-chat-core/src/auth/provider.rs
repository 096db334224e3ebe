//! HTTP seam to the identity provider: device authorization, device token
//! polling, and bearer exchange.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::api::copilot_headers;
use crate::config::Endpoints;
use crate::utils::{redact_secret, truncate_string};

use super::{AuthError, BearerToken, DeviceSession, IdentityToken};

/// Public OAuth client identifier of the Copilot editor integration.
pub const GITHUB_CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Timeout for identity-provider requests.
/// These are small JSON exchanges; 15s fails fast on a dead connection.
const PROVIDER_TIMEOUT_SECS: u64 = 15;

/// Longest provider error body kept in an error message.
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Result of one device token poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Granted(IdentityToken),
    Pending,
    /// Polling too fast. Carries the provider's new interval if it sent one.
    SlowDown(Option<u64>),
    Denied,
    Expired,
}

/// Identity provider operations used by the session manager.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn request_device_code(&self) -> Result<DeviceSession, AuthError>;

    async fn poll_device_token(&self, device_code: &str) -> Result<PollOutcome, AuthError>;

    /// Exchange the identity token for a bearer token. Returns
    /// `AuthError::Rejected` if the provider refuses the identity.
    async fn exchange(&self, identity: &IdentityToken) -> Result<BearerToken, AuthError>;
}

#[derive(Debug, Deserialize)]
struct DeviceTokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    token: String,
    expires_at: Option<i64>,
    expires_in: Option<i64>,
}

/// GitHub device flow and Copilot token exchange.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct GitHubProvider {
    client: Client,
    endpoints: Endpoints,
}

impl GitHubProvider {
    pub fn new(endpoints: Endpoints) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(PROVIDER_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, endpoints })
    }

    fn parse_poll(body: DeviceTokenResponse) -> Result<PollOutcome, AuthError> {
        if let Some(token) = body.access_token {
            debug!(token = %redact_secret(&token), "Device flow granted identity token");
            return Ok(PollOutcome::Granted(IdentityToken::new(token)));
        }
        match body.error.as_deref() {
            Some("authorization_pending") => Ok(PollOutcome::Pending),
            Some("slow_down") => Ok(PollOutcome::SlowDown(body.interval)),
            Some("access_denied") => Ok(PollOutcome::Denied),
            Some("expired_token") => Ok(PollOutcome::Expired),
            Some(other) => Err(AuthError::Provider(
                body.error_description.unwrap_or_else(|| other.to_string()),
            )),
            None => Err(AuthError::Provider(
                "Token response had neither a token nor an error".to_string(),
            )),
        }
    }
}

#[async_trait]
impl IdentityProvider for GitHubProvider {
    async fn request_device_code(&self) -> Result<DeviceSession, AuthError> {
        debug!(url = %self.endpoints.device_code, "Requesting device code");
        let response = self
            .client
            .post(&self.endpoints.device_code)
            .header(header::ACCEPT, "application/json")
            .form(&[("client_id", GITHUB_CLIENT_ID), ("scope", "read:user")])
            .send()
            .await?;

        let response = check_response(response).await?;
        let session: DeviceSession = response
            .json()
            .await
            .map_err(|e| AuthError::Provider(format!("Invalid device code response: {}", e)))?;
        debug!(
            user_code = %session.user_code,
            interval = session.interval,
            expires_in = session.expires_in,
            "Device code issued"
        );
        Ok(session)
    }

    async fn poll_device_token(&self, device_code: &str) -> Result<PollOutcome, AuthError> {
        let response = self
            .client
            .post(&self.endpoints.device_token)
            .header(header::ACCEPT, "application/json")
            .form(&[
                ("client_id", GITHUB_CLIENT_ID),
                ("device_code", device_code),
                ("grant_type", DEVICE_GRANT_TYPE),
            ])
            .send()
            .await?;

        let response = check_response(response).await?;
        let body: DeviceTokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Provider(format!("Invalid token response: {}", e)))?;
        Self::parse_poll(body)
    }

    async fn exchange(&self, identity: &IdentityToken) -> Result<BearerToken, AuthError> {
        debug!(
            url = %self.endpoints.bearer_exchange,
            identity = %redact_secret(identity.as_str()),
            "Exchanging identity for bearer token"
        );
        let response = self
            .client
            .get(&self.endpoints.bearer_exchange)
            .headers(copilot_headers())
            .header(header::AUTHORIZATION, format!("token {}", identity.as_str()))
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        ) {
            let body = response.text().await.unwrap_or_default();
            debug!(status = %status, body = %truncate_string(&body, MAX_ERROR_BODY_CHARS), "Bearer exchange refused");
            return Err(AuthError::Rejected);
        }
        let response = check_response(response).await?;

        let body: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Provider(format!("Invalid exchange response: {}", e)))?;
        let bearer = match (body.expires_at, body.expires_in) {
            (Some(at), _) if at > 0 => BearerToken::from_unix(body.token, at),
            (_, Some(secs)) if secs > 0 => BearerToken::from_expires_in(body.token, secs),
            _ => BearerToken::with_default_lifetime(body.token),
        };
        debug!(expires_at = %bearer.expires_at(), "Bearer token obtained");
        Ok(bearer)
    }
}

async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AuthError::Provider(format!(
        "Status {}: {}",
        status,
        truncate_string(&body, MAX_ERROR_BODY_CHARS)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: &str) -> DeviceTokenResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_poll_outcomes() {
        assert_eq!(
            GitHubProvider::parse_poll(response(r#"{"error":"authorization_pending"}"#)).unwrap(),
            PollOutcome::Pending
        );
        assert_eq!(
            GitHubProvider::parse_poll(response(r#"{"error":"slow_down","interval":10}"#))
                .unwrap(),
            PollOutcome::SlowDown(Some(10))
        );
        assert_eq!(
            GitHubProvider::parse_poll(response(r#"{"error":"access_denied"}"#)).unwrap(),
            PollOutcome::Denied
        );
        assert_eq!(
            GitHubProvider::parse_poll(response(r#"{"error":"expired_token"}"#)).unwrap(),
            PollOutcome::Expired
        );
        assert_eq!(
            GitHubProvider::parse_poll(response(
                r#"{"access_token":"gho_abc","token_type":"bearer","scope":""}"#
            ))
            .unwrap(),
            PollOutcome::Granted(IdentityToken::new("gho_abc"))
        );
    }

    #[test]
    fn test_parse_poll_unknown_error() {
        let err = GitHubProvider::parse_poll(response(
            r#"{"error":"incorrect_client_credentials","error_description":"The client_id is invalid."}"#,
        ))
        .unwrap_err();
        assert_eq!(err, AuthError::Provider("The client_id is invalid.".to_string()));

        assert!(matches!(
            GitHubProvider::parse_poll(response("{}")),
            Err(AuthError::Provider(_))
        ));
    }
}
