use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::redact_secret;

/// Bearer lifetime assumed when the exchange response carries no expiry.
/// Copilot bearer tokens are issued for about 30 minutes.
const DEFAULT_BEARER_LIFETIME_MINUTES: i64 = 30;

/// Long-lived token issued by the identity provider after device-flow
/// approval. Only ever logged in redacted form.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityToken(String);

impl IdentityToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityToken({})", redact_secret(&self.0))
    }
}

/// Short-lived API token with an absolute expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BearerToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl BearerToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Token valid for `seconds` from now.
    pub fn from_expires_in(token: impl Into<String>, seconds: i64) -> Self {
        Self::new(token, Utc::now() + Duration::seconds(seconds))
    }

    /// Token expiring at a unix timestamp. Falls back to the default
    /// lifetime if the timestamp is out of range.
    pub fn from_unix(token: impl Into<String>, expires_at: i64) -> Self {
        let expires_at = Utc
            .timestamp_opt(expires_at, 0)
            .single()
            .unwrap_or_else(|| Utc::now() + Duration::minutes(DEFAULT_BEARER_LIFETIME_MINUTES));
        Self::new(token, expires_at)
    }

    /// Token with the default 30-minute lifetime.
    pub fn with_default_lifetime(token: impl Into<String>) -> Self {
        Self::new(
            token,
            Utc::now() + Duration::minutes(DEFAULT_BEARER_LIFETIME_MINUTES),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Check if the token expires within `margin` and should be refreshed
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        Utc::now() + margin >= self.expires_at
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at - Utc::now()
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("token", &redact_secret(&self.token))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One device authorization attempt, as issued by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceSession {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    /// Minimum seconds between polls.
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
    /// Seconds until the device code expires.
    pub expires_in: u64,
}

fn default_poll_interval() -> u64 {
    5
}

/// What the user needs to complete sign-in in a browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthorization {
    pub user_code: String,
    pub verification_uri: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&DeviceSession> for DeviceAuthorization {
    fn from(session: &DeviceSession) -> Self {
        Self {
            user_code: session.user_code.clone(),
            verification_uri: session.verification_uri.clone(),
            expires_at: Utc::now() + Duration::seconds(session.expires_in as i64),
        }
    }
}
