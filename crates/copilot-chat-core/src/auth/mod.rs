//! Authentication: device-flow sign-in and bearer-token lifecycle.
//!
//! This module provides:
//! - `CredentialStore`: atomic on-disk storage for the identity and bearer tokens
//! - `IdentityProvider`: the HTTP seam to GitHub (`GitHubProvider`)
//! - `AuthSessionManager`: the sign-in state machine and single-flight refresh
//!
//! Identity tokens are long-lived; bearer tokens expire after about 30 minutes
//! and are refreshed 60 seconds before expiry by default.

pub mod credentials;
pub mod error;
pub mod manager;
pub mod provider;
pub mod session;

pub use credentials::{CredentialStore, StoredCredentials};
pub use error::{AuthError, PersistenceError};
pub use manager::{AuthSessionManager, AuthState, PollStatus};
pub use provider::{GitHubProvider, IdentityProvider, PollOutcome, GITHUB_CLIENT_ID};
pub use session::{BearerToken, DeviceAuthorization, DeviceSession, IdentityToken};
