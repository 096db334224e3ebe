use std::path::PathBuf;

use thiserror::Error;

/// Authentication failures.
///
/// `Clone` so a single bearer refresh result can be handed to every caller
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Sign-in was denied by the user")]
    Denied,

    #[error("Device code expired before sign-in completed")]
    Expired,

    #[error("Not signed in")]
    Unauthenticated,

    #[error("Stored identity was rejected - sign in again")]
    Rejected,

    #[error("No device sign-in in progress")]
    NoDeviceFlow,

    #[error("Sign-in was cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Identity provider error: {0}")]
    Provider(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Network(e.to_string())
    }
}

/// Credential file failures. Callers treat these as "no credentials".
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to access credential file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Credential file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Credential file version {0} is not supported")]
    UnsupportedVersion(u32),

    #[error("Cannot store a bearer token without a stored identity")]
    MissingIdentity,
}
