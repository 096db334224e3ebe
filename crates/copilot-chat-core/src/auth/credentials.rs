//! On-disk credential storage.
//!
//! Credentials are kept in a small versioned JSON file. Every write goes to a
//! temporary file in the same directory, is flushed to disk, then renamed over
//! the previous file, so an interrupted write leaves the old credentials
//! intact.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BearerToken, IdentityToken, PersistenceError};

/// Current credential file format.
const FORMAT_VERSION: u32 = 1;

/// Credentials as loaded from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredentials {
    pub identity: IdentityToken,
    pub bearer: Option<BearerToken>,
}

#[derive(Serialize, Deserialize)]
struct CredentialFile {
    version: u32,
    identity_token: IdentityToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bearer: Option<BearerToken>,
}

/// Reads and atomically replaces the credential file.
///
/// Clones share one write lock, so concurrent saves never interleave.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load stored credentials. A missing file is `Ok(None)`.
    pub fn load(&self) -> Result<Option<StoredCredentials>, PersistenceError> {
        let Some(file) = self.read_file()? else {
            return Ok(None);
        };
        debug!(path = %self.path.display(), has_bearer = file.bearer.is_some(), "Loaded credentials");
        Ok(Some(StoredCredentials {
            identity: file.identity_token,
            bearer: file.bearer,
        }))
    }

    /// Store a new identity token. Any cached bearer token belonged to the
    /// previous identity and is discarded.
    pub fn save(&self, identity: &IdentityToken) -> Result<(), PersistenceError> {
        let _guard = self.lock();
        self.write_file(&CredentialFile {
            version: FORMAT_VERSION,
            identity_token: identity.clone(),
            bearer: None,
        })
    }

    /// Cache a bearer token next to the stored identity.
    pub fn save_bearer(&self, bearer: &BearerToken) -> Result<(), PersistenceError> {
        let _guard = self.lock();
        let mut file = self
            .read_file()?
            .ok_or(PersistenceError::MissingIdentity)?;
        file.bearer = Some(bearer.clone());
        self.write_file(&file)
    }

    /// Remove all stored credentials.
    pub fn clear(&self) -> Result<(), PersistenceError> {
        let _guard = self.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_file(&self) -> Result<Option<CredentialFile>, PersistenceError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        let file: CredentialFile =
            serde_json::from_str(&contents).map_err(|source| PersistenceError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        if file.version != FORMAT_VERSION {
            return Err(PersistenceError::UnsupportedVersion(file.version));
        }
        Ok(Some(file))
    }

    fn write_file(&self, file: &CredentialFile) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let contents = serde_json::to_vec_pretty(file).map_err(|source| {
            PersistenceError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;

        let tmp = self.tmp_path();
        let result = (|| {
            let mut out = open_private(&tmp)?;
            out.write_all(&contents)?;
            out.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(self.io_error(e));
        }
        debug!(path = %self.path.display(), "Saved credentials");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}
