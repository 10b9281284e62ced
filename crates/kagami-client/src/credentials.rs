//! Persisted session credentials.
//!
//! One secret record: the bearer token plus the identity it was issued
//! to. Load/save/clear only — refresh and validation live in
//! [`SessionManager`](crate::SessionManager). The token and identity are
//! always cleared together.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kagami_types::Identity;

/// The persisted record. Identity may lag the token: a token exists
/// transiently before the identity endpoint confirms who it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredentials {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
}

/// Error talking to the credential store.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt credential record: {0}")]
    Corrupt(String),
}

/// Opaque secure key/value persistence for the session secret.
///
/// Implementations must treat the record as a unit: `clear` removes both
/// token and identity.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<StoredCredentials>, CredentialError>;
    fn save(&self, creds: &StoredCredentials) -> Result<(), CredentialError>;
    fn clear(&self) -> Result<(), CredentialError>;
}

// ============================================================================
// File-backed store
// ============================================================================

/// JSON file under the user config dir, owner-readable only on unix.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location: `~/.config/kagami/credentials.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kagami")
            .join("credentials.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<StoredCredentials>, CredentialError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let creds = serde_json::from_str(&text)
            .map_err(|e| CredentialError::Corrupt(e.to_string()))?;
        Ok(Some(creds))
    }

    fn save(&self, creds: &StoredCredentials) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(creds)
            .map_err(|e| CredentialError::Corrupt(e.to_string()))?;
        fs::write(&self.path, text)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// In-memory store (tests, ephemeral sessions)
// ============================================================================

/// Holds the record in memory. Used by tests and by callers that must not
/// touch disk.
#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<Option<StoredCredentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<StoredCredentials>, CredentialError> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, creds: &StoredCredentials) -> Result<(), CredentialError> {
        *self.inner.lock() = Some(creds.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        *self.inner.lock() = None;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
