//! Credential storage
//!
//! Holds the access token, its absolute expiry, the optional refresh token
//! and the transient PKCE verifier. Pure storage: no network, no validation
//! beyond the expiry check on read.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::time::current_time_ms;

/// An access token with its absolute expiry
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    /// Expiry in milliseconds since UNIX epoch
    pub expires_at_ms: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl Credential {
    /// Valid iff `now < expires_at_ms`
    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(current_time_ms())
    }
}

// Token material stays out of logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_at_ms", &self.expires_at_ms)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// PKCE verifier waiting for its code exchange
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingVerifier {
    pub value: String,
    pub created_at_ms: u64,
}

impl fmt::Debug for PendingVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingVerifier")
            .field("value", &"<redacted>")
            .field("created_at_ms", &self.created_at_ms)
            .finish()
    }
}

/// On-disk layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredState {
    #[serde(default)]
    credential: Option<Credential>,
    #[serde(default)]
    verifier: Option<PendingVerifier>,
}

/// Credential store, in memory or write-through to a JSON file
#[derive(Debug)]
pub struct CredentialStore {
    state: Mutex<StoredState>,
    path: Option<PathBuf>,
}

impl CredentialStore {
    /// Store that forgets everything when dropped
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoredState::default()),
            path: None,
        }
    }

    /// Open a file-backed store, reading any existing state
    ///
    /// A missing file means an empty store. A file that does not parse is
    /// logged and treated as empty; it is overwritten on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!("Ignoring unreadable credential file {}: {}", path.display(), e);
                    StoredState::default()
                }
            }
        } else {
            StoredState::default()
        };

        debug!("Opened credential store at {}", path.display());
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Persist a credential, replacing any previous one
    pub fn save(&self, credential: Credential) -> Result<()> {
        self.update(|state| state.credential = Some(credential))
    }

    /// The stored credential if it has not expired
    pub fn load(&self) -> Option<Credential> {
        self.load_at(current_time_ms())
    }

    /// Same as [`load`](Self::load) with an explicit clock reading
    ///
    /// Expired credentials are ignored, not deleted.
    pub fn load_at(&self, now_ms: u64) -> Option<Credential> {
        self.state
            .lock()
            .credential
            .as_ref()
            .filter(|c| c.is_valid_at(now_ms))
            .cloned()
    }

    /// Stored refresh token, even when the access token has expired
    pub fn refresh_token(&self) -> Option<String> {
        self.state
            .lock()
            .credential
            .as_ref()
            .and_then(|c| c.refresh_token.clone())
    }

    /// Remove the credential and any outstanding verifier. Idempotent.
    pub fn clear(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        self.update(|state| *state = StoredState::default())?;
        info!("Cleared stored credentials");
        Ok(())
    }

    /// Drop only the credential, keeping a verifier for an in-flight login
    pub fn clear_credential(&self) -> Result<()> {
        if self.state.lock().credential.is_none() {
            return Ok(());
        }
        self.update(|state| state.credential = None)
    }

    pub fn save_verifier(&self, verifier: PendingVerifier) -> Result<()> {
        self.update(|state| state.verifier = Some(verifier))
    }

    pub fn verifier(&self) -> Option<PendingVerifier> {
        self.state.lock().verifier.clone()
    }

    pub fn discard_verifier(&self) -> Result<()> {
        if self.state.lock().verifier.is_none() {
            return Ok(());
        }
        self.update(|state| state.verifier = None)
    }

    fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.credential.is_none() && state.verifier.is_none()
    }

    /// Apply `change` to a copy and keep it only once it is on disk, so a
    /// failed write leaves memory and file agreeing on the old state.
    fn update(&self, change: impl FnOnce(&mut StoredState)) -> Result<()> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        change(&mut next);
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    /// Write the whole state through to disk (temp file + rename)
    fn persist(&self, state: &StoredState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| crate::Error::Storage(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        let written = write_private(&tmp, &content).and_then(|()| fs::rename(&tmp, path));
        if let Err(e) = written {
            warn!(path = %path.display(), "Failed to write credentials: {}", e);
            if tmp.is_file() {
                let _ = fs::remove_file(&tmp);
            }
            return Err(e.into());
        }
        Ok(())
    }
}

fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    fs::write(path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }

    Ok(())
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
