//! FFI types exposed via uniffi

use crate::auth::AuthState;
use crate::error::Error;
use crate::sync::{ItemKind, PlaybackSnapshot, SyncStatus};

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Not signed in")]
    NotAuthenticated,

    #[error("No login in progress")]
    NoLoginInProgress,

    #[error("A login is already in progress")]
    LoginInProgress,

    #[error("Authorization rejected: {0}")]
    AuthorizationRejected(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Nothing is playing")]
    NothingPlaying,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Spotify rejected the request (HTTP {0})")]
    RemoteRejected(u16),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

impl From<Error> for CoreError {
    fn from(e: Error) -> Self {
        match e {
            Error::Unauthenticated | Error::RemoteRejected { status: 401 } => {
                CoreError::NotAuthenticated
            }
            Error::MissingVerifier => CoreError::NoLoginInProgress,
            Error::LoginInProgress => CoreError::LoginInProgress,
            Error::ExchangeRejected { status, reason } => CoreError::AuthorizationRejected(
                reason.unwrap_or_else(|| format!("token endpoint answered HTTP {}", status)),
            ),
            Error::AuthorizationDenied(reason) => CoreError::AuthorizationRejected(reason),
            Error::InvalidArgument(msg) => CoreError::InvalidArgument(msg),
            Error::NothingPlaying => CoreError::NothingPlaying,
            Error::RemoteUnavailable(msg) => CoreError::NetworkError(msg),
            Error::RemoteRejected { status } => CoreError::RemoteRejected(status),
            Error::MalformedResponse(msg) => CoreError::UnexpectedResponse(msg),
            Error::Storage(msg) => CoreError::StorageError(msg),
            Error::Config(msg) => CoreError::ConfigError(msg),
        }
    }
}

/// Track information exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct TrackInfo {
    pub track_id: String,
    pub name: String,
    /// Comma-separated artists, or the publisher for episodes
    pub artist: String,
    pub album: String,
    pub artwork_url: Option<String>,
    pub duration_ms: u64,
    pub is_episode: bool,
}

/// Displayed playback state exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct PlaybackState {
    pub track: TrackInfo,
    pub is_playing: bool,
    pub position_ms: u64,
    pub is_favorite: bool,
    /// When the server state behind this was fetched
    pub timestamp_ms: u64,
}

impl From<&PlaybackSnapshot> for PlaybackState {
    fn from(s: &PlaybackSnapshot) -> Self {
        Self {
            track: TrackInfo {
                track_id: s.track_id.clone(),
                name: s.track.name.clone(),
                artist: s.track.artist_line(),
                album: s.track.album.clone().unwrap_or_default(),
                artwork_url: s.track.artwork_url.clone(),
                duration_ms: s.duration_ms,
                is_episode: s.track.kind == ItemKind::Episode,
            },
            is_playing: s.is_playing,
            position_ms: s.progress_ms,
            is_favorite: s.is_favorite,
            timestamp_ms: s.fetched_at_ms,
        }
    }
}

/// Sync loop health exposed via FFI
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Enum)]
pub enum SyncState {
    Starting,
    Live,
    NothingPlaying,
    Degraded {
        reason: String,
        consecutive_failures: u32,
    },
    SignedOut,
}

impl From<&SyncStatus> for SyncState {
    fn from(s: &SyncStatus) -> Self {
        match s {
            SyncStatus::Starting => SyncState::Starting,
            SyncStatus::Live => SyncState::Live,
            SyncStatus::NothingPlaying => SyncState::NothingPlaying,
            SyncStatus::Degraded {
                reason,
                consecutive_failures,
            } => SyncState::Degraded {
                reason: reason.clone(),
                consecutive_failures: *consecutive_failures,
            },
            SyncStatus::SignedOut => SyncState::SignedOut,
        }
    }
}

/// Login state exposed via FFI
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum LoginState {
    SignedOut,
    /// Browser login started, waiting for the redirect
    AwaitingRedirect,
    SignedIn,
}

impl From<AuthState> for LoginState {
    fn from(s: AuthState) -> Self {
        match s {
            AuthState::Unauthenticated => LoginState::SignedOut,
            AuthState::PendingExchange => LoginState::AwaitingRedirect,
            AuthState::Authenticated => LoginState::SignedIn,
        }
    }
}

/// Options for creating a session
///
/// Unset fields fall back to the config file, then the environment, then defaults.
#[derive(Debug, Clone, Default, uniffi::Record)]
pub struct SessionSettings {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    /// TOML config file to load first
    pub config_path: Option<String>,
    /// Where to keep credentials; in memory only when unset and no default exists
    pub credentials_path: Option<String>,
    pub poll_interval_ms: Option<u64>,
}

/// Callback interface for session events
///
/// Called from a background thread, one event at a time and in order. A
/// callback may read the session (`current_playback`, `sync_state`,
/// `auth_state`) or call `stop_sync`. Blocking actions such as `play_pause`
/// must be dispatched to another thread.
#[uniffi::export(callback_interface)]
pub trait SessionCallback: Send + Sync {
    /// `None` when nothing is playing or the user signed out
    fn on_playback_changed(&self, playback: Option<PlaybackState>);
    fn on_status_changed(&self, status: SyncState);
    /// The stored credential is gone; show the login affordance
    fn on_auth_required(&self);
    fn on_error(&self, message: String);
}
