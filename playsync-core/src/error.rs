//! Error taxonomy shared by the auth, client and sync layers

use thiserror::Error;

/// Errors surfaced by the playsync core
#[derive(Debug, Error)]
pub enum Error {
    /// No valid credential. Triggers a login redirect rather than an error display.
    #[error("Not authenticated")]
    Unauthenticated,

    /// The PKCE verifier for this login attempt is gone (double callback, lost state)
    #[error("No PKCE verifier stored for this login attempt")]
    MissingVerifier,

    /// A login attempt is already waiting for its callback
    #[error("A login attempt is already in progress")]
    LoginInProgress,

    #[error("Token exchange rejected (HTTP {status})")]
    ExchangeRejected { status: u16, reason: Option<String> },

    /// The user or the provider refused the authorization request
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Caller bug, e.g. an out-of-range seek. Never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No track currently playing")]
    NothingPlaying,

    #[error("Remote service unreachable: {0}")]
    RemoteUnavailable(String),

    #[error("Remote service rejected the request (HTTP {status})")]
    RemoteRejected { status: u16 },

    #[error("Unexpected response: {0}")]
    MalformedResponse(String),

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the only way forward is a fresh login
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Error::Unauthenticated | Error::RemoteRejected { status: 401 }
        )
    }

    /// True for failures that may clear up on their own by the next poll
    pub fn is_transient(&self) -> bool {
        match self {
            Error::RemoteUnavailable(_) | Error::MalformedResponse(_) => true,
            Error::RemoteRejected { status } => *status != 401,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            Error::RemoteRejected {
                status: status.as_u16(),
            }
        } else if e.is_decode() {
            Error::MalformedResponse(e.to_string())
        } else if e.is_connect() {
            Error::RemoteUnavailable(format!("Connection refused ({})", e))
        } else if e.is_timeout() {
            Error::RemoteUnavailable("Connection timed out".to_string())
        } else {
            Error::RemoteUnavailable(format!("Network error ({})", e))
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
