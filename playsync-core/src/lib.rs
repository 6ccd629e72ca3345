//! Playsync - Core Library
//!
//! Signs a user in to Spotify with the PKCE authorization-code flow and keeps
//! a local view of their playback in step with the remote player, showing
//! user actions immediately while the server catches up.

pub mod auth;
pub mod config;
pub mod credentials;
mod error;
pub mod ffi;
pub mod spotify;
pub mod sync;
pub mod time;

// Re-exports for convenience
pub use auth::{AuthFlow, AuthState};
pub use config::Config;
pub use credentials::{Credential, CredentialStore};
pub use error::{Error, Result};
pub use spotify::{PlaybackApi, PlaybackClient};
pub use sync::{PlaybackSnapshot, SyncLoop, SyncObserver, SyncStatus};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
