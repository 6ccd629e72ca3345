//! Credential persistence
//!
//! A single [`CredentialStore`] instance is shared by the auth flow, the
//! playback client and the sync loop.

mod store;

pub use store::{Credential, CredentialStore, PendingVerifier};
