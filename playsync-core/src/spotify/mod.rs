//! Spotify Web API client
//!
//! The handful of player and library endpoints the sync loop needs.

mod client;
mod types;

pub(crate) use client::http_client;
pub use client::{PlaybackApi, PlaybackClient};
pub use types::*;
