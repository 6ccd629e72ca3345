//! Playback snapshots and loop status

use serde::{Deserialize, Serialize};

/// What kind of item is playing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    Track,
    Episode,
}

/// Display metadata for the playing item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub name: String,
    /// Artist names; the publisher for episodes
    pub artists: Vec<String>,
    /// Album name; the show name for episodes
    pub album: Option<String>,
    pub artwork_url: Option<String>,
    pub kind: ItemKind,
}

impl TrackMetadata {
    /// "Artist A, Artist B"
    pub fn artist_line(&self) -> String {
        self.artists.join(", ")
    }
}

/// One consistent view of playback at a point in time
///
/// Never mutated after construction; the next poll supersedes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub track_id: String,
    pub track: TrackMetadata,
    pub is_playing: bool,
    pub progress_ms: u64,
    pub duration_ms: u64,
    pub is_favorite: bool,
    /// When the server state was fetched (ms since UNIX epoch)
    pub fetched_at_ms: u64,
}

/// Health of the sync loop as shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// No poll has completed yet
    Starting,
    /// Last poll succeeded with something playing
    Live,
    /// Last poll succeeded, no active device or item
    NothingPlaying,
    /// Last poll failed; the last good snapshot is still shown
    Degraded {
        reason: String,
        consecutive_failures: u32,
    },
    /// No valid credential; the login affordance should be shown
    SignedOut,
}

impl SyncStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, SyncStatus::Degraded { .. })
    }
}
