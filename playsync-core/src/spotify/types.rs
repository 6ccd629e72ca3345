//! Types for Web API player responses

use serde::Deserialize;

use crate::sync::{ItemKind, PlaybackSnapshot, TrackMetadata};

/// Response of `GET /me/player/currently-playing`
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentlyPlaying {
    /// Position in the current item, in milliseconds
    #[serde(default)]
    pub progress_ms: Option<u64>,

    #[serde(default)]
    pub is_playing: bool,

    /// Null for ads, private sessions and some local files
    #[serde(default)]
    pub item: Option<PlayableItem>,

    /// "track", "episode", "ad" or "unknown"
    #[serde(default)]
    pub currently_playing_type: Option<String>,
}

/// A track or an episode
#[derive(Debug, Clone, Deserialize)]
pub struct PlayableItem {
    /// Null for local files
    #[serde(default)]
    pub id: Option<String>,

    pub name: String,

    #[serde(default)]
    pub duration_ms: u64,

    #[serde(rename = "type", default)]
    pub item_type: Option<String>,

    // Tracks
    #[serde(default)]
    pub artists: Vec<Artist>,
    #[serde(default)]
    pub album: Option<Album>,

    // Episodes
    #[serde(default)]
    pub show: Option<Show>,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Artist {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Album {
    pub name: String,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Show {
    pub name: String,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub images: Vec<Image>,
}

/// Artwork, largest first as returned by the API
#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl CurrentlyPlaying {
    /// Id of the playing item, if there is one we can act on
    pub fn track_id(&self) -> Option<&str> {
        self.item
            .as_ref()
            .and_then(|item| item.id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Build a snapshot. `None` when nothing addressable is playing.
    pub fn into_snapshot(self, is_favorite: bool, fetched_at_ms: u64) -> Option<PlaybackSnapshot> {
        let item = self.item?;
        let track_id = item.id.clone().filter(|id| !id.is_empty())?;
        let duration_ms = item.duration_ms;
        let progress_ms = self.progress_ms.unwrap_or(0).min(duration_ms);

        Some(PlaybackSnapshot {
            track_id,
            track: item.into_metadata(),
            is_playing: self.is_playing,
            progress_ms,
            duration_ms,
            is_favorite,
            fetched_at_ms,
        })
    }
}

impl PlayableItem {
    fn is_episode(&self) -> bool {
        self.item_type.as_deref() == Some("episode") || self.show.is_some()
    }

    /// First (largest) artwork from the album, the show, or the item itself
    fn artwork_url(&self) -> Option<String> {
        let from_album = self.album.as_ref().and_then(|a| a.images.first());
        let from_show = self.show.as_ref().and_then(|s| s.images.first());
        from_album
            .or(from_show)
            .or_else(|| self.images.first())
            .map(|img| img.url.clone())
    }

    fn into_metadata(self) -> TrackMetadata {
        let artwork_url = self.artwork_url();

        if self.is_episode() {
            let (album, artists) = match self.show {
                Some(show) => (Some(show.name), show.publisher.into_iter().collect()),
                None => (None, Vec::new()),
            };
            TrackMetadata {
                name: self.name,
                artists,
                album,
                artwork_url,
                kind: ItemKind::Episode,
            }
        } else {
            TrackMetadata {
                name: self.name,
                artists: self.artists.into_iter().map(|a| a.name).collect(),
                album: self.album.map(|a| a.name),
                artwork_url,
                kind: ItemKind::Track,
            }
        }
    }
}
