//! Web API player HTTP client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, instrument, warn};

use super::types::CurrentlyPlaying;
use crate::config::ApiConfig;
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::sync::PlaybackSnapshot;
use crate::time::current_time_ms;

/// Build the HTTP client shared by the auth flow and the player client
pub(crate) fn http_client(config: &ApiConfig) -> Result<Client> {
    Client::builder()
        .connect_timeout(config.connect_timeout())
        .timeout(config.request_timeout())
        .pool_max_idle_per_host(2)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))
}

/// The remote operations the sync loop depends on
///
/// Every call needs a valid credential and fails with
/// [`Error::Unauthenticated`] otherwise. Implementations never retry.
#[async_trait]
pub trait PlaybackApi: Send + Sync {
    /// Current playback, or `None` when no device is playing anything
    async fn current_playback(&self) -> Result<Option<PlaybackSnapshot>>;

    /// Resume playback. Success means the command was accepted, not applied.
    async fn play(&self) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    async fn skip_next(&self) -> Result<()>;

    async fn skip_previous(&self) -> Result<()>;

    /// Seek within the current item. `position_ms` must lie in `[0, duration_ms]`.
    async fn seek(&self, position_ms: i64, duration_ms: u64) -> Result<()>;

    async fn is_favorite(&self, track_id: &str) -> Result<bool>;

    async fn set_favorite(&self, track_id: &str, favorite: bool) -> Result<()>;
}

/// Client for the player and library endpoints
#[derive(Debug, Clone)]
pub struct PlaybackClient {
    http: Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
    /// Last favorite flag the library confirmed, by track id
    last_favorite: Arc<Mutex<Option<(String, bool)>>>,
}

impl PlaybackClient {
    pub fn new(config: &ApiConfig, credentials: Arc<CredentialStore>) -> Result<Self> {
        Ok(Self {
            http: http_client(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            last_favorite: Arc::new(Mutex::new(None)),
        })
    }

    /// Favorite flag for a playback read. Only an auth failure fails the
    /// read; any other error falls back to the last flag seen for this
    /// track, or `false`.
    async fn favorite_for_read(&self, track_id: &str) -> Result<bool> {
        match self.is_favorite(track_id).await {
            Ok(favorite) => {
                *self.last_favorite.lock() = Some((track_id.to_string(), favorite));
                Ok(favorite)
            }
            Err(e) if e.is_auth_failure() => Err(e),
            Err(e) => {
                let known = match self.last_favorite.lock().as_ref() {
                    Some((id, favorite)) if id == track_id => *favorite,
                    _ => false,
                };
                warn!("Favorite check failed, assuming {}: {}", known, e);
                Ok(known)
            }
        }
    }

    fn access_token(&self) -> Result<String> {
        self.credentials
            .load()
            .map(|c| c.access_token)
            .ok_or(Error::Unauthenticated)
    }

    /// Build a bearer-authenticated request
    fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let token = self.access_token()?;
        let url = format!("{}{}", self.base_url, path);
        Ok(self.http.request(method, &url).bearer_auth(token))
    }

    /// Fire a bodyless command and check for a 2xx answer
    async fn command(&self, method: Method, path: &str, query: &[(&str, String)]) -> Result<()> {
        let resp = self
            .request(method, path)?
            .query(query)
            // Some endpoints answer 411 to a PUT without a length
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;

        debug!("{} -> {}", path, resp.status());
        resp.error_for_status()?;
        Ok(())
    }
}

fn require_track_id(track_id: &str) -> Result<()> {
    if track_id.is_empty() {
        return Err(Error::InvalidArgument("empty track id".to_string()));
    }
    Ok(())
}

#[async_trait]
impl PlaybackApi for PlaybackClient {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn current_playback(&self) -> Result<Option<PlaybackSnapshot>> {
        let resp = self
            .request(Method::GET, "/me/player/currently-playing")?
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            debug!("No active playback");
            return Ok(None);
        }
        if !status.is_success() {
            warn!("Playback read failed (HTTP {})", status.as_u16());
            return Err(Error::RemoteRejected {
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }
        let playing: CurrentlyPlaying = serde_json::from_slice(&body)
            .map_err(|e| Error::MalformedResponse(format!("currently-playing: {}", e)))?;

        let is_favorite = match playing.track_id() {
            Some(track_id) => self.favorite_for_read(track_id).await?,
            None => return Ok(None),
        };

        Ok(playing.into_snapshot(is_favorite, current_time_ms()))
    }

    async fn play(&self) -> Result<()> {
        self.command(Method::PUT, "/me/player/play", &[]).await
    }

    async fn pause(&self) -> Result<()> {
        self.command(Method::PUT, "/me/player/pause", &[]).await
    }

    async fn skip_next(&self) -> Result<()> {
        self.command(Method::POST, "/me/player/next", &[]).await
    }

    async fn skip_previous(&self) -> Result<()> {
        self.command(Method::POST, "/me/player/previous", &[]).await
    }

    #[instrument(skip(self))]
    async fn seek(&self, position_ms: i64, duration_ms: u64) -> Result<()> {
        if position_ms < 0 || position_ms as u64 > duration_ms {
            return Err(Error::InvalidArgument(format!(
                "seek position {}ms outside [0, {}]",
                position_ms, duration_ms
            )));
        }
        self.command(
            Method::PUT,
            "/me/player/seek",
            &[("position_ms", position_ms.to_string())],
        )
        .await
    }

    async fn is_favorite(&self, track_id: &str) -> Result<bool> {
        require_track_id(track_id)?;

        let flags: Vec<bool> = self
            .request(Method::GET, "/me/tracks/contains")?
            .query(&[("ids", track_id)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        flags
            .first()
            .copied()
            .ok_or_else(|| Error::MalformedResponse("empty favorite check".to_string()))
    }

    #[instrument(skip(self))]
    async fn set_favorite(&self, track_id: &str, favorite: bool) -> Result<()> {
        require_track_id(track_id)?;

        let method = if favorite { Method::PUT } else { Method::DELETE };
        self.command(method, "/me/tracks", &[("ids", track_id.to_string())])
            .await
    }
}
