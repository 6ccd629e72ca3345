//! Shared fixtures: an in-process mock of the remote API and a scripted
//! `PlaybackApi` for driving the sync loop under paused time.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use parking_lot::Mutex;
use tokio::sync::Notify;

use playsync_core::config::{ApiConfig, AuthConfig};
use playsync_core::sync::{ItemKind, TrackMetadata};
use playsync_core::{
    Credential, CredentialStore, Error, PlaybackApi, PlaybackSnapshot, Result, SyncObserver,
    SyncStatus,
};

// ---------------------------------------------------------------------------
// HTTP mock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub authorization: Option<String>,
    pub content_length: Option<String>,
    pub body: String,
}

impl RecordedRequest {
    /// Body parsed as `application/x-www-form-urlencoded`
    pub fn form(&self) -> HashMap<String, String> {
        url::form_urlencoded::parse(self.body.as_bytes())
            .into_owned()
            .collect()
    }
}

#[derive(Default)]
struct MockState {
    routes: Mutex<HashMap<(String, String), (u16, String)>>,
    requests: Mutex<Vec<RecordedRequest>>,
    delay: Mutex<Duration>,
}

/// Records every request and answers from a `(method, path)` table.
/// Unrouted requests get a 404.
pub struct MockRemote {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockRemote {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new().fallback(handle).with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn respond(&self, method: &str, path: &str, status: u16, body: &str) {
        self.state
            .routes
            .lock()
            .insert((method.to_string(), path.to_string()), (status, body.to_string()));
    }

    /// Delay every answer, to widen race windows
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    pub fn last(&self, method: &str, path: &str) -> Option<RecordedRequest> {
        self.state
            .requests
            .lock()
            .iter()
            .rev()
            .find(|r| r.method == method && r.path == path)
            .cloned()
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            client_id: "test-client".to_string(),
            authorize_url: self.url("/authorize"),
            token_url: self.url("/api/token"),
            ..AuthConfig::default()
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.url("/v1"),
            ..ApiConfig::default()
        }
    }
}

async fn handle(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let query = url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .into_owned()
        .collect();
    let header_value = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    state.requests.lock().push(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query,
        authorization: header_value(header::AUTHORIZATION),
        content_length: header_value(header::CONTENT_LENGTH),
        body,
    });

    let delay = *state.delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let route = state
        .routes
        .lock()
        .get(&(method.to_string(), uri.path().to_string()))
        .cloned();
    match route {
        Some((status, body)) => Response::builder()
            .status(StatusCode::from_u16(status).unwrap())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub const TOKEN_JSON: &str = r#"{
    "access_token": "access-1",
    "token_type": "Bearer",
    "expires_in": 3600,
    "refresh_token": "refresh-1",
    "scope": "user-read-playback-state"
}"#;

// ---------------------------------------------------------------------------
// Sync loop fixtures
// ---------------------------------------------------------------------------

pub fn signed_in_store() -> Arc<CredentialStore> {
    let store = Arc::new(CredentialStore::in_memory());
    store
        .save(Credential {
            access_token: "access".to_string(),
            expires_at_ms: u64::MAX,
            refresh_token: Some("refresh".to_string()),
        })
        .unwrap();
    store
}

pub fn snapshot(track_id: &str, progress_ms: u64) -> PlaybackSnapshot {
    PlaybackSnapshot {
        track_id: track_id.to_string(),
        track: TrackMetadata {
            name: format!("Track {}", track_id),
            artists: vec!["Artist".to_string()],
            album: Some("Album".to_string()),
            artwork_url: None,
            kind: ItemKind::Track,
        },
        is_playing: true,
        progress_ms,
        duration_ms: 200_000,
        is_favorite: false,
        fetched_at_ms: 0,
    }
}

/// One scripted answer to `current_playback`
pub enum Reply {
    Playing(Option<PlaybackSnapshot>),
    Unavailable,
    Rejected(u16),
}

/// `PlaybackApi` that answers from a script, then from a settable default
#[derive(Default)]
pub struct FakeApi {
    latency: Mutex<Duration>,
    script: Mutex<VecDeque<Reply>>,
    current: Mutex<Option<PlaybackSnapshot>>,
    command_failure: Mutex<Option<u16>>,
    pub commands: Mutex<Vec<String>>,
    pub polls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Signalled each time a poll starts
    pub poll_started: Notify,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn playing(snapshot: PlaybackSnapshot) -> Arc<Self> {
        let api = Self::new();
        api.set_current(Some(snapshot));
        api
    }

    pub fn set_current(&self, snapshot: Option<PlaybackSnapshot>) {
        *self.current.lock() = snapshot;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().push_back(reply);
    }

    /// Make every command fail with this HTTP status
    pub fn fail_commands(&self, status: Option<u16>) {
        *self.command_failure.lock() = status;
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    fn command(&self, name: String) -> Result<()> {
        self.commands.lock().push(name);
        match *self.command_failure.lock() {
            Some(status) => Err(Error::RemoteRejected { status }),
            None => Ok(()),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PlaybackApi for FakeApi {
    async fn current_playback(&self) -> Result<Option<PlaybackSnapshot>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.poll_started.notify_one();

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let scripted = self.script.lock().pop_front();
        match scripted {
            Some(Reply::Playing(snapshot)) => Ok(snapshot),
            Some(Reply::Unavailable) => {
                Err(Error::RemoteUnavailable("connection refused".to_string()))
            }
            Some(Reply::Rejected(status)) => Err(Error::RemoteRejected { status }),
            None => Ok(self.current.lock().clone()),
        }
    }

    async fn play(&self) -> Result<()> {
        self.command("play".to_string())
    }

    async fn pause(&self) -> Result<()> {
        self.command("pause".to_string())
    }

    async fn skip_next(&self) -> Result<()> {
        self.command("next".to_string())
    }

    async fn skip_previous(&self) -> Result<()> {
        self.command("previous".to_string())
    }

    async fn seek(&self, position_ms: i64, _duration_ms: u64) -> Result<()> {
        self.command(format!("seek:{}", position_ms))
    }

    async fn is_favorite(&self, _track_id: &str) -> Result<bool> {
        Ok(self
            .current
            .lock()
            .as_ref()
            .map(|s| s.is_favorite)
            .unwrap_or(false))
    }

    async fn set_favorite(&self, track_id: &str, favorite: bool) -> Result<()> {
        self.command(format!("favorite:{}:{}", track_id, favorite))
    }
}

/// Observer that keeps everything it was told
#[derive(Default)]
pub struct Recorder {
    snapshots: Mutex<Vec<Option<PlaybackSnapshot>>>,
    statuses: Mutex<Vec<SyncStatus>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshots(&self) -> Vec<Option<PlaybackSnapshot>> {
        self.snapshots.lock().clone()
    }

    pub fn statuses(&self) -> Vec<SyncStatus> {
        self.statuses.lock().clone()
    }

    /// Most recent published snapshot; panics if nothing was published
    pub fn last(&self) -> Option<PlaybackSnapshot> {
        self.snapshots
            .lock()
            .last()
            .cloned()
            .expect("nothing published yet")
    }

    pub fn last_status(&self) -> Option<SyncStatus> {
        self.statuses.lock().last().cloned()
    }

    pub fn event_count(&self) -> usize {
        self.snapshots.lock().len() + self.statuses.lock().len()
    }
}

impl SyncObserver for Recorder {
    fn on_snapshot(&self, snapshot: Option<&PlaybackSnapshot>) {
        self.snapshots.lock().push(snapshot.cloned());
    }

    fn on_status(&self, status: &SyncStatus) {
        self.statuses.lock().push(status.clone());
    }
}
