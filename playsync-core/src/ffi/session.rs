//! Session implementation for FFI

use std::path::Path;
use std::sync::{Arc, Once};

use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::AuthFlow;
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::Error;
use crate::spotify::PlaybackClient;
use crate::sync::{PlaybackSnapshot, SyncLoop, SyncObserver, SyncStatus};

use super::types::*;

static TRACING_INIT: Once = Once::new();

const DEFAULT_LOG_FILTER: &str = "playsync_core=debug,hyper_util=off,hyper=off,reqwest=off";

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        // A host or test harness may already have installed a subscriber
        let _ = tracing_subscriber::fmt()
            .with_ansi(false) // Disable colors for Xcode / logcat
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

type SharedCallback = Arc<RwLock<Option<Arc<dyn SessionCallback>>>>;

/// Clone out of the lock so a callback may replace itself
fn current_callback(callback: &SharedCallback) -> Option<Arc<dyn SessionCallback>> {
    callback.read().clone()
}

/// Forwards sync loop output to the host callback
struct CallbackBridge {
    callback: SharedCallback,
}

impl SyncObserver for CallbackBridge {
    fn on_snapshot(&self, snapshot: Option<&PlaybackSnapshot>) {
        if let Some(cb) = current_callback(&self.callback) {
            cb.on_playback_changed(snapshot.map(PlaybackState::from));
        }
    }

    fn on_status(&self, status: &SyncStatus) {
        if let Some(cb) = current_callback(&self.callback) {
            cb.on_status_changed(SyncState::from(status));
            if *status == SyncStatus::SignedOut {
                cb.on_auth_required();
            }
        }
    }
}

/// Main session interface
#[derive(uniffi::Object)]
pub struct Session {
    runtime: Runtime,
    auth: AuthFlow,
    sync: SyncLoop,
    callback: SharedCallback,
}

#[uniffi::export]
impl Session {
    /// Create a new session
    #[uniffi::constructor]
    pub fn new(settings: SessionSettings) -> Result<Arc<Self>, CoreError> {
        init_tracing();

        info!("Initializing playsync-core session");

        let config = load_config(&settings)?;

        let credentials = match config.credentials_path() {
            Some(path) => CredentialStore::open(path)?,
            None => {
                warn!("No config directory, credentials will not outlive the session");
                CredentialStore::in_memory()
            }
        };
        let credentials = Arc::new(credentials);

        let runtime = Runtime::new().map_err(|e| CoreError::RuntimeError(e.to_string()))?;

        let auth = AuthFlow::new(config.auth.clone(), &config.api, credentials.clone())?;
        let client = PlaybackClient::new(&config.api, credentials.clone())?;
        let sync = SyncLoop::new(Arc::new(client), credentials, config.sync.clone());

        let callback: SharedCallback = Arc::new(RwLock::new(None));
        sync.set_observer(Arc::new(CallbackBridge {
            callback: callback.clone(),
        }));

        Ok(Arc::new(Self {
            runtime,
            auth,
            sync,
            callback,
        }))
    }

    /// Set the event callback
    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        *self.callback.write() = Some(Arc::from(callback));
    }

    /// Start a browser login; returns the URL to open
    pub fn begin_login(&self) -> Result<String, CoreError> {
        Ok(self.auth.begin_login()?)
    }

    /// Abandon a browser login that never came back
    pub fn cancel_login(&self) -> Result<(), CoreError> {
        Ok(self.auth.cancel_login()?)
    }

    /// Finish the login with the `code` from the redirect
    pub fn complete_login(&self, code: String) -> Result<(), CoreError> {
        let result = self.runtime.block_on(self.auth.complete_login(&code));
        self.finish_login(result.map(|_| ()))
    }

    /// Finish the login with the full redirect URL
    pub fn complete_login_from_redirect(&self, redirect_url: String) -> Result<(), CoreError> {
        let result = self
            .runtime
            .block_on(self.auth.complete_login_from_redirect(&redirect_url));
        self.finish_login(result.map(|_| ()))
    }

    /// Renew the access token with the stored refresh token
    pub fn refresh_login(&self) -> Result<(), CoreError> {
        match self.runtime.block_on(self.auth.refresh()) {
            Ok(_) => {
                info!("Access token refreshed");
                self.sync.poll_now();
                Ok(())
            }
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                if !self.auth.is_authenticated() {
                    self.notify_auth_required();
                }
                Err(e.into())
            }
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    pub fn auth_state(&self) -> LoginState {
        self.auth.state().into()
    }

    /// Forget the credential and any login in progress
    pub fn logout(&self) -> Result<(), CoreError> {
        info!("Logging out");
        self.auth.logout()?;
        self.sync.poll_now();
        Ok(())
    }

    /// Start polling playback in the background
    pub fn start_sync(&self) {
        let _guard = self.runtime.enter();
        self.sync.start();
    }

    /// Stop polling; no callbacks fire after this returns
    pub fn stop_sync(&self) {
        self.sync.stop();
    }

    /// The playback state last published
    pub fn current_playback(&self) -> Option<PlaybackState> {
        self.sync.snapshot().as_ref().map(PlaybackState::from)
    }

    pub fn sync_state(&self) -> SyncState {
        SyncState::from(&self.sync.status())
    }

    pub fn play_pause(&self) -> Result<(), CoreError> {
        let result = self.runtime.block_on(self.sync.request_play_pause());
        self.report("play_pause", result)
    }

    pub fn seek(&self, position_ms: u64) -> Result<(), CoreError> {
        let result = self.runtime.block_on(self.sync.request_seek(position_ms));
        self.report("seek", result)
    }

    pub fn toggle_favorite(&self) -> Result<(), CoreError> {
        let result = self.runtime.block_on(self.sync.request_favorite_toggle());
        self.report("toggle_favorite", result)
    }

    pub fn skip_next(&self) -> Result<(), CoreError> {
        let result = self.runtime.block_on(self.sync.request_skip_next());
        self.report("skip_next", result)
    }

    pub fn skip_previous(&self) -> Result<(), CoreError> {
        let result = self.runtime.block_on(self.sync.request_skip_previous());
        self.report("skip_previous", result)
    }
}

impl Session {
    /// A lost verifier or a rejected code leaves nothing to resume, so the
    /// user starts over from a clean sign-out.
    fn finish_login(&self, result: Result<(), Error>) -> Result<(), CoreError> {
        match result {
            Ok(()) => {
                info!("Login complete");
                self.sync.poll_now();
                Ok(())
            }
            Err(e @ (Error::MissingVerifier | Error::ExchangeRejected { .. })) => {
                warn!("Login failed, signing out: {}", e);
                if let Err(logout_err) = self.auth.logout() {
                    warn!("Logout after failed login also failed: {}", logout_err);
                }
                self.notify_error(format!("Login failed: {}", e));
                self.notify_auth_required();
                Err(e.into())
            }
            Err(e) => {
                warn!("Login failed: {}", e);
                Err(e.into())
            }
        }
    }

    fn report(&self, action: &str, result: Result<(), Error>) -> Result<(), CoreError> {
        match result {
            Ok(()) => {
                debug!("{} accepted", action);
                Ok(())
            }
            Err(e) => {
                warn!("{} failed: {}", action, e);
                Err(e.into())
            }
        }
    }

    fn notify_auth_required(&self) {
        if let Some(cb) = current_callback(&self.callback) {
            cb.on_auth_required();
        }
    }

    fn notify_error(&self, message: String) {
        if let Some(cb) = current_callback(&self.callback) {
            cb.on_error(message);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.sync.stop();
    }
}

/// Config file, then environment, then explicit settings
fn load_config(settings: &SessionSettings) -> Result<Config, CoreError> {
    let mut config = match settings.config_path.as_deref() {
        Some(path) => Config::load(Path::new(path))?,
        None => Config::default(),
    };
    config.apply_env()?;

    if let Some(client_id) = settings.client_id.as_ref().filter(|s| !s.is_empty()) {
        config.auth.client_id = client_id.clone();
    }
    if let Some(redirect_uri) = settings.redirect_uri.as_ref() {
        config.auth.redirect_uri = redirect_uri.clone();
    }
    if let Some(path) = settings.credentials_path.as_ref() {
        config.storage.credentials_path = Some(path.into());
    }
    if let Some(interval) = settings.poll_interval_ms {
        config.sync.poll_interval_ms = interval;
    }

    config.validate()?;
    Ok(config)
}
