//! The playback sync loop
//!
//! Polls the remote player, reconciles the result with outstanding user
//! edits and publishes one snapshot per tick to an observer. User actions go
//! through the same reconciliation so the observer only ever sees snapshots
//! produced by one writer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pending::{Intent, PendingEdits};
use super::snapshot::{PlaybackSnapshot, SyncStatus};
use crate::config::SyncConfig;
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::spotify::PlaybackApi;

/// Receives what the loop publishes
///
/// Events arrive in publication order, one at a time, with no loop lock held
/// except the delivery lock. Implementations may read the [`SyncLoop`] or
/// call [`SyncLoop::stop`] from a callback; once `stop` returns no further
/// event is delivered.
pub trait SyncObserver: Send + Sync {
    /// The displayed snapshot, `None` when nothing is playing or signed out
    fn on_snapshot(&self, snapshot: Option<&PlaybackSnapshot>);

    /// Only called when the status changes
    fn on_status(&self, status: &SyncStatus);
}

/// Published but not yet delivered
enum Event {
    Snapshot(Option<PlaybackSnapshot>),
    Status(SyncStatus),
}

struct State {
    /// Last snapshot the server reported
    server: Option<PlaybackSnapshot>,
    /// Server snapshot with live edits applied
    published: Option<PlaybackSnapshot>,
    edits: PendingEdits,
    status: SyncStatus,
    consecutive_failures: u32,
    stopped: bool,
    /// Bumped on every start and stop; polls from an older epoch are discarded
    epoch: u64,
    outbox: VecDeque<Event>,
}

impl State {
    fn is_current(&self, epoch: u64) -> bool {
        !self.stopped && self.epoch == epoch
    }
}

struct Shared {
    api: Arc<dyn PlaybackApi>,
    credentials: Arc<CredentialStore>,
    config: SyncConfig,
    observer: RwLock<Option<Arc<dyn SyncObserver>>>,
    state: Mutex<State>,
    /// Held while events are handed to the observer, and by `stop`
    delivery: ReentrantMutex<()>,
    in_flight: AtomicBool,
    wake: Notify,
}

/// Marks a poll as outstanding until dropped
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Cooperative single-flight poller for the remote player
pub struct SyncLoop {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl SyncLoop {
    pub fn new(
        api: Arc<dyn PlaybackApi>,
        credentials: Arc<CredentialStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                api,
                credentials,
                config,
                observer: RwLock::new(None),
                state: Mutex::new(State {
                    server: None,
                    published: None,
                    edits: PendingEdits::new(),
                    status: SyncStatus::Starting,
                    consecutive_failures: 0,
                    stopped: false,
                    epoch: 0,
                    outbox: VecDeque::new(),
                }),
                delivery: ReentrantMutex::new(()),
                in_flight: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn SyncObserver>) {
        *self.shared.observer.write() = Some(observer);
    }

    pub fn clear_observer(&self) {
        *self.shared.observer.write() = None;
    }

    /// Spawn the poll task on the current tokio runtime. No-op when running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("Sync loop already running");
            return;
        }

        {
            let mut state = self.shared.state.lock();
            state.stopped = false;
            state.epoch += 1;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(self.shared.clone(), cancel.clone()));
        *running = Some(Running { cancel, handle });
    }

    /// Stop polling. Once this returns nothing more is published, including
    /// the result of a poll that was still in flight.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.cancel.cancel();
        }

        // Waits out a delivery running on another thread
        let _delivery = self.shared.delivery.lock();
        let mut state = self.shared.state.lock();
        state.stopped = true;
        state.epoch += 1;
        state.outbox.clear();
        debug!("Sync loop stopped at epoch {}", state.epoch);
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Run one tick now. Returns `false` if a poll was already in flight.
    pub async fn poll_once(&self) -> bool {
        self.shared.poll().await
    }

    /// Ask the running loop to poll without waiting for the interval
    pub fn poll_now(&self) {
        self.shared.wake.notify_one();
    }

    /// The snapshot last published
    pub fn snapshot(&self) -> Option<PlaybackSnapshot> {
        self.shared.state.lock().published.clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.shared.state.lock().status.clone()
    }

    pub fn pending_edits(&self) -> usize {
        self.shared.state.lock().edits.len()
    }

    /// Toggle play/pause against the displayed state
    ///
    /// With nothing displayed this asks the remote to resume.
    pub async fn request_play_pause(&self) -> Result<()> {
        self.ensure_signed_in()?;

        let (play, generation) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            match state.published.as_ref().map(|s| !s.is_playing) {
                Some(play) => {
                    let generation = state.edits.insert(
                        Intent::Playing(play),
                        None,
                        Instant::now(),
                        self.shared.config.play_pause_settle(),
                    );
                    self.shared.republish(state);
                    (play, Some(generation))
                }
                None => (true, None),
            }
        };
        self.shared.deliver();

        debug!("{} requested", if play { "Play" } else { "Pause" });
        let result = if play {
            self.shared.api.play().await
        } else {
            self.shared.api.pause().await
        };
        self.shared.settle(generation, result)
    }

    /// Seek the current item; the position is clamped to its duration
    pub async fn request_seek(&self, position_ms: u64) -> Result<()> {
        self.ensure_signed_in()?;

        let (target, duration_ms, generation) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let current = state.published.as_ref().ok_or(Error::NothingPlaying)?;
            let duration_ms = current.duration_ms;
            let target = position_ms.min(duration_ms);
            let track_id = current.track_id.clone();

            let generation = state.edits.insert(
                Intent::Seek {
                    position_ms: target,
                },
                Some(track_id),
                Instant::now(),
                self.shared.config.seek_settle(),
            );
            self.shared.republish(state);
            (target, duration_ms, generation)
        };
        self.shared.deliver();

        debug!("Seek to {}ms requested", target);
        let result = self.shared.api.seek(target as i64, duration_ms).await;
        self.shared.settle(Some(generation), result)
    }

    /// Like or unlike the current item
    pub async fn request_favorite_toggle(&self) -> Result<()> {
        self.ensure_signed_in()?;

        let (track_id, favorite, generation) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let current = state.published.as_ref().ok_or(Error::NothingPlaying)?;
            let favorite = !current.is_favorite;
            let track_id = current.track_id.clone();

            let generation = state.edits.insert(
                Intent::Favorite(favorite),
                Some(track_id.clone()),
                Instant::now(),
                self.shared.config.favorite_settle(),
            );
            self.shared.republish(state);
            (track_id, favorite, generation)
        };
        self.shared.deliver();

        debug!("Favorite={} requested", favorite);
        let result = self.shared.api.set_favorite(&track_id, favorite).await;
        self.shared.settle(Some(generation), result)
    }

    pub async fn request_skip_next(&self) -> Result<()> {
        self.ensure_signed_in()?;
        let result = self.shared.api.skip_next().await;
        self.shared.settle(None, result)?;
        self.poll_now();
        Ok(())
    }

    pub async fn request_skip_previous(&self) -> Result<()> {
        self.ensure_signed_in()?;
        let result = self.shared.api.skip_previous().await;
        self.shared.settle(None, result)?;
        self.poll_now();
        Ok(())
    }

    fn ensure_signed_in(&self) -> Result<()> {
        match self.shared.credentials.load() {
            Some(_) => Ok(()),
            None => Err(Error::Unauthenticated),
        }
    }
}

impl Drop for SyncLoop {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    info!(
        "Sync loop started ({}ms interval)",
        shared.config.poll_interval_ms
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shared.poll() => {}
        }

        let delay = shared.next_delay();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shared.wake.notified() => debug!("Immediate poll requested"),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("Sync loop ended");
}

impl Shared {
    async fn poll(&self) -> bool {
        let Some(_flight) = FlightGuard::acquire(&self.in_flight) else {
            debug!("Poll already in flight, skipping");
            return false;
        };
        let epoch = self.state.lock().epoch;

        if self.credentials.load().is_none() {
            {
                let mut state = self.state.lock();
                if state.is_current(epoch) {
                    self.enter_signed_out(&mut state);
                }
            }
            self.deliver();
            return true;
        }

        let result = self.api.current_playback().await;
        self.apply_poll(epoch, result, Instant::now());
        self.deliver();
        true
    }

    fn apply_poll(&self, epoch: u64, result: Result<Option<PlaybackSnapshot>>, now: Instant) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.is_current(epoch) {
            debug!("Discarding poll result from epoch {}", epoch);
            return;
        }

        match result {
            Ok(Some(server)) => {
                state.consecutive_failures = 0;
                let shown = state
                    .edits
                    .reconcile(&server, now, self.config.seek_tolerance());
                state.server = Some(server);
                state.published = Some(shown);
                self.emit_snapshot(state);
                self.set_status(state, SyncStatus::Live);
            }
            Ok(None) => {
                state.consecutive_failures = 0;
                state.server = None;
                state.published = None;
                state.edits.clear();
                self.emit_snapshot(state);
                self.set_status(state, SyncStatus::NothingPlaying);
            }
            Err(e) if e.is_auth_failure() => {
                warn!("Playback read was not authorized: {}", e);
                self.sign_out(state);
            }
            Err(e) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                let failures = state.consecutive_failures;
                warn!("Poll failed ({} in a row): {}", failures, e);
                self.set_status(
                    state,
                    SyncStatus::Degraded {
                        reason: e.to_string(),
                        consecutive_failures: failures,
                    },
                );
            }
        }
    }

    fn next_delay(&self) -> Duration {
        let failures = self.state.lock().consecutive_failures;
        self.config.retry_delay(failures)
    }

    /// Outcome of a user command: roll back its edit on failure
    fn settle(&self, generation: Option<u64>, result: Result<()>) -> Result<()> {
        let Err(e) = result else {
            return Ok(());
        };

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(generation) = generation {
                if state.edits.rollback(generation) {
                    debug!("Rolled back edit {}: {}", generation, e);
                    self.republish(state);
                }
            }
            if e.is_auth_failure() {
                self.sign_out(state);
            }
        }
        self.deliver();
        Err(e)
    }

    /// Re-derive the displayed snapshot after the edit set changed
    fn republish(&self, state: &mut State) {
        if let Some(server) = state.server.as_ref() {
            state.published = Some(state.edits.overlay(server, Instant::now()));
            self.emit_snapshot(state);
        }
    }

    fn sign_out(&self, state: &mut State) {
        if let Err(e) = self.credentials.clear() {
            warn!("Failed to clear credentials: {}", e);
        }
        self.enter_signed_out(state);
    }

    fn enter_signed_out(&self, state: &mut State) {
        state.server = None;
        state.edits.clear();
        state.consecutive_failures = 0;
        if state.published.take().is_some() {
            self.emit_snapshot(state);
        }
        self.set_status(state, SyncStatus::SignedOut);
    }

    fn emit_snapshot(&self, state: &mut State) {
        if state.stopped {
            return;
        }
        let published = state.published.clone();
        state.outbox.push_back(Event::Snapshot(published));
    }

    fn set_status(&self, state: &mut State, status: SyncStatus) {
        if state.status == status {
            return;
        }
        debug!("Sync status: {:?}", status);
        state.status = status.clone();

        if !state.stopped {
            state.outbox.push_back(Event::Status(status));
        }
    }

    /// Hand queued events to the observer. Must be called without the state
    /// lock; a nested call from inside a callback drains the same queue.
    fn deliver(&self) {
        let _delivery = self.delivery.lock();
        loop {
            let event = {
                let mut state = self.state.lock();
                if state.stopped {
                    state.outbox.clear();
                }
                state.outbox.pop_front()
            };
            let Some(event) = event else {
                break;
            };

            let observer = self.observer.read().clone();
            let Some(observer) = observer else {
                continue;
            };
            match event {
                Event::Snapshot(snapshot) => observer.on_snapshot(snapshot.as_ref()),
                Event::Status(status) => observer.on_status(&status),
            }
        }
    }
}
