//! Sync loop behaviour under paused time, against a scripted player

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use common::{signed_in_store, snapshot, FakeApi, Recorder, Reply};
use parking_lot::Mutex;
use playsync_core::config::SyncConfig;
use playsync_core::{
    CredentialStore, Error, PlaybackSnapshot, SyncLoop, SyncObserver, SyncStatus,
};

fn sync_config() -> SyncConfig {
    SyncConfig::default()
}

#[tokio::test(start_paused = true)]
async fn seek_is_shown_until_server_confirms() {
    let api = FakeApi::playing(snapshot("t1", 60_000));
    let sync = SyncLoop::new(api.clone(), signed_in_store(), sync_config());
    let recorder = Recorder::new();
    sync.set_observer(recorder.clone());

    assert!(sync.poll_once().await);
    assert_eq!(recorder.last().unwrap().progress_ms, 60_000);

    sync.request_seek(5_000).await.unwrap();
    assert_eq!(recorder.last().unwrap().progress_ms, 5_000);
    assert_eq!(api.commands(), vec!["seek:5000"]);

    // The server has not applied the seek yet
    api.set_current(Some(snapshot("t1", 61_000)));
    tokio::time::advance(Duration::from_millis(500)).await;
    sync.poll_once().await;
    assert_eq!(recorder.last().unwrap().progress_ms, 5_000);
    assert_eq!(sync.pending_edits(), 1);

    api.set_current(Some(snapshot("t1", 5_450)));
    tokio::time::advance(Duration::from_millis(500)).await;
    sync.poll_once().await;
    assert_eq!(recorder.last().unwrap().progress_ms, 5_450);
    assert_eq!(sync.pending_edits(), 0);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_seek_yields_to_server_after_settle_time() {
    let api = FakeApi::playing(snapshot("t1", 60_000));
    let sync = SyncLoop::new(api.clone(), signed_in_store(), sync_config());
    sync.poll_once().await;

    sync.request_seek(5_000).await.unwrap();
    assert_eq!(sync.snapshot().unwrap().progress_ms, 5_000);

    api.set_current(Some(snapshot("t1", 62_000)));
    tokio::time::advance(Duration::from_millis(1_999)).await;
    sync.poll_once().await;
    assert_eq!(sync.snapshot().unwrap().progress_ms, 5_000);

    tokio::time::advance(Duration::from_millis(1)).await;
    sync.poll_once().await;
    assert_eq!(sync.snapshot().unwrap().progress_ms, 62_000);
    assert_eq!(sync.pending_edits(), 0);
}

#[tokio::test(start_paused = true)]
async fn seek_is_clamped_to_duration() {
    let api = FakeApi::playing(snapshot("t1", 0));
    let sync = SyncLoop::new(api.clone(), signed_in_store(), sync_config());
    sync.poll_once().await;

    sync.request_seek(999_999).await.unwrap();
    assert_eq!(api.commands(), vec!["seek:200000"]);
    assert_eq!(sync.snapshot().unwrap().progress_ms, 200_000);
}

#[tokio::test(start_paused = true)]
async fn like_survives_library_propagation_lag() {
    let api = FakeApi::playing(snapshot("t1", 10_000));
    let sync = SyncLoop::new(api.clone(), signed_in_store(), sync_config());
    let recorder = Recorder::new();
    sync.set_observer(recorder.clone());
    sync.poll_once().await;

    sync.request_favorite_toggle().await.unwrap();
    assert_eq!(api.commands(), vec!["favorite:t1:true"]);
    assert!(recorder.last().unwrap().is_favorite);

    // The library check keeps answering "not liked" for a while
    for _ in 0..3 {
        tokio::time::advance(Duration::from_millis(1_000)).await;
        sync.poll_once().await;
        assert!(recorder.last().unwrap().is_favorite);
    }

    tokio::time::advance(Duration::from_millis(600)).await;
    sync.poll_once().await;
    assert!(!recorder.last().unwrap().is_favorite);
}

#[tokio::test(start_paused = true)]
async fn track_change_drops_favorite_edit() {
    let api = FakeApi::playing(snapshot("t1", 10_000));
    let sync = SyncLoop::new(api.clone(), signed_in_store(), sync_config());
    sync.poll_once().await;
    sync.request_favorite_toggle().await.unwrap();

    api.set_current(Some(snapshot("t2", 0)));
    sync.poll_once().await;

    let shown = sync.snapshot().unwrap();
    assert_eq!(shown.track_id, "t2");
    assert!(!shown.is_favorite);
    assert_eq!(sync.pending_edits(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_poll_is_skipped_not_queued() {
    let api = FakeApi::playing(snapshot("t1", 0));
    api.set_latency(Duration::from_millis(300));
    let sync = SyncLoop::new(api.clone(), signed_in_store(), sync_config());

    let (first, second) = tokio::join!(sync.poll_once(), sync.poll_once());
    assert!(first);
    assert!(!second);
    assert_eq!(api.poll_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn running_loop_never_overlaps_slow_polls() {
    let api = FakeApi::playing(snapshot("t1", 0));
    api.set_latency(Duration::from_millis(350));
    let config = SyncConfig {
        poll_interval_ms: 100,
        ..sync_config()
    };
    let sync = SyncLoop::new(api.clone(), signed_in_store(), config);

    sync.start();
    tokio::time::sleep(Duration::from_secs(5)).await;
    sync.stop();

    assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
    let polls = api.poll_count();
    assert!((5..=12).contains(&polls), "unexpected poll count {}", polls);
}

#[tokio::test(start_paused = true)]
async fn start_twice_runs_one_loop() {
    let api = FakeApi::playing(snapshot("t1", 0));
    api.set_latency(Duration::from_millis(200));
    let sync = SyncLoop::new(api.clone(), signed_in_store(), sync_config());

    sync.start();
    sync.start();
    assert!(sync.is_running());
    tokio::time::sleep(Duration::from_secs(3)).await;
    sync.stop();

    assert!(!sync.is_running());
    assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_discards_in_flight_poll() {
    let api = FakeApi::playing(snapshot("t1", 0));
    api.set_latency(Duration::from_millis(500));
    let sync = SyncLoop::new(api.clone(), signed_in_store(), sync_config());
    let recorder = Recorder::new();
    sync.set_observer(recorder.clone());

    sync.start();
    api.poll_started.notified().await;
    sync.stop();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(recorder.event_count(), 0);
    assert!(sync.snapshot().is_none());
}

#[tokio::test(start_paused = true)]
async fn manual_poll_after_stop_publishes_nothing() {
    let api = FakeApi::playing(snapshot("t1", 0));
    let sync = SyncLoop::new(api.clone(), signed_in_store(), sync_config());
    let recorder = Recorder::new();
    sync.set_observer(recorder.clone());

    sync.stop();
    sync.poll_once().await;
    assert_eq!(recorder.event_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn restart_after_stop_publishes_again() {
    let api = FakeApi::playing(snapshot("t1", 0));
    let sync = SyncLoop::new(api.clone(), signed_in_store(), sync_config());
    let recorder = Recorder::new();
    sync.set_observer(recorder.clone());

    sync.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    sync.stop();
    let published = recorder.snapshots().len();
    assert!(published >= 1);

    sync.start();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    sync.stop();
    assert!(recorder.snapshots().len() > published);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_keeps_last_snapshot() {
    let api = FakeApi::playing(snapshot("t1", 1_000));
    api.push(Reply::Playing(Some(snapshot("t1", 1_000))));
    api.push(Reply::Unavailable);
    let sync = SyncLoop::new(api.clone(), signed_in_store(), sync_config());
    let recorder = Recorder::new();
    sync.set_observer(recorder.clone());

    sync.poll_once().await;
    sync.poll_once().await;

    assert_eq!(sync.snapshot().unwrap().track_id, "t1");
    assert_eq!(recorder.snapshots().len(), 1);
    match recorder.last_status() {
        Some(SyncStatus::Degraded {
            consecutive_failures,
            ..
        }) => assert_eq!(consecutive_failures, 1),
        other => panic!("expected degraded status, got {:?}", other),
    }

    sync.poll_once().await;
    assert_eq!(recorder.last_status(), Some(SyncStatus::Live));
}

#[tokio::test(start_paused = true)]
async fn unauthorized_poll_signs_out() {
    let store = signed_in_store();
    let api = FakeApi::playing(snapshot("t1", 0));
    let sync = SyncLoop::new(api.clone(), store.clone(), sync_config());
    let recorder = Recorder::new();
    sync.set_observer(recorder.clone());

    sync.poll_once().await;
    assert_eq!(sync.status(), SyncStatus::Live);

    api.push(Reply::Rejected(401));
    sync.poll_once().await;

    assert!(store.load().is_none());
    assert!(sync.snapshot().is_none());
    assert_eq!(recorder.last(), None);
    assert_eq!(recorder.last_status(), Some(SyncStatus::SignedOut));

    // No credential, no remote calls
    sync.poll_once().await;
    assert_eq!(api.poll_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn signed_out_poll_skips_remote() {
    let api = FakeApi::playing(snapshot("t1", 0));
    let sync = SyncLoop::new(api.clone(), Arc::new(CredentialStore::in_memory()), sync_config());
    let recorder = Recorder::new();
    sync.set_observer(recorder.clone());

    sync.poll_once().await;
    sync.poll_once().await;

    assert_eq!(api.poll_count(), 0);
    assert!(recorder.snapshots().is_empty());
    assert_eq!(recorder.statuses(), vec![SyncStatus::SignedOut]);
}

#[tokio::test(start_paused = true)]
async fn nothing_playing_clears_snapshot() {
    let api = FakeApi::playing(snapshot("t1", 0));
    let sync = SyncLoop::new(api.clone(), signed_in_store(), sync_config());
    sync.poll_once().await;

    api.set_current(None);
    sync.poll_once().await;
    assert!(sync.snapshot().is_none());
    assert_eq!(sync.status(), SyncStatus::NothingPlaying);

    assert!(matches!(sync.request_seek(1_000).await, Err(Error::NothingPlaying)));
    assert!(matches!(
        sync.request_favorite_toggle().await,
        Err(Error::NothingPlaying)
    ));

    // Play with nothing shown asks the remote to resume
    sync.request_play_pause().await.unwrap();
    assert_eq!(api.commands(), vec!["play"]);
}

#[tokio::test(start_paused = true)]
async fn failed_command_rolls_back_edit() {
    let api = FakeApi::playing(snapshot("t1", 0));
    let sync = SyncLoop::new(api.clone(), signed_in_store(), sync_config());
    let recorder = Recorder::new();
    sync.set_observer(recorder.clone());
    sync.poll_once().await;

    api.fail_commands(Some(404));
    let result = sync.request_play_pause().await;
    assert!(matches!(result, Err(Error::RemoteRejected { status: 404 })));
    assert_eq!(api.commands(), vec!["pause"]);

    let playing: Vec<bool> = recorder
        .snapshots()
        .into_iter()
        .map(|s| s.unwrap().is_playing)
        .collect();
    assert_eq!(playing, vec![true, false, true]);
    assert_eq!(sync.pending_edits(), 0);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_command_signs_out() {
    let store = signed_in_store();
    let api = FakeApi::playing(snapshot("t1", 0));
    let sync = SyncLoop::new(api.clone(), store.clone(), sync_config());
    sync.poll_once().await;

    api.fail_commands(Some(401));
    assert!(sync.request_favorite_toggle().await.is_err());
    assert!(store.load().is_none());
    assert_eq!(sync.status(), SyncStatus::SignedOut);
    assert!(matches!(
        sync.request_play_pause().await,
        Err(Error::Unauthenticated)
    ));
}

#[tokio::test(start_paused = true)]
async fn outage_backs_off() {
    let api = FakeApi::new();
    for _ in 0..100 {
        api.push(Reply::Unavailable);
    }
    let config = SyncConfig {
        poll_interval_ms: 100,
        retry_base_ms: 1_000,
        retry_max_ms: 3_000,
        ..sync_config()
    };
    let sync = SyncLoop::new(api.clone(), signed_in_store(), config);

    sync.start();
    tokio::time::sleep(Duration::from_secs(10)).await;
    sync.stop();

    // Polls at 0s, 1s, 3s, 6s, 9s
    let polls = api.poll_count();
    assert!((4..=6).contains(&polls), "unexpected poll count {}", polls);
    assert!(sync.status().is_degraded());
}

#[tokio::test(start_paused = true)]
async fn skip_wakes_loop_for_immediate_poll() {
    let api = FakeApi::playing(snapshot("t1", 0));
    let config = SyncConfig {
        poll_interval_ms: 60_000,
        ..sync_config()
    };
    let sync = SyncLoop::new(api.clone(), signed_in_store(), config);

    sync.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(api.poll_count(), 1);

    api.set_current(Some(snapshot("t2", 0)));
    sync.request_skip_next().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    sync.stop();

    assert_eq!(api.commands(), vec!["next"]);
    assert_eq!(api.poll_count(), 2);
    assert_eq!(sync.snapshot().unwrap().track_id, "t2");
}

/// Observer that reads the loop back from inside its callbacks
#[derive(Default)]
struct ReadBack {
    sync: Mutex<Weak<SyncLoop>>,
    stop_on_snapshot: AtomicBool,
    /// What `snapshot()` and `status()` returned during each `on_snapshot`
    seen: Mutex<Vec<(Option<PlaybackSnapshot>, SyncStatus)>>,
    statuses: Mutex<Vec<SyncStatus>>,
}

impl ReadBack {
    fn attach(sync: &Arc<SyncLoop>) -> Arc<Self> {
        let observer = Arc::new(Self::default());
        *observer.sync.lock() = Arc::downgrade(sync);
        sync.set_observer(observer.clone());
        observer
    }
}

impl SyncObserver for ReadBack {
    fn on_snapshot(&self, _snapshot: Option<&PlaybackSnapshot>) {
        let Some(sync) = self.sync.lock().upgrade() else {
            return;
        };
        self.seen.lock().push((sync.snapshot(), sync.status()));
        if self.stop_on_snapshot.load(Ordering::SeqCst) {
            sync.stop();
        }
    }

    fn on_status(&self, status: &SyncStatus) {
        self.statuses.lock().push(status.clone());
    }
}

#[tokio::test(start_paused = true)]
async fn observer_can_read_loop_from_callback() {
    let api = FakeApi::playing(snapshot("t1", 60_000));
    let sync = Arc::new(SyncLoop::new(api, signed_in_store(), sync_config()));
    let observer = ReadBack::attach(&sync);

    assert!(sync.poll_once().await);
    sync.request_seek(5_000).await.unwrap();

    let seen = observer.seen.lock().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0.as_ref().unwrap().progress_ms, 60_000);
    assert_eq!(seen[0].1, SyncStatus::Live);
    assert_eq!(seen[1].0.as_ref().unwrap().progress_ms, 5_000);
    assert_eq!(*observer.statuses.lock(), vec![SyncStatus::Live]);
}

#[tokio::test(start_paused = true)]
async fn observer_can_stop_loop_from_callback() {
    let api = FakeApi::playing(snapshot("t1", 0));
    let sync = Arc::new(SyncLoop::new(api, signed_in_store(), sync_config()));
    let observer = ReadBack::attach(&sync);
    observer.stop_on_snapshot.store(true, Ordering::SeqCst);

    sync.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!sync.is_running());

    // The status queued behind the first snapshot is never delivered
    assert_eq!(observer.seen.lock().len(), 1);
    assert!(observer.statuses.lock().is_empty());

    sync.poll_once().await;
    assert_eq!(observer.seen.lock().len(), 1);
}
