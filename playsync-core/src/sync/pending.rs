//! Optimistic edits and their reconciliation against server state
//!
//! A user action records what the user asked for as a [`PendingEdit`]. Until
//! the server reports the same value, or the edit's settle deadline passes,
//! the displayed snapshot shows the edit instead of the server value. There is
//! at most one edit per field; a newer one replaces the older.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::snapshot::PlaybackSnapshot;

/// Which part of the snapshot an edit overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditField {
    Seek,
    PlayPause,
    Favorite,
}

/// The value the user asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Seek { position_ms: u64 },
    Playing(bool),
    Favorite(bool),
}

impl Intent {
    pub fn field(&self) -> EditField {
        match self {
            Intent::Seek { .. } => EditField::Seek,
            Intent::Playing(_) => EditField::PlayPause,
            Intent::Favorite(_) => EditField::Favorite,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingEdit {
    pub intent: Intent,
    /// Track the edit was made against; `None` for edits that survive a track change
    pub track_id: Option<String>,
    pub created_at: Instant,
    pub deadline: Instant,
    /// Identifies the edit for rollback
    pub generation: u64,
}

impl PendingEdit {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    fn applies_to(&self, snapshot: &PlaybackSnapshot) -> bool {
        self.track_id
            .as_deref()
            .map_or(true, |id| id == snapshot.track_id)
    }

    /// Whether the server already reflects this edit
    ///
    /// A seek counts as applied when the server position is near the target,
    /// allowing for playback having moved on since the edit was made.
    fn is_satisfied_by(
        &self,
        server: &PlaybackSnapshot,
        now: Instant,
        seek_tolerance: Duration,
    ) -> bool {
        match self.intent {
            Intent::Seek { position_ms } => {
                let tolerance = seek_tolerance.as_millis() as u64;
                let elapsed = now.saturating_duration_since(self.created_at).as_millis() as u64;
                let low = position_ms.saturating_sub(tolerance);
                let high = position_ms
                    .saturating_add(elapsed)
                    .saturating_add(tolerance);
                (low..=high).contains(&server.progress_ms)
            }
            Intent::Playing(playing) => server.is_playing == playing,
            Intent::Favorite(favorite) => server.is_favorite == favorite,
        }
    }

    fn apply(&self, snapshot: &mut PlaybackSnapshot) {
        match self.intent {
            Intent::Seek { position_ms } => {
                snapshot.progress_ms = position_ms.min(snapshot.duration_ms);
            }
            Intent::Playing(playing) => snapshot.is_playing = playing,
            Intent::Favorite(favorite) => snapshot.is_favorite = favorite,
        }
    }
}

/// The set of outstanding edits, one per field
#[derive(Debug, Default)]
pub struct PendingEdits {
    edits: Vec<PendingEdit>,
    next_generation: u64,
}

impl PendingEdits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an edit, replacing any earlier edit on the same field.
    /// Returns the generation to use for rollback.
    pub fn insert(
        &mut self,
        intent: Intent,
        track_id: Option<String>,
        now: Instant,
        settle: Duration,
    ) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        let field = intent.field();

        self.edits.retain(|e| e.intent.field() != field);
        self.edits.push(PendingEdit {
            intent,
            track_id,
            created_at: now,
            deadline: now + settle,
            generation,
        });
        generation
    }

    /// Remove the edit with this generation, if it is still outstanding.
    /// A newer edit on the same field is left alone.
    pub fn rollback(&mut self, generation: u64) -> bool {
        let before = self.edits.len();
        self.edits.retain(|e| e.generation != generation);
        self.edits.len() != before
    }

    /// Settle edits against a fresh server snapshot and return what to display
    ///
    /// Edits the server confirms, edits past their deadline and edits made
    /// against a different track are dropped. The rest override the server.
    pub fn reconcile(
        &mut self,
        server: &PlaybackSnapshot,
        now: Instant,
        seek_tolerance: Duration,
    ) -> PlaybackSnapshot {
        self.edits.retain(|edit| {
            if !edit.applies_to(server) {
                debug!("Dropping {:?} edit: track changed", edit.intent.field());
                false
            } else if edit.is_satisfied_by(server, now, seek_tolerance) {
                debug!("{:?} edit confirmed by server", edit.intent.field());
                false
            } else if edit.is_expired(now) {
                debug!("{:?} edit expired, server value wins", edit.intent.field());
                false
            } else {
                true
            }
        });
        self.overlay(server, now)
    }

    /// Apply live edits to a server snapshot without settling them
    pub fn overlay(&self, server: &PlaybackSnapshot, now: Instant) -> PlaybackSnapshot {
        let mut shown = server.clone();
        for edit in &self.edits {
            if edit.applies_to(server) && !edit.is_expired(now) {
                edit.apply(&mut shown);
            }
        }
        shown
    }

    pub fn get(&self, field: EditField) -> Option<&PendingEdit> {
        self.edits.iter().find(|e| e.intent.field() == field)
    }

    pub fn clear(&mut self) {
        self.edits.clear();
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}
