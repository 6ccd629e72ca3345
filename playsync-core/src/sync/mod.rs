//! Sync Engine
//!
//! Keeps a displayed playback snapshot in step with the remote player.

mod engine;
mod pending;
mod snapshot;

pub use engine::{SyncLoop, SyncObserver};
pub use pending::{EditField, Intent, PendingEdit, PendingEdits};
pub use snapshot::*;
