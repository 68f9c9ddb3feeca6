//! Reading session
//!
//! A `Session` owns one open book for one user: it restores the reader's
//! position, tracks active reading time, and turns activity into checkpoints
//! in the position store. `SessionActor` runs a session on its own task so
//! that navigation, timer ticks and sync results are applied one at a time.

mod actor;
mod clock;
mod controller;
mod state;

use std::sync::Arc;

use serde::Serialize;

pub use actor::{SessionActor, SessionHandle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::Session;
pub use state::SessionState;

use crate::authority::RemoteAuthority;
use crate::config::EngineConfig;
use crate::container::ContainerLoader;
use crate::locator::{Position, PositionResolution};
use crate::store::{CheckpointReason, PositionStore};
use crate::sync::SyncHandle;

/// Collaborators a session needs
#[derive(Clone)]
pub struct SessionDeps {
    pub store: PositionStore,
    pub authority: Arc<dyn RemoteAuthority>,
    pub loader: ContainerLoader,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
    /// Where checkpoint and close triggers go; no background sync when absent
    pub sync: Option<SyncHandle>,
}

impl SessionDeps {
    pub fn new(store: PositionStore, authority: Arc<dyn RemoteAuthority>) -> Self {
        Self {
            store,
            authority,
            loader: ContainerLoader::new(),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
            sync: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sync(mut self, sync: SyncHandle) -> Self {
        self.sync = Some(sync);
        self
    }
}

/// Point-in-time view of a session for the rendering surface
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub book_id: Option<String>,
    pub title: Option<String>,
    pub position: Option<Position>,
    pub resolution: Option<PositionResolution>,
    /// Active seconds not yet written to a checkpoint
    pub unflushed_seconds: u64,
}

/// Notifications delivered to the session's owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    CheckpointRecorded {
        reason: CheckpointReason,
        time_spent_seconds: u64,
    },
    /// Another device has read further than the current position
    RemoteAhead(Position),
    Synced { remote_time_spent_seconds: u64 },
    /// Sync keeps failing; progress is safe locally
    SyncDegraded { pending: usize },
    /// The authority refused this book's progress
    SyncRejected { reason: String },
}
