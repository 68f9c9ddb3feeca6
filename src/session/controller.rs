//! Session controller

use chrono::{DateTime, Utc};

use super::{SessionDeps, SessionEvent, SessionSnapshot, SessionState};
use crate::container::{
    BookMetadata, BookStructure, ContainerError, ContainerSource, ContentContainer,
    SectionContent, TocEntry,
};
use crate::error::{EngineError, Result};
use crate::locator::{order_positions, resolve_position, Position, PositionResolution};
use crate::store::{CheckpointReason, ReadingCheckpoint};
use crate::sync::{SyncEvent, SyncTrigger};

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

struct OpenBook {
    book_id: String,
    container: ContentContainer,
    position: Position,
    resolution: PositionResolution,
    /// Last navigation (or open)
    last_activity: DateTime<Utc>,
    /// Start of the span not yet added to `unflushed_ms`; `None` unless reading
    active_since: Option<DateTime<Utc>>,
    last_checkpoint_at: DateTime<Utc>,
    checkpointed_address: String,
    unflushed_ms: u64,
}

impl OpenBook {
    /// Credit active time up to `now`. Nothing past `idle_ms` after the last
    /// navigation counts.
    fn accumulate(&mut self, now: DateTime<Utc>, idle_ms: u64) {
        let Some(since) = self.active_since else {
            return;
        };
        let limit = self.last_activity + chrono::Duration::milliseconds(idle_ms as i64);
        let elapsed = millis_between(since, now.min(limit));
        self.unflushed_ms += elapsed.min(idle_ms);
        self.active_since = Some(now);
    }
}

/// One open book for one user
pub struct Session {
    user_id: String,
    deps: SessionDeps,
    state: SessionState,
    book: Option<OpenBook>,
    events: Vec<SessionEvent>,
    /// Stamped onto every checkpoint
    attributes: serde_json::Map<String, serde_json::Value>,
}

impl Session {
    pub fn new(user_id: &str, deps: SessionDeps) -> Self {
        Self {
            user_id: user_id.to_string(),
            deps,
            state: SessionState::Closed,
            book: None,
            events: Vec::new(),
            attributes: serde_json::Map::new(),
        }
    }

    /// Replace the telemetry carried by later checkpoints (device, app
    /// version and the like). The authority receives it untouched.
    pub fn set_attributes(&mut self, attributes: serde_json::Map<String, serde_json::Value>) {
        self.attributes = attributes;
    }

    pub fn attributes(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.attributes
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::info!(
                user_id = %self.user_id,
                book_id = self.book.as_ref().map(|b| b.book_id.as_str()).unwrap_or(""),
                from = %self.state,
                to = %state,
                "session state"
            );
            self.state = state;
            self.events.push(SessionEvent::StateChanged(state));
        }
    }

    fn not_open(&self, operation: &'static str) -> EngineError {
        match self.state {
            SessionState::Closed => EngineError::NoBookOpen,
            state => EngineError::InvalidState { operation, state },
        }
    }

    fn idle_ms(&self) -> u64 {
        self.deps.config.idle_threshold.as_millis() as u64
    }

    /// Load a book and restore the reader's position
    pub async fn open_book(
        &mut self,
        book_id: &str,
        source: ContainerSource,
    ) -> Result<SessionSnapshot> {
        if !self.state.can_open() {
            return Err(EngineError::InvalidState {
                operation: "open_book",
                state: self.state,
            });
        }

        self.book = None;
        self.set_state(SessionState::Opening);

        let container = match self.deps.loader.open(source).await {
            Ok(container) => container,
            Err(e) => {
                tracing::error!(user_id = %self.user_id, book_id, "failed to open container: {}", e);
                self.set_state(SessionState::Failed);
                return Err(e.into());
            }
        };

        let stored = self.restore_position(book_id).await;
        let (position, resolution) = resolve_position(stored.as_ref(), container.structure());
        let now = self.deps.clock.now();

        tracing::info!(
            user_id = %self.user_id,
            book_id,
            title = %container.metadata().title,
            fraction = position.fraction,
            resolution = ?resolution,
            "opened book"
        );

        self.book = Some(OpenBook {
            book_id: book_id.to_string(),
            container,
            checkpointed_address: position.address.clone(),
            position,
            resolution,
            last_activity: now,
            active_since: None,
            last_checkpoint_at: now,
            unflushed_ms: 0,
        });
        self.set_state(SessionState::Ready);

        Ok(self.snapshot())
    }

    /// Local record first, then the authority. Failures on either side only
    /// degrade the restore.
    async fn restore_position(&self, book_id: &str) -> Option<Position> {
        match self.deps.store.load(&self.user_id, book_id).await {
            Ok(Some(record)) if record.position.is_some() => return record.position,
            Ok(_) => {}
            Err(e) => tracing::warn!(book_id, "could not read local progress: {}", e),
        }

        match self.deps.authority.fetch_position(&self.user_id, book_id).await {
            Ok(Some(remote)) => {
                if let Err(e) = self
                    .deps
                    .store
                    .seed_from_remote(&self.user_id, book_id, &remote)
                    .await
                {
                    tracing::warn!(book_id, "could not store remote progress: {}", e);
                }
                remote.position
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(book_id, "authority unavailable, starting from the beginning: {}", e);
                None
            }
        }
    }

    /// Navigation sink for the rendering surface
    pub async fn on_position_changed(&mut self, address: &str) -> Result<Position> {
        if !self.state.is_open() {
            return Err(self.not_open("on_position_changed"));
        }

        let now = self.deps.clock.now();
        let idle_ms = self.idle_ms();
        let reading = self.state == SessionState::Reading;
        let book = self.book.as_mut().ok_or(EngineError::NoBookOpen)?;

        let position = Position::at_address(address, book.container.structure())?;

        if reading {
            book.accumulate(now, idle_ms);
        } else {
            book.active_since = Some(now);
        }
        book.position = position.clone();
        book.last_activity = now;

        tracing::debug!(address, fraction = position.fraction, "position changed");
        self.set_state(SessionState::Reading);
        Ok(position)
    }

    /// Stop the active-time clock and checkpoint
    pub async fn pause(&mut self) -> Result<Option<ReadingCheckpoint>> {
        match self.state {
            SessionState::Reading => {}
            SessionState::Ready | SessionState::Paused => return Ok(None),
            _ => return Err(self.not_open("pause")),
        }

        let now = self.deps.clock.now();
        self.stop_clock(now);
        self.set_state(SessionState::Paused);
        self.checkpoint(CheckpointReason::Paused, now).await
    }

    /// Periodic housekeeping: idle detection and periodic checkpoints
    pub async fn tick(&mut self) -> Result<Option<ReadingCheckpoint>> {
        if self.state != SessionState::Reading {
            return Ok(None);
        }

        let now = self.deps.clock.now();
        let idle_ms = self.idle_ms();
        let interval_ms = self.deps.config.checkpoint_interval.as_millis() as u64;

        let (idle, due) = {
            let book = self.book.as_mut().ok_or(EngineError::NoBookOpen)?;
            let idle = millis_between(book.last_activity, now) >= idle_ms;
            book.accumulate(now, idle_ms);
            if idle {
                book.active_since = None;
            }
            (idle, millis_between(book.last_checkpoint_at, now) >= interval_ms)
        };

        if idle {
            tracing::info!(user_id = %self.user_id, "no activity, pausing");
            self.set_state(SessionState::Paused);
            return self.checkpoint(CheckpointReason::Idle, now).await;
        }
        if due {
            return self.checkpoint(CheckpointReason::Periodic, now).await;
        }
        Ok(None)
    }

    /// Final checkpoint, then release the book. Sync is triggered, not awaited.
    pub async fn close_book(&mut self) -> Result<()> {
        match self.state {
            SessionState::Closed => return Ok(()),
            SessionState::Opening | SessionState::Failed => {
                self.book = None;
                self.set_state(SessionState::Closed);
                return Ok(());
            }
            _ => {}
        }

        let now = self.deps.clock.now();
        self.stop_clock(now);
        self.set_state(SessionState::Closing);

        let result = self.checkpoint(CheckpointReason::Closing, now).await;

        if let Some(book) = self.book.take() {
            if let Some(sync) = &self.deps.sync {
                sync.trigger(SyncTrigger::SessionClosed {
                    user_id: self.user_id.clone(),
                    book_id: book.book_id.clone(),
                });
            }
            tracing::info!(user_id = %self.user_id, book_id = %book.book_id, "closed book");
        }
        self.set_state(SessionState::Closed);

        result.map(|_| ())
    }

    fn stop_clock(&mut self, now: DateTime<Utc>) {
        let idle_ms = self.idle_ms();
        if let Some(book) = self.book.as_mut() {
            book.accumulate(now, idle_ms);
            book.active_since = None;
        }
    }

    /// Record a checkpoint if there is time or movement to record. Sub-second
    /// remainders carry over to the next checkpoint.
    async fn checkpoint(
        &mut self,
        reason: CheckpointReason,
        now: DateTime<Utc>,
    ) -> Result<Option<ReadingCheckpoint>> {
        let book = self.book.as_mut().ok_or(EngineError::NoBookOpen)?;

        let seconds = book.unflushed_ms / 1000;
        let moved = book.checkpointed_address != book.position.address;
        if seconds == 0 && !moved {
            return Ok(None);
        }

        let checkpoint = ReadingCheckpoint::new(
            &self.user_id,
            &book.book_id,
            book.position.clone(),
            seconds,
            now,
            reason,
        )
        .with_attributes(self.attributes.clone());
        self.deps.store.record_checkpoint(checkpoint.clone()).await?;

        book.unflushed_ms -= seconds * 1000;
        book.last_checkpoint_at = now;
        book.checkpointed_address = book.position.address.clone();

        tracing::debug!(
            book_id = %book.book_id,
            reason = ?reason,
            seconds,
            fraction = book.position.fraction,
            "checkpoint"
        );
        self.events.push(SessionEvent::CheckpointRecorded {
            reason,
            time_spent_seconds: seconds,
        });

        if reason != CheckpointReason::Closing {
            if let Some(sync) = &self.deps.sync {
                sync.trigger(SyncTrigger::CheckpointCaptured {
                    user_id: self.user_id.clone(),
                    book_id: book.book_id.clone(),
                });
            }
        }

        Ok(Some(checkpoint))
    }

    /// Translate a sync event about this session's book
    pub fn observe_sync(&mut self, event: &SyncEvent) -> Vec<SessionEvent> {
        let Some(book) = self.book.as_ref() else {
            return Vec::new();
        };
        if event.user_id() != self.user_id || event.book_id() != book.book_id {
            return Vec::new();
        }

        match event {
            SyncEvent::Synced {
                accepted,
                remote_time_spent_seconds,
                ..
            } => {
                let mut events = vec![SessionEvent::Synced {
                    remote_time_spent_seconds: *remote_time_spent_seconds,
                }];
                if let Some(accepted) = accepted {
                    if order_positions(accepted, &book.position).is_gt() {
                        events.push(SessionEvent::RemoteAhead(accepted.clone()));
                    }
                }
                events
            }
            SyncEvent::Degraded { pending, .. } => {
                vec![SessionEvent::SyncDegraded { pending: *pending }]
            }
            SyncEvent::Rejected { reason, .. } => vec![SessionEvent::SyncRejected {
                reason: reason.clone(),
            }],
            SyncEvent::Deferred { .. } => Vec::new(),
        }
    }

    /// Events produced since the last call
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let book = self.book.as_ref();
        SessionSnapshot {
            state: self.state,
            book_id: book.map(|b| b.book_id.clone()),
            title: book.map(|b| b.container.metadata().title.clone()),
            position: book.map(|b| b.position.clone()),
            resolution: book.map(|b| b.resolution.clone()),
            unflushed_seconds: book.map(|b| b.unflushed_ms / 1000).unwrap_or(0),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn book_id(&self) -> Option<&str> {
        self.book.as_ref().map(|b| b.book_id.as_str())
    }

    pub fn current_position(&self) -> Option<&Position> {
        self.book.as_ref().map(|b| &b.position)
    }

    pub fn current_address(&self) -> Option<&str> {
        self.book.as_ref().map(|b| b.position.address.as_str())
    }

    pub fn current_fraction(&self) -> Option<f64> {
        self.book.as_ref().map(|b| b.position.fraction)
    }

    /// How the restored position was obtained
    pub fn resolution(&self) -> Option<&PositionResolution> {
        self.book.as_ref().map(|b| &b.resolution)
    }

    fn open_book_ref(&self) -> Result<&OpenBook> {
        self.book.as_ref().ok_or(EngineError::NoBookOpen)
    }

    pub fn structure(&self) -> Result<&BookStructure> {
        Ok(self.open_book_ref()?.container.structure())
    }

    pub fn table_of_contents(&self) -> Result<&[TocEntry]> {
        Ok(self.open_book_ref()?.container.structure().table_of_contents())
    }

    pub fn metadata(&self) -> Result<&BookMetadata> {
        Ok(self.open_book_ref()?.container.metadata())
    }

    /// Raw content of a spine section
    pub fn section(&self, index: usize) -> Result<SectionContent> {
        self.open_book_ref()?
            .container
            .section(index)
            .map_err(|e| match e {
                ContainerError::SectionOutOfRange(i) => EngineError::SectionNotFound(i),
                other => EngineError::MalformedContainer(other),
            })
    }
}
