//! Session actor
//!
//! Runs a `Session` on its own task. Navigation, pause and close requests,
//! timer ticks and sync results all arrive on one queue and are applied in
//! order, so a tick can never interleave with a half-applied navigation.

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{Session, SessionEvent, SessionSnapshot};
use crate::container::{BookMetadata, ContainerSource, SectionContent, TocEntry};
use crate::error::{EngineError, Result};
use crate::locator::Position;
use crate::store::ReadingCheckpoint;
use crate::sync::SyncEvent;

const COMMAND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 256;
const DEFAULT_TICK: Duration = Duration::from_secs(1);

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Open {
        book_id: String,
        source: ContainerSource,
        reply: Reply<SessionSnapshot>,
    },
    Navigate {
        address: String,
        reply: Reply<Position>,
    },
    Pause {
        reply: Reply<Option<ReadingCheckpoint>>,
    },
    Close {
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
    Section {
        index: usize,
        reply: Reply<SectionContent>,
    },
    TableOfContents {
        reply: Reply<Vec<TocEntry>>,
    },
    Metadata {
        reply: Reply<BookMetadata>,
    },
    SetAttributes {
        attributes: serde_json::Map<String, serde_json::Value>,
        reply: Reply<()>,
    },
}

/// Cloneable front end of a running session. Dropping every handle closes
/// the open book and stops the actor.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| EngineError::ActorStopped)?;
        rx.await.map_err(|_| EngineError::ActorStopped)?
    }

    pub async fn open_book(&self, book_id: &str, source: ContainerSource) -> Result<SessionSnapshot> {
        let book_id = book_id.to_string();
        self.request(|reply| Command::Open {
            book_id,
            source,
            reply,
        })
        .await
    }

    pub async fn on_position_changed(&self, address: &str) -> Result<Position> {
        let address = address.to_string();
        self.request(|reply| Command::Navigate { address, reply }).await
    }

    pub async fn pause(&self) -> Result<Option<ReadingCheckpoint>> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn close_book(&self) -> Result<()> {
        self.request(|reply| Command::Close { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn section(&self, index: usize) -> Result<SectionContent> {
        self.request(|reply| Command::Section { index, reply }).await
    }

    pub async fn table_of_contents(&self) -> Result<Vec<TocEntry>> {
        self.request(|reply| Command::TableOfContents { reply }).await
    }

    pub async fn metadata(&self) -> Result<BookMetadata> {
        self.request(|reply| Command::Metadata { reply }).await
    }

    /// Telemetry for every later checkpoint
    pub async fn set_attributes(
        &self,
        attributes: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.request(|reply| Command::SetAttributes { attributes, reply })
            .await
    }
}

pub struct SessionActor {
    session: Session,
    tick: Duration,
    sync_events: Option<broadcast::Receiver<SyncEvent>>,
}

impl SessionActor {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            tick: DEFAULT_TICK,
            sync_events: None,
        }
    }

    /// Feed results from a `SyncCoordinator` into the session
    pub fn with_sync_events(mut self, events: broadcast::Receiver<SyncEvent>) -> Self {
        self.sync_events = Some(events);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn spawn(self) -> (SessionHandle, mpsc::Receiver<SessionEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let handle = tokio::spawn(self.run(rx, events_tx));
        (SessionHandle { tx }, events_rx, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>, events: mpsc::Sender<SessionEvent>) {
        tracing::debug!(user_id = %self.session.user_id(), "session actor started");

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.session.tick().await {
                        tracing::warn!("session tick failed: {}", e);
                    }
                }
                event = next_sync_event(&mut self.sync_events) => {
                    for event in self.session.observe_sync(&event) {
                        publish(&events, event);
                    }
                }
            }
            for event in self.session.take_events() {
                publish(&events, event);
            }
        }

        if let Err(e) = self.session.close_book().await {
            tracing::error!("closing session on shutdown failed: {}", e);
        }
        for event in self.session.take_events() {
            publish(&events, event);
        }
        tracing::debug!(user_id = %self.session.user_id(), "session actor stopped");
    }

    async fn handle(&mut self, command: Command) {
        let session = &mut self.session;
        // A dropped reply only means the caller stopped waiting
        match command {
            Command::Open {
                book_id,
                source,
                reply,
            } => {
                let _ = reply.send(session.open_book(&book_id, source).await);
            }
            Command::Navigate { address, reply } => {
                let _ = reply.send(session.on_position_changed(&address).await);
            }
            Command::Pause { reply } => {
                let _ = reply.send(session.pause().await);
            }
            Command::Close { reply } => {
                let _ = reply.send(session.close_book().await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(session.snapshot()));
            }
            Command::Section { index, reply } => {
                let _ = reply.send(session.section(index));
            }
            Command::TableOfContents { reply } => {
                let _ = reply.send(session.table_of_contents().map(|toc| toc.to_vec()));
            }
            Command::Metadata { reply } => {
                let _ = reply.send(session.metadata().cloned());
            }
            Command::SetAttributes { attributes, reply } => {
                session.set_attributes(attributes);
                let _ = reply.send(Ok(()));
            }
        }
    }
}

fn publish(events: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
        tracing::warn!(?event, "session event queue full, dropping event");
    }
}

async fn next_sync_event(events: &mut Option<broadcast::Receiver<SyncEvent>>) -> SyncEvent {
    loop {
        let Some(receiver) = events.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(event) => return event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "session fell behind on sync events");
            }
            Err(RecvError::Closed) => *events = None,
        }
    }
}
