//! Background sync worker
//!
//! Receives `SyncTrigger`s on a queue and runs one drain task per
//! (user, book). Different books sync in parallel; triggers for a book that is
//! already syncing mark it for another pass instead of starting a second task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{SyncCoordinator, SyncTrigger};
use crate::store::ProgressKey;

const TRIGGER_QUEUE: usize = 128;

// Drain task lifecycle. A task only exits through RUNNING -> DONE, so a
// trigger either lands as RERUN before that or finds DONE and starts a new task.
const RUNNING: u8 = 0;
const RERUN: u8 = 1;
const DONE: u8 = 2;

/// Sender side of the worker queue
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncTrigger>,
}

impl SyncHandle {
    /// Queue a trigger without waiting. A full or closed queue only loses the
    /// trigger; the checkpoints stay pending for the next one.
    pub fn trigger(&self, trigger: SyncTrigger) {
        if let Err(e) = self.tx.try_send(trigger) {
            tracing::warn!("dropping sync trigger: {}", e);
        }
    }

    /// Queue a trigger, waiting for room
    pub async fn send(&self, trigger: SyncTrigger) -> bool {
        self.tx.send(trigger).await.is_ok()
    }
}

struct KeyTask {
    handle: JoinHandle<()>,
    state: Arc<AtomicU8>,
}

impl KeyTask {
    /// Ask a live task for another pass; false once it has committed to exiting
    fn request_rerun(&self) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                (state != DONE).then_some(RERUN)
            })
            .is_ok()
    }
}

pub struct SyncWorker {
    coordinator: Arc<SyncCoordinator>,
    debounce: Duration,
    rx: mpsc::Receiver<SyncTrigger>,
    shutdown: watch::Receiver<bool>,
    tasks: HashMap<ProgressKey, KeyTask>,
}

impl SyncWorker {
    /// Start the worker on its own task
    pub fn spawn(
        coordinator: Arc<SyncCoordinator>,
        debounce: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(TRIGGER_QUEUE);
        let worker = SyncWorker {
            coordinator,
            debounce,
            rx,
            shutdown,
            tasks: HashMap::new(),
        };
        (SyncHandle { tx }, tokio::spawn(worker.run()))
    }

    async fn run(mut self) {
        tracing::debug!("sync worker started");
        loop {
            tokio::select! {
                trigger = self.rx.recv() => match trigger {
                    Some(trigger) => self.handle(trigger).await,
                    None => break,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Drain tasks observe the same shutdown signal; wait for them to finish
        // their current store write.
        for (key, task) in self.tasks.drain() {
            if let Err(e) = task.handle.await {
                tracing::warn!(key = %key, "sync task failed: {}", e);
            }
        }
        tracing::debug!("sync worker stopped");
    }

    async fn handle(&mut self, trigger: SyncTrigger) {
        tracing::debug!(?trigger, "sync trigger");
        self.tasks.retain(|_, task| !task.handle.is_finished());

        match trigger {
            SyncTrigger::CheckpointCaptured { user_id, book_id } => {
                self.schedule(ProgressKey::new(&user_id, &book_id), self.debounce);
            }
            SyncTrigger::SessionClosed { user_id, book_id } => {
                self.schedule(ProgressKey::new(&user_id, &book_id), Duration::ZERO);
            }
            SyncTrigger::Reconnected { user_id } | SyncTrigger::Foregrounded { user_id } => {
                match self.coordinator.store().books_with_pending(&user_id).await {
                    Ok(books) => {
                        for book_id in books {
                            self.schedule(ProgressKey::new(&user_id, &book_id), Duration::ZERO);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, "could not list pending books: {}", e)
                    }
                }
            }
        }
    }

    fn schedule(&mut self, key: ProgressKey, delay: Duration) {
        if let Some(task) = self.tasks.get(&key) {
            if task.request_rerun() {
                return;
            }
        }

        let state = Arc::new(AtomicU8::new(RUNNING));
        let handle = tokio::spawn(drain_key(
            self.coordinator.clone(),
            key.clone(),
            delay,
            state.clone(),
            self.shutdown.clone(),
        ));
        // An exiting task under the same key is left to finish on its own
        self.tasks.insert(key, KeyTask { handle, state });
    }
}

async fn drain_key(
    coordinator: Arc<SyncCoordinator>,
    key: ProgressKey,
    delay: Duration,
    state: Arc<AtomicU8>,
    mut shutdown: watch::Receiver<bool>,
) {
    if !delay.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                state.store(DONE, Ordering::SeqCst);
                return;
            }
        }
    }

    loop {
        state.store(RUNNING, Ordering::SeqCst);
        match coordinator
            .sync_until_drained(&key.user_id, &key.book_id, shutdown.clone())
            .await
        {
            Ok(outcome) => tracing::debug!(key = %key, ?outcome, "drain finished"),
            Err(e) => tracing::warn!(key = %key, "drain failed: {}", e),
        }

        if *shutdown.borrow() {
            state.store(DONE, Ordering::SeqCst);
            break;
        }
        if state
            .compare_exchange(RUNNING, DONE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break;
        }
    }
}
