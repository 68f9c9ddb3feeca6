//! Los Libros Reader
//!
//! Reading session engine for EPUB books: opens a package, tracks where the
//! reader is as an EPUB CFI plus a fraction, records reading time, and keeps
//! that progress in step with a remote authority across devices and offline
//! periods.
//!
//! # Modules
//!
//! - `cfi`: EPUB CFI parsing, generation and ordering
//! - `locator`: address to fraction mapping over a book's structure
//! - `container`: EPUB package loading
//! - `store`: durable per-book progress and pending checkpoints
//! - `session`: one open book, active time, checkpoints
//! - `sync`: pushing checkpoints to the authority
//! - `authority`: the remote progress API, its HTTP client and a reference server

pub mod authority;
pub mod cfi;
pub mod config;
pub mod container;
pub mod error;
pub mod locator;
pub mod session;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use config::{Config, EngineConfig};
pub use error::{EngineError, Result};
pub use locator::{Position, PositionResolution};
pub use session::{Session, SessionActor, SessionDeps, SessionEvent, SessionHandle, SessionState};
