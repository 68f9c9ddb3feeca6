//! Remote progress authority
//!
//! The backend that owns canonical progress. The engine talks to it through
//! `RemoteAuthority`; `HttpAuthority` is the production client and `server`
//! holds a reference implementation for local development.

mod client;
pub mod server;
mod types;

use async_trait::async_trait;

pub use client::HttpAuthority;
pub use types::{CheckpointUpload, RemoteError, RemoteProgress};

/// Progress authority API consumed by the engine
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Canonical progress for a book, `None` if the user never opened it
    async fn fetch_position(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> Result<Option<RemoteProgress>, RemoteError>;

    /// Apply a checkpoint upload and return the resulting progress
    async fn push_checkpoint(
        &self,
        user_id: &str,
        book_id: &str,
        upload: &CheckpointUpload,
    ) -> Result<RemoteProgress, RemoteError>;
}
