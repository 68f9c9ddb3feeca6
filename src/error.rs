//! Error types for the reading session engine

use thiserror::Error;

use crate::container::ContainerError;
use crate::session::SessionState;
use crate::store::StoreError;

/// Engine-wide result type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    /// Address does not belong to the book's current structure. Recoverable:
    /// callers fall back to the nearest valid address.
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The package is missing required structural parts. Fatal to an open.
    #[error("Malformed container: {0}")]
    MalformedContainer(#[from] ContainerError),

    /// Network or server failure. Retried with backoff by the sync coordinator
    /// and only surfaced once the backlog is degraded.
    #[error("Transient sync failure: {0}")]
    SyncTransient(String),

    /// The authority refused the checkpoint (e.g. access revoked)
    #[error("Sync rejected: {0}")]
    SyncRejected(String),

    #[error("Position store error: {0}")]
    Store(#[from] StoreError),

    #[error("Operation {operation} not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("No book is open")]
    NoBookOpen,

    #[error("Section not found: index {0}")]
    SectionNotFound(usize),

    #[error("Session actor has stopped")]
    ActorStopped,
}

impl EngineError {
    pub fn invalid_address(address: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may carry on with a degraded result
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidAddress { .. } | EngineError::SyncTransient(_)
        )
    }
}
