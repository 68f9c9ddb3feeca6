//! Session lifecycle states

use serde::{Deserialize, Serialize};

/// ```text
/// Closed ──open──▶ Opening ──▶ Ready ──navigate──▶ Reading ⇄ Paused
///   ▲                 │                              │
///   │                 ▼                              ▼
///   └──── close ── Failed                  Closing ──▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Closed,
    Opening,
    /// Position restored, nothing read yet
    Ready,
    Reading,
    Paused,
    Closing,
    /// The container could not be loaded
    Failed,
}

impl SessionState {
    pub fn can_open(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// A book is loaded and accepts navigation
    pub fn is_open(self) -> bool {
        matches!(
            self,
            SessionState::Ready | SessionState::Reading | SessionState::Paused
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Closed => "closed",
            SessionState::Opening => "opening",
            SessionState::Ready => "ready",
            SessionState::Reading => "reading",
            SessionState::Paused => "paused",
            SessionState::Closing => "closing",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
