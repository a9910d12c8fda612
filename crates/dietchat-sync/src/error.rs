use thiserror::Error;

/// Failures of the HTTP conversation API as seen by the sync client.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The server answered with a non-success status. `message` is the
    /// server's `error` field when present.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    /// The session task has stopped and can no longer take commands.
    #[error("sync session closed")]
    Closed,
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// The realtime path is unavailable. Never surfaced as a hard failure; the
/// session falls back to polling.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("realtime connect failed: {0}")]
    Connect(String),

    #[error("realtime handshake failed: {0}")]
    Handshake(String),

    #[error("subscription refused: {0}")]
    Refused(String),
}
