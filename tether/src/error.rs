//! Error types for the connection-management layer.

use thiserror::Error;

/// Errors produced while encoding or decoding wire frames.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Frame payload exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    TooLarge {
        /// Actual payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The frame header carries an unknown kind tag.
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    /// A heartbeat frame arrived with a payload attached.
    #[error("heartbeat frame carries {0} payload bytes")]
    HeartbeatPayload(usize),
}

/// Errors surfaced by pool and endpoint operations.
///
/// Connection-scoped read/write failures never appear here: the affected
/// connection is torn down and the loss is reported through the event
/// surface on the next poll. Transient connect failures are rescheduled
/// internally and never surfaced at all.
#[derive(Error, Debug)]
pub enum TetherError {
    /// The target peer or client has no live connection.
    #[error("not connected")]
    NotConnected,

    /// Maximum client count has been reached; the connection is refused.
    #[error("maximum clients reached: {0}")]
    MaxClientsReached(usize),

    /// The endpoint is already listening.
    #[error("already published on {0}")]
    AlreadyPublished(std::net::SocketAddr),

    /// The reactor has been shut down.
    #[error("reactor has been shut down")]
    Shutdown,

    /// Reactor-level I/O failure (epoll, timer, bind, listen).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire framing violation.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Convenience result type for connection-management operations.
pub type Result<T> = std::result::Result<T, TetherError>;
