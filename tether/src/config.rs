//! Configuration for the connection-management reactors.

/// Interval between heartbeats sent to every connected client (ms).
pub const HEARTBEAT_INTERVAL_MS: u64 = 200;

/// How long a client may stay silent before it is declared lost (ms).
pub const HEARTBEAT_TIMEOUT_MS: u64 = 1_000;

/// Reconnection model for an outbound peer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    /// Reconnect on loss and otherwise leave healthy connections alone.
    Persistent,
    /// Reconnect on loss, and additionally tear down and re-establish
    /// healthy connections once they reach the configured period, so no
    /// connection grows older than roughly one period.
    Rotate,
}

/// Configuration for an outbound peer pool.
///
/// The `period_ms` is the single knob everything else derives from: the
/// reconnect backoff window, the rotation age in [`Model::Rotate`], and
/// the internal tick rate.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Reconnection model.
    pub model: Model,

    /// Base period (ms) for reconnect backoff and connection rotation.
    pub period_ms: u64,

    /// How long a non-blocking connect may stay in flight before it is
    /// aborted and rescheduled (ms).
    pub connect_timeout_ms: u64,

    /// Maximum size of a single frame payload in bytes.
    pub max_frame_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            model: Model::Persistent,
            period_ms: 1_000,
            connect_timeout_ms: 10_000,
            max_frame_bytes: 1_048_576, // 1 MB
        }
    }
}

impl PoolConfig {
    /// Create a config suitable for local testing with fast reconnects.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            model: Model::Persistent,
            period_ms: 100,
            connect_timeout_ms: 1_000,
            max_frame_bytes: 1_048_576,
        }
    }
}

/// Configuration for an inbound endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Interval between heartbeats sent to every connected client (ms).
    pub heartbeat_interval_ms: u64,

    /// How long a client may stay silent before it is declared lost and
    /// disconnected (ms).
    pub heartbeat_timeout_ms: u64,

    /// Inbound connections beyond this count are refused at accept.
    pub max_clients: usize,

    /// Listen backlog handed to the kernel.
    pub listen_backlog: i32,

    /// Maximum size of a single frame payload in bytes.
    pub max_frame_bytes: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: HEARTBEAT_TIMEOUT_MS,
            max_clients: 1_024,
            listen_backlog: 128,
            max_frame_bytes: 1_048_576, // 1 MB
        }
    }
}

impl EndpointConfig {
    /// Create a config suitable for local testing with shorter timers.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            heartbeat_interval_ms: 20,
            heartbeat_timeout_ms: 100,
            max_clients: 16,
            listen_backlog: 16,
            max_frame_bytes: 1_048_576,
        }
    }
}
