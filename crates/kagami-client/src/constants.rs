//! Client configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default auth service base URL for local development.
pub const DEFAULT_AUTH_URL: &str = "http://localhost:8700";

/// Default worker WebSocket URL for local development.
pub const DEFAULT_WORKER_URL: &str = "ws://localhost:8701/channel";

/// Timeout for opening the worker connection. Prevents a connect from
/// hanging indefinitely on SYN blackholes or stalled workers.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for correlated request/response exchanges (listing).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// Deadline for a push-matched file read to arrive.
pub const READ_TIMEOUT: Duration = Duration::from_secs(8);

/// Per-call timeout on auth HTTP requests.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for the best-effort remote logout notification. Local session
/// state is cleared regardless of whether this elapses.
pub const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer size for the channel/session/vfs broadcast event streams.
pub const EVENT_BUFFER: usize = 64;

/// Buffer size for the transport's outbound/inbound mpsc pair.
pub const TRANSPORT_BUFFER: usize = 256;
