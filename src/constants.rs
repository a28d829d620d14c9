//! Crate-wide timing and limit constants.
//!
//! Centralized so the handshake, connect, and shutdown paths agree on
//! their deadlines.

use std::time::Duration;

/// Interval between existence probes while waiting for a pipe name to
/// appear, and between retries while an accept or connect is pending.
///
/// 10 ms keeps connect latency low without busy-spinning.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Deadline for opening a client endpoint once its pipe name exists.
///
/// Covers the window between the socket file appearing and the owning
/// listener reaching accept. One second is generous; on a healthy host
/// this completes in microseconds.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Server-side deadline for the redirected client to arrive on its
/// private data pipe during the handshake.
///
/// A client that read the redirect frame has at most this long to
/// connect before the server abandons the half-open session and
/// returns to accepting.
pub const HANDSHAKE_ACCEPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for each stage of the shutdown wake-up handshake.
///
/// `Server::stop` unblocks a parked listener by running a throwaway
/// handshake against the well-known name; each stage (connect, data
/// pipe connect) is bounded by this so `stop` always returns.
pub const STOP_WAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default permission bits for server socket files (owner-only).
pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
