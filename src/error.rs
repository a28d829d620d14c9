//! Error types for the pipe messaging engine.
//!
//! Four failure families, mirrored in how the loops react to them:
//! transport and protocol errors tear a connection down, serialization
//! errors drop the offending message and keep the connection alive, and
//! lifecycle errors report misuse of a component (starting a running
//! server, sending on a stopped client).

use std::io;

use thiserror::Error;

/// Errors surfaced by the pipe server, client, and connection loops.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying socket failed (broken pipe, refused connect, OS error).
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A pipe endpoint did not appear or accept within its deadline.
    #[error("timed out connecting to pipe '{0}'")]
    ConnectTimeout(String),

    /// The byte stream violated the framing protocol (torn header,
    /// truncated payload, zero-length or oversized frame).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The codec rejected a payload. The connection survives; the
    /// message is dropped.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An operation was invoked on a component in the wrong state.
    #[error("lifecycle error: {0}")]
    Lifecycle(&'static str),
}

impl Error {
    /// Whether the read loop should keep the connection open after this
    /// error. Only codec failures are survivable.
    pub(crate) fn is_recoverable(&self) -> bool {
        matches!(self, Error::Serialization(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
