//! Error taxonomy shared by the control plane, data planes, and client agent.
//!
//! Library code returns these typed errors; `anyhow` is reserved for the
//! binary entrypoint where a human-readable chain is all that's needed.

use thiserror::Error;

/// Transport-level failure: dial, accept, or stream I/O.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stream I/O error: {0}")]
    Io(#[source] std::io::Error),
    #[error("multiplexed session closed")]
    SessionClosed,
}

/// Identity verification failure (component C2). Never carries the
/// underlying cause to the wire; logged server-side only.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid or rejected token")]
    Invalid,
}

/// A user's tunnel registry is already at `max_tunnels`.
#[derive(Debug, Error)]
#[error("max {kind} tunnel limit reached ({max})")]
pub struct QuotaExceeded {
    pub kind: &'static str,
    pub max: u32,
}

/// The port allocator's configured range is exhausted.
#[derive(Debug, Error)]
#[error("no ports available")]
pub struct NoPortsAvailable;

/// A malformed control frame or `Host` header.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control frame")]
    MalformedFrame,
    #[error("control frame too large")]
    FrameTooLarge,
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("malformed host header")]
    MalformedHost,
    #[error("tunnel not found")]
    NotFound,
}

/// The client-side local service is unreachable or its response can't be
/// parsed as HTTP/1.1.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("local service unavailable: {0}")]
    Unreachable(#[source] std::io::Error),
    #[error("could not parse upstream response: {0}")]
    BadResponse(String),
}
