use std::io;
use thiserror::Error;

/// Errors produced while discovering peers and establishing links.
#[derive(Debug, Error)]
pub enum LanLinkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration or handshake error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Identity packet error
    #[error("identity packet error: {0}")]
    Identity(#[from] IdentityError),

    /// Certificate generation or parsing error
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The peer's device id cannot be used as a TLS server name
    #[error("invalid peer name: {0}")]
    InvalidPeerName(String),

    /// No free TCP port for the acceptor
    #[error("no free TCP port in range {0}-{1}")]
    PortRangeExhausted(u16, u16),

    /// The pre-TLS identity line exceeded the allowed size
    #[error("identity line exceeds limit ({0} bytes buffered)")]
    IdentityTooLong(usize),

    /// A peer sent bytes beyond the identity line before TLS started
    #[error("unexpected data received before the TLS handshake")]
    UnexpectedPlaintext,

    /// Connection already closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Timeout error
    #[error("operation timed out")]
    Timeout,
}

/// Errors related to identity packet encoding and decoding.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The record carried a type tag other than the identity type
    #[error("expected packet type {expected:?}, got {found:?}")]
    WrongType {
        expected: &'static str,
        found: String,
    },

    /// Truncated or structurally invalid record
    #[error("malformed identity packet: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LanLinkError>;
