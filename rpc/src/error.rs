use std::io;

use thiserror::Error;

/// Why a transport-security handshake failed. A failed handshake is
/// terminal for its connection: the stream is discarded before any
/// authentication data becomes visible.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The credential scheme is server-only: the kernel facility only
    /// identifies the accepting side's peer. Kept distinct so installing
    /// the adapter on a client is immediately diagnosable.
    #[error("client-side handshake is not supported by peer-credential security")]
    ClientUnsupported,

    /// The security layer has no configuration for the requested role.
    #[error("no transport-security configuration for this handshake role")]
    NotConfigured,

    /// I/O on the underlying stream failed mid-handshake.
    #[error("handshake I/O failed")]
    Io(#[from] io::Error),

    /// The TLS layer rejected the negotiation.
    #[error("TLS handshake failed")]
    Tls(#[from] rustls::Error),

    /// Failure from an externally supplied security layer.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why no credential could be extracted from a request context.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    /// The context carries no connection-level peer at all: the
    /// credential handshake adapter was never installed, or the context
    /// is unrelated to any connection.
    #[error("request context has no connection peer")]
    NoPeer,

    /// A peer exists but its authentication record carries no
    /// credentials (non-local transport, or a foreign security layer's
    /// record).
    #[error("connection peer carries no process credentials")]
    NoCredentials,
}

/// Failure while producing an authenticated session: either the accept
/// itself or the subsequent handshake.
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error(transparent)]
    Accept(#[from] peerlink_core::Error),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}
