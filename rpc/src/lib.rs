//! Peer-credential RPC Transport Security
//!
//! This crate adapts [`peerlink_core`]'s credential-aware listener to
//! the transport-security model used by RPC frameworks: a server-side
//! handshake that turns each accepted connection into a byte stream
//! plus an authentication record, which request handlers later read
//! back through their request context. It includes:
//!
//! - A [`TransportSecurity`] trait describing the handshake seam, with
//!   [`CredentialSecurity`] attaching the accepting socket's peer
//!   credentials (optionally merged over an inner security layer)
//! - [`RequestContext`] and [`credentials_from_context`] for pulling
//!   the caller's identity out of a handler's context
//! - A [`TlsSecurity`] inner layer driving a blocking rustls handshake
//!   over the accepted stream, with PEM loaders for the common
//!   server/mutual-TLS/client configurations
//! - [`SecuredListener`], pairing a listener with a security layer so
//!   every accept comes back as an established [`Session`]
//!
//! Client handshakes through [`CredentialSecurity`] always fail:
//! peer credentials are read by the accepting side of a local socket,
//! so a connector has nothing to present. Configure clients with their
//! own transport security (for example [`TlsSecurity`]) directly.
//!
//! A server that authorizes by UID looks like:
//!
//! ```no_run
//! use peerlink_rpc::{credentials_from_context, RequestContext, SecuredListener};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = SecuredListener::credential_only(
//!     peerlink_core::Listener::bind("/run/myapp.sock")?,
//! );
//! let session = listener.accept()?;
//! let ctx = RequestContext::with_peer(session.peer());
//! let creds = credentials_from_context(&ctx)?;
//! println!("caller uid={}", creds.uid);
//! # Ok(())
//! # }
//! ```

/// Authentication records attached by the handshake
pub mod auth;

/// Request context and credential lookup for handlers
pub mod context;

/// Handshake, lookup, and accept error taxonomy
pub mod error;

/// The transport-security seam and the credential adapter
pub mod security;

/// Blocking rustls inner layer and PEM config loaders
pub mod tls;

// Re-export commonly used types for convenience
pub use auth::{AuthInfo, AuthRecord};
pub use context::{credentials_from_context, Peer, RequestContext};
pub use error::{AcceptError, HandshakeError, LookupError};
pub use security::{
    CredentialSecurity, IoStream, ProtocolInfo, SecuredListener, Session, TransportSecurity,
};
pub use tls::{load_client_config, load_server_config, TlsAuthInfo, TlsSecurity, TlsStream};
