use std::io::{Read, Write};
use std::sync::Arc;

use peerlink_core::{CancelToken, Listener, PeerConn};

use crate::auth::{AuthInfo, AuthRecord};
use crate::context::Peer;
use crate::error::{AcceptError, HandshakeError};

/// Byte stream a finished handshake hands back to the framework.
pub trait IoStream: Read + Write + Send {}

impl<T: Read + Write + Send> IoStream for T {}

/// What a transport-security layer advertises about itself, so generic
/// framework machinery knows which negotiation scheme is in play (and,
/// in particular, never assumes encryption that is not there).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolInfo {
    /// Stable identifier of the negotiated security scheme.
    pub security_protocol: String,
}

impl ProtocolInfo {
    pub fn new(security_protocol: impl Into<String>) -> Self {
        Self {
            security_protocol: security_protocol.into(),
        }
    }
}

/// An established connection: the (possibly re-wrapped) byte stream plus
/// the authentication record negotiated for it.
///
/// A handshake has exactly two terminal outcomes: an established
/// `Session`, or a [`HandshakeError`] with the connection discarded.
pub struct Session {
    stream: Box<dyn IoStream>,
    peer: Arc<Peer>,
}

impl Session {
    pub fn new(stream: Box<dyn IoStream>, auth: Arc<dyn AuthInfo>) -> Self {
        Self {
            stream,
            peer: Arc::new(Peer::new(auth)),
        }
    }

    /// The connection-level peer record shared by every request on this
    /// connection.
    pub fn peer(&self) -> Arc<Peer> {
        Arc::clone(&self.peer)
    }

    /// Split the session into its stream and peer.
    pub fn into_parts(self) -> (Box<dyn IoStream>, Arc<Peer>) {
        (self.stream, self.peer)
    }

    /// The negotiated byte stream.
    pub fn stream_mut(&mut self) -> &mut dyn IoStream {
        self.stream.as_mut()
    }
}

/// The pluggable transport-security extension point an RPC framework
/// consumes: per-connection negotiation producing an opaque
/// authentication record.
///
/// Implementations must be shareable across concurrent handshakes; all
/// mutable negotiation state lives inside a single call.
pub trait TransportSecurity: Send + Sync {
    /// Negotiate security for an accepted connection.
    fn server_handshake(&self, conn: PeerConn) -> Result<Session, HandshakeError>;

    /// Negotiate security for an outbound connection against
    /// `server_name`.
    fn client_handshake(&self, conn: PeerConn, server_name: &str)
        -> Result<Session, HandshakeError>;

    /// Identify the negotiation scheme.
    fn protocol_info(&self) -> ProtocolInfo;
}

/// Server-side security that exposes the peer credentials captured at
/// accept time, optionally chained over an inner security layer (for
/// example [`crate::tls::TlsSecurity`] for encryption).
///
/// Clones share the same immutable configuration and no per-handshake
/// state.
#[derive(Clone, Default)]
pub struct CredentialSecurity {
    inner: Option<Arc<dyn TransportSecurity>>,
}

impl CredentialSecurity {
    /// Credential-only negotiation: no encryption, no inner layer.
    pub fn new() -> Self {
        Self { inner: None }
    }

    /// Credential negotiation chained over `inner`; the inner layer
    /// handshakes first and both results merge into one record.
    pub fn with_inner(inner: Arc<dyn TransportSecurity>) -> Self {
        Self { inner: Some(inner) }
    }
}

impl TransportSecurity for CredentialSecurity {
    fn server_handshake(&self, conn: PeerConn) -> Result<Session, HandshakeError> {
        // Capture the credential decision made at accept time before the
        // stream gets re-wrapped by any inner layer.
        let credentials = conn.credentials().copied();

        match &self.inner {
            None => {
                let record = AuthRecord::new(credentials, None);
                Ok(Session::new(Box::new(conn), Arc::new(record)))
            }
            Some(inner) => {
                // Inner failure fails the whole handshake; the connection
                // is dropped here and never reaches the caller.
                let (stream, inner_peer) = inner.server_handshake(conn)?.into_parts();
                let record = AuthRecord::new(credentials, Some(inner_peer.auth_info()));
                Ok(Session::new(stream, Arc::new(record)))
            }
        }
    }

    fn client_handshake(
        &self,
        _conn: PeerConn,
        _server_name: &str,
    ) -> Result<Session, HandshakeError> {
        // Server-only by decision: a client wanting the inner layer
        // installs it directly instead of silently degrading.
        Err(HandshakeError::ClientUnsupported)
    }

    fn protocol_info(&self) -> ProtocolInfo {
        match &self.inner {
            Some(inner) => inner.protocol_info(),
            None => ProtocolInfo::new("peer"),
        }
    }
}

/// A listener paired with the transport security to run on every
/// accepted connection. This is the server-side surface an application
/// installs once and accepts through.
pub struct SecuredListener {
    listener: Listener,
    security: Arc<dyn TransportSecurity>,
}

impl SecuredListener {
    /// Credential-only security.
    pub fn credential_only(listener: Listener) -> Self {
        Self::new(listener, Arc::new(CredentialSecurity::new()))
    }

    /// Credential security chained over an externally constructed inner
    /// layer.
    pub fn credential_with(listener: Listener, inner: Arc<dyn TransportSecurity>) -> Self {
        Self::new(listener, Arc::new(CredentialSecurity::with_inner(inner)))
    }

    /// Pair `listener` with an arbitrary security implementation.
    pub fn new(listener: Listener, security: Arc<dyn TransportSecurity>) -> Self {
        Self { listener, security }
    }

    /// Accept one connection and run the server handshake on it.
    pub fn accept(&self) -> Result<Session, AcceptError> {
        let conn = self.listener.accept()?;
        self.handshake(conn)
    }

    /// Accept with cancellation; see
    /// [`Listener::accept_with_cancel`] for the destructive-cancel
    /// trade-off.
    pub fn accept_with_cancel(&self, token: &CancelToken) -> Result<Session, AcceptError> {
        let conn = self.listener.accept_with_cancel(token)?;
        self.handshake(conn)
    }

    /// Close the underlying listener (idempotent).
    pub fn close(&self) -> Result<(), peerlink_core::Error> {
        self.listener.close()
    }

    /// The wrapped listener.
    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    fn handshake(&self, conn: PeerConn) -> Result<Session, AcceptError> {
        match self.security.server_handshake(conn) {
            Ok(session) => Ok(session),
            Err(err) => {
                tracing::warn!("handshake failed: {err}");
                Err(err.into())
            }
        }
    }
}
