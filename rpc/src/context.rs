use std::sync::Arc;

use peerlink_core::PeerCredentials;

use crate::auth::{AuthInfo, AuthRecord};
use crate::error::LookupError;

/// Connection-level peer information the framework attaches during the
/// handshake. One `Peer` is shared by every request made over its
/// connection.
pub struct Peer {
    auth: Arc<dyn AuthInfo>,
}

impl Peer {
    pub fn new(auth: Arc<dyn AuthInfo>) -> Self {
        Self { auth }
    }

    /// The authentication record negotiated for this connection.
    pub fn auth_info(&self) -> Arc<dyn AuthInfo> {
        Arc::clone(&self.auth)
    }
}

/// Request-scoped context as the framework hands it to a service
/// method: possibly tied to a connection peer, possibly not.
#[derive(Clone, Default)]
pub struct RequestContext {
    peer: Option<Arc<Peer>>,
}

impl RequestContext {
    /// A context derived from a connection's peer.
    pub fn with_peer(peer: Arc<Peer>) -> Self {
        Self { peer: Some(peer) }
    }

    /// A context unrelated to any connection.
    pub fn detached() -> Self {
        Self { peer: None }
    }

    /// The connection peer, when the context has one.
    pub fn peer(&self) -> Option<&Arc<Peer>> {
        self.peer.as_ref()
    }
}

/// Extract the peer process credentials from a request context.
///
/// [`LookupError::NoPeer`] means the context carries no connection peer
/// at all; [`LookupError::NoCredentials`] means a peer exists but its
/// record has no credentials (non-local transport, or a foreign
/// security layer's record type). The two are never conflated.
///
/// Pure read: safe to call repeatedly and from concurrent request
/// handlers sharing one connection.
pub fn credentials_from_context(ctx: &RequestContext) -> Result<PeerCredentials, LookupError> {
    let peer = ctx.peer().ok_or(LookupError::NoPeer)?;
    let auth = peer.auth_info();

    // The single place where "is this our record type" is decided.
    let record = auth
        .as_any()
        .downcast_ref::<AuthRecord>()
        .ok_or(LookupError::NoCredentials)?;

    record.credentials().copied().ok_or(LookupError::NoCredentials)
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use super::*;

    struct ForeignAuth;

    impl AuthInfo for ForeignAuth {
        fn auth_type(&self) -> &str {
            "foreign"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn creds() -> PeerCredentials {
        PeerCredentials {
            pid: 4321,
            uid: 1000,
            gid: 1000,
        }
    }

    #[test]
    fn detached_context_has_no_peer() {
        assert_eq!(
            credentials_from_context(&RequestContext::detached()),
            Err(LookupError::NoPeer)
        );
    }

    #[test]
    fn record_without_credentials_is_no_credentials() {
        let record = AuthRecord::new(None, None);
        let ctx = RequestContext::with_peer(Arc::new(Peer::new(Arc::new(record))));
        assert_eq!(credentials_from_context(&ctx), Err(LookupError::NoCredentials));
    }

    #[test]
    fn foreign_auth_record_is_no_credentials_not_no_peer() {
        let ctx = RequestContext::with_peer(Arc::new(Peer::new(Arc::new(ForeignAuth))));
        assert_eq!(credentials_from_context(&ctx), Err(LookupError::NoCredentials));
    }

    #[test]
    fn attached_credentials_round_trip() {
        let record = AuthRecord::new(Some(creds()), None);
        let ctx = RequestContext::with_peer(Arc::new(Peer::new(Arc::new(record))));

        // Repeated lookups over the same connection see the same value.
        for _ in 0..3 {
            assert_eq!(credentials_from_context(&ctx), Ok(creds()));
        }
    }
}
