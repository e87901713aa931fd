use std::any::Any;
use std::sync::Arc;

use peerlink_core::PeerCredentials;

/// Opaque per-connection authentication record produced by a
/// transport-security handshake.
///
/// The framework side only ever sees this trait; whoever knows the
/// concrete type (such as [`AuthRecord`]) downcasts through
/// [`AuthInfo::as_any`] at exactly one place, instead of scattering
/// runtime type checks around.
pub trait AuthInfo: Send + Sync + 'static {
    /// Short stable tag naming the security scheme that produced this
    /// record.
    fn auth_type(&self) -> &str;

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

/// The authentication record a credential handshake attaches to each
/// connection: the peer credentials captured at accept time (if any)
/// merged with whatever an inner security layer negotiated.
///
/// Created once per connection during the handshake and immutable
/// afterward.
pub struct AuthRecord {
    credentials: Option<PeerCredentials>,
    inner: Option<Arc<dyn AuthInfo>>,
}

impl AuthRecord {
    pub(crate) fn new(
        credentials: Option<PeerCredentials>,
        inner: Option<Arc<dyn AuthInfo>>,
    ) -> Self {
        Self { credentials, inner }
    }

    /// The peer credentials captured at accept time, absent when the
    /// transport could not report any.
    pub fn credentials(&self) -> Option<&PeerCredentials> {
        self.credentials.as_ref()
    }

    /// The chained security layer's own record, when one was configured.
    pub fn inner(&self) -> Option<&Arc<dyn AuthInfo>> {
        self.inner.as_ref()
    }
}

impl AuthInfo for AuthRecord {
    fn auth_type(&self) -> &str {
        match &self.inner {
            Some(inner) => inner.auth_type(),
            None => "peer",
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
