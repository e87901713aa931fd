//! Peer-credential IPC Core Library
//!
//! This crate lets a server accepting connections over Unix domain
//! sockets reliably learn the OS identity (PID, UID, GID) of the
//! client process at the far end of each accepted connection. It
//! includes:
//!
//! - A credential probe around the kernel's peer-credential socket
//!   option (`SO_PEERCRED` on Linux, `getpeereid`/`LOCAL_PEERPID` on
//!   macOS)
//! - A listener whose accepts attach those credentials before the
//!   connection is handed back, with race-safe idempotent close
//! - A cancellation token that can unblock a pending accept by closing
//!   the listener (see [`Listener::accept_with_cancel`])
//! - Recovery of listeners handed over through systemd-style socket
//!   activation
//!
//! The kernel facility only identifies the accepting side's peer of a
//! local stream socket, so credentials never exist for IP transports or
//! on the connecting side.
//!
//! A minimal server looks like:
//!
//! ```no_run
//! use peerlink_core::Listener;
//!
//! # fn main() -> Result<(), peerlink_core::Error> {
//! let listener = Listener::bind("/run/myapp.sock")?;
//! let conn = listener.accept()?;
//! if let Some(creds) = conn.credentials() {
//!     println!("client pid={} uid={}", creds.pid, creds.uid);
//! }
//! # Ok(())
//! # }
//! ```

/// Cancellation tokens for unblocking a pending accept
pub mod cancel;

/// Peer credential record and the kernel probe
pub mod credentials;

/// Error taxonomy for bind/accept/cancel/activation
pub mod error;

/// Credential-aware listener and connection types
pub mod listener;

/// Socket-activation discovery
pub mod systemd;

// Re-export commonly used types for convenience
pub use cancel::{cancellation, CancelToken, Canceller};
pub use credentials::{probe, PeerCredentials};
pub use error::Error;
pub use listener::{Listener, PeerConn, StreamConn, StreamListener};
pub use systemd::{activated_listener, activated_listeners, LISTEN_FDS_START};
