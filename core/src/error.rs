use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong while binding, accepting, cancelling, or
/// recovering activated listeners.
///
/// Nothing is retried internally: every failure is handed straight back
/// to the caller, since a silently redone accept or probe would hide
/// client identity problems.
#[derive(Debug, Error)]
pub enum Error {
    /// The socket path is already bound by another listener. Kept apart
    /// from [`Error::Bind`] so "another instance is running" is
    /// machine-recognizable.
    #[error("address already in use: {}", .0.display())]
    AddrInUse(PathBuf),

    /// Binding the listening socket failed for any other reason.
    #[error("failed to bind listener at {}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Connecting to a listening socket failed.
    #[error("failed to connect to {}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The blocking accept call itself failed.
    #[error("failed to accept connection")]
    Accept(#[source] io::Error),

    /// The accept succeeded but the peer credential query failed; the
    /// connection was discarded.
    #[error("failed to read peer credentials")]
    Credentials(#[source] io::Error),

    /// The listener was closed; it accepts nothing ever again.
    #[error("listener is closed")]
    Closed,

    /// The accept was cancelled through its token. The listener was
    /// closed to unblock it and is spent.
    #[error("accept cancelled")]
    Cancelled,

    /// Shutting the listening socket down failed.
    #[error("failed to shut down listener")]
    Close(#[source] io::Error),

    /// No socket-activation environment is present; callers should fall
    /// back to binding directly.
    #[error("no socket activation environment present")]
    ActivationNotPresent,

    /// The activation environment targets a different process.
    #[error("socket activation pid mismatch: environment says {env_pid}, this process is {our_pid}")]
    ActivationPidMismatch { env_pid: i32, our_pid: u32 },

    /// The advertised descriptor count and the name list disagree.
    #[error("socket activation count mismatch: {fds} descriptors advertised, {names} names given")]
    ActivationCountMismatch { fds: usize, names: usize },

    /// The activation environment is present but unparsable.
    #[error("invalid socket activation environment: {0}")]
    ActivationInvalid(String),

    /// An activated descriptor is not a usable listening socket.
    #[error("activated descriptor {fd} ({name}) is not a usable listening socket")]
    ActivationDescriptor {
        fd: i32,
        name: String,
        #[source]
        source: io::Error,
    },

    /// Exactly one activated listener was requested but none exist.
    #[error("found no activated sockets")]
    NoActivatedSockets,

    /// Exactly one activated listener was requested but several exist;
    /// all of them were closed before returning.
    #[error("found {0} activated sockets, expected exactly one")]
    MultipleActivatedSockets(usize),
}
