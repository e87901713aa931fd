use std::io;
#[cfg(any(target_os = "linux", target_os = "android"))]
use std::os::unix::net::UnixStream;

#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::sys::socket::{getsockopt, sockopt};
use serde::{Deserialize, Serialize};

use crate::listener::StreamConn;

/// OS identity of the process on the other end of a Unix domain socket
/// connection, as reported by the kernel at accept time.
///
/// The record is produced exactly once per accepted connection and never
/// mutated afterward. A connection whose transport cannot report
/// credentials carries `None` instead of a zero-valued stand-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCredentials {
    /// Process ID of the peer
    pub pid: i32,
    /// User ID of the peer
    pub uid: u32,
    /// Group ID of the peer
    pub gid: u32,
}

/// Query the peer credentials for a connection.
///
/// Returns `Ok(None)` when the connection is not backed by a Unix domain
/// socket; callers treat that as "credential absent", not as a failure.
/// Any OS-level error from the query itself is returned as `Err` and the
/// caller must discard the connection: an accepted connection without a
/// verifiable identity is unusable here.
pub fn probe(conn: &StreamConn) -> io::Result<Option<PeerCredentials>> {
    match conn {
        StreamConn::Unix(stream) => peer_credentials(stream).map(Some),
        StreamConn::Tcp(_) => Ok(None),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn peer_credentials(stream: &UnixStream) -> io::Result<PeerCredentials> {
    let creds = getsockopt(stream, sockopt::PeerCredentials)?;

    Ok(PeerCredentials {
        pid: creds.pid(),
        uid: creds.uid(),
        gid: creds.gid(),
    })
}

#[cfg(target_os = "macos")]
fn peer_credentials(stream: &std::os::unix::net::UnixStream) -> io::Result<PeerCredentials> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();

    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;

    // SAFETY: getpeereid is safe to call with a valid file descriptor and
    // mutable references to uid_t and gid_t on the stack.
    if unsafe { libc::getpeereid(fd, &mut uid, &mut gid) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut pid: libc::pid_t = 0;
    let mut pid_len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;

    // SAFETY: getsockopt is safe when called with a valid file descriptor,
    // the SOL_LOCAL/LOCAL_PEERPID option pair, and a properly sized buffer
    // (pid is a stack variable and pid_len matches its size).
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_LOCAL,
            libc::LOCAL_PEERPID,
            &mut pid as *mut _ as *mut libc::c_void,
            &mut pid_len,
        )
    };

    if result != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(PeerCredentials { pid, uid, gid })
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn probe_reports_own_identity_over_socketpair() {
        let (a, _b) = UnixStream::pair().expect("socketpair");
        let conn = StreamConn::Unix(a);

        let creds = probe(&conn)
            .expect("probe")
            .expect("socketpair peers are unix sockets");

        assert_eq!(creds.pid, std::process::id() as i32);
        // SAFETY: getuid/getgid have no failure modes.
        assert_eq!(creds.uid, unsafe { libc::getuid() });
        assert_eq!(creds.gid, unsafe { libc::getgid() });
    }

    #[test]
    fn probe_is_not_applicable_for_tcp() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = std::net::TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        drop(client);

        let conn = StreamConn::Tcp(server);
        assert!(probe(&conn).expect("probe").is_none());
    }
}
