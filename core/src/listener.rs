use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::credentials::{probe, PeerCredentials};
use crate::error::Error;

/// The underlying listening socket, tagged by transport.
///
/// Peer credentials exist only for the Unix variant; the TCP variant is
/// carried so listeners reconstructed from an activated descriptor table
/// keep working, with credentials explicitly absent on every accept.
pub enum StreamListener {
    /// Unix domain socket listener
    Unix(UnixListener),
    /// TCP listener (socket activation may hand one over)
    Tcp(TcpListener),
}

impl AsRawFd for StreamListener {
    fn as_raw_fd(&self) -> i32 {
        match self {
            StreamListener::Unix(l) => l.as_raw_fd(),
            StreamListener::Tcp(l) => l.as_raw_fd(),
        }
    }
}

/// An accepted byte-stream connection, tagged by transport.
pub enum StreamConn {
    /// Unix domain socket connection
    Unix(UnixStream),
    /// TCP connection
    Tcp(TcpStream),
}

impl Read for StreamConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamConn::Unix(stream) => stream.read(buf),
            StreamConn::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for StreamConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StreamConn::Unix(stream) => stream.write(buf),
            StreamConn::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            StreamConn::Unix(stream) => stream.flush(),
            StreamConn::Tcp(stream) => stream.flush(),
        }
    }
}

/// A connection plus the peer credentials captured when it was accepted.
///
/// The credential decision is always made before the connection is handed
/// to any caller: either a probed `PeerCredentials`, or `None` for
/// transports that cannot report one.
pub struct PeerConn {
    stream: StreamConn,
    credentials: Option<PeerCredentials>,
}

impl PeerConn {
    /// Wrap a connection with an already-made credential decision.
    pub fn new(stream: StreamConn, credentials: Option<PeerCredentials>) -> Self {
        Self {
            stream,
            credentials,
        }
    }

    /// Connect to a Unix socket at `path`.
    ///
    /// The connecting side never sees its peer's credentials, so the
    /// returned connection carries none.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|source| Error::Connect {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            stream: StreamConn::Unix(stream),
            credentials: None,
        })
    }

    /// Credentials of the peer process, if the transport reported any.
    pub fn credentials(&self) -> Option<&PeerCredentials> {
        self.credentials.as_ref()
    }

    /// The underlying tagged connection.
    pub fn stream(&self) -> &StreamConn {
        &self.stream
    }
}

impl Read for PeerConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for PeerConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// A listening socket whose accepts capture the peer's OS credentials.
///
/// Closing is idempotent: however many callers race into [`Listener::close`],
/// exactly one `shutdown(2)` runs and every caller observes the first
/// outcome. The descriptor itself is released once, on drop.
pub struct Listener {
    inner: StreamListener,
    path: Option<PathBuf>,
    // First close outcome: None = clean, Some(errno) = saved failure.
    close_gate: OnceLock<Option<i32>>,
}

impl Listener {
    /// Bind a Unix domain socket listener at `path`.
    ///
    /// A path that is already bound surfaces as [`Error::AddrInUse`] so
    /// callers can tell "another instance is running" apart from every
    /// other bind failure.
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();

        let listener = UnixListener::bind(path).map_err(|err| bind_error(path, err))?;
        tracing::info!("listening on unix socket {}", path.display());

        Ok(Self {
            inner: StreamListener::Unix(listener),
            path: Some(path.to_path_buf()),
            close_gate: OnceLock::new(),
        })
    }

    /// Bind at `path`, first removing a stale socket file left by a
    /// previous instance. Only socket files are removed; anything else at
    /// `path` still fails the bind.
    pub fn bind_replacing<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();

        if let Ok(meta) = fs::symlink_metadata(path) {
            if meta.file_type().is_socket() {
                tracing::warn!("removing stale socket file {}", path.display());
                fs::remove_file(path).map_err(|source| Error::Bind {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }

        Self::bind(path)
    }

    /// Wrap an already-bound Unix listener.
    pub fn from_unix(listener: UnixListener) -> Self {
        Self {
            inner: StreamListener::Unix(listener),
            path: None,
            close_gate: OnceLock::new(),
        }
    }

    /// Wrap an already-bound TCP listener. Accepted connections carry no
    /// credentials.
    pub fn from_tcp(listener: TcpListener) -> Self {
        Self {
            inner: StreamListener::Tcp(listener),
            path: None,
            close_gate: OnceLock::new(),
        }
    }

    /// The filesystem path this listener was bound at, when known.
    pub fn local_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Block until a connection arrives, then attach the peer's
    /// credentials.
    ///
    /// A failed credential probe discards the accepted connection and is
    /// returned as [`Error::Credentials`]; no connection is ever handed
    /// back without a deliberate credential decision.
    pub fn accept(&self) -> Result<PeerConn, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let stream = match &self.inner {
            StreamListener::Unix(listener) => match listener.accept() {
                Ok((stream, _)) => StreamConn::Unix(stream),
                Err(err) => return Err(self.accept_error(err)),
            },
            StreamListener::Tcp(listener) => match listener.accept() {
                Ok((stream, _)) => StreamConn::Tcp(stream),
                Err(err) => return Err(self.accept_error(err)),
            },
        };

        let credentials = probe(&stream).map_err(Error::Credentials)?;
        Ok(PeerConn {
            stream,
            credentials,
        })
    }

    /// Iterator over incoming connections, for callers that want the
    /// generic listener shape.
    pub fn incoming(&self) -> Incoming<'_> {
        Incoming { listener: self }
    }

    /// Stop accepting connections.
    ///
    /// Safe to call from any number of threads, concurrently or
    /// repeatedly: the first call shuts the socket down (which also wakes
    /// an accept blocked in another thread) and every call returns that
    /// first outcome. Once closed, a listener accepts nothing ever again.
    pub fn close(&self) -> Result<(), Error> {
        let outcome = *self.close_gate.get_or_init(|| {
            tracing::debug!("closing listener");

            // SAFETY: the descriptor is owned by `self.inner` and stays
            // open until drop; shutdown on a listening socket is valid.
            let rc = unsafe { libc::shutdown(self.inner.as_raw_fd(), libc::SHUT_RDWR) };
            let errno = if rc == 0 {
                None
            } else {
                io::Error::last_os_error().raw_os_error()
            };

            if let Some(path) = &self.path {
                let _ = fs::remove_file(path);
            }

            // A listening TCP socket has no peer to shut down and reports
            // ENOTCONN; the listener is quiesced all the same.
            match errno {
                Some(code) if code == libc::ENOTCONN => None,
                other => other,
            }
        });

        match outcome {
            None => Ok(()),
            Some(raw) => Err(Error::Close(io::Error::from_raw_os_error(raw))),
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.close_gate.get().is_some()
    }

    // Accept failures on a closed listener are the forced-unblock noise of
    // `close`, not real transport errors.
    fn accept_error(&self, err: io::Error) -> Error {
        if self.is_closed() {
            Error::Closed
        } else {
            Error::Accept(err)
        }
    }
}

/// Iterator over incoming connections
pub struct Incoming<'a> {
    listener: &'a Listener,
}

impl Iterator for Incoming<'_> {
    type Item = Result<PeerConn, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.listener.accept())
    }
}

fn bind_error(path: &Path, err: io::Error) -> Error {
    // EADDRINUSE must stay recognizable no matter how many layers wrapped
    // it, so check the raw errno as well as the mapped kind.
    if err.kind() == io::ErrorKind::AddrInUse || err.raw_os_error() == Some(libc::EADDRINUSE) {
        Error::AddrInUse(path.to_path_buf())
    } else {
        Error::Bind {
            path: path.to_path_buf(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn scratch_path(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("peerlink-{}-{}.sock", tag, std::process::id()));
        let _ = fs::remove_file(&path);
        path
    }

    #[test]
    fn accepted_connection_carries_caller_identity() {
        let path = scratch_path("identity");
        let listener = Listener::bind(&path).expect("bind");

        let client_path = path.clone();
        let client = std::thread::spawn(move || PeerConn::connect(client_path).expect("connect"));

        let conn = listener.accept().expect("accept");
        let creds = conn.credentials().expect("unix accept must carry credentials");
        assert_eq!(creds.pid, std::process::id() as i32);
        assert_eq!(creds.uid, unsafe { libc::getuid() });
        assert_eq!(creds.gid, unsafe { libc::getgid() });

        let client_conn = client.join().expect("client thread");
        assert!(client_conn.credentials().is_none());

        listener.close().expect("close");
    }

    #[test]
    fn bind_reports_addr_in_use_distinctly() {
        let path = scratch_path("addrinuse");
        let first = Listener::bind(&path).expect("bind");

        match Listener::bind(&path) {
            Err(Error::AddrInUse(reported)) => assert_eq!(reported, path),
            other => panic!("expected AddrInUse, got {:?}", other.map(|_| ())),
        }

        first.close().expect("close");
    }

    #[test]
    fn bind_replacing_removes_stale_socket() {
        let path = scratch_path("replace");
        let stale = Listener::bind(&path).expect("bind");
        // Simulate a crashed instance: socket file on disk, nobody closing it.
        drop(stale);

        let listener = Listener::bind_replacing(&path).expect("rebind over stale socket");
        listener.close().expect("close");
    }

    #[test]
    fn close_is_idempotent_sequentially() {
        let path = scratch_path("close-seq");
        let listener = Listener::bind(&path).expect("bind");

        listener.close().expect("first close");
        listener.close().expect("second close");
        listener.close().expect("third close");

        assert!(matches!(listener.accept(), Err(Error::Closed)));
    }

    #[test]
    fn concurrent_close_runs_exactly_once() {
        let path = scratch_path("close-race");
        let listener = Arc::new(Listener::bind(&path).expect("bind"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let listener = Arc::clone(&listener);
            handles.push(std::thread::spawn(move || listener.close()));
        }

        for handle in handles {
            handle.join().expect("close thread").expect("every close observes the first outcome");
        }

        assert!(listener.is_closed());
    }

    #[test]
    fn tcp_accept_has_no_credentials() {
        let tcp = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = tcp.local_addr().expect("addr");
        let listener = Listener::from_tcp(tcp);

        let client = std::thread::spawn(move || TcpStream::connect(addr).expect("connect"));

        let conn = listener.accept().expect("accept");
        assert!(conn.credentials().is_none());

        drop(client.join().expect("client thread"));
        listener.close().expect("close");
    }

    #[test]
    fn end_to_end_accept_and_double_close() {
        let path = scratch_path("e2e");
        let listener = Arc::new(Listener::bind(&path).expect("bind"));

        let client_path = path.clone();
        let client = std::thread::spawn(move || PeerConn::connect(client_path).expect("connect"));

        let conn = listener.accept().expect("accept");
        let creds = conn.credentials().expect("credentials");
        assert_eq!(creds.uid, unsafe { libc::getuid() });
        drop(client.join().expect("client thread"));

        let racer = {
            let listener = Arc::clone(&listener);
            std::thread::spawn(move || listener.close())
        };
        listener.close().expect("close");
        racer
            .join()
            .expect("racing close thread")
            .expect("racing close observes the same clean outcome");
    }
}
