//! Recovery of listening sockets handed over by a socket activator.
//!
//! An activator (systemd) binds the sockets before launching the service
//! and communicates them through three environment variables: the target
//! pid (`LISTEN_PID`), the descriptor count (`LISTEN_FDS`), and a
//! colon-separated name per descriptor (`LISTEN_FDNAMES`). The
//! descriptors themselves sit at a fixed slot in the descriptor table,
//! starting at [`LISTEN_FDS_START`], in name-list order.
//!
//! systemd before v227 never sets `LISTEN_FDNAMES`. A missing (or empty)
//! name list therefore defaults every slot to the name `"unknown"`, the
//! same default `sd_listen_fds_with_names(3)` uses; a name list that is
//! present but disagrees with the descriptor count is still an error.

use std::collections::HashMap;
use std::env;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixListener;

use crate::error::Error;
use crate::listener::Listener;

/// First descriptor slot the activator uses; 0 through 2 are the
/// standard streams.
pub const LISTEN_FDS_START: RawFd = 3;

const LISTEN_PID: &str = "LISTEN_PID";
const LISTEN_FDS: &str = "LISTEN_FDS";
const LISTEN_FDNAMES: &str = "LISTEN_FDNAMES";

// Name given to slots the activator did not name, per
// sd_listen_fds_with_names(3).
const DEFAULT_NAME: &str = "unknown";

/// Activation state as handed over by the environment.
///
/// Read once at discovery time; never re-read or watched afterward.
#[derive(Debug, Clone)]
pub struct ActivationEnv {
    pid: Option<String>,
    fds: Option<String>,
    names: Option<String>,
}

impl ActivationEnv {
    /// Snapshot the three activation variables from the process
    /// environment.
    pub fn from_env() -> Self {
        Self {
            pid: env::var(LISTEN_PID).ok(),
            fds: env::var(LISTEN_FDS).ok(),
            names: env::var(LISTEN_FDNAMES).ok(),
        }
    }

    fn validate(&self, our_pid: u32) -> Result<ActivationLayout, Error> {
        let (Some(pid), Some(fds)) = (&self.pid, &self.fds) else {
            return Err(Error::ActivationNotPresent);
        };

        let env_pid: i32 = pid.parse().map_err(|_| {
            Error::ActivationInvalid(format!("{LISTEN_PID} is not a pid: {pid:?}"))
        })?;
        if env_pid != our_pid as i32 {
            return Err(Error::ActivationPidMismatch { env_pid, our_pid });
        }

        let fd_count: usize = fds.parse().map_err(|_| {
            Error::ActivationInvalid(format!("{LISTEN_FDS} is not a count: {fds:?}"))
        })?;

        let names: Vec<String> = match self.names.as_deref() {
            // systemd < v227 sets no name list at all.
            None | Some("") => vec![DEFAULT_NAME.to_owned(); fd_count],
            Some(list) => list.split(':').map(str::to_owned).collect(),
        };

        if names.len() != fd_count {
            return Err(Error::ActivationCountMismatch {
                fds: fd_count,
                names: names.len(),
            });
        }

        Ok(ActivationLayout { names })
    }
}

#[derive(Debug)]
struct ActivationLayout {
    names: Vec<String>,
}

/// Recover every activated listener, keyed by its socket name.
///
/// The name of each entry comes from the activator (systemd's
/// `FileDescriptorName=` directive, defaulting to the socket unit name;
/// `"unknown"` per slot when the activator sets no name list at all).
/// Each descriptor is consumed exactly once. Missing activation state is
/// the distinct [`Error::ActivationNotPresent`] so callers can fall back
/// to binding directly; a pid mismatch fails before any descriptor is
/// touched; a disagreement between the advertised count and a present
/// name list fails hard rather than guessing, as does a name shared by
/// several descriptors (the map cannot represent both).
pub fn activated_listeners() -> Result<HashMap<String, Listener>, Error> {
    let layout = ActivationEnv::from_env().validate(std::process::id())?;
    let listeners = listeners_from(&layout, LISTEN_FDS_START)?;
    tracing::info!(
        "recovered {} activated listener(s): {:?}",
        listeners.len(),
        layout.names
    );
    Ok(listeners)
}

/// Recover the single activated listener.
///
/// Zero activated sockets is [`Error::NoActivatedSockets`]; more than
/// one closes them all and returns
/// [`Error::MultipleActivatedSockets`], with no partial hand-back.
/// Callers expecting several sockets use [`activated_listeners`].
pub fn activated_listener() -> Result<Listener, Error> {
    single_from(activated_listeners()?)
}

fn single_from(map: HashMap<String, Listener>) -> Result<Listener, Error> {
    if map.len() > 1 {
        let count = map.len();
        for listener in map.values() {
            let _ = listener.close();
        }
        return Err(Error::MultipleActivatedSockets(count));
    }

    map.into_values().next().ok_or(Error::NoActivatedSockets)
}

fn listeners_from(
    layout: &ActivationLayout,
    fd_base: RawFd,
) -> Result<HashMap<String, Listener>, Error> {
    let mut out = HashMap::new();

    for (index, name) in layout.names.iter().enumerate() {
        let fd = fd_base + index as RawFd;
        let listener = listener_from_fd(fd).map_err(|source| Error::ActivationDescriptor {
            fd,
            name: name.clone(),
            source,
        })?;
        tracing::debug!("activated listener {:?} at fd {}", name, fd);
        // A repeated key would silently drop a listener; descriptors
        // that cannot be told apart by name are a configuration error.
        if out.insert(name.clone(), listener).is_some() {
            return Err(Error::ActivationInvalid(format!(
                "duplicate socket name {name:?}"
            )));
        }
    }

    Ok(out)
}

/// Take ownership of one activated descriptor, after checking it really
/// is a socket and classifying its address family.
fn listener_from_fd(fd: RawFd) -> io::Result<Listener> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fstat writes into the zeroed stat buffer; fd validity is
    // checked through the return code.
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if st.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptor is not a socket",
        ));
    }

    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: getsockname writes at most `len` bytes into the storage
    // and updates `len`; both are valid stack locations.
    let rc = unsafe { libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // The activator may have left the socket non-blocking; the accept
    // loop expects blocking descriptors.
    match addr.ss_family as libc::c_int {
        libc::AF_UNIX => {
            // SAFETY: verified socket descriptor; ownership transfers to
            // the listener here and nothing else uses the slot again.
            let listener = unsafe { UnixListener::from_raw_fd(fd) };
            listener.set_nonblocking(false)?;
            Ok(Listener::from_unix(listener))
        }
        libc::AF_INET | libc::AF_INET6 => {
            // SAFETY: as above.
            let listener = unsafe { TcpListener::from_raw_fd(fd) };
            listener.set_nonblocking(false)?;
            Ok(Listener::from_tcp(listener))
        }
        family => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported socket family {family}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::io::IntoRawFd;
    use std::path::PathBuf;

    use super::*;
    use crate::listener::PeerConn;

    fn env(pid: Option<&str>, fds: Option<&str>, names: Option<&str>) -> ActivationEnv {
        ActivationEnv {
            pid: pid.map(str::to_owned),
            fds: fds.map(str::to_owned),
            names: names.map(str::to_owned),
        }
    }

    fn scratch_path(tag: &str) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("peerlink-{}-{}.sock", tag, std::process::id()));
        let _ = fs::remove_file(&path);
        path
    }

    // Pin a freshly bound listener's descriptor at a known slot, the way
    // the activator would have.
    fn pin_listener_at(path: &PathBuf, slot: RawFd) {
        let listener = std::os::unix::net::UnixListener::bind(path).expect("bind");
        let fd = listener.into_raw_fd();
        // SAFETY: fd is owned (into_raw_fd) and slot is an unused table
        // entry reserved for this test.
        unsafe {
            assert_eq!(libc::dup2(fd, slot), slot);
            libc::close(fd);
        }
    }

    #[test]
    fn missing_environment_is_not_present() {
        let result = env(None, None, None).validate(std::process::id());
        assert!(matches!(result, Err(Error::ActivationNotPresent)));

        let result = env(Some("1"), None, None).validate(std::process::id());
        assert!(matches!(result, Err(Error::ActivationNotPresent)));
    }

    #[test]
    fn pid_mismatch_fails_before_descriptors() {
        let result = env(Some("1"), Some("2"), Some("a:b")).validate(std::process::id());
        assert!(matches!(
            result,
            Err(Error::ActivationPidMismatch { env_pid: 1, .. })
        ));
    }

    #[test]
    fn unparsable_state_is_invalid() {
        let ours = std::process::id();
        let ours_str = ours.to_string();
        assert!(matches!(
            env(Some("not-a-pid"), Some("1"), Some("a")).validate(ours),
            Err(Error::ActivationInvalid(_))
        ));
        assert!(matches!(
            env(Some(ours_str.as_str()), Some("many"), Some("a")).validate(ours),
            Err(Error::ActivationInvalid(_))
        ));
    }

    #[test]
    fn count_and_present_names_must_agree() {
        let ours = std::process::id();
        let ours_str = ours.to_string();
        let result = env(Some(ours_str.as_str()), Some("2"), Some("only-one")).validate(ours);
        assert!(matches!(
            result,
            Err(Error::ActivationCountMismatch { fds: 2, names: 1 })
        ));

        let result = env(Some(ours_str.as_str()), Some("3"), Some("a:b")).validate(ours);
        assert!(matches!(
            result,
            Err(Error::ActivationCountMismatch { fds: 3, names: 2 })
        ));
    }

    // systemd before v227 never sets LISTEN_FDNAMES.
    #[test]
    fn absent_names_default_to_unknown_per_slot() {
        let ours = std::process::id();
        let ours_str = ours.to_string();

        let layout = env(Some(ours_str.as_str()), Some("1"), None)
            .validate(ours)
            .expect("layout without a name list");
        assert_eq!(layout.names, vec!["unknown"]);

        let layout = env(Some(ours_str.as_str()), Some("2"), Some(""))
            .validate(ours)
            .expect("layout with an empty name list");
        assert_eq!(layout.names, vec!["unknown", "unknown"]);
    }

    #[test]
    fn valid_environment_yields_ordered_names() {
        let ours = std::process::id();
        let ours_str = ours.to_string();
        let layout = env(Some(ours_str.as_str()), Some("2"), Some("api:events"))
            .validate(ours)
            .expect("layout");
        assert_eq!(layout.names, vec!["api", "events"]);
    }

    #[test]
    fn listeners_are_rebuilt_from_pinned_descriptors() {
        // Slots far above anything the test harness itself holds open.
        const BASE: RawFd = 510;

        let api_path = scratch_path("sd-api");
        let events_path = scratch_path("sd-events");
        pin_listener_at(&api_path, BASE);
        pin_listener_at(&events_path, BASE + 1);

        let layout = ActivationLayout {
            names: vec!["api".into(), "events".into()],
        };
        let listeners = listeners_from(&layout, BASE).expect("rebuild");
        assert_eq!(listeners.len(), 2);

        // The rebuilt listener must actually accept, with credentials.
        let api = listeners.get("api").expect("api entry");
        let client =
            std::thread::spawn(move || PeerConn::connect(api_path).expect("connect"));
        let conn = api.accept().expect("accept");
        assert!(conn.credentials().is_some());
        drop(client.join().expect("client thread"));

        for listener in listeners.values() {
            listener.close().expect("close");
        }
        let _ = fs::remove_file(&events_path);
    }

    #[test]
    fn unnamed_single_descriptor_rebuilds_under_the_default_name() {
        const SLOT: RawFd = 530;

        let path = scratch_path("sd-unnamed");
        pin_listener_at(&path, SLOT);

        let ours = std::process::id();
        let ours_str = ours.to_string();
        let layout = env(Some(ours_str.as_str()), Some("1"), None)
            .validate(ours)
            .expect("layout");
        let listeners = listeners_from(&layout, SLOT).expect("rebuild");

        let unnamed = listeners.get("unknown").expect("default-named entry");
        let client = std::thread::spawn(move || PeerConn::connect(path).expect("connect"));
        let conn = unnamed.accept().expect("accept");
        assert!(conn.credentials().is_some());
        drop(client.join().expect("client thread"));

        unnamed.close().expect("close");
    }

    #[test]
    fn duplicate_socket_names_are_rejected() {
        const BASE: RawFd = 540;

        let a_path = scratch_path("sd-dup-a");
        let b_path = scratch_path("sd-dup-b");
        pin_listener_at(&a_path, BASE);
        pin_listener_at(&b_path, BASE + 1);

        let layout = ActivationLayout {
            names: vec!["dup".into(), "dup".into()],
        };
        match listeners_from(&layout, BASE) {
            Err(Error::ActivationInvalid(message)) => assert!(message.contains("dup")),
            other => panic!("expected ActivationInvalid, got {:?}", other.map(|_| ())),
        }
        let _ = fs::remove_file(&a_path);
        let _ = fs::remove_file(&b_path);
    }

    #[test]
    fn non_socket_descriptor_is_rejected() {
        const SLOT: RawFd = 520;
        let file = fs::File::open("/dev/null").expect("open");
        let fd = file.into_raw_fd();
        // SAFETY: fd is owned and SLOT is reserved for this test.
        unsafe {
            assert_eq!(libc::dup2(fd, SLOT), SLOT);
            libc::close(fd);
        }

        let layout = ActivationLayout {
            names: vec!["bogus".into()],
        };
        match listeners_from(&layout, SLOT) {
            Err(Error::ActivationDescriptor { fd, name, .. }) => {
                assert_eq!(fd, SLOT);
                assert_eq!(name, "bogus");
            }
            other => panic!("expected ActivationDescriptor, got {:?}", other.map(|_| ())),
        }
        // SAFETY: the failed rebuild never took ownership of the slot.
        unsafe {
            libc::close(SLOT);
        }
    }

    #[test]
    fn single_listener_requires_exactly_one() {
        assert!(matches!(
            single_from(HashMap::new()),
            Err(Error::NoActivatedSockets)
        ));

        let one_path = scratch_path("sd-one");
        let mut one = HashMap::new();
        one.insert("only".to_string(), Listener::bind(&one_path).expect("bind"));
        let listener = single_from(one).expect("single");
        listener.close().expect("close");

        let mut many = HashMap::new();
        for tag in ["sd-a", "sd-b"] {
            let path = scratch_path(tag);
            many.insert(tag.to_string(), Listener::bind(&path).expect("bind"));
        }
        match single_from(many) {
            Err(Error::MultipleActivatedSockets(2)) => {}
            other => panic!("expected MultipleActivatedSockets, got {:?}", other.map(|_| ())),
        }
    }
}
