//! Environment protocol carrying listeners across exec.
//!
//! Three comma-joined parallel lists describe the handed-off listeners:
//!
//! - `WADDLE_HANDOFF_FDS`: descriptor numbers
//! - `WADDLE_HANDOFF_SERVICES`: service names
//! - `WADDLE_HANDOFF_NAMES`: display names (`tcp:127.0.0.1:8080->`)
//!
//! plus the scalar fields used by external control (`WADDLE_HANDOFF_PID`,
//! `WADDLE_HANDOFF_PPID`, `WADDLE_HANDOFF_SIGNAL`).
//!
//! A half-decoded handoff is never returned: any failure drops (closes) the
//! listeners adopted so far and closes the listed descriptors not yet adopted.

use std::collections::HashSet;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;

use tracing::{debug, info};

use crate::error::HandoffError;
use crate::fd::{self, SocketKind};
use crate::registry::{Listener, Registry, Service};

/// Descriptor numbers of the handed-off listeners.
pub const FDS_VAR: &str = "WADDLE_HANDOFF_FDS";
/// Service names, same order as [`FDS_VAR`].
pub const SERVICES_VAR: &str = "WADDLE_HANDOFF_SERVICES";
/// Display names, same order as [`FDS_VAR`].
pub const NAMES_VAR: &str = "WADDLE_HANDOFF_NAMES";
/// Pid of the process currently serving, set after a successful spawn.
pub const PID_VAR: &str = "WADDLE_HANDOFF_PID";
/// Pid of the process that started the handoff.
pub const PPID_VAR: &str = "WADDLE_HANDOFF_PPID";
/// Signal number external control sends.
pub const SIGNAL_VAR: &str = "WADDLE_HANDOFF_SIGNAL";

pub(crate) const LIST_SEPARATOR: char = ',';

/// The three parallel lists of a handoff, index-aligned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoffLists {
    pub descriptors: Vec<RawFd>,
    pub names: Vec<String>,
    pub display_names: Vec<String>,
}

impl HandoffLists {
    pub(crate) fn push(&mut self, descriptor: RawFd, name: String, display_name: String) {
        self.descriptors.push(descriptor);
        self.names.push(name);
        self.display_names.push(display_name);
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Environment entries for the child.
    pub fn encode(&self) -> [(&'static str, String); 3] {
        let descriptors: Vec<String> = self.descriptors.iter().map(|fd| fd.to_string()).collect();
        [
            (FDS_VAR, descriptors.join(",")),
            (SERVICES_VAR, self.names.join(",")),
            (NAMES_VAR, self.display_names.join(",")),
        ]
    }
}

impl Registry {
    /// Rebuild the registry handed off by the parent process.
    ///
    /// Returns an empty registry on a cold start (no handoff variables). Must
    /// run before the application opens any sockets of its own.
    ///
    /// The three list variables are removed after a successful decode so that
    /// later subprocesses do not see stale descriptor numbers. Like any
    /// environment mutation this is not synchronised with other threads
    /// reading the environment through libc, so call it early in `main`.
    pub fn inherit() -> Result<Self, HandoffError> {
        let registry = decode(|key| std::env::var(key).ok())?;
        // Clear the lists so child processes don't re-inherit stale values
        for key in [FDS_VAR, SERVICES_VAR, NAMES_VAR] {
            std::env::remove_var(key);
        }
        if !registry.is_empty() {
            info!(
                count = registry.len(),
                services = ?registry.names(),
                "Inherited listeners from parent process"
            );
        }
        Ok(registry)
    }
}

fn split(value: Option<String>) -> Vec<String> {
    match value {
        Some(v) if !v.is_empty() => v.split(LIST_SEPARATOR).map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// Decode a handoff from an environment lookup.
pub fn decode<F>(lookup: F) -> Result<Registry, HandoffError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw_fds = lookup(FDS_VAR);
    let raw_names = lookup(SERVICES_VAR);
    let raw_display_names = lookup(NAMES_VAR);

    if raw_fds.is_none() && raw_names.is_none() && raw_display_names.is_none() {
        debug!("No handoff in environment, cold start");
        return Ok(Registry::new());
    }

    let fds = split(raw_fds);
    let names = split(raw_names);
    let display_names = split(raw_display_names);

    if fds.len() != names.len() || fds.len() != display_names.len() {
        return Err(HandoffError::ProtocolMismatch {
            descriptors: fds.len(),
            names: names.len(),
            display_names: display_names.len(),
        });
    }

    let descriptors = fds
        .iter()
        .map(|value| {
            value
                .trim()
                .parse::<RawFd>()
                .ok()
                .filter(|fd| *fd >= 0)
                .ok_or_else(|| HandoffError::InvalidDescriptor {
                    value: value.clone(),
                })
        })
        .collect::<Result<Vec<RawFd>, HandoffError>>()?;

    let mut listed = HashSet::new();
    if let Some(&fd) = descriptors.iter().find(|&&fd| !listed.insert(fd)) {
        release(&descriptors);
        return Err(HandoffError::DuplicateDescriptor { fd });
    }
    // All entries must be open before the first one is adopted
    if let Some(&fd) = descriptors.iter().find(|&&fd| !fd::is_open(fd)) {
        release(&descriptors);
        return Err(HandoffError::Inherit {
            fd,
            source: io::Error::from_raw_os_error(libc::EBADF),
        });
    }
    let floor = descriptors.iter().max().map_or(0, |max| max + 1);

    let registry = Registry::new();
    let entries = descriptors.iter().copied().zip(names).zip(display_names);
    for (index, ((fd, name), display_name)) in entries.enumerate() {
        let adopted = adopt(fd, floor, &name).and_then(|listener| {
            debug!(
                fd,
                new_fd = listener.as_raw_fd(),
                name = %name,
                listener = %display_name,
                "Adopted inherited listener"
            );
            registry.insert(Service::new(name, display_name, listener))
        });
        if let Err(error) = adopted {
            release(&descriptors[index + 1..]);
            return Err(error);
        }
    }
    Ok(registry)
}

/// Wrap an inherited descriptor into a listener, then close the original.
///
/// The copy is numbered at or above `floor` (past every listed descriptor)
/// with close-on-exec set again. The inherited number is closed whether or
/// not the copy succeeded.
fn adopt(fd: RawFd, floor: RawFd, name: &str) -> Result<Listener, HandoffError> {
    let duplicated = fd::dup_cloexec(fd, floor);
    let closed = fd::close(fd);
    let owned = duplicated.map_err(|source| HandoffError::Inherit { fd, source })?;
    closed.map_err(|source| HandoffError::Inherit { fd, source })?;

    let kind = fd::socket_kind(owned.as_raw_fd())
        .map_err(|source| HandoffError::Inherit { fd, source })?;
    match kind {
        SocketKind::Tcp => Ok(Listener::Tcp(TcpListener::from(owned))),
        SocketKind::Unix => Ok(Listener::Unix(UnixListener::from(owned))),
        SocketKind::Other(kind) => Err(HandoffError::UnsupportedListener {
            name: name.to_string(),
            fd,
            kind,
        }),
    }
}

/// Close inherited descriptors that a failed decode will never adopt.
fn release(fds: &[RawFd]) {
    let mut closed = HashSet::new();
    for &fd in fds {
        if fd::is_open(fd) && closed.insert(fd) && fd::close(fd).is_ok() {
            debug!(fd, "Released unadopted inherited descriptor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::os::unix::io::IntoRawFd;

    fn env(entries: &[(&str, String)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    /// Cold start: no env vars → empty registry.
    #[test]
    fn test_cold_start_returns_empty() {
        let registry = decode(|_| None).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_empty_lists_decode_to_empty_registry() {
        let lookup = env(&[
            (FDS_VAR, String::new()),
            (SERVICES_VAR, String::new()),
            (NAMES_VAR, String::new()),
        ]);
        assert!(decode(lookup).unwrap().is_empty());
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let lookup = env(&[
            (FDS_VAR, "3,4".to_string()),
            (SERVICES_VAR, "a,b,c".to_string()),
            (NAMES_VAR, "x,y".to_string()),
        ]);
        let err = decode(lookup).unwrap_err();
        assert!(matches!(
            err,
            HandoffError::ProtocolMismatch {
                descriptors: 2,
                names: 3,
                display_names: 2
            }
        ));
    }

    #[test]
    fn test_partial_env_is_a_mismatch() {
        let lookup = env(&[(FDS_VAR, "3".to_string())]);
        assert!(matches!(
            decode(lookup),
            Err(HandoffError::ProtocolMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_descriptor_is_rejected() {
        let lookup = env(&[
            (FDS_VAR, "seven".to_string()),
            (SERVICES_VAR, "http".to_string()),
            (NAMES_VAR, "tcp:127.0.0.1:8080->".to_string()),
        ]);
        assert!(matches!(
            decode(lookup),
            Err(HandoffError::InvalidDescriptor { value }) if value == "seven"
        ));
    }

    /// One TCP service, as a parent would hand it over.
    #[test]
    fn test_decode_single_tcp_service() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let fd = listener.into_raw_fd();
        fd::clear_cloexec(fd).unwrap();

        let lookup = env(&[
            (FDS_VAR, fd.to_string()),
            (SERVICES_VAR, "http".to_string()),
            (NAMES_VAR, "tcp:127.0.0.1:8080->".to_string()),
        ]);
        let registry = decode(lookup).unwrap();
        assert_eq!(registry.names(), vec!["http"]);

        let service = registry.get("http").unwrap();
        assert_eq!(service.display_name(), "tcp:127.0.0.1:8080->");
        assert!(service.descriptor() > fd);
        assert!(fd::is_cloexec(service.descriptor()).unwrap());

        let Listener::Tcp(adopted) = service.try_clone_listener().unwrap() else {
            panic!("expected a TCP listener");
        };
        assert_eq!(adopted.local_addr().unwrap(), addr);
    }

    #[test]
    fn test_udp_socket_is_unsupported() {
        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap().into_raw_fd();
        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().into_raw_fd();

        let lookup = env(&[
            (FDS_VAR, format!("{},{}", tcp, udp)),
            (SERVICES_VAR, "http,dns".to_string()),
            (NAMES_VAR, "tcp:->,udp:->".to_string()),
        ]);
        let err = decode(lookup).unwrap_err();
        assert!(matches!(
            err,
            HandoffError::UnsupportedListener { ref name, fd, .. } if name == "dns" && fd == udp
        ));
    }

    #[test]
    fn test_round_trip_through_environment() {
        let parent = Registry::new();
        let mut addrs = HashMap::new();
        for name in ["http", "xmpp"] {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            addrs.insert(name, listener.local_addr().unwrap());
            parent.register(name, listener).unwrap();
        }

        let lists = parent.export().unwrap();
        assert_eq!(lists.len(), 2);
        let entries = lists.encode();

        // exec boundary: the parent's listener objects are gone, the descriptors live on
        for service in parent.snapshot() {
            let listener = service.take_listener().unwrap();
            let _ = listener.into_raw_fd();
        }

        let child = decode(env(&entries)).unwrap();
        assert_eq!(child.names(), parent.names());
        for service in child.snapshot() {
            let original = parent.get(service.name()).unwrap();
            assert_eq!(service.display_name(), original.display_name());
            let Listener::Tcp(adopted) = service.try_clone_listener().unwrap() else {
                panic!("expected a TCP listener");
            };
            assert_eq!(adopted.local_addr().unwrap(), addrs[service.name()]);
        }
    }

    /// A listed descriptor that is not open fails the decode before anything
    /// is adopted, and the open entries are released instead of leaked.
    #[test]
    fn test_missing_descriptor_fails_and_releases_the_rest() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let fd = listener.into_raw_fd();
        fd::clear_cloexec(fd).unwrap();
        let missing = RawFd::MAX;

        let lookup = env(&[
            (FDS_VAR, format!("{},{}", fd, missing)),
            (SERVICES_VAR, "http,admin".to_string()),
            (NAMES_VAR, "tcp:->,tcp:->".to_string()),
        ]);
        let err = decode(lookup).unwrap_err();
        assert!(matches!(
            err,
            HandoffError::Inherit { fd: bad, .. } if bad == missing
        ));
        assert!(std::net::TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_repeated_descriptor_is_rejected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let fd = listener.into_raw_fd();

        let lookup = env(&[
            (FDS_VAR, format!("{},{}", fd, fd)),
            (SERVICES_VAR, "http,xmpp".to_string()),
            (NAMES_VAR, "tcp:->,tcp:->".to_string()),
        ]);
        assert!(matches!(
            decode(lookup),
            Err(HandoffError::DuplicateDescriptor { fd: repeated }) if repeated == fd
        ));
        assert!(std::net::TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_unix_path_with_separator_round_trips() {
        let dir =
            std::env::temp_dir().join(format!("waddle-handoff-codec-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("a,b.sock");
        let _ = std::fs::remove_file(&path);

        let parent = Registry::new();
        parent
            .register("admin", UnixListener::bind(&path).unwrap())
            .unwrap();
        let display = parent.get("admin").unwrap().display_name().to_string();
        assert!(!display.contains(LIST_SEPARATOR));
        let entries = parent.export().unwrap().encode();

        for service in parent.snapshot() {
            let _ = service.take_listener().unwrap().into_raw_fd();
        }

        let child = decode(env(&entries)).unwrap();
        let service = child.get("admin").unwrap();
        assert_eq!(service.display_name(), display);
        let Listener::Unix(adopted) = service.try_clone_listener().unwrap() else {
            panic!("expected a Unix listener");
        };
        assert_eq!(
            adopted.local_addr().unwrap().as_pathname(),
            Some(path.as_path())
        );
        let _ = std::fs::remove_file(&path);
    }

    /// The only test that touches the real process environment.
    #[test]
    fn test_inherit_clears_list_variables() {
        for key in [FDS_VAR, SERVICES_VAR, NAMES_VAR] {
            std::env::set_var(key, "");
        }
        let registry = Registry::inherit().unwrap();
        assert!(registry.is_empty());
        for key in [FDS_VAR, SERVICES_VAR, NAMES_VAR] {
            assert!(std::env::var_os(key).is_none());
        }
    }

    #[test]
    fn test_encode_joins_in_order() {
        let mut lists = HandoffLists::default();
        lists.push(7, "http".to_string(), "tcp:127.0.0.1:8080->".to_string());
        lists.push(8, "admin".to_string(), "unix:/run/admin.sock->".to_string());
        let [fds, names, display] = lists.encode();
        assert_eq!(fds, (FDS_VAR, "7,8".to_string()));
        assert_eq!(names, (SERVICES_VAR, "http,admin".to_string()));
        assert_eq!(
            display,
            (NAMES_VAR, "tcp:127.0.0.1:8080->,unix:/run/admin.sock->".to_string())
        );
    }
}
