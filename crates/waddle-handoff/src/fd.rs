//! Raw descriptor plumbing: close-on-exec, duplication and socket probing.

use std::io;
use std::mem;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

/// What an inherited descriptor turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SocketKind {
    /// `SOCK_STREAM` over `AF_INET` or `AF_INET6`.
    Tcp,
    /// `SOCK_STREAM` over `AF_UNIX`.
    Unix,
    /// Anything else, described for diagnostics.
    Other(String),
}

/// Clear `FD_CLOEXEC` so the descriptor survives exec.
///
/// Clearing an already-clear flag is a no-op, so repeated restarts are fine.
pub(crate) fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::FD_CLOEXEC == 0 {
        return Ok(());
    }
    let result = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn is_cloexec(fd: RawFd) -> io::Result<bool> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::FD_CLOEXEC != 0)
}

/// Whether `fd` names an open descriptor in this process.
pub(crate) fn is_open(fd: RawFd) -> bool {
    (unsafe { libc::fcntl(fd, libc::F_GETFD) }) >= 0
}

/// Duplicate `fd` into a new owned descriptor, numbered `floor` or above,
/// with `FD_CLOEXEC` set.
pub(crate) fn dup_cloexec(fd: RawFd, floor: RawFd) -> io::Result<OwnedFd> {
    let new_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, floor) };
    if new_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fcntl just handed us a fresh descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

/// Close a raw descriptor, reporting the error `close(2)` returns.
pub(crate) fn close(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::close(fd) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Validate that a file descriptor is a socket using fstat.
fn is_socket(fd: RawFd) -> io::Result<bool> {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK)
}

/// Classify the socket behind `fd` by type and address family.
pub(crate) fn socket_kind(fd: RawFd) -> io::Result<SocketKind> {
    if !is_socket(fd)? {
        return Ok(SocketKind::Other("not a socket".to_string()));
    }

    let mut sock_type: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut sock_type as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockname(
            fd,
            &mut addr as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    let family = libc::c_int::from(addr.ss_family);

    if sock_type != libc::SOCK_STREAM {
        return Ok(SocketKind::Other(format!(
            "a socket of type {} (family {})",
            sock_type, family
        )));
    }

    Ok(match family {
        libc::AF_INET | libc::AF_INET6 => SocketKind::Tcp,
        libc::AF_UNIX => SocketKind::Unix,
        other => SocketKind::Other(format!("a stream socket of family {}", other)),
    })
}
