//! Opening and closing of listen fds for socket units.
//!
//! Stream and datagram addresses are either filesystem paths (unix
//! sockets) or `[host:]port` (TCP/UDP); FIFOs are created with mkfifo and
//! opened read-write so the manager's end never sees EOF while no writer
//! is around.

use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::IntoRawFd;
use std::path::Path;

use log::trace;

use crate::units::ListenSpec;

/// Close, retrying on EINTR/EIO and treating EBADF as already closed.
pub fn close_raw_fd(fd: i32) {
    loop {
        let ret = unsafe { libc::close(fd) };
        if ret == 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EBADF) {
            break;
        }
    }
}

/// Set or clear FD_CLOEXEC on an fd. Errors are ignored; a bad fd here is
/// a stale store entry, not something to act on.
pub fn set_cloexec(fd: i32, on: bool) {
    use std::os::fd::BorrowedFd;

    let flag = if on {
        nix::fcntl::FdFlag::FD_CLOEXEC
    } else {
        nix::fcntl::FdFlag::empty()
    };
    let _ = nix::fcntl::fcntl(
        unsafe { BorrowedFd::borrow_raw(fd) },
        nix::fcntl::FcntlArg::F_SETFD(flag),
    );
}

/// Open one listen fd for a socket unit. `mode` applies to freshly
/// created filesystem entries (unix sockets, FIFOs); 0 keeps the umask
/// default.
pub fn open_listen_fd(spec: &ListenSpec, mode: u32) -> Result<i32, String> {
    match spec {
        ListenSpec::Stream(addr) => {
            if addr.starts_with('/') {
                let path = Path::new(addr);
                remove_stale_node(path);
                let listener = std::os::unix::net::UnixListener::bind(path)
                    .map_err(|e| format!("cannot bind unix socket {addr}: {e}"))?;
                apply_node_mode(path, mode);
                let fd = listener.into_raw_fd();
                trace!("opened unix stream socket {addr} as fd {fd}");
                Ok(fd)
            } else {
                let listener = std::net::TcpListener::bind(tcp_addr(addr))
                    .map_err(|e| format!("cannot bind tcp socket {addr}: {e}"))?;
                let fd = listener.into_raw_fd();
                trace!("opened tcp socket {addr} as fd {fd}");
                Ok(fd)
            }
        }
        ListenSpec::Datagram(addr) => {
            if addr.starts_with('/') {
                let path = Path::new(addr);
                remove_stale_node(path);
                let socket = std::os::unix::net::UnixDatagram::bind(path)
                    .map_err(|e| format!("cannot bind unix datagram {addr}: {e}"))?;
                apply_node_mode(path, mode);
                let fd = socket.into_raw_fd();
                trace!("opened unix datagram socket {addr} as fd {fd}");
                Ok(fd)
            } else {
                let socket = std::net::UdpSocket::bind(tcp_addr(addr))
                    .map_err(|e| format!("cannot bind udp socket {addr}: {e}"))?;
                let fd = socket.into_raw_fd();
                trace!("opened udp socket {addr} as fd {fd}");
                Ok(fd)
            }
        }
        ListenSpec::FifoPath(path) => {
            remove_stale_node(path);
            let fifo_mode = if mode == 0 { 0o666 } else { mode };
            nix::unistd::mkfifo(
                path.as_path(),
                nix::sys::stat::Mode::from_bits_truncate(fifo_mode),
            )
            .map_err(|e| format!("cannot create fifo {}: {e}", path.display()))?;
            // Read-write keeps the fd alive with no writer attached.
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
                .map_err(|e| format!("cannot open fifo {}: {e}", path.display()))?;
            let fd = file.into_raw_fd();
            trace!("opened fifo {} as fd {fd}", path.display());
            Ok(fd)
        }
    }
}

/// Undo [`open_listen_fd`]: close the fd and remove the filesystem node
/// for path-based sockets. The fd is gone either way; the error reports a
/// node that could not be removed.
pub fn close_listen_fd(spec: &ListenSpec, fd: i32) -> Result<(), String> {
    close_raw_fd(fd);
    match spec {
        ListenSpec::Stream(addr) | ListenSpec::Datagram(addr) if addr.starts_with('/') => {
            remove_node(Path::new(addr))
        }
        ListenSpec::FifoPath(path) => remove_node(path),
        _ => Ok(()),
    }
}

fn tcp_addr(addr: &str) -> String {
    // A bare port listens on all interfaces.
    if addr.parse::<u16>().is_ok() {
        format!("0.0.0.0:{addr}")
    } else {
        addr.to_owned()
    }
}

fn remove_stale_node(path: &Path) {
    if path.symlink_metadata().is_ok() {
        let _ = std::fs::remove_file(path);
    }
}

fn remove_node(path: &Path) -> Result<(), String> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(format!("cannot remove {}: {e}", path.display())),
    }
}

fn apply_node_mode(path: &Path, mode: u32) {
    if mode != 0 {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::ListenSpec;

    #[test]
    fn unix_stream_open_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.socket");
        let spec = ListenSpec::Stream(path.to_string_lossy().into_owned());

        let fd = open_listen_fd(&spec, 0o660).unwrap();
        assert!(fd >= 0);
        assert!(path.exists());

        close_listen_fd(&spec, fd).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn fifo_open_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fifo");
        let spec = ListenSpec::FifoPath(path.clone());

        let fd = open_listen_fd(&spec, 0o600).unwrap();
        assert!(fd >= 0);
        assert!(path.exists());

        close_listen_fd(&spec, fd).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn rebinding_replaces_a_stale_node() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.socket");
        let spec = ListenSpec::Stream(path.to_string_lossy().into_owned());

        let fd = open_listen_fd(&spec, 0).unwrap();
        // simulate a crashed manager leaving the node behind
        close_raw_fd(fd);
        let fd = open_listen_fd(&spec, 0).unwrap();
        close_listen_fd(&spec, fd).unwrap();
    }

    #[test]
    fn tcp_port_shorthand() {
        assert_eq!(tcp_addr("8080"), "0.0.0.0:8080");
        assert_eq!(tcp_addr("127.0.0.1:8080"), "127.0.0.1:8080");
    }
}
