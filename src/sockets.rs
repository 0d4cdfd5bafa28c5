//! Thin wrappers over the OS socket calls.
//!
//! Everything here is a direct syscall with errno translated to
//! `io::Error`; policy (retry, close, abort) lives in the callers.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

use log::warn;

use crate::error::Error;

/// Create a non-blocking, close-on-exec TCP socket for the given family
/// (`libc::AF_INET` or `libc::AF_INET6`).
pub(crate) fn create_nonblocking(family: libc::c_int) -> Result<RawFd, Error> {
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(fd)
}

pub(crate) fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = socket_addr_to_sockaddr(addr, &mut storage);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn listen(fd: RawFd) -> io::Result<()> {
    let ret = unsafe { libc::listen(fd, libc::SOMAXCONN) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Accept one pending connection as a non-blocking close-on-exec
/// descriptor, together with its peer address. Errno handling is the
/// caller's job; see [`accept_error_is_fatal`].
pub(crate) fn accept(listen_fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let peer = sockaddr_to_socket_addr(&storage)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    Ok((fd, peer))
}

/// Classify an accept errno. The recoverable class (transient, per-call)
/// is retried on the next readiness event; everything else indicates a
/// broken process state and the acceptor aborts.
pub(crate) fn accept_error_is_fatal(errno: i32) -> bool {
    match errno {
        // Transient: would-block, aborted handshake, signal, protocol
        // hiccup, firewall, process descriptor table full (recovered via
        // the idle reserve).
        libc::EAGAIN | libc::ECONNABORTED | libc::EINTR | libc::EPROTO | libc::EPERM
        | libc::EMFILE => false,
        // Broken: bad listen fd, bad address memory, invalid args,
        // system-wide table full, no kernel memory, not a stream socket.
        libc::EBADF | libc::EFAULT | libc::EINVAL | libc::ENFILE | libc::ENOBUFS
        | libc::ENOMEM | libc::EOPNOTSUPP => true,
        _ => true,
    }
}

pub(crate) fn write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub(crate) fn close(fd: RawFd) {
    if unsafe { libc::close(fd) } < 0 {
        warn!("close({fd}): {}", io::Error::last_os_error());
    }
}

pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::shutdown(fd, libc::SHUT_WR) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Fetch and clear the pending socket error (`SO_ERROR`).
pub(crate) fn socket_error(fd: RawFd) -> i32 {
    let mut optval: libc::c_int = 0;
    let mut optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut _ as *mut libc::c_void,
            &mut optlen,
        )
    };
    if ret < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        optval
    }
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
    let optval: libc::c_int = if on { 1 } else { 0 };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn set_reuse_addr(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub(crate) fn set_reuse_port(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
}

pub(crate) fn set_keep_alive(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

pub(crate) fn set_tcp_no_delay(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_socket_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
}

#[allow(dead_code)]
pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_socket_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
}

/// True when the connection's local and peer endpoints are the same
/// address and port (a TCP simultaneous-open artifact).
#[allow(dead_code)]
pub(crate) fn is_self_connect(fd: RawFd) -> bool {
    match (local_addr(fd), peer_addr(fd)) {
        (Ok(local), Ok(peer)) => local == peer,
        _ => false,
    }
}

/// Write a `SocketAddr` into a `sockaddr_storage`; returns the length.
pub(crate) fn socket_addr_to_sockaddr(
    addr: &SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Read a `sockaddr_storage` back into a `SocketAddr`.
pub(crate) fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Owned socket descriptor; closed exactly once on drop.
pub(crate) struct Socket {
    fd: RawFd,
}

impl Socket {
    pub(crate) fn new(fd: RawFd) -> Self {
        Socket { fd }
    }

    /// Create the listening socket for `addr`'s family.
    pub(crate) fn listener_for(addr: &SocketAddr) -> Result<Self, Error> {
        let family = if addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        Ok(Socket::new(create_nonblocking(family)?))
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn bind_address(&self, addr: &SocketAddr) -> Result<(), Error> {
        bind(self.fd, addr).map_err(|source| Error::Bind {
            addr: *addr,
            source,
        })
    }

    pub(crate) fn listen(&self) -> Result<(), Error> {
        listen(self.fd).map_err(Error::Io)
    }

    pub(crate) fn shutdown_write(&self) {
        if let Err(e) = shutdown_write(self.fd) {
            warn!("shutdown_write fd={}: {e}", self.fd);
        }
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) {
        if let Err(e) = set_reuse_addr(self.fd, on) {
            warn!("SO_REUSEADDR fd={}: {e}", self.fd);
        }
    }

    pub(crate) fn set_reuse_port(&self, on: bool) {
        if let Err(e) = set_reuse_port(self.fd, on) {
            warn!("SO_REUSEPORT fd={}: {e}", self.fd);
        }
    }

    pub(crate) fn set_keep_alive(&self, on: bool) {
        if let Err(e) = set_keep_alive(self.fd, on) {
            warn!("SO_KEEPALIVE fd={}: {e}", self.fd);
        }
    }

    pub(crate) fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = set_tcp_no_delay(self.fd, on) {
            warn!("TCP_NODELAY fd={}: {e}", self.fd);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.168.1.9:4567".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = socket_addr_to_sockaddr(&addr, &mut storage);
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in>());
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:80".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = socket_addr_to_sockaddr(&addr, &mut storage);
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in6>());
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }

    #[test]
    fn accept_errno_classes() {
        for errno in [
            libc::EAGAIN,
            libc::ECONNABORTED,
            libc::EINTR,
            libc::EPROTO,
            libc::EPERM,
            libc::EMFILE,
        ] {
            assert!(!accept_error_is_fatal(errno), "errno {errno} is recoverable");
        }
        for errno in [
            libc::EBADF,
            libc::EFAULT,
            libc::EINVAL,
            libc::ENFILE,
            libc::ENOBUFS,
            libc::ENOMEM,
            libc::EOPNOTSUPP,
        ] {
            assert!(accept_error_is_fatal(errno), "errno {errno} is fatal");
        }
        // Anything unrecognized counts as fatal.
        assert!(accept_error_is_fatal(libc::EIO));
    }

    #[test]
    fn listener_binds_and_reports_local_addr() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = Socket::listener_for(&addr).unwrap();
        socket.set_reuse_addr(true);
        socket.bind_address(&addr).unwrap();
        socket.listen().unwrap();

        let bound = local_addr(socket.fd()).unwrap();
        assert_eq!(bound.ip(), addr.ip());
        assert_ne!(bound.port(), 0);
    }

    #[test]
    fn bind_conflict_is_reported() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let first = Socket::listener_for(&addr).unwrap();
        first.bind_address(&addr).unwrap();
        first.listen().unwrap();
        let bound = local_addr(first.fd()).unwrap();

        let second = Socket::listener_for(&bound).unwrap();
        let err = second.bind_address(&bound).unwrap_err();
        match err {
            Error::Bind { addr: a, source } => {
                assert_eq!(a, bound);
                assert_eq!(source.kind(), std::io::ErrorKind::AddrInUse);
            }
            other => panic!("expected Bind error, got {other}"),
        }
    }
}
