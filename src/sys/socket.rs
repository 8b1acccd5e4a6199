//! Socket creation and the handful of `setsockopt`/`accept4` calls the
//! Acceptor and Connection layers need. Builds directly on raw
//! descriptors rather than `std::net`, since the Acceptor needs to
//! steer non-blocking/close-on-exec flags and `SO_REUSEPORT` at
//! creation time.

use std::io;
use std::mem;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use libc::{c_int, c_void, socklen_t};

use crate::sys::syscall;
use super::fd::FileDesc;

pub fn new_nonblocking_stream_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let ty = libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    match syscall!(socket(family, ty, 0)) {
        Ok(fd) => Ok(fd),
        Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => {
            // Older kernels reject SOCK_NONBLOCK|SOCK_CLOEXEC in type; fall
            // back to setting the flags after creation.
            use std::os::unix::io::IntoRawFd;
            let fd = syscall!(socket(family, libc::SOCK_STREAM, 0))?;
            let desc = FileDesc::new(fd);
            desc.set_cloexec()?;
            desc.set_nonblocking(true)?;
            Ok(desc.into_raw_fd())
        }
        Err(e) => Err(e),
    }
}

pub fn set_reuseaddr(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as c_int)
}

pub fn set_reuseport(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as c_int)
}

pub fn set_tcp_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as c_int)
}

pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR))?;
    Ok(())
}

/// Fetches and clears `SO_ERROR`, the pending asynchronous error on a
/// socket (what a readiness notifier's error bit refers to).
pub fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut value: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut value as *mut c_int as *mut c_void,
        &mut len
    ))?;
    if value == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(value)))
    }
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(write(fd, buf.as_ptr() as *const c_void, buf.len()))?;
    Ok(n as usize)
}

fn setsockopt(fd: RawFd, level: c_int, name: c_int, value: c_int) -> io::Result<()> {
    let value = &value as *const c_int as *const c_void;
    syscall!(setsockopt(
        fd,
        level,
        name,
        value,
        mem::size_of::<c_int>() as socklen_t
    ))?;
    Ok(())
}

pub fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (raw, len) = socket_addr_to_raw(addr);
    syscall!(bind(fd, &raw as *const _ as *const libc::sockaddr, len))?;
    Ok(())
}

pub fn listen(fd: RawFd, backlog: c_int) -> io::Result<()> {
    syscall!(listen(fd, backlog))?;
    Ok(())
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len))?;
        raw_to_socket_addr(&storage, len as usize)
    }
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len))?;
        raw_to_socket_addr(&storage, len as usize)
    }
}

/// One `accept4` call, non-blocking + close-on-exec on the returned
/// descriptor. Returns `WouldBlock` when nothing is pending.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let conn_fd = loop {
            match syscall!(accept4(
                fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
            )) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        }?;

        let peer = raw_to_socket_addr(&storage, len as usize)?;
        Ok((conn_fd, peer))
    }
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let len = match addr {
            SocketAddr::V4(a) => {
                let raw = sockaddr_in_from(a);
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, raw);
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(a) => {
                let raw = sockaddr_in6_from(a);
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, raw);
                mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as socklen_t)
    }
}

fn sockaddr_in_from(addr: &SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    }
}

fn sockaddr_in6_from(addr: &SocketAddrV6) -> libc::sockaddr_in6 {
    libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: addr.port().to_be(),
        sin6_flowinfo: addr.flowinfo(),
        sin6_addr: libc::in6_addr {
            s6_addr: addr.ip().octets(),
        },
        sin6_scope_id: addr.scope_id(),
    }
}

fn raw_to_socket_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let raw: libc::sockaddr_in = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(raw.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let raw: libc::sockaddr_in6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(raw.sin6_addr.s6_addr);
            let port = u16::from_be(raw.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                raw.sin6_flowinfo,
                raw.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "unsupported address family")),
    }
}
