use std::io;
use std::mem::size_of;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// A type with the same memory layout as `libc::sockaddr`. Used in converting
/// Rust level `SocketAddr`s into their system representation. The benefit of
/// this type over `libc::sockaddr_storage` is that this type is the correct
/// size for the address family it holds, so the kernel is never handed
/// uninitialised trailing bytes.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const _ as *const libc::sockaddr
    }
}

/// Converts a `SocketAddr` into its system representation.
pub(crate) fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(ref addr) => {
            // `s_addr` is stored as BE on all machines, and the array is in BE
            // order. So the native endian conversion method is used so that
            // it's never swapped.
            let sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            };

            let sockaddr_in = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr,
                sin_zero: [0; 8],
            };

            let sockaddr = SocketAddrCRepr { v4: sockaddr_in };
            let socklen = size_of::<libc::sockaddr_in>() as libc::socklen_t;
            (sockaddr, socklen)
        }
        SocketAddr::V6(ref addr) => {
            let sockaddr_in6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_flowinfo: addr.flowinfo(),
                sin6_scope_id: addr.scope_id(),
            };

            let sockaddr = SocketAddrCRepr { v6: sockaddr_in6 };
            let socklen = size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            (sockaddr, socklen)
        }
    }
}

/// Converts a system `sockaddr_storage` back into a `SocketAddr`.
///
/// # Safety
///
/// `storage` must hold a `sockaddr_in` or `sockaddr_in6` written by the
/// kernel.
pub(crate) unsafe fn to_socket_addr(
    storage: *const libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = &*(storage as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = &*(storage as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

/// Creates a non-blocking, close-on-exec stream socket for `addr`'s family.
/// Both flags are applied atomically in the `socket(2)` call; there is no
/// window where the descriptor could leak across a fork or block.
pub(crate) fn new_stream_socket(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };
    let ty = libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    let fd = syscall!(socket(domain, ty, 0))?;
    // SAFETY: `socket(2)` ensures the fd is valid.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (raw_addr, raw_addr_length) = socket_addr(addr);
    syscall!(bind(fd, raw_addr.as_ptr(), raw_addr_length)).map(|_| ())
}

pub(crate) fn listen(fd: RawFd, backlog: libc::c_int) -> io::Result<()> {
    syscall!(listen(fd, backlog)).map(|_| ())
}

/// Accepts one connection, returning the peer address alongside the new
/// descriptor. The accepted socket inherits nothing; non-blocking and
/// close-on-exec are set atomically by `accept4(2)`.
pub(crate) fn accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut length = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let stream = syscall!(accept4(
        fd,
        &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
        &mut length,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))
    // SAFETY: `accept4(2)` ensures the fd is valid.
    .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })?;

    let addr = unsafe { to_socket_addr(&storage)? };
    Ok((stream, addr))
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut length = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
        &mut length,
    ))?;
    unsafe { to_socket_addr(&storage) }
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut length = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
        &mut length,
    ))?;
    unsafe { to_socket_addr(&storage) }
}

fn set_bool_option(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    enable: bool,
) -> io::Result<()> {
    let value: libc::c_int = i32::from(enable);
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const libc::c_int as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

pub(crate) fn set_reuseaddr(fd: RawFd, enable: bool) -> io::Result<()> {
    set_bool_option(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, enable)
}

pub(crate) fn set_reuseport(fd: RawFd, enable: bool) -> io::Result<()> {
    set_bool_option(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, enable)
}

pub(crate) fn set_nodelay(fd: RawFd, enable: bool) -> io::Result<()> {
    set_bool_option(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, enable)
}

/// Closes the write half; any buffered data already written to the kernel is
/// still flushed to the peer before the FIN.
pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR)).map(|_| ())
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|n| n as usize)
}

/// Returns the pending socket error, if any, clearing it in the process.
pub(crate) fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut value: libc::c_int = 0;
    let mut length = size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut value as *mut libc::c_int as *mut libc::c_void,
        &mut length,
    ))?;
    if value == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(value)))
    }
}

/// Opens the sentinel descriptor used by the acceptor's EMFILE recovery.
pub(crate) fn open_idle_fd() -> io::Result<OwnedFd> {
    let path = b"/dev/null\0";
    let fd = syscall!(open(
        path.as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC,
    ))?;
    // SAFETY: `open(2)` ensures the fd is valid.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
