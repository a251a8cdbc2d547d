//! Component F (syscall layer): raw, non-blocking socket operations.
//! Everything here is a thin wrapper over a single libc call plus
//! `EAGAIN`/`EWOULDBLOCK`/`EINTR` translation; the state machine that
//! decides *when* to call these lives in `worker.rs`.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::sockaddr;

pub(crate) const MAX_UDP_PACKAGE: usize = 65535;

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fd is a valid, just-created socket fd.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn new_tcp_socket(addr: SocketAddr) -> io::Result<RawFd> {
    let family = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    // SAFETY: plain socket(2) call with validated constant arguments.
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    set_nonblocking(fd)?;
    Ok(fd)
}

pub(crate) fn new_udp_socket(addr: SocketAddr) -> io::Result<RawFd> {
    let family = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    // SAFETY: plain socket(2) call with validated constant arguments.
    let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    set_nonblocking(fd)?;
    Ok(fd)
}

/// `connect()`; `Ok(true)` means the connection completed immediately
/// (rare, usually loopback), `Ok(false)` means it's in progress and
/// completion must be confirmed via `SO_ERROR` once the fd is writable.
pub(crate) fn connect_nonblocking(fd: RawFd, addr: SocketAddr) -> io::Result<bool> {
    let (storage, len) = sockaddr::to_raw(addr);
    // SAFETY: storage/len describe a valid sockaddr of the matching family.
    let rc = unsafe {
        libc::connect(
            fd,
            std::ptr::addr_of!(storage).cast(),
            len,
        )
    };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == Some(libc::EINPROGRESS)
    {
        return Ok(false);
    }
    Err(err)
}

pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: err/len describe a valid out-buffer for SO_ERROR.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::addr_of_mut!(err).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

pub(crate) fn bind_and_listen(addr: SocketAddr, backlog: i32) -> io::Result<RawFd> {
    let fd = new_tcp_socket(addr)?;
    let one: libc::c_int = 1;
    // SAFETY: fd is freshly created and still owned here; `one` lives for the call.
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(one).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    let (storage, len) = sockaddr::to_raw(addr);
    // SAFETY: storage/len describe a valid sockaddr for this fd's family.
    let rc = unsafe { libc::bind(fd, std::ptr::addr_of!(storage).cast(), len) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        // SAFETY: fd is owned and not yet handed to a caller.
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }
    // SAFETY: fd is a bound, valid socket.
    let rc = unsafe { libc::listen(fd, backlog) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        // SAFETY: fd is owned and not yet handed to a caller.
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }
    Ok(fd)
}

/// `getsockname`: the actual address a socket ended up bound to, needed
/// whenever the caller asked for an ephemeral port (`:0`) and the real
/// assignment only exists after `bind`.
pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage/len describe a valid out-buffer for getsockname(2).
    let rc = unsafe { libc::getsockname(fd, std::ptr::addr_of_mut!(storage).cast(), &mut len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr::from_raw(&storage).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported local address family"))
}

/// `getpeername`: the remote address a connected socket ended up talking
/// to, used for the `OPEN` event's peer-address field.
pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage/len describe a valid out-buffer for getpeername(2).
    let rc = unsafe { libc::getpeername(fd, std::ptr::addr_of_mut!(storage).cast(), &mut len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr::from_raw(&storage).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported peer address family"))
}

pub(crate) fn bind_udp(addr: SocketAddr) -> io::Result<RawFd> {
    let fd = new_udp_socket(addr)?;
    let (storage, len) = sockaddr::to_raw(addr);
    // SAFETY: storage/len describe a valid sockaddr for this fd's family.
    let rc = unsafe { libc::bind(fd, std::ptr::addr_of!(storage).cast(), len) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        // SAFETY: fd is owned and not yet handed to a caller.
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }
    Ok(fd)
}

/// `accept()` a single pending connection. `worker.rs` holds a spare fd it
/// can sacrifice to recycle this call on `EMFILE`/`ENFILE` so the listener
/// doesn't spin.
pub(crate) fn accept_one(listener_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage/len describe a valid out-buffer for accept(2).
    let fd = unsafe {
        libc::accept(
            listener_fd,
            std::ptr::addr_of_mut!(storage).cast(),
            &mut len,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(err),
        };
    }
    set_nonblocking(fd)?;
    let peer = sockaddr::from_raw(&storage).unwrap_or_else(|| {
        std::net::SocketAddr::from(([0, 0, 0, 0], 0))
    });
    Ok(Some((fd, peer)))
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
    // SAFETY: buf is a valid, exclusively-borrowed out-buffer.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    translate_count(n)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<Option<usize>> {
    // SAFETY: buf is a valid, borrowed input buffer.
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    translate_count(n)
}

pub(crate) fn recvfrom(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: buf/storage/len describe valid out-buffers for recvfrom(2).
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            0,
            std::ptr::addr_of_mut!(storage).cast(),
            &mut len,
        )
    };
    match translate_count(n)? {
        Some(n) => {
            let from = sockaddr::from_raw(&storage)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported source address family"))?;
            Ok(Some((n, from)))
        }
        None => Ok(None),
    }
}

pub(crate) fn sendto(fd: RawFd, buf: &[u8], dest: SocketAddr) -> io::Result<Option<usize>> {
    let (storage, len) = sockaddr::to_raw(dest);
    // SAFETY: buf is valid for reads; storage/len describe a valid sockaddr.
    let n = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr().cast(),
            buf.len(),
            0,
            std::ptr::addr_of!(storage).cast(),
            len,
        )
    };
    translate_count(n)
}

fn translate_count(n: isize) -> io::Result<Option<usize>> {
    if n >= 0 {
        Ok(Some(n as usize))
    } else {
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(err),
        }
    }
}

pub(crate) fn set_nodelay(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    // SAFETY: fd is a valid TCP socket; `one` lives for the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            std::ptr::addr_of!(one).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    // SAFETY: fd is a valid connected-TCP socket.
    let rc = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// `shutdown(RD)`: stop accepting further inbound bytes on a socket whose
/// write side still has data draining.
pub(crate) fn shutdown_read(fd: RawFd) -> io::Result<()> {
    // SAFETY: fd is a valid connected-TCP socket.
    let rc = unsafe { libc::shutdown(fd, libc::SHUT_RD) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn close(fd: RawFd) {
    // SAFETY: fd is owned by the caller and not used again after this.
    unsafe {
        libc::close(fd);
    }
}

/// A spare, already-open fd held in reserve so that when `accept()` fails
/// with `EMFILE`/`ENFILE` the listener can close it, accept (now that a
/// descriptor is free), immediately drop the new connection, and reopen
/// the spare — keeping the listener from spinning on a full fd table
/// instead of silently wedging.
pub(crate) struct SpareFd(RawFd);

impl SpareFd {
    pub(crate) fn open() -> Self {
        // SAFETY: dup of a known-valid fd (stdin); closed immediately after.
        let fd = unsafe { libc::dup(0) };
        Self(fd)
    }

    pub(crate) fn is_exhaustion(err: &io::Error) -> bool {
        matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
    }

    /// Free the spare fd, try the accept again, then reopen a spare.
    /// Any connection obtained this way is immediately closed — there is
    /// no free descriptor to keep it open with.
    pub(crate) fn recycle_for_accept(&mut self, listener_fd: RawFd) {
        if self.0 >= 0 {
            close(self.0);
        }
        if let Ok(Some((fd, _))) = accept_one(listener_fd) {
            close(fd);
        }
        *self = Self::open();
    }
}

impl Drop for SpareFd {
    fn drop(&mut self) {
        if self.0 >= 0 {
            close(self.0);
        }
    }
}
