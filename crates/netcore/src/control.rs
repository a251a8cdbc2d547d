//! Component E: the producer → worker control channel.
//!
//! A Rust channel carries an owned `Request` directly rather than framing
//! it down a byte pipe, but the worker still has to be woken out of a
//! blocking `poller.wait()` from another thread. The idiomatic way to do
//! that with `mio::Poll` is a self-pipe registered alongside the real
//! sockets, carrying one dummy wake-up byte per request instead of the
//! request itself.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::mpsc::{self, Receiver, Sender};

use crate::buffer::Payload;
use crate::ids::SocketId;
use crate::udp_addr::UdpAddr;

pub(crate) enum Request {
    Connect {
        opaque: u64,
        host: String,
        port: u16,
        id: SocketId,
    },
    Listen {
        opaque: u64,
        fd: RawFd,
        id: SocketId,
        listen_port: u16,
        local_addr: String,
    },
    Bind {
        opaque: u64,
        fd: RawFd,
        id: SocketId,
    },
    UdpOpen {
        opaque: u64,
        fd: RawFd,
        id: SocketId,
        bound_port: u16,
        protocol: crate::protocol::Protocol,
    },
    UdpDial {
        opaque: u64,
        fd: RawFd,
        id: SocketId,
        peer: UdpAddr,
    },
    UdpConnect {
        id: SocketId,
        peer: SocketAddr,
    },
    Send {
        id: SocketId,
        priority: Priority,
        payload: Payload,
        udp_dest: Option<UdpAddr>,
    },
    Close {
        id: SocketId,
        opaque: u64,
    },
    Shutdown {
        id: SocketId,
        opaque: u64,
    },
    Pause {
        id: SocketId,
        opaque: u64,
    },
    Resume {
        id: SocketId,
        opaque: u64,
    },
    SetNoDelay {
        id: SocketId,
    },
    /// Tells the worker a direct-write fast path (component G) left a
    /// remainder in `Socket::dw` for this id and it needs adopting into
    /// the normal write queue.
    ResumeDirectWrite {
        id: SocketId,
    },
    Exit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Priority {
    High,
    Low,
}

/// Producer-side handle: clone of the `mpsc::Sender` plus the self-pipe
/// write end. Cheap to clone, safe to share across threads — a pipe write
/// under `PIPE_BUF` is atomic, and the channel send is already thread-safe.
#[derive(Clone)]
pub(crate) struct ControlSender {
    tx: Sender<Request>,
    wake_fd: RawFd,
}

impl ControlSender {
    pub(crate) fn send(&self, req: Request) -> io::Result<()> {
        self.tx
            .send(req)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "engine worker has exited"))?;
        self.wake()
    }

    fn wake(&self) -> io::Result<()> {
        let byte = [0u8; 1];
        loop {
            // SAFETY: wake_fd is a valid, open pipe write end for the
            // lifetime of the engine; a single-byte write is async-signal
            // and thread safe.
            let n = unsafe { libc::write(self.wake_fd, byte.as_ptr().cast(), 1) };
            if n >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // a full pipe just means a wake-up is already pending.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
    }
}

/// Worker-side half: the `Receiver` plus the self-pipe read end, which the
/// caller registers with the poller under a reserved token.
pub(crate) struct ControlReceiver {
    rx: Receiver<Request>,
    pub(crate) wake_read_fd: RawFd,
}

impl ControlReceiver {
    pub(crate) fn try_recv(&self) -> Option<Request> {
        self.rx.try_recv().ok()
    }

    /// Drain and discard every pending wake-up byte after the poller
    /// reports the self-pipe readable.
    pub(crate) fn drain_wake(&self) {
        let mut buf = [0u8; 256];
        loop {
            // SAFETY: wake_read_fd is a valid, non-blocking pipe read end.
            let n = unsafe { libc::read(self.wake_read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

pub(crate) fn channel() -> io::Result<(ControlSender, ControlReceiver)> {
    let mut fds = [0i32; 2];
    // SAFETY: fds is a valid 2-element out-array.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);
    for fd in [read_fd, write_fd] {
        // SAFETY: fd was just created by pipe() above.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
    let (tx, rx) = mpsc::channel();
    Ok((
        ControlSender {
            tx,
            wake_fd: write_fd,
        },
        ControlReceiver {
            rx,
            wake_read_fd: read_fd,
        },
    ))
}
