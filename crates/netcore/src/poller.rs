//! Component A: the readiness-poller abstraction. `mio` already resolves
//! to epoll, kqueue, or (elsewhere) IOCP per target OS at compile time, so
//! it's the realization of the "static dispatch per target OS" design note
//! rather than something built from scratch here. Every fd this engine
//! tracks — listeners, streams, UDP sockets, and the control self-pipe —
//! is a raw fd, so registration goes through `mio::unix::SourceFd` instead
//! of mio's owned `net` types.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

pub(crate) const MAX_EVENT: usize = 64;

/// Token reserved for the control self-pipe; real sockets are tokened by
/// their table slot index, which never reaches `usize::MAX`.
pub(crate) const CONTROL_TOKEN: Token = Token(usize::MAX);

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
}

pub(crate) struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Peer performed an orderly shutdown on this side; treated the same
    /// as a zero-byte `read()` (i.e. another way to learn EOF), never as a
    /// substitute for actually reading to end of stream.
    pub read_closed: bool,
    pub error: bool,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(MAX_EVENT),
        })
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, read: bool, write: bool) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest(read, write))
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: Token, read: bool, write: bool) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, interest(read, write))
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Block for up to `timeout` (forever, if `None`) waiting for
    /// readiness. This is the engine's one suspension point.
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn readiness(&self) -> impl Iterator<Item = Readiness> + '_ {
        self.events.iter().map(|ev| Readiness {
            token: ev.token(),
            readable: ev.is_readable(),
            writable: ev.is_writable(),
            read_closed: ev.is_read_closed(),
            error: ev.is_error(),
        })
    }
}

fn interest(read: bool, write: bool) -> Interest {
    match (read, write) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => Interest::READABLE, // mio requires a non-empty interest set
    }
}
