use crate::ids::SocketId;
use crate::udp_addr::UdpAddr;

/// One outcome of a [`crate::Engine`] poll pass. Internal signals that only
/// ever meant "loop again, nothing for the caller yet" (buffer-filled reads,
/// pipe drains) are absorbed into the poll loop itself and never escape as
/// an `Event`.
#[derive(Debug)]
pub enum Event {
    /// A `connect`/`listen`/`bind` request finished setting up a socket.
    /// `listen_port` is non-zero only for a listening socket bound to an
    /// ephemeral port.
    Open {
        id: SocketId,
        opaque: u64,
        addr: String,
        listen_port: u16,
    },
    /// A listener accepted a new connection. `new_id` is writable but not
    /// yet readable — the caller must call `resume` once it has recorded
    /// the new id somewhere.
    Accept {
        listener: SocketId,
        opaque: u64,
        new_id: SocketId,
        peer: String,
    },
    /// Inbound TCP bytes.
    Data {
        id: SocketId,
        opaque: u64,
        payload: Vec<u8>,
    },
    /// Inbound UDP datagram, together with the sender's address so a
    /// connectionless responder can reply without a prior `udp_connect`.
    Udp {
        id: SocketId,
        opaque: u64,
        payload: Vec<u8>,
        source: UdpAddr,
    },
    /// The peer (or our own `close`/`shutdown` call) finished tearing the
    /// socket down; the slot is free for reuse once this is delivered.
    Close { id: SocketId, opaque: u64 },
    /// A connect, bind, or listen attempt failed, or a write error shut
    /// the write half of an open connection down (the read half may still
    /// be live; the socket itself isn't gone until a subsequent `Close`).
    Err {
        id: SocketId,
        opaque: u64,
        message: String,
    },
    /// The peer reset the connection (`ECONNRESET`), or a close request
    /// landed on a socket whose read side was already half-closed — kept
    /// distinct from `Err`/`Close` so a caller never sees a close reported
    /// twice for the same socket.
    Rst { id: SocketId, opaque: u64 },
    /// Backpressure warning: the write queue just crossed another power-of-
    /// two multiple of 1 MiB still pending.
    Warning {
        id: SocketId,
        opaque: u64,
        queued_kib: u64,
    },
    /// `Engine::exit` was called; no further events follow.
    Exit,
}

impl Event {
    pub const fn id(&self) -> Option<SocketId> {
        match self {
            Self::Open { id, .. }
            | Self::Data { id, .. }
            | Self::Udp { id, .. }
            | Self::Close { id, .. }
            | Self::Err { id, .. }
            | Self::Rst { id, .. }
            | Self::Warning { id, .. } => Some(*id),
            Self::Accept { listener, .. } => Some(*listener),
            Self::Exit => None,
        }
    }
}
