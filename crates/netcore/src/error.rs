use crate::ids::SocketId;

/// Failures a producer call can hit before a request is even handed to the
/// I/O worker. Everything that can only be known once the worker gets its
/// hands on the socket (connect refused, peer reset, write error) is never
/// returned here — it surfaces later as [`crate::Event::Err`] or
/// [`crate::Event::Rst`] on the event stream instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("socket table exhausted ({0} sockets already open)")]
    TableFull(usize),

    #[error("hostname too long for the control frame ({0} bytes)")]
    AddressTooLong(usize),

    #[error("socket {0} is not open")]
    NotOpen(SocketId),

    #[error("i/o setup failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid udp peer address: {0}")]
    UdpAddr(#[from] crate::udp_addr::UdpAddrError),

    #[error("the engine has already exited")]
    Closed,
}
