//! Event-driven TCP/UDP socket engine: a fixed 65536-slot socket table
//! multiplexed by a single I/O worker thread through `mio`, fed by a
//! control channel from any number of producer threads.
//!
//! Start with [`spawn`] to get an [`Engine`] handle plus a running
//! worker, or [`spawn_standalone`] to drive the poll loop yourself (the
//! way the integration tests under `tests/` do).

mod buffer;
mod control;
mod engine;
mod error;
mod event;
mod ids;
mod monitor;
mod net;
mod poller;
mod protocol;
mod sockaddr;
mod socket;
mod stats;
mod udp_addr;
mod worker;

pub use buffer::UserObject;
pub use engine::{spawn, spawn_standalone, Engine, EngineConfig, EngineWorker, StandaloneWorker};
pub use error::EngineError;
pub use event::Event;
pub use ids::{SocketId, MAX_SOCKET};
pub use monitor::Watchdog;
pub use protocol::Protocol;
pub use stats::{SocketInfo, SocketStatus};
pub use udp_addr::{UdpAddr, UdpAddrError, UDP_ADDRESS_SIZE};

pub use netcore_utils::ThreadPriority;
