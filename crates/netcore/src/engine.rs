//! The public facade: everything a producer thread calls, plus the
//! helper that boots the single dedicated I/O worker thread. A
//! `Clone`-able handle exposing a builder plus a small set of imperative
//! calls.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use netcore_utils::ThreadPriority;

use crate::buffer::{Payload, UserObject};
use crate::control::{self, ControlSender, Priority, Request};
use crate::error::EngineError;
use crate::event::Event;
use crate::ids::SocketId;
use crate::monitor::{Monitor, Watchdog};
use crate::net;
use crate::protocol::{Protocol, SocketType};
use crate::socket::SocketTable;
use crate::stats::SocketInfo;
use crate::udp_addr::UdpAddr;
use crate::worker::IoWorker;

/// Tuning knobs for the worker thread, builder-style like
/// `TcpConnector::with_*`.
#[derive(Default)]
pub struct EngineConfig {
    core: Option<usize>,
    priority: ThreadPriority,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the I/O worker to a specific CPU core.
    pub fn with_core(mut self, core: usize) -> Self {
        self.core = Some(core);
        self
    }

    /// Raise (or lower) the worker thread's scheduling priority.
    pub fn with_priority(mut self, priority: ThreadPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Owns the worker's `JoinHandle` and its watchdog. Dropping this without
/// calling `join` leaves the worker thread detached.
pub struct EngineWorker {
    join: JoinHandle<()>,
    monitor: Arc<Monitor>,
}

impl EngineWorker {
    pub fn watchdog(&self) -> Watchdog {
        Watchdog::new(Arc::clone(&self.monitor))
    }

    pub fn join(self) -> std::thread::Result<()> {
        self.join.join()
    }
}

/// Producer-facing handle. Cheap to clone and safe to share across
/// threads — every method just validates, then hands a `Request` to the
/// worker over the control channel (or, for `send`, sometimes writes
/// directly to the fd itself; see `send`'s doc comment).
#[derive(Clone)]
pub struct Engine {
    table: Arc<SocketTable>,
    ctrl: ControlSender,
}

/// Spawn the dedicated I/O worker thread and return a handle to talk to
/// it plus a handle to manage the thread itself. `on_event` runs on the
/// worker thread — keep it non-blocking.
pub fn spawn<F>(config: EngineConfig, mut on_event: F) -> std::io::Result<(Engine, EngineWorker)>
where
    F: FnMut(Event) + Send + 'static,
{
    let table = Arc::new(SocketTable::new());
    let (tx, rx) = control::channel()?;
    let monitor = Arc::new(Monitor::new());
    let mut worker = IoWorker::new(Arc::clone(&table), rx, Some(Arc::clone(&monitor)))?;

    let engine = Engine {
        table: Arc::clone(&table),
        ctrl: tx,
    };

    let join = std::thread::Builder::new()
        .name("netcore-io".into())
        .spawn(move || {
            netcore_utils::thread_boot(config.core, config.priority);
            loop {
                match worker.poll_once(None) {
                    Ok(Some(Event::Exit)) => {
                        on_event(Event::Exit);
                        break;
                    }
                    Ok(Some(ev)) => on_event(ev),
                    Ok(None) => {
                        // poll_once(None) only returns None for a bounded
                        // wait; unreachable here but harmless if it ever happens.
                    }
                    Err(e) => tracing::error!(error = %e, "i/o worker poll failed"),
                }
            }
        })?;

    Ok((engine, EngineWorker { join, monitor }))
}

impl Engine {
    pub fn connect(&self, opaque: u64, host: &str, port: u16) -> Result<SocketId, EngineError> {
        if host.len() > 255 {
            return Err(EngineError::AddressTooLong(host.len()));
        }
        let id = self.reserve()?;
        self.ctrl
            .send(Request::Connect { opaque, host: host.to_string(), port, id })
            .map_err(|_| EngineError::Closed)?;
        Ok(id)
    }

    pub fn listen_at(&self, opaque: u64, addr: SocketAddr, backlog: i32) -> Result<SocketId, EngineError> {
        let fd = net::bind_and_listen(addr, backlog)?;
        // getsockname, not the caller's `addr`: an ephemeral (`:0`) port is
        // only assigned by the kernel once bound.
        let bound = net::local_addr(fd).unwrap_or(addr);
        let id = self.reserve_or_close(fd)?;
        self.ctrl
            .send(Request::Listen {
                opaque,
                fd,
                id,
                listen_port: bound.port(),
                local_addr: bound.to_string(),
            })
            .map_err(|_| EngineError::Closed)?;
        Ok(id)
    }

    pub fn bind_fd(&self, opaque: u64, fd: std::os::fd::RawFd) -> Result<SocketId, EngineError> {
        let id = self.reserve()?;
        self.ctrl
            .send(Request::Bind { opaque, fd, id })
            .map_err(|_| EngineError::Closed)?;
        Ok(id)
    }

    /// Open a UDP endpoint. `bind_addr` of `None` creates an unbound
    /// ephemeral socket (the common "client" case); `Some` binds to a
    /// fixed local address first (a UDP "server").
    pub fn udp_open(&self, opaque: u64, bind_addr: Option<SocketAddr>) -> Result<SocketId, EngineError> {
        let (fd, port, protocol) = match bind_addr {
            Some(addr) => {
                let fd = net::bind_udp(addr)?;
                let bound_port = net::local_addr(fd).map_or(addr.port(), |a| a.port());
                (fd, bound_port, protocol_of(addr))
            }
            None => {
                let any: SocketAddr = "0.0.0.0:0".parse().unwrap();
                (net::new_udp_socket(any)?, 0, Protocol::Udp)
            }
        };
        let id = self.reserve_or_close(fd)?;
        self.ctrl
            .send(Request::UdpOpen { opaque, fd, id, bound_port: port, protocol })
            .map_err(|_| EngineError::Closed)?;
        Ok(id)
    }

    pub fn udp_listen(&self, opaque: u64, addr: SocketAddr) -> Result<SocketId, EngineError> {
        self.udp_open(opaque, Some(addr))
    }

    /// Open a UDP socket with a default peer already resolved, like a TCP
    /// `connect` but for datagrams — sends with no explicit destination go
    /// to this peer.
    pub fn udp_dial(&self, opaque: u64, host: &str, port: u16) -> Result<SocketId, EngineError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| EngineError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")))?;
        let fd = net::new_udp_socket(addr)?;
        let id = self.reserve_or_close(fd)?;
        let peer = UdpAddr::encode(addr);
        self.ctrl
            .send(Request::UdpDial { opaque, fd, id, peer })
            .map_err(|_| EngineError::Closed)?;
        Ok(id)
    }

    /// Set (or change) the default peer on an already-open UDP socket.
    pub fn udp_connect(&self, id: SocketId, host: &str, port: u16) -> Result<(), EngineError> {
        self.table.slot(id).udpconnecting.fetch_add(1, Ordering::AcqRel);
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| EngineError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")))?;
        self.ctrl
            .send(Request::UdpConnect { id, peer: addr })
            .map_err(|_| EngineError::Closed)?;
        Ok(())
    }

    /// Queue `bytes` at normal priority. Attempts a direct write on the
    /// calling thread first (component G) when the socket has no pending
    /// backlog at all; otherwise — and for any write that doesn't fully
    /// complete — hands off to the worker's queue so ordering is
    /// preserved.
    pub fn send(&self, id: SocketId, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.send_payload(id, Priority::High, Payload::Owned(bytes), None)
    }

    pub fn send_object(&self, id: SocketId, obj: Box<dyn UserObject>) -> Result<(), EngineError> {
        self.send_payload(id, Priority::High, Payload::Object(obj), None)
    }

    pub fn send_low(&self, id: SocketId, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.send_payload(id, Priority::Low, Payload::Owned(bytes), None)
    }

    pub fn send_udp(&self, id: SocketId, dest: Option<SocketAddr>, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.send_payload(id, Priority::High, Payload::Owned(bytes), dest.map(UdpAddr::encode))
    }

    fn send_payload(&self, id: SocketId, priority: Priority, payload: Payload, udp_dest: Option<UdpAddr>) -> Result<(), EngineError> {
        if priority == Priority::High && udp_dest.is_none() {
            if let Some(remaining) = self.try_direct_write(id, payload) {
                return self
                    .ctrl
                    .send(Request::Send { id, priority, payload: remaining, udp_dest })
                    .map_err(|_| EngineError::Closed);
            }
            return Ok(());
        }
        self.ctrl
            .send(Request::Send { id, priority, payload, udp_dest })
            .map_err(|_| EngineError::Closed)
    }

    /// Try to write `payload` straight to the fd from this thread. Only
    /// attempted when the socket is connected TCP with an empty backlog
    /// and no other direct write already in flight. Returns `None` if the whole
    /// payload was handled (fully sent, or handed to the worker's queue
    /// for a protocol/state that can't direct-write); returns
    /// `Some(leftover)` when a partial direct write needs the worker to
    /// pick up where it left off.
    fn try_direct_write(&self, id: SocketId, payload: Payload) -> Option<Payload> {
        let Some(snap) = self.table.snapshot(id) else {
            return Some(payload);
        };
        if snap.ty != SocketType::Connected || snap.protocol != Protocol::Tcp || snap.writing || snap.fd < 0 {
            return Some(payload);
        }
        let slot = self.table.slot(id);
        let Some(mut guard) = slot.dw.try_lock() else {
            return Some(payload);
        };
        if guard.pending.is_some() {
            return Some(payload);
        }
        slot.inc_sending_ref(id);
        let result = net::write(snap.fd, payload.as_bytes());
        slot.dec_sending_ref(id);
        match result {
            Ok(Some(n)) if n == payload.len() => None,
            Ok(Some(n)) => {
                slot.writing.store(true, Ordering::Release);
                guard.pending = Some(crate::socket::DwChunk { payload, offset: n, udp_dest: None });
                drop(guard);
                let _ = self.ctrl.send(Request::ResumeDirectWrite { id });
                None
            }
            Ok(None) => Some(payload),
            Err(_) => Some(payload),
        }
    }

    pub fn close(&self, id: SocketId, opaque: u64) -> Result<(), EngineError> {
        self.ensure_open(id)?;
        self.ctrl
            .send(Request::Close { id, opaque })
            .map_err(|_| EngineError::Closed)
    }

    pub fn shutdown(&self, id: SocketId, opaque: u64) -> Result<(), EngineError> {
        self.ensure_open(id)?;
        self.ctrl
            .send(Request::Shutdown { id, opaque })
            .map_err(|_| EngineError::Closed)
    }

    pub fn pause(&self, id: SocketId, opaque: u64) -> Result<(), EngineError> {
        self.ensure_open(id)?;
        self.ctrl
            .send(Request::Pause { id, opaque })
            .map_err(|_| EngineError::Closed)
    }

    pub fn resume(&self, id: SocketId, opaque: u64) -> Result<(), EngineError> {
        self.ensure_open(id)?;
        self.ctrl
            .send(Request::Resume { id, opaque })
            .map_err(|_| EngineError::Closed)
    }

    pub fn set_nodelay(&self, id: SocketId) -> Result<(), EngineError> {
        self.ensure_open(id)?;
        self.ctrl
            .send(Request::SetNoDelay { id })
            .map_err(|_| EngineError::Closed)
    }

    /// Fail fast on an id the table no longer recognizes (already closed,
    /// or never allocated) instead of sending a control request the
    /// worker will just silently discard with no event, which would be
    /// invisible to a caller expecting feedback.
    fn ensure_open(&self, id: SocketId) -> Result<(), EngineError> {
        self.table.snapshot(id).map(|_| ()).ok_or(EngineError::NotOpen(id))
    }

    pub fn exit(&self) -> Result<(), EngineError> {
        self.ctrl.send(Request::Exit).map_err(|_| EngineError::Closed)
    }

    pub fn info(&self) -> Vec<SocketInfo> {
        crate::stats::snapshot_all(&self.table)
    }

    fn reserve(&self) -> Result<SocketId, EngineError> {
        self.table
            .reserve_id()
            .ok_or_else(|| EngineError::TableFull(self.table.len()))
    }

    fn reserve_or_close(&self, fd: std::os::fd::RawFd) -> Result<SocketId, EngineError> {
        self.reserve().inspect_err(|_| net::close(fd))
    }
}

const fn protocol_of(addr: SocketAddr) -> Protocol {
    if addr.is_ipv4() {
        Protocol::Udp
    } else {
        Protocol::UdpV6
    }
}

/// A self-driven worker for callers that want to own the poll loop
/// themselves (tests, or a host that already has its own thread for
/// this). Construct with [`spawn_standalone`].
pub struct StandaloneWorker(IoWorker);

impl StandaloneWorker {
    /// Drive the engine from the calling thread instead of a spawned
    /// worker — used by tests, the same `loop { ... thread::sleep }`
    /// shape as driving `TcpConnector::poll_with` directly. Returns
    /// `None` once `timeout` elapses with nothing to report.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> std::io::Result<Option<Event>> {
        self.0.poll_once(timeout)
    }
}

/// Build an `Engine`/`StandaloneWorker` pair without spawning a thread —
/// the caller drives `Engine::poll_once` itself.
pub fn spawn_standalone() -> std::io::Result<(Engine, StandaloneWorker)> {
    let table = Arc::new(SocketTable::new());
    let (tx, rx) = control::channel()?;
    let worker = IoWorker::new(Arc::clone(&table), rx, None)?;
    Ok((Engine { table, ctrl: tx }, StandaloneWorker(worker)))
}
