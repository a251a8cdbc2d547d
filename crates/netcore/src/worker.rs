//! Components F, G (continuation half), H, I: the single I/O worker. Owns
//! every fd-side piece of mutable state that isn't safe to touch from a
//! producer thread — the write queues, the read-buffer size hint, the UDP
//! default peer, and the `closing` flag — in a private `WorkerSlot` table
//! parallel to the shared `SocketTable`.

use std::collections::VecDeque;
use std::net::ToSocketAddrs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::Token;

use crate::buffer::{Payload, WbList, WriteChunk};
use crate::control::{ControlReceiver, Priority, Request};
use crate::event::Event;
use crate::ids::SocketId;
use crate::monitor::Monitor;
use crate::net;
use crate::poller::{Poller, Readiness, CONTROL_TOKEN};
use crate::protocol::{Protocol, SocketType};
use crate::socket::{SocketTable, MIN_READ_BUFFER};
use crate::udp_addr::UdpAddr;

const MAX_READ_BUFFER: usize = 1 << 20;

#[derive(Default)]
struct WorkerSlot {
    high: WbList,
    low: WbList,
    closing: bool,
    read_hint: usize,
    udp_peer: Option<UdpAddr>,
    write_armed: bool,
}

impl WorkerSlot {
    fn fresh() -> Self {
        Self {
            read_hint: MIN_READ_BUFFER,
            ..Default::default()
        }
    }

    /// Queue a chunk, promoting an already-partially-sent low-priority
    /// head into the high queue first so in-flight bytes aren't starved
    /// behind it.
    fn enqueue(&mut self, priority: Priority, chunk: WriteChunk) {
        if priority == Priority::High {
            if let Some(front) = self.low.front() {
                if front.is_partially_sent() {
                    if let Some(partial) = self.low.pop_front() {
                        self.high.push_back(partial);
                    }
                }
            }
            self.high.push_back(chunk);
        } else {
            self.low.push_back(chunk);
        }
        netcore_utils::safe_assert!(
            self.low.front().is_none_or(|c| !c.is_partially_sent()),
            "low-priority queue head left partially sent"
        );
    }

    fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }

    fn total_bytes(&self) -> u64 {
        self.high.total_bytes() + self.low.total_bytes()
    }
}

pub(crate) struct IoWorker {
    table: Arc<SocketTable>,
    poller: Poller,
    ctrl: ControlReceiver,
    slots: Vec<WorkerSlot>,
    pending: VecDeque<Event>,
    spare_fd: net::SpareFd,
    monitor: Option<Arc<Monitor>>,
    started_at: Instant,
}

impl IoWorker {
    pub(crate) fn new(
        table: Arc<SocketTable>,
        ctrl: ControlReceiver,
        monitor: Option<Arc<Monitor>>,
    ) -> std::io::Result<Self> {
        let poller = Poller::new()?;
        poller.register(ctrl.wake_read_fd, CONTROL_TOKEN, true, false)?;
        let slots = (0..table.len()).map(|_| WorkerSlot::default()).collect();
        Ok(Self {
            table,
            poller,
            ctrl,
            slots,
            pending: VecDeque::new(),
            spare_fd: net::SpareFd::open(),
            monitor,
            started_at: Instant::now(),
        })
    }

    /// Run one pass. Blocks in the poller for up to `timeout` (forever if
    /// `None`) when there's nothing else to do; returns `Ok(None)` only
    /// when `timeout` is `Some` and the deadline passed with nothing to
    /// report.
    pub(crate) fn poll_once(&mut self, timeout: Option<Duration>) -> std::io::Result<Option<Event>> {
        loop {
            if let Some(ev) = self.pending.pop_front() {
                return Ok(Some(ev));
            }

            let mut drained_any = false;
            while let Some(req) = self.ctrl.try_recv() {
                drained_any = true;
                if let Some(ev) = self.dispatch_control(req) {
                    self.pending.push_back(ev);
                }
            }
            if let Some(ev) = self.pending.pop_front() {
                return Ok(Some(ev));
            }
            if drained_any {
                continue;
            }

            self.poller.wait(timeout)?;
            if let Some(monitor) = &self.monitor {
                monitor.trigger();
            }
            self.handle_readiness();
            if self.pending.is_empty() {
                if timeout.is_some() {
                    return Ok(None);
                }
                continue;
            }
        }
    }

    fn handle_readiness(&mut self) {
        let events: Vec<Readiness> = self.poller.readiness().collect();
        for r in events {
            if r.token == CONTROL_TOKEN {
                self.ctrl.drain_wake();
                continue;
            }
            let idx = r.token.0;
            if idx >= self.table.len() {
                continue;
            }
            if let Some(ev) = self.dispatch_socket_event(idx, r) {
                self.pending.push_back(ev);
            }
        }
    }

    // ---- control-request dispatch -----------------------------------

    fn dispatch_control(&mut self, req: Request) -> Option<Event> {
        match req {
            Request::Connect { opaque, host, port, id } => self.do_connect(id, opaque, &host, port),
            Request::Listen { opaque, fd, id, listen_port, local_addr } => {
                self.do_listen(id, opaque, fd, listen_port, local_addr)
            }
            Request::Bind { opaque, fd, id } => self.do_bind(id, opaque, fd),
            Request::UdpOpen { opaque, fd, id, bound_port, protocol } => {
                self.do_udp_open(id, opaque, fd, bound_port, protocol)
            }
            Request::UdpDial { opaque, fd, id, peer } => self.do_udp_dial(id, opaque, fd, peer),
            Request::UdpConnect { id, peer } => {
                self.do_udp_connect(id, peer);
                None
            }
            Request::Send { id, priority, payload, udp_dest } => {
                self.do_send(id, priority, payload, udp_dest)
            }
            Request::Close { id, opaque } => self.do_close(id, opaque, false),
            Request::Shutdown { id, opaque } => self.do_close(id, opaque, true),
            Request::Pause { id, .. } => {
                self.set_reading(id, false);
                None
            }
            Request::Resume { id, .. } => {
                self.do_resume(id);
                None
            }
            Request::SetNoDelay { id } => {
                if let Some(snap) = self.table.snapshot(id) {
                    if snap.fd >= 0 {
                        let _ = net::set_nodelay(snap.fd);
                    }
                }
                None
            }
            Request::ResumeDirectWrite { id } => {
                self.adopt_direct_write(id);
                None
            }
            Request::Exit => Some(Event::Exit),
        }
    }

    fn do_connect(&mut self, id: SocketId, opaque: u64, host: &str, port: u16) -> Option<Event> {
        let idx = crate::ids::hash_id(id);
        let candidates = (host, port).to_socket_addrs();
        let mut last_err = None;
        if let Ok(addrs) = candidates {
            for addr in addrs {
                match net::new_tcp_socket(addr).and_then(|fd| {
                    net::connect_nonblocking(fd, addr).map(|done| (fd, done))
                }) {
                    Ok((fd, true)) => {
                        self.slots[idx] = WorkerSlot::fresh();
                        return Some(self.finish_connect(idx, id, opaque, fd));
                    }
                    Ok((fd, false)) => {
                        self.table.slot(id).fd.store(fd, Ordering::Release);
                        self.table.slot(id).protocol.store(Protocol::Tcp as u8, Ordering::Release);
                        self.table.slot(id).opaque.store(opaque, Ordering::Release);
                        self.table.slot(id).ty.store(SocketType::Connecting, Ordering::Release);
                        self.slots[idx] = WorkerSlot::fresh();
                        if let Err(e) = self.poller.register(fd, Token(idx), false, true) {
                            tracing::warn!(%id, error = %e, "failed to register connecting socket");
                        }
                        return None;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
        } else if let Err(e) = candidates {
            last_err = Some(e);
        }
        self.table.slot(id).ty.store(SocketType::Invalid, Ordering::Release);
        Some(Event::Err {
            id,
            opaque,
            message: last_err.map_or_else(|| "name resolution failed".to_string(), |e| e.to_string()),
        })
    }

    /// Transitions a socket into `Connected` and reports `SOCKET_OPEN`.
    /// Does NOT reset the `WorkerSlot` — a producer may already have
    /// enqueued sends while the socket was still `Connecting` (`do_send`
    /// allows that state through), and discarding them here would violate
    /// the per-socket submission-order guarantee. The immediate-connect
    /// caller in `do_connect`, which reaches this before any request for
    /// the brand-new id could have been enqueued, resets the slot itself.
    fn finish_connect(&mut self, idx: usize, id: SocketId, opaque: u64, fd: i32) -> Event {
        let slot = self.table.slot(id);
        slot.fd.store(fd, Ordering::Release);
        slot.protocol.store(Protocol::Tcp as u8, Ordering::Release);
        slot.opaque.store(opaque, Ordering::Release);
        slot.ty.store(SocketType::Connected, Ordering::Release);
        if let Err(e) = self.poller.register(fd, Token(idx), true, false) {
            tracing::warn!(%id, error = %e, "failed to register connected socket");
        }
        let addr = net::peer_addr(fd).map(|a| a.to_string()).unwrap_or_default();
        Event::Open {
            id,
            opaque,
            addr,
            listen_port: 0,
        }
    }

    /// A freshly listened socket starts in `PLISTEN`, not `LISTEN` — the
    /// owner must call `resume` before connections are actually accepted.
    fn do_listen(&mut self, id: SocketId, opaque: u64, fd: i32, listen_port: u16, local_addr: String) -> Option<Event> {
        let idx = crate::ids::hash_id(id);
        let slot = self.table.slot(id);
        slot.fd.store(fd, Ordering::Release);
        slot.protocol.store(Protocol::Tcp as u8, Ordering::Release);
        slot.opaque.store(opaque, Ordering::Release);
        slot.ty.store(SocketType::PListen, Ordering::Release);
        slot.reading.store(false, Ordering::Release);
        self.slots[idx] = WorkerSlot::fresh();
        if let Err(e) = self.poller.register(fd, Token(idx), true, false) {
            tracing::warn!(%id, error = %e, "failed to register listener");
        }
        Some(Event::Open { id, opaque, addr: local_addr, listen_port })
    }

    fn do_bind(&mut self, id: SocketId, opaque: u64, fd: i32) -> Option<Event> {
        let idx = crate::ids::hash_id(id);
        let slot = self.table.slot(id);
        slot.fd.store(fd, Ordering::Release);
        slot.protocol.store(Protocol::Tcp as u8, Ordering::Release);
        slot.opaque.store(opaque, Ordering::Release);
        slot.ty.store(SocketType::Bind, Ordering::Release);
        self.slots[idx] = WorkerSlot::fresh();
        if let Err(e) = self.poller.register(fd, Token(idx), true, true) {
            tracing::warn!(%id, error = %e, "failed to register bound fd");
        }
        Some(Event::Open {
            id,
            opaque,
            addr: format!("fd:{fd}"),
            listen_port: 0,
        })
    }

    fn do_udp_open(&mut self, id: SocketId, opaque: u64, fd: i32, bound_port: u16, protocol: Protocol) -> Option<Event> {
        let idx = crate::ids::hash_id(id);
        let slot = self.table.slot(id);
        slot.fd.store(fd, Ordering::Release);
        slot.protocol.store(protocol as u8, Ordering::Release);
        slot.opaque.store(opaque, Ordering::Release);
        slot.ty.store(SocketType::Connected, Ordering::Release);
        self.slots[idx] = WorkerSlot::fresh();
        if let Err(e) = self.poller.register(fd, Token(idx), true, false) {
            tracing::warn!(%id, error = %e, "failed to register udp socket");
        }
        Some(Event::Open {
            id,
            opaque,
            addr: String::new(),
            listen_port: bound_port,
        })
    }

    fn do_udp_dial(&mut self, id: SocketId, opaque: u64, fd: i32, peer: UdpAddr) -> Option<Event> {
        let idx = crate::ids::hash_id(id);
        let slot = self.table.slot(id);
        slot.fd.store(fd, Ordering::Release);
        slot.protocol.store(peer.protocol() as u8, Ordering::Release);
        slot.opaque.store(opaque, Ordering::Release);
        slot.ty.store(SocketType::Connected, Ordering::Release);
        let addr = peer.socket_addr();
        self.slots[idx] = WorkerSlot::fresh();
        self.slots[idx].udp_peer = Some(peer);
        if let Err(e) = self.poller.register(fd, Token(idx), true, false) {
            tracing::warn!(%id, error = %e, "failed to register dialed udp socket");
        }
        Some(Event::Open { id, opaque, addr: addr.to_string(), listen_port: 0 })
    }

    fn do_udp_connect(&mut self, id: SocketId, peer: std::net::SocketAddr) {
        let idx = crate::ids::hash_id(id);
        let slot = self.table.slot(id);
        if slot.id.load(Ordering::Acquire) == id && slot.protocol().is_udp() {
            self.slots[idx].udp_peer = Some(UdpAddr::encode(peer));
        }
        slot.udpconnecting.fetch_sub(1, Ordering::AcqRel);
    }

    /// Promotes `PLISTEN`/`PACCEPT` to `LISTEN`/`CONNECTED` (the only way
    /// out of those two states) and, either way, enables reading.
    ///
    /// Also drains immediately rather than waiting for the next
    /// `poller.wait`: `mio`'s readiness is edge-triggered, so a backlog
    /// that built up while the socket was `PLISTEN`/`PACCEPT` or paused
    /// produced its one edge already, and nothing new will arrive to
    /// generate another unless a peer happens to send more.
    fn do_resume(&mut self, id: SocketId) {
        let idx = crate::ids::hash_id(id);
        let slot = self.table.slot(id);
        if slot.id.load(Ordering::Acquire) != id {
            return;
        }
        let was = slot.socket_type();
        match was {
            SocketType::PListen => slot.ty.store(SocketType::Listen, Ordering::Release),
            SocketType::PAccept => slot.ty.store(SocketType::Connected, Ordering::Release),
            _ => {}
        }
        self.set_reading(id, true);
        match was {
            SocketType::PListen => {
                let opaque = self.table.slot_at(idx).opaque.load(Ordering::Acquire);
                self.accept_loop(idx, id, opaque);
            }
            SocketType::PAccept | SocketType::Connected | SocketType::HalfCloseRead => {
                let opaque = self.table.slot_at(idx).opaque.load(Ordering::Acquire);
                if let Some(ev) = self.handle_readable(idx, id, opaque) {
                    self.pending.push_back(ev);
                }
            }
            _ => {}
        }
    }

    fn set_reading(&mut self, id: SocketId, enable: bool) {
        let idx = crate::ids::hash_id(id);
        let slot = self.table.slot(id);
        if slot.id.load(Ordering::Acquire) != id {
            return;
        }
        slot.reading.store(enable, Ordering::Release);
        let fd = slot.fd.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }
        let write_armed = self.slots[idx].write_armed;
        let _ = self.poller.reregister(fd, Token(idx), enable, write_armed);
    }

    fn do_send(&mut self, id: SocketId, priority: Priority, payload: Payload, udp_dest: Option<UdpAddr>) -> Option<Event> {
        let idx = crate::ids::hash_id(id);
        let slot = self.table.slot(id);
        if slot.id.load(Ordering::Acquire) != id {
            return None; // socket already gone, drop silently.
        }
        let ty = slot.socket_type();
        if matches!(ty, SocketType::Invalid | SocketType::HalfCloseWrite | SocketType::Listen | SocketType::PListen) {
            return None;
        }
        self.slots[idx].enqueue(priority, WriteChunk::new(payload, udp_dest));
        self.flush_socket(idx, id)
    }

    fn do_close(&mut self, id: SocketId, opaque: u64, force: bool) -> Option<Event> {
        let idx = crate::ids::hash_id(id);
        let slot = self.table.slot(id);
        if slot.id.load(Ordering::Acquire) != id {
            return None;
        }
        let already_half_closed_read = slot.socket_type() == SocketType::HalfCloseRead;
        if force || self.slots[idx].is_empty() {
            // Read side already saw the peer's FIN: this close is just us
            // catching up, not news — RST instead of re-announcing CLOSE.
            Some(self.finalize_close(idx, id, opaque, already_half_closed_read))
        } else {
            self.slots[idx].closing = true;
            let fd = slot.fd.load(Ordering::Acquire);
            if fd >= 0 {
                if !already_half_closed_read {
                    let _ = net::shutdown_read(fd);
                    slot.reading.store(false, Ordering::Release);
                }
                let _ = self.poller.reregister(fd, Token(idx), false, true);
                self.slots[idx].write_armed = true;
            }
            None
        }
    }

    /// A direct-write syscall on a producer thread (component G) can
    /// briefly be in flight against this fd; bounded-spin for it to
    /// finish rather than closing (and potentially recycling) the fd out
    /// from under it. The window is a single syscall, so this never
    /// spins long in practice.
    fn wait_for_sending_drain(&self, id: SocketId) {
        let slot = self.table.slot(id);
        for _ in 0..10_000 {
            if slot.sending_refcount(id) == 0 {
                return;
            }
            std::hint::spin_loop();
        }
    }

    fn finalize_close(&mut self, idx: usize, id: SocketId, opaque: u64, reset: bool) -> Event {
        self.wait_for_sending_drain(id);
        let slot = self.table.slot(id);
        let fd = slot.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            let _ = self.poller.deregister(fd);
            net::close(fd);
        }
        slot.ty.store(SocketType::Invalid, Ordering::Release);
        slot.wb_size.store(0, Ordering::Release);
        slot.writing.store(false, Ordering::Release);
        *slot.dw.lock() = crate::socket::DirectWrite::default();
        self.slots[idx] = WorkerSlot::default();
        if reset {
            Event::Rst { id, opaque }
        } else {
            Event::Close { id, opaque }
        }
    }

    /// A write error on an otherwise-live socket: the read side may
    /// still have data worth delivering, so this doesn't
    /// tear the socket down outright. Shuts the write half down, drops
    /// the now-unsendable backlog, and reports `SOCKET_ERR` once. A
    /// second write error after that (nothing left to shut down) is
    /// the real end of the socket's life.
    fn close_write(&mut self, idx: usize, id: SocketId, opaque: u64, err: std::io::Error) -> Event {
        let slot = self.table.slot(id);
        let ty = slot.socket_type();
        if ty == SocketType::HalfCloseWrite || slot.protocol().is_udp() {
            return self.finalize_close(idx, id, opaque, false);
        }
        let fd = slot.fd.load(Ordering::Acquire);
        if fd >= 0 {
            let _ = net::shutdown_write(fd);
            let reading = slot.reading.load(Ordering::Acquire);
            let _ = self.poller.reregister(fd, Token(idx), reading, false);
        }
        slot.ty.store(SocketType::HalfCloseWrite, Ordering::Release);
        slot.wb_size.store(0, Ordering::Release);
        slot.writing.store(false, Ordering::Release);
        self.slots[idx].high.clear();
        self.slots[idx].low.clear();
        self.slots[idx].write_armed = false;
        self.slots[idx].closing = false;
        Event::Err { id, opaque, message: err.to_string() }
    }

    fn adopt_direct_write(&mut self, id: SocketId) {
        let idx = crate::ids::hash_id(id);
        let slot = self.table.slot(id);
        if slot.id.load(Ordering::Acquire) != id {
            return;
        }
        let pending = slot.dw.lock().pending.take();
        if let Some(dw) = pending {
            let mut chunk = WriteChunk::new(dw.payload, dw.udp_dest);
            if dw.offset > 0 {
                chunk.advance(dw.offset);
            }
            self.slots[idx].enqueue(Priority::High, chunk);
        }
        self.flush_socket(idx, id);
    }

    // ---- readiness dispatch ------------------------------------------

    fn dispatch_socket_event(&mut self, idx: usize, r: Readiness) -> Option<Event> {
        let id = self.table.slot_at(idx).id.load(Ordering::Acquire);
        if id < 0 {
            return None;
        }
        let slot = self.table.slot_at(idx);
        let opaque = slot.opaque.load(Ordering::Acquire);
        let ty = slot.socket_type();

        if r.error {
            let fd = slot.fd.load(Ordering::Acquire);
            let reset = fd >= 0
                && net::take_socket_error(fd)
                    .err()
                    .is_some_and(|e| e.raw_os_error() == Some(libc::ECONNRESET));
            return Some(self.finalize_close(idx, id, opaque, reset));
        }

        match ty {
            SocketType::Listen => {
                self.accept_loop(idx, id, opaque);
                None
            }
            SocketType::Connecting => {
                if r.writable {
                    let fd = self.table.slot_at(idx).fd.load(Ordering::Acquire);
                    match net::take_socket_error(fd) {
                        Ok(()) => {
                            let ev = self.finish_connect(idx, id, opaque, fd);
                            // Flush anything a producer queued while still
                            // Connecting; any event it produces (a write
                            // error, a warning) trails the Open above.
                            if let Some(flush_ev) = self.flush_socket(idx, id) {
                                self.pending.push_back(flush_ev);
                            }
                            Some(ev)
                        }
                        Err(e) => {
                            net::close(fd);
                            let _ = self.poller.deregister(fd);
                            self.table.slot_at(idx).ty.store(SocketType::Invalid, Ordering::Release);
                            self.slots[idx] = WorkerSlot::default();
                            Some(Event::Err { id, opaque, message: e.to_string() })
                        }
                    }
                } else {
                    None
                }
            }
            SocketType::Connected | SocketType::HalfCloseRead | SocketType::HalfCloseWrite | SocketType::Bind => {
                let mut out = None;
                if r.readable || r.read_closed {
                    out = self.handle_readable(idx, id, opaque);
                }
                if out.is_none() && r.writable {
                    out = self.flush_socket(idx, id);
                }
                out
            }
            SocketType::Invalid | SocketType::Reserve | SocketType::PListen | SocketType::PAccept => None,
        }
    }

    fn accept_loop(&mut self, listener_idx: usize, listener_id: SocketId, listener_opaque: u64) {
        let listener_fd = self.table.slot_at(listener_idx).fd.load(Ordering::Acquire);
        loop {
            match net::accept_one(listener_fd) {
                Ok(Some((fd, peer))) => {
                    let Some(new_id) = self.table.reserve_id() else {
                        tracing::warn!("socket table full, dropping accepted connection");
                        net::close(fd);
                        continue;
                    };
                    let new_idx = crate::ids::hash_id(new_id);
                    let slot = self.table.slot(new_id);
                    slot.fd.store(fd, Ordering::Release);
                    slot.protocol.store(Protocol::Tcp as u8, Ordering::Release);
                    slot.opaque.store(listener_opaque, Ordering::Release);
                    // Stays PACCEPT — not readable — until the owner calls
                    // resume; avoids delivering data before the caller has
                    // even recorded the new id anywhere.
                    slot.ty.store(SocketType::PAccept, Ordering::Release);
                    slot.reading.store(false, Ordering::Release);
                    self.slots[new_idx] = WorkerSlot::fresh();
                    if let Err(e) = self.poller.register(fd, Token(new_idx), true, false) {
                        tracing::warn!(id = new_id, error = %e, "failed to register accepted socket");
                    }
                    self.pending.push_back(Event::Accept {
                        listener: listener_id,
                        opaque: listener_opaque,
                        new_id,
                        peer: peer.to_string(),
                    });
                }
                Ok(None) => break,
                Err(e) if net::SpareFd::is_exhaustion(&e) => {
                    tracing::warn!(error = %e, "fd table exhausted, recycling spare fd");
                    self.spare_fd.recycle_for_accept(listener_fd);
                    // Policy error, not a socket failure: the listener stays
                    // LISTEN, just report the exhaustion to the caller.
                    self.pending.push_back(Event::Err {
                        id: listener_id,
                        opaque: listener_opaque,
                        message: e.to_string(),
                    });
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Drains everything currently readable on this fd, not just one
    /// `read`/`recvfrom`. Two independent reasons this has to loop rather
    /// than return after a single syscall:
    ///
    /// - `mio` registers fds edge-triggered, so a readiness notification is
    ///   a one-shot edge; anything left unread after this call returns
    ///   won't generate another wake-up until *more* data arrives.
    /// - When a TCP read fills its buffer exactly, this revisits the fd
    ///   immediately rather than waiting for the next `wait()` — the
    ///   capacity-doubling hint only pays off if the socket is actually
    ///   drained in the same pass.
    ///
    /// Extra events beyond the first are pushed onto `self.pending`; the
    /// first is returned so ordinary readiness dispatch doesn't need to
    /// know this can produce more than one.
    fn handle_readable(&mut self, idx: usize, id: SocketId, opaque: u64) -> Option<Event> {
        let mut out: Vec<Event> = Vec::new();
        loop {
            let slot = self.table.slot_at(idx);
            if !slot.reading.load(Ordering::Acquire) {
                break;
            }
            let fd = slot.fd.load(Ordering::Acquire);
            if fd < 0 {
                break;
            }
            let protocol = slot.protocol();
            if protocol.is_udp() {
                let mut buf = vec![0u8; net::MAX_UDP_PACKAGE];
                match net::recvfrom(fd, &mut buf) {
                    Ok(Some((n, from))) => {
                        buf.truncate(n);
                        self.bump_read_stat(idx, n);
                        out.push(Event::Udp { id, opaque, payload: buf, source: UdpAddr::encode(from) });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(%id, error = %e, "udp recv failed");
                        break;
                    }
                }
            } else {
                let hint = self.slots[idx].read_hint.max(MIN_READ_BUFFER);
                let mut buf = vec![0u8; hint];
                match net::read(fd, &mut buf) {
                    Ok(Some(n)) => {
                        if n == 0 {
                            let ty = self.table.slot_at(idx).socket_type();
                            if let Some(ev) = self.handle_eof(idx, id, opaque, ty) {
                                out.push(ev);
                            }
                            break;
                        }
                        buf.truncate(n);
                        let filled = n == hint;
                        self.adapt_read_hint(idx, n, hint);
                        self.bump_read_stat(idx, n);
                        out.push(Event::Data { id, opaque, payload: buf });
                        if !filled {
                            break;
                        }
                        // buffer filled exactly, go around again.
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(%id, error = %e, "tcp read failed");
                        out.push(self.finalize_close(idx, id, opaque, false));
                        break;
                    }
                }
            }
        }
        let mut events = out.into_iter();
        let first = events.next();
        self.pending.extend(events);
        first
    }

    fn adapt_read_hint(&mut self, idx: usize, got: usize, hint: usize) {
        let slot = &mut self.slots[idx];
        if got == hint {
            slot.read_hint = (hint * 2).min(MAX_READ_BUFFER);
        } else if got < hint / 2 && hint > MIN_READ_BUFFER {
            slot.read_hint = (hint / 2).max(MIN_READ_BUFFER);
        }
    }

    fn bump_read_stat(&self, idx: usize, n: usize) {
        let slot = self.table.slot_at(idx);
        slot.stat.read.fetch_add(n as u64, Ordering::Relaxed);
        slot.stat.rtime.store(self.started_at.elapsed().as_secs(), Ordering::Relaxed);
    }

    fn handle_eof(&mut self, idx: usize, id: SocketId, opaque: u64, ty: SocketType) -> Option<Event> {
        let slot = self.table.slot_at(idx);
        let fd = slot.fd.load(Ordering::Acquire);
        if fd >= 0 {
            let write_armed = self.slots[idx].write_armed;
            let _ = self.poller.reregister(fd, Token(idx), false, write_armed);
        }
        match ty {
            SocketType::Connected => {
                slot.ty.store(SocketType::HalfCloseRead, Ordering::Release);
                None
            }
            SocketType::HalfCloseWrite => Some(self.finalize_close(idx, id, opaque, false)),
            _ => None,
        }
    }

    /// Drain the high then low queues until `EWOULDBLOCK`, empty, or a
    /// hard error. Returns a `Warning` event if the still-queued byte
    /// count just crossed another doubling of 1 MiB, or a `Close`/`Err`
    /// event if draining finished a pending close or hit a write error.
    fn flush_socket(&mut self, idx: usize, id: SocketId) -> Option<Event> {
        let slot = self.table.slot_at(idx);
        let opaque = slot.opaque.load(Ordering::Acquire);
        let fd = slot.fd.load(Ordering::Acquire);
        let protocol = slot.protocol();
        if fd < 0 {
            return None;
        }

        let result = self.drain_queues(fd, protocol, idx);
        match result {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(%id, error = %e, "write failed");
                return Some(self.close_write(idx, id, opaque, e));
            }
        }

        let remaining = self.slots[idx].total_bytes();
        let slot = self.table.slot_at(idx);
        slot.wb_size.store(remaining as i64, Ordering::Release);
        slot.writing.store(remaining > 0, Ordering::Release);

        let drained = remaining == 0;
        if drained {
            if fd >= 0 {
                let reading = slot.reading.load(Ordering::Acquire);
                let _ = self.poller.reregister(fd, Token(idx), reading, false);
                self.slots[idx].write_armed = false;
            }
            if self.slots[idx].closing {
                let reset = self.table.slot_at(idx).socket_type() == SocketType::HalfCloseRead;
                return Some(self.finalize_close(idx, id, opaque, reset));
            }
            if self.table.slot_at(idx).socket_type() == SocketType::HalfCloseWrite {
                return Some(self.finalize_close(idx, id, opaque, false));
            }
            return None;
        }

        if fd >= 0 && !self.slots[idx].write_armed {
            let reading = slot.reading.load(Ordering::Acquire);
            let _ = self.poller.reregister(fd, Token(idx), reading, true);
            self.slots[idx].write_armed = true;
        }

        self.check_warning(idx, id, opaque, remaining)
    }

    /// A socket's `warn_size` starts at 1 MiB and doubles each time the
    /// still-queued byte count reaches it, so a warning fires once per
    /// doubling (1, 2, 4, 8 MiB, ...) rather than once per MiB.
    fn check_warning(&self, idx: usize, id: SocketId, opaque: u64, remaining: u64) -> Option<Event> {
        let slot = self.table.slot_at(idx);
        let warn_size = slot.warn_size.load(Ordering::Acquire) as u64;
        if warn_size == 0 || remaining < warn_size {
            return None;
        }
        slot.warn_size.store((warn_size * 2) as i64, Ordering::Release);
        Some(Event::Warning { id, opaque, queued_kib: remaining.div_ceil(1024) })
    }

    fn drain_queues(&mut self, fd: i32, protocol: Protocol, idx: usize) -> std::io::Result<()> {
        for which in [Priority::High, Priority::Low] {
            loop {
                let list: &mut WbList = if which == Priority::High {
                    &mut self.slots[idx].high
                } else {
                    &mut self.slots[idx].low
                };
                let Some(front) = list.front_mut() else { break };
                let dest = front.udp_dest.or(self.slots[idx].udp_peer);
                let list: &mut WbList = if which == Priority::High {
                    &mut self.slots[idx].high
                } else {
                    &mut self.slots[idx].low
                };
                let front = list.front_mut().expect("checked above");
                let sent = if protocol.is_udp() {
                    match dest {
                        Some(addr) => net::sendto(fd, front.remaining(), addr.socket_addr())?,
                        None => net::write(fd, front.remaining())?,
                    }
                } else {
                    net::write(fd, front.remaining())?
                };
                match sent {
                    Some(n) if n > 0 => {
                        let done = front.advance(n);
                        if done {
                            list.pop_front();
                        } else {
                            return Ok(());
                        }
                    }
                    _ => return Ok(()),
                }
            }
        }
        Ok(())
    }
}
