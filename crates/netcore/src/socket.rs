//! Component D: the fixed socket table and id allocator.
//!
//! One `Socket` per table slot, shared via `Arc<SocketTable>` between the
//! I/O worker and every producer thread. Only the fields a producer thread
//! can legitimately touch without the worker's cooperation are atomics
//! here (id, fd, type, protocol, opaque, the `sending`/`udpconnecting`
//! refcounts, queue byte totals, stats, and the direct-write hand-off).
//! Everything else the worker alone mutates — the write queues, the
//! per-socket read-buffer size hint, the UDP default peer, the `closing`
//! flag — lives in `WorkerSlot` in `worker.rs`, which is never shared.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use spin::Mutex;

use crate::buffer::Payload;
use crate::ids::{hash_id, id_tag16, MAX_SOCKET, RESERVED_ID};
use crate::protocol::{AtomicSocketType, Protocol, SocketType};
use crate::udp_addr::UdpAddr;

pub(crate) const MIN_READ_BUFFER: usize = 64;
pub(crate) const WARNING_SIZE: u64 = 1024 * 1024;

/// A hand-off buffer for the direct-write fast path (component G), guarded
/// by a spinlock. The lock owns the data it protects rather than the two
/// living next to each other by convention, so there's no way to touch
/// `dw_*` without holding it.
#[derive(Default)]
pub(crate) struct DirectWrite {
    pub pending: Option<DwChunk>,
}

pub(crate) struct DwChunk {
    pub payload: Payload,
    pub offset: usize,
    pub udp_dest: Option<UdpAddr>,
}

#[derive(Default)]
pub(crate) struct SocketStat {
    pub read: AtomicU64,
    pub write: AtomicU64,
    pub rtime: AtomicU64,
    pub wtime: AtomicU64,
}

/// Cross-thread-visible state for one table slot. `fd == -1` means the
/// slot is not backing an open file descriptor right now.
pub(crate) struct Socket {
    pub id: AtomicI32,
    pub fd: AtomicI32,
    pub ty: AtomicSocketType,
    pub protocol: AtomicU8,
    pub opaque: AtomicU64,
    pub wb_size: AtomicI64,
    pub warn_size: AtomicI64,
    pub reading: AtomicBool,
    pub writing: AtomicBool,
    pub sending: AtomicU32,
    pub udpconnecting: AtomicI32,
    pub stat: SocketStat,
    pub dw: Mutex<DirectWrite>,
}

impl Socket {
    fn new() -> Self {
        Self {
            id: AtomicI32::new(-1),
            fd: AtomicI32::new(-1),
            ty: AtomicSocketType::new(SocketType::Invalid),
            protocol: AtomicU8::new(Protocol::Unknown as u8),
            opaque: AtomicU64::new(0),
            wb_size: AtomicI64::new(0),
            warn_size: AtomicI64::new(0),
            reading: AtomicBool::new(true),
            writing: AtomicBool::new(true),
            sending: AtomicU32::new(0),
            udpconnecting: AtomicI32::new(0),
            stat: SocketStat::default(),
            dw: Mutex::new(DirectWrite::default()),
        }
    }

    pub(crate) fn protocol(&self) -> Protocol {
        Protocol::from_u8(self.protocol.load(Ordering::Acquire))
    }

    pub(crate) fn socket_type(&self) -> SocketType {
        self.ty.load(Ordering::Acquire)
    }

    /// `(generation << 16) | refcount`, packed into one atomic so a
    /// 31-bit id's generation tag can be folded in to detect a slot
    /// recycled out from under an in-flight TCP send.
    pub(crate) fn inc_sending_ref(&self, id: crate::ids::SocketId) {
        let tag = u32::from(id_tag16(id)) << 16;
        loop {
            let cur = self.sending.load(Ordering::Acquire);
            if cur >> 16 != tag >> 16 {
                // a new generation has already taken the slot; don't touch it.
                return;
            }
            let next = tag | ((cur & 0xffff) + 1);
            if self
                .sending
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub(crate) fn dec_sending_ref(&self, id: crate::ids::SocketId) {
        let tag = u32::from(id_tag16(id)) << 16;
        loop {
            let cur = self.sending.load(Ordering::Acquire);
            if cur >> 16 != tag >> 16 {
                return;
            }
            let next = tag | (cur & 0xffff).saturating_sub(1);
            if self
                .sending
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub(crate) fn sending_refcount(&self, id: crate::ids::SocketId) -> u32 {
        let cur = self.sending.load(Ordering::Acquire);
        if (cur >> 16) as u16 != id_tag16(id) {
            return 0;
        }
        cur & 0xffff
    }
}

/// Snapshot of a slot's cross-thread-visible fields, used by component J
/// and by the direct-write precheck in component G.
#[derive(Clone, Copy, Debug)]
pub struct SocketSnapshot {
    pub id: crate::ids::SocketId,
    pub fd: i32,
    pub ty: SocketType,
    pub protocol: Protocol,
    pub opaque: u64,
    pub wb_size: i64,
    pub reading: bool,
    pub writing: bool,
}

pub(crate) struct SocketTable {
    slots: Box<[Socket]>,
    alloc_cursor: AtomicI32,
}

impl SocketTable {
    pub(crate) fn new() -> Self {
        let slots = (0..MAX_SOCKET).map(|_| Socket::new()).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            alloc_cursor: AtomicI32::new(1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, id: crate::ids::SocketId) -> &Socket {
        &self.slots[hash_id(id)]
    }

    pub(crate) fn slot_at(&self, index: usize) -> &Socket {
        &self.slots[index]
    }

    /// Walk the table starting from `alloc_cursor`, looking for a slot
    /// whose `ty` is `Invalid`, and atomically claim it as `Reserve`.
    /// Bounded to one full lap so a saturated table fails fast instead of
    /// spinning forever.
    pub(crate) fn reserve_id(&self) -> Option<crate::ids::SocketId> {
        for _ in 0..self.slots.len() {
            let cursor = self.alloc_cursor.fetch_add(1, Ordering::Relaxed);
            let mut candidate = cursor & 0x7fff_ffff;
            if candidate == RESERVED_ID {
                candidate = self.alloc_cursor.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff;
            }
            let slot = self.slot(candidate);
            if slot
                .ty
                .compare_exchange(SocketType::Invalid, SocketType::Reserve)
                .is_ok()
            {
                slot.id.store(candidate, Ordering::Release);
                slot.fd.store(-1, Ordering::Release);
                slot.protocol.store(Protocol::Unknown as u8, Ordering::Release);
                slot.wb_size.store(0, Ordering::Release);
                slot.warn_size.store(WARNING_SIZE as i64, Ordering::Release);
                slot.reading.store(true, Ordering::Release);
                slot.writing.store(true, Ordering::Release);
                slot.sending.store(0, Ordering::Release);
                slot.udpconnecting.store(0, Ordering::Release);
                return Some(candidate);
            }
        }
        None
    }

    pub(crate) fn snapshot(&self, id: crate::ids::SocketId) -> Option<SocketSnapshot> {
        let slot = self.slot(id);
        let observed_id = slot.id.load(Ordering::Acquire);
        if observed_id != id {
            return None;
        }
        let snap = SocketSnapshot {
            id: observed_id,
            fd: slot.fd.load(Ordering::Acquire),
            ty: slot.socket_type(),
            protocol: slot.protocol(),
            opaque: slot.opaque.load(Ordering::Acquire),
            wb_size: slot.wb_size.load(Ordering::Acquire),
            reading: slot.reading.load(Ordering::Acquire),
            writing: slot.writing.load(Ordering::Acquire),
        };
        // id might have been recycled while we were reading; re-check.
        if slot.id.load(Ordering::Acquire) != id {
            return None;
        }
        Some(snap)
    }

    pub(crate) fn all_ids(&self) -> impl Iterator<Item = crate::ids::SocketId> + '_ {
        self.slots.iter().filter_map(|s| {
            let id = s.id.load(Ordering::Acquire);
            (s.socket_type() != SocketType::Invalid && id >= 0).then_some(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_id_claims_distinct_slots() {
        let table = SocketTable::new();
        let a = table.reserve_id().unwrap();
        let b = table.reserve_id().unwrap();
        assert_ne!(a, b);
        assert_eq!(table.slot(a).socket_type(), SocketType::Reserve);
    }

    #[test]
    fn reserve_id_never_hands_out_reserved_id() {
        let table = SocketTable::new();
        // force the cursor right up to the reserved value.
        table.alloc_cursor.store(RESERVED_ID, Ordering::Relaxed);
        for _ in 0..8 {
            let id = table.reserve_id().unwrap();
            assert_ne!(id, RESERVED_ID);
            table.slot(id).ty.store(SocketType::Invalid, Ordering::Release);
        }
    }

    #[test]
    fn sending_refcount_ignores_stale_generation() {
        let table = SocketTable::new();
        let id = table.reserve_id().unwrap();
        let slot = table.slot(id);
        slot.inc_sending_ref(id);
        assert_eq!(slot.sending_refcount(id), 1);

        let stale_id = id | (1 << 20);
        assert_eq!(slot.sending_refcount(stale_id), 0);
        slot.dec_sending_ref(stale_id); // no-op, different generation
        assert_eq!(slot.sending_refcount(id), 1);
    }
}
