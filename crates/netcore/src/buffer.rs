//! Component C: per-socket pending-write storage. Each priority's backlog
//! is a FIFO of not-yet-sent chunks, so a `VecDeque<WriteChunk>` per
//! priority plus an optional UDP destination per chunk is the natural
//! shape here.

use std::collections::VecDeque;

use crate::udp_addr::UdpAddr;

/// Lets a producer hand the engine an already-framed buffer it owns
/// (e.g. a reference-counted message) instead of forcing a copy into a
/// fresh `Vec<u8>`. Freeing is just `Drop`.
pub trait UserObject: Send {
    fn as_bytes(&self) -> &[u8];
}

impl UserObject for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

pub(crate) enum Payload {
    Owned(Vec<u8>),
    Object(Box<dyn UserObject>),
}

impl Payload {
    pub(crate) fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Owned(v) => v,
            Self::Object(o) => o.as_bytes(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.as_bytes().len()
    }
}

/// One queued write. `udp_dest` is `Some` only for a UDP chunk sent to an
/// address other than the socket's default peer.
pub(crate) struct WriteChunk {
    payload: Payload,
    offset: usize,
    pub udp_dest: Option<UdpAddr>,
}

impl WriteChunk {
    pub(crate) fn new(payload: Payload, udp_dest: Option<UdpAddr>) -> Self {
        Self {
            payload,
            offset: 0,
            udp_dest,
        }
    }

    pub(crate) fn remaining(&self) -> &[u8] {
        &self.payload.as_bytes()[self.offset..]
    }

    pub(crate) fn remaining_len(&self) -> usize {
        self.payload.len() - self.offset
    }

    pub(crate) fn is_partially_sent(&self) -> bool {
        self.offset != 0
    }

    /// Record that `n` more bytes were sent; `true` once the chunk is
    /// fully flushed and should be popped.
    pub(crate) fn advance(&mut self, n: usize) -> bool {
        self.offset += n;
        netcore_utils::safe_assert!(self.offset <= self.payload.len(), "write chunk advanced past its own length");
        self.offset == self.payload.len()
    }
}

/// FIFO of pending writes for one priority (high or low) on one socket.
#[derive(Default)]
pub(crate) struct WbList {
    chunks: VecDeque<WriteChunk>,
}

impl WbList {
    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub(crate) fn push_back(&mut self, chunk: WriteChunk) {
        self.chunks.push_back(chunk);
    }

    pub(crate) fn front(&self) -> Option<&WriteChunk> {
        self.chunks.front()
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut WriteChunk> {
        self.chunks.front_mut()
    }

    pub(crate) fn pop_front(&mut self) -> Option<WriteChunk> {
        self.chunks.pop_front()
    }

    pub(crate) fn drain_into(&mut self, other: &mut Self) {
        while let Some(c) = self.chunks.pop_front() {
            other.push_back(c);
        }
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.remaining_len() as u64).sum()
    }

    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(bytes: &[u8]) -> WriteChunk {
        WriteChunk::new(Payload::Owned(bytes.to_vec()), None)
    }

    #[test]
    fn advance_reports_completion() {
        let mut c = chunk(b"hello");
        assert!(!c.advance(3));
        assert_eq!(c.remaining(), b"lo");
        assert!(c.advance(2));
    }

    #[test]
    fn low_queue_promotes_partial_head_into_high() {
        let mut low = WbList::default();
        let mut high = WbList::default();
        low.push_back(chunk(b"first"));
        low.push_back(chunk(b"second"));
        low.front_mut().unwrap().advance(2);
        assert!(low.front().unwrap().is_partially_sent());

        low.drain_into(&mut high);
        assert!(low.is_empty());
        assert_eq!(high.total_bytes(), 3 + 6);
        assert!(high.front().unwrap().is_partially_sent());
    }
}
