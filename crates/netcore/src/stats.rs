//! Component J: a lock-free statistics snapshot over every live socket —
//! walk the table, take a best-effort atomic read per slot, and return
//! an owned `Vec` rather than filling a caller-provided array.

use crate::ids::SocketId;
use crate::protocol::{Protocol, SocketType};
use crate::socket::SocketTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketStatus {
    Listening,
    Connecting,
    Connected,
    /// Either half-close direction, folded together as one status.
    Closing,
    Bind,
}

#[derive(Clone, Debug)]
pub struct SocketInfo {
    pub id: SocketId,
    pub opaque: u64,
    pub protocol: Protocol,
    pub status: SocketStatus,
    pub write_queue_bytes: i64,
}

fn status_of(ty: SocketType) -> Option<SocketStatus> {
    match ty {
        SocketType::Listen | SocketType::PListen => Some(SocketStatus::Listening),
        SocketType::Connecting => Some(SocketStatus::Connecting),
        SocketType::Connected => Some(SocketStatus::Connected),
        SocketType::HalfCloseRead | SocketType::HalfCloseWrite => Some(SocketStatus::Closing),
        SocketType::Bind => Some(SocketStatus::Bind),
        SocketType::Invalid | SocketType::Reserve | SocketType::PAccept => None,
    }
}

pub(crate) fn snapshot_all(table: &SocketTable) -> Vec<SocketInfo> {
    table
        .all_ids()
        .filter_map(|id| {
            let snap = table.snapshot(id)?;
            let status = status_of(snap.ty)?;
            Some(SocketInfo {
                id: snap.id,
                opaque: snap.opaque,
                protocol: snap.protocol,
                status,
                write_queue_bytes: snap.wb_size,
            })
        })
        .collect()
}
