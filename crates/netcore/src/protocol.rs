use std::sync::atomic::{AtomicU8, Ordering};

/// Wire protocol a slot was opened with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    Tcp = 0,
    Udp = 1,
    UdpV6 = 2,
    Unknown = 255,
}

impl Protocol {
    pub(crate) const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Tcp,
            1 => Self::Udp,
            2 => Self::UdpV6,
            _ => Self::Unknown,
        }
    }

    pub(crate) const fn is_udp(self) -> bool {
        matches!(self, Self::Udp | Self::UdpV6)
    }
}

/// Lifecycle state of a table slot, stored as an [`AtomicU8`] so producer
/// threads can take a best-effort snapshot without locking. Only the I/O
/// worker ever writes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketType {
    Invalid = 0,
    Reserve = 1,
    PListen = 2,
    Listen = 3,
    Connecting = 4,
    Connected = 5,
    HalfCloseRead = 6,
    HalfCloseWrite = 7,
    PAccept = 8,
    Bind = 9,
}

impl SocketType {
    pub(crate) const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Reserve,
            2 => Self::PListen,
            3 => Self::Listen,
            4 => Self::Connecting,
            5 => Self::Connected,
            6 => Self::HalfCloseRead,
            7 => Self::HalfCloseWrite,
            8 => Self::PAccept,
            9 => Self::Bind,
            _ => Self::Invalid,
        }
    }
}

/// Atomic cell holding a [`SocketType`]; a thin wrapper so call sites read
/// `SocketType` values instead of raw bytes.
#[derive(Debug)]
pub(crate) struct AtomicSocketType(AtomicU8);

impl AtomicSocketType {
    pub(crate) const fn new(ty: SocketType) -> Self {
        Self(AtomicU8::new(ty as u8))
    }

    pub(crate) fn load(&self, order: Ordering) -> SocketType {
        SocketType::from_u8(self.0.load(order))
    }

    pub(crate) fn store(&self, ty: SocketType, order: Ordering) {
        self.0.store(ty as u8, order);
    }

    /// Compare-and-swap keyed on the enum value rather than the raw byte.
    pub(crate) fn compare_exchange(
        &self,
        current: SocketType,
        new: SocketType,
    ) -> Result<SocketType, SocketType> {
        self.0
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(SocketType::from_u8)
            .map_err(SocketType::from_u8)
    }
}
