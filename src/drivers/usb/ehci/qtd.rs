//! Queue Element Transfer Descriptors
//!
//! [`Qtd`] is the software model of one DMA-executable slice of a transfer.
//! Its status lives in [`QtdStatus`]; the packed token only exists at the
//! hardware boundary ([`Qtd::token`] / [`Qtd::apply_token`]).

use bitflags::bitflags;

use super::hw::{DmaRegion, QtdLink, RawOverlay, RawQtd};
use crate::drivers::usb::core::{Direction, TransferError};

/// EHCI buffer page size
pub const PAGE_SIZE: u32 = 4096;

/// Buffer pointers per qTD
pub const QTD_PAGES: usize = 5;

/// Error retry budget loaded into every new descriptor
pub const CERR_DEFAULT: u8 = 3;

/// qTD token field layout
mod token {
    pub const STATUS_MASK: u32 = 0xFF;
    pub const PID_SHIFT: u32 = 8;
    pub const PID_MASK: u32 = 3 << 8;
    pub const CERR_SHIFT: u32 = 10;
    pub const CERR_MASK: u32 = 3 << 10;
    pub const CPAGE_SHIFT: u32 = 12;
    pub const CPAGE_MASK: u32 = 7 << 12;
    pub const IOC: u32 = 1 << 15;
    pub const BYTES_SHIFT: u32 = 16;
    pub const BYTES_MASK: u32 = 0x7FFF << 16;
    pub const TOGGLE: u32 = 1 << 31;
}

bitflags! {
    /// qTD status byte, as written back by the controller
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QtdStatus: u8 {
        const PING_STATE = 1 << 0;
        const SPLIT_STATE = 1 << 1;
        const MISSED_UFRAME = 1 << 2;
        const XACT_ERR = 1 << 3;
        const BABBLE = 1 << 4;
        const BUFFER_ERR = 1 << 5;
        const HALTED = 1 << 6;
        const ACTIVE = 1 << 7;
    }
}

impl QtdStatus {
    pub fn is_active(self) -> bool {
        self.contains(QtdStatus::ACTIVE)
    }

    pub fn is_halted(self) -> bool {
        self.contains(QtdStatus::HALTED)
    }

    /// Fault classification of a halted descriptor
    pub fn error_kind(self) -> TransferError {
        if self.contains(QtdStatus::BABBLE) {
            TransferError::Babble
        } else if self.contains(QtdStatus::BUFFER_ERR) {
            TransferError::DataBuffer
        } else if self.contains(QtdStatus::XACT_ERR) {
            TransferError::Transaction
        } else if self.contains(QtdStatus::MISSED_UFRAME) {
            TransferError::MissedMicroframe
        } else if self.contains(QtdStatus::SPLIT_STATE) {
            TransferError::SplitState
        } else if self.contains(QtdStatus::PING_STATE) {
            TransferError::PingState
        } else {
            TransferError::Stall
        }
    }
}

/// Transaction PID code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Pid {
    Out = 0,
    In = 1,
    Setup = 2,
}

impl From<Direction> for Pid {
    fn from(dir: Direction) -> Self {
        match dir {
            Direction::Out => Pid::Out,
            Direction::In => Pid::In,
        }
    }
}

impl Pid {
    fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => Pid::Out,
            1 => Pid::In,
            _ => Pid::Setup,
        }
    }
}

/// Round down to the start of a 4 KiB page
pub const fn align4k(addr: u32) -> u32 {
    addr & !(PAGE_SIZE - 1)
}

/// Largest slice one descriptor can cover starting at `addr`
pub const fn max_descriptor_bytes(addr: u32) -> u32 {
    QTD_PAGES as u32 * PAGE_SIZE - (addr & (PAGE_SIZE - 1))
}

/// Scatter list for a descriptor starting at `addr`: the exact start, then
/// the four following page frames
pub fn buffer_pages(addr: u32) -> [u32; QTD_PAGES] {
    core::array::from_fn(|i| {
        if i == 0 {
            addr
        } else {
            align4k(addr.wrapping_add(PAGE_SIZE * i as u32))
        }
    })
}

/// Splits `[addr, addr + length)` into descriptor-sized slices
///
/// Every slice except the last covers exactly [`max_descriptor_bytes`] from
/// its own start, so after the first one each slice starts on a page. A
/// zero length yields a single empty slice (zero-length packet).
#[derive(Debug, Clone)]
pub struct TransferChunks {
    addr: u32,
    remaining: u32,
    done: bool,
}

impl TransferChunks {
    pub fn new(addr: u32, length: u32) -> Self {
        Self {
            addr,
            remaining: length,
            done: false,
        }
    }
}

impl Iterator for TransferChunks {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<(u32, u32)> {
        if self.done {
            return None;
        }
        let limit = max_descriptor_bytes(self.addr);
        let len = if self.remaining <= limit {
            self.done = true;
            self.remaining
        } else {
            limit
        };
        let chunk = (self.addr, len);
        self.addr = self.addr.wrapping_add(len);
        self.remaining -= len;
        Some(chunk)
    }
}

/// Software model of a qTD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qtd {
    pub next: QtdLink,
    /// Alternate-on-short-packet target; always terminated here
    pub alternate: QtdLink,
    pub status: QtdStatus,
    pub data_toggle: bool,
    pub cerr: u8,
    pub current_page: u8,
    /// Bytes still to transfer (mirrors the token once written back)
    pub total_bytes: u16,
    /// Bytes originally requested
    pub expected_bytes: u16,
    pub pid: Pid,
    pub int_on_complete: bool,
    pub buffer: [u32; QTD_PAGES],
    /// Pool occupancy
    pub used: bool,
}

impl Qtd {
    pub const EMPTY: Qtd = Qtd {
        next: QtdLink::Terminate,
        alternate: QtdLink::Terminate,
        status: QtdStatus::empty(),
        data_toggle: false,
        cerr: 0,
        current_page: 0,
        total_bytes: 0,
        expected_bytes: 0,
        pid: Pid::Out,
        int_on_complete: false,
        buffer: [0; QTD_PAGES],
        used: false,
    };

    /// A fresh, armed descriptor for `length` bytes at `addr`
    pub fn new(pid: Pid, addr: u32, length: u16, data_toggle: bool) -> Self {
        Self {
            status: QtdStatus::ACTIVE,
            data_toggle,
            cerr: CERR_DEFAULT,
            total_bytes: length,
            expected_bytes: length,
            pid,
            buffer: buffer_pages(addr),
            used: true,
            ..Self::EMPTY
        }
    }

    /// Packed token. The active bit travels with it, which is why the
    /// token is the last word written.
    pub fn token(&self) -> u32 {
        let mut token = self.status.bits() as u32
            | ((self.pid as u32) << token::PID_SHIFT)
            | (((self.cerr as u32) << token::CERR_SHIFT) & token::CERR_MASK)
            | (((self.current_page as u32) << token::CPAGE_SHIFT) & token::CPAGE_MASK)
            | (((self.total_bytes as u32) << token::BYTES_SHIFT) & token::BYTES_MASK);
        if self.int_on_complete {
            token |= token::IOC;
        }
        if self.data_toggle {
            token |= token::TOGGLE;
        }
        token
    }

    /// Take the controller's write-back of a token
    pub fn apply_token(&mut self, raw: u32) {
        self.status = QtdStatus::from_bits_truncate((raw & token::STATUS_MASK) as u8);
        self.pid = Pid::from_bits((raw & token::PID_MASK) >> token::PID_SHIFT);
        self.cerr = ((raw & token::CERR_MASK) >> token::CERR_SHIFT) as u8;
        self.current_page = ((raw & token::CPAGE_MASK) >> token::CPAGE_SHIFT) as u8;
        self.total_bytes = ((raw & token::BYTES_MASK) >> token::BYTES_SHIFT) as u16;
        self.data_toggle = raw & token::TOGGLE != 0;
    }

    /// Bytes moved so far
    pub fn transferred(&self) -> u32 {
        self.expected_bytes.saturating_sub(self.total_bytes) as u32
    }

    pub fn to_raw(&self, dma: &DmaRegion) -> RawQtd {
        RawQtd {
            body: RawOverlay {
                next_qtd: dma.encode_qtd_link(self.next),
                alt_next_qtd: dma.encode_qtd_link(self.alternate),
                token: self.token(),
                buffer: self.buffer,
            },
        }
    }
}

/// What the controller's overlay says about a queue head's progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overlay {
    pub next: QtdLink,
    pub status: QtdStatus,
}

impl Overlay {
    /// Decode the overlay words. A next pointer the arena does not own
    /// decodes as terminated.
    pub fn decode(raw: &RawOverlay, dma: &DmaRegion) -> Self {
        Self {
            next: dma
                .decode_qtd_link(raw.next_qtd)
                .unwrap_or(QtdLink::Terminate),
            status: QtdStatus::from_bits_truncate((raw.token & token::STATUS_MASK) as u8),
        }
    }

    /// Not executing and nothing left to fetch
    pub fn is_idle(&self) -> bool {
        !self.status.is_active() && !self.status.is_halted() && self.next.is_terminate()
    }
}
