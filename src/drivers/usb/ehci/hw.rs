//! Hardware-visible memory
//!
//! Everything the controller's DMA engine reads or writes lives in one
//! [`DmaArena`]: the periodic frame list, the async ring head, the six
//! interval-tree bucket heads, the per-device queue-head pool and the shared
//! qTD pool. The rest of the driver works on typed models ([`Link`],
//! [`QtdLink`], `QtdStatus`, ...) and only this module packs them into the
//! EHCI bit layouts and back.
//!
//! All arena accesses are volatile: the controller may change overlay and
//! token words at any time.
//!
//! # References
//! - EHCI Specification 1.0, sections 3.5 and 3.6

use core::mem::{offset_of, size_of};
use core::ptr::{self, NonNull};
use core::sync::atomic::{Ordering, fence};

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::config::{FRAME_LIST_LEN, QH_POOL_LEN, QTD_POOL_SIZE};

/// Number of interval-tree bucket heads (1, 2, 4, 8, 16, 32 ms)
pub const BUCKET_COUNT: usize = 6;

/// Link pointer terminate bit
pub const LINK_TERMINATE: u32 = 1;
/// Link pointer type field: queue head
pub const LINK_TYPE_QH: u32 = 1 << 1;
/// Link pointer type field mask
pub const LINK_TYPE_MASK: u32 = 3 << 1;

/// Transfer overlay / qTD body (8 dwords)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawOverlay {
    /// Next qTD Pointer
    pub next_qtd: u32,
    /// Alternate Next qTD Pointer
    pub alt_next_qtd: u32,
    /// Token
    pub token: u32,
    /// Buffer Pointers (page 0 carries the current offset)
    pub buffer: [u32; 5],
}

impl RawOverlay {
    /// Quiescent overlay: nothing to execute, both pointers terminated
    pub const fn idle() -> Self {
        Self {
            next_qtd: LINK_TERMINATE,
            alt_next_qtd: LINK_TERMINATE,
            token: 0,
            buffer: [0; 5],
        }
    }
}

/// Queue Element Transfer Descriptor (32 bytes, 32-byte aligned)
#[repr(C, align(32))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawQtd {
    pub body: RawOverlay,
}

/// Queue Head (48 bytes used, padded to 64, 32-byte aligned)
#[repr(C, align(32))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawQueueHead {
    /// Horizontal Link Pointer
    pub horiz_link: u32,
    /// Endpoint Characteristics
    pub ep_chars: u32,
    /// Endpoint Capabilities
    pub ep_caps: u32,
    /// Current qTD Pointer
    pub current_qtd: u32,
    /// Transfer Overlay
    pub overlay: RawOverlay,
    _reserved: [u32; 4],
}

impl RawQueueHead {
    pub fn new(horiz_link: u32, ep_chars: u32, ep_caps: u32, overlay: RawOverlay) -> Self {
        Self {
            horiz_link,
            ep_chars,
            ep_caps,
            current_qtd: 0,
            overlay,
            _reserved: [0; 4],
        }
    }
}

/// All controller-visible schedule memory
///
/// Must be placed in memory the controller can reach with 32-bit addresses.
/// The frame list comes first so the 4 KiB alignment of the arena is also
/// the alignment PERIODICLISTBASE requires.
#[repr(C, align(4096))]
#[derive(FromZeros, KnownLayout)]
pub struct DmaArena {
    pub frame_list: [u32; FRAME_LIST_LEN],
    pub async_head: RawQueueHead,
    pub bucket_heads: [RawQueueHead; BUCKET_COUNT],
    pub qh: [RawQueueHead; QH_POOL_LEN],
    pub qtd: [RawQtd; QTD_POOL_SIZE],
}

/// Index into the shared qTD pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QtdId(pub u16);

impl QtdId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Any queue head the horizontal schedule can point at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QhRef {
    /// Permanent head of the async ring
    AsyncHead,
    /// Interval-tree bucket head, by bucket index (0 = 1 ms .. 5 = 32 ms)
    Bucket(u8),
    /// Pipe queue head, by pool index
    Pipe(u16),
}

/// Horizontal link pointer (QH.next / frame list entry)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Terminate,
    Qh(QhRef),
}

/// qTD link pointer (qTD.next, qTD.alternate, overlay.next)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QtdLink {
    Terminate,
    Qtd(QtdId),
}

impl QtdLink {
    pub fn is_terminate(self) -> bool {
        self == QtdLink::Terminate
    }
}

/// Address translation and volatile access for a [`DmaArena`]
pub struct DmaRegion {
    base: NonNull<DmaArena>,
    phys: u32,
}

impl DmaRegion {
    /// Wrap an arena the controller sees at bus address `phys`
    ///
    /// # Safety
    ///
    /// `arena` must stay valid and pinned for the life of the region, must
    /// not be accessed other than through it, and `phys` must be the address
    /// at which the controller sees the arena.
    pub unsafe fn new(arena: NonNull<DmaArena>, phys: u32) -> Self {
        Self { base: arena, phys }
    }

    fn arena(&self) -> *mut DmaArena {
        self.base.as_ptr()
    }

    fn qh_ptr(&self, qh: QhRef) -> *mut RawQueueHead {
        let arena = self.arena();
        // Safety: indices come from the pools and are bounds checked by the
        // array index expression
        unsafe {
            match qh {
                QhRef::AsyncHead => &raw mut (*arena).async_head,
                QhRef::Bucket(i) => &raw mut (*arena).bucket_heads[i as usize],
                QhRef::Pipe(i) => &raw mut (*arena).qh[i as usize],
            }
        }
    }

    fn qtd_ptr(&self, id: QtdId) -> *mut RawQtd {
        let arena = self.arena();
        // Safety: see `qh_ptr`
        unsafe { &raw mut (*arena).qtd[id.idx()] }
    }

    // ------------------------------------------------------------------
    // Address translation
    // ------------------------------------------------------------------

    pub fn frame_list_phys(&self) -> u32 {
        self.phys + offset_of!(DmaArena, frame_list) as u32
    }

    pub fn qh_phys(&self, qh: QhRef) -> u32 {
        let offset = match qh {
            QhRef::AsyncHead => offset_of!(DmaArena, async_head),
            QhRef::Bucket(i) => {
                offset_of!(DmaArena, bucket_heads) + i as usize * size_of::<RawQueueHead>()
            }
            QhRef::Pipe(i) => offset_of!(DmaArena, qh) + i as usize * size_of::<RawQueueHead>(),
        };
        self.phys + offset as u32
    }

    pub fn qtd_phys(&self, id: QtdId) -> u32 {
        self.phys + (offset_of!(DmaArena, qtd) + id.idx() * size_of::<RawQtd>()) as u32
    }

    pub fn qh_from_phys(&self, addr: u32) -> Option<QhRef> {
        let offset = addr.checked_sub(self.phys)? as usize;
        let qh_size = size_of::<RawQueueHead>();
        let async_head = offset_of!(DmaArena, async_head);
        let buckets = offset_of!(DmaArena, bucket_heads);
        let pool = offset_of!(DmaArena, qh);

        if offset == async_head {
            Some(QhRef::AsyncHead)
        } else if (buckets..buckets + BUCKET_COUNT * qh_size).contains(&offset)
            && (offset - buckets) % qh_size == 0
        {
            Some(QhRef::Bucket(((offset - buckets) / qh_size) as u8))
        } else if (pool..pool + QH_POOL_LEN * qh_size).contains(&offset)
            && (offset - pool) % qh_size == 0
        {
            Some(QhRef::Pipe(((offset - pool) / qh_size) as u16))
        } else {
            None
        }
    }

    pub fn qtd_from_phys(&self, addr: u32) -> Option<QtdId> {
        let offset = (addr.checked_sub(self.phys)? as usize).checked_sub(offset_of!(DmaArena, qtd))?;
        let qtd_size = size_of::<RawQtd>();
        if offset % qtd_size != 0 || offset / qtd_size >= QTD_POOL_SIZE {
            return None;
        }
        Some(QtdId((offset / qtd_size) as u16))
    }

    // ------------------------------------------------------------------
    // Link encode/decode
    // ------------------------------------------------------------------

    pub fn encode_link(&self, link: Link) -> u32 {
        match link {
            Link::Terminate => LINK_TERMINATE,
            Link::Qh(qh) => self.qh_phys(qh) | LINK_TYPE_QH,
        }
    }

    /// Decode a horizontal link; `None` for element types this driver never
    /// creates (iTD, siTD, FSTN) or addresses outside the arena
    pub fn decode_link(&self, raw: u32) -> Option<Link> {
        if raw & LINK_TERMINATE != 0 {
            return Some(Link::Terminate);
        }
        if raw & LINK_TYPE_MASK != LINK_TYPE_QH {
            return None;
        }
        self.qh_from_phys(raw & !0x1F).map(Link::Qh)
    }

    pub fn encode_qtd_link(&self, link: QtdLink) -> u32 {
        match link {
            QtdLink::Terminate => LINK_TERMINATE,
            QtdLink::Qtd(id) => self.qtd_phys(id),
        }
    }

    pub fn decode_qtd_link(&self, raw: u32) -> Option<QtdLink> {
        if raw & LINK_TERMINATE != 0 {
            return Some(QtdLink::Terminate);
        }
        self.qtd_from_phys(raw & !0x1F).map(QtdLink::Qtd)
    }

    // ------------------------------------------------------------------
    // Queue heads
    // ------------------------------------------------------------------

    /// Overwrite a whole queue head. Only legal while the controller cannot
    /// reach it.
    pub fn write_qh(&self, qh: QhRef, raw: &RawQueueHead) {
        // Safety: pointer derived from the arena
        unsafe { ptr::write_volatile(self.qh_ptr(qh), *raw) };
        fence(Ordering::SeqCst);
    }

    pub fn read_qh(&self, qh: QhRef) -> RawQueueHead {
        // Safety: pointer derived from the arena
        unsafe { ptr::read_volatile(self.qh_ptr(qh)) }
    }

    pub fn horizontal_link(&self, qh: QhRef) -> u32 {
        // Safety: pointer derived from the arena
        unsafe { ptr::read_volatile(&raw const (*self.qh_ptr(qh)).horiz_link) }
    }

    pub fn set_horizontal_link(&self, qh: QhRef, raw: u32) {
        fence(Ordering::SeqCst);
        // Safety: pointer derived from the arena
        unsafe { ptr::write_volatile(&raw mut (*self.qh_ptr(qh)).horiz_link, raw) };
        fence(Ordering::SeqCst);
    }

    pub fn overlay(&self, qh: QhRef) -> RawOverlay {
        fence(Ordering::SeqCst);
        // Safety: pointer derived from the arena
        unsafe { ptr::read_volatile(&raw const (*self.qh_ptr(qh)).overlay) }
    }

    /// Point the overlay at a new qTD chain. Only legal while the overlay is
    /// not active.
    pub fn set_overlay_next(&self, qh: QhRef, raw: u32) {
        fence(Ordering::SeqCst);
        // Safety: pointer derived from the arena
        unsafe { ptr::write_volatile(&raw mut (*self.qh_ptr(qh)).overlay.next_qtd, raw) };
        fence(Ordering::SeqCst);
    }

    /// Replace the whole overlay. Only legal while the overlay is not active
    /// (idle or halted).
    pub fn set_overlay(&self, qh: QhRef, overlay: &RawOverlay) {
        fence(Ordering::SeqCst);
        // Safety: pointer derived from the arena
        unsafe {
            let p = self.qh_ptr(qh);
            ptr::write_volatile(&raw mut (*p).current_qtd, 0);
            ptr::write_volatile(&raw mut (*p).overlay, *overlay);
        }
        fence(Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Transfer descriptors
    // ------------------------------------------------------------------

    /// Write a qTD with its token last, so it is never visible half-built
    /// with the active bit set
    pub fn write_qtd(&self, id: QtdId, raw: &RawQtd) {
        // Safety: pointer derived from the arena
        unsafe {
            let p = self.qtd_ptr(id);
            ptr::write_volatile(&raw mut (*p).body.token, 0);
            fence(Ordering::SeqCst);
            ptr::write_volatile(&raw mut (*p).body.next_qtd, raw.body.next_qtd);
            ptr::write_volatile(&raw mut (*p).body.alt_next_qtd, raw.body.alt_next_qtd);
            ptr::write_volatile(&raw mut (*p).body.buffer, raw.body.buffer);
            fence(Ordering::SeqCst);
            ptr::write_volatile(&raw mut (*p).body.token, raw.body.token);
        }
        fence(Ordering::SeqCst);
    }

    pub fn read_qtd(&self, id: QtdId) -> RawQtd {
        fence(Ordering::SeqCst);
        // Safety: pointer derived from the arena
        unsafe { ptr::read_volatile(self.qtd_ptr(id)) }
    }

    pub fn qtd_token(&self, id: QtdId) -> u32 {
        fence(Ordering::SeqCst);
        // Safety: pointer derived from the arena
        unsafe { ptr::read_volatile(&raw const (*self.qtd_ptr(id)).body.token) }
    }

    /// Link a published chain's tail to its successor
    pub fn set_qtd_next(&self, id: QtdId, raw: u32) {
        fence(Ordering::SeqCst);
        // Safety: pointer derived from the arena
        unsafe { ptr::write_volatile(&raw mut (*self.qtd_ptr(id)).body.next_qtd, raw) };
        fence(Ordering::SeqCst);
    }

    /// Token write-back, as the controller does when it retires a qTD
    #[cfg(test)]
    pub fn set_qtd_token(&self, id: QtdId, token: u32) {
        // Safety: pointer derived from the arena
        unsafe { ptr::write_volatile(&raw mut (*self.qtd_ptr(id)).body.token, token) };
        fence(Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Periodic frame list
    // ------------------------------------------------------------------

    pub fn set_frame_list_entry(&self, frame: usize, raw: u32) {
        let arena = self.arena();
        // Safety: bounds checked by the array index expression
        unsafe { ptr::write_volatile(&raw mut (*arena).frame_list[frame], raw) };
    }

    pub fn frame_list_entry(&self, frame: usize) -> u32 {
        let arena = self.arena();
        // Safety: bounds checked by the array index expression
        unsafe { ptr::read_volatile(&raw const (*arena).frame_list[frame]) }
    }
}
