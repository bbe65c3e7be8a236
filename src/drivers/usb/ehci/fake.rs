//! Software stand-in for the controller's DMA engine
//!
//! Walks the same arena the `Hcd` writes, executes qTDs on request the way
//! the hardware would (token write-back, overlay advance), keeps a FRINDEX
//! clock and answers the async-advance doorbell when told to.

use core::cell::Cell;
use core::ptr::NonNull;

use super::controller::{HostController, UsbStatus};
use super::hw::{DmaArena, DmaRegion, Link, QhRef, QtdId, RawOverlay};
use super::qtd::QtdStatus;
use super::{Hcd, HcdEvent};
use crate::config::HcdConfig;

/// Bus address the test arena pretends to live at
pub const ARENA_PHYS: u32 = 0x1000_0000;

const BYTES_MASK: u32 = 0x7FFF << 16;

/// How the fake executes the next qTD of a queue head
#[derive(Debug, Clone, Copy)]
pub enum Exec {
    /// Move every byte
    Complete,
    /// Short packet, leaving this many bytes untransferred
    Short(u16),
    /// Halt with these error bits
    Halt(QtdStatus),
}

pub struct FakeController {
    dma: DmaRegion,
    frindex: Cell<u32>,
    /// FRINDEX advance per read, in microframes
    pub tick_per_read: u32,
    pub running: bool,
    /// IAAD set and not yet answered
    pub doorbell: bool,
    pub doorbells_rung: u32,
    /// Answer every doorbell at once, latching ASYNC_ADVANCE
    pub auto_answer: bool,
    /// Causes latched for `take_status`
    pub latched: UsbStatus,
    pub schedules: Option<(u32, u32)>,
}

impl FakeController {
    /// # Safety
    ///
    /// `arena` must outlive the fake; it is shared with the `Hcd` under test
    /// the same way real memory is shared with a real controller.
    pub unsafe fn new(arena: NonNull<DmaArena>, phys: u32) -> Self {
        Self {
            dma: DmaRegion::new(arena, phys),
            frindex: Cell::new(0),
            tick_per_read: 0,
            running: true,
            doorbell: false,
            doorbells_rung: 0,
            auto_answer: false,
            latched: UsbStatus::empty(),
            schedules: None,
        }
    }

    pub fn advance_frames(&self, frames: u32) {
        self.frindex
            .set((self.frindex.get() + frames * 8) & 0x3FFF);
    }

    /// Status to feed `service_interrupt` once the doorbell is honoured
    pub fn answer_doorbell(&mut self) -> UsbStatus {
        if self.doorbell {
            self.doorbell = false;
            UsbStatus::ASYNC_ADVANCE
        } else {
            UsbStatus::empty()
        }
    }

    /// Execute the qTD the overlay points at
    ///
    /// Returns `None` when the queue head is halted, idle, or pointing at an
    /// inactive qTD.
    pub fn execute(&self, qh: QhRef, exec: Exec) -> Option<QtdId> {
        let overlay = self.dma.overlay(qh);
        if overlay.token & QtdStatus::HALTED.bits() as u32 != 0 || overlay.next_qtd & 1 != 0 {
            return None;
        }
        let id = self.dma.qtd_from_phys(overlay.next_qtd & !0x1F)?;
        let qtd = self.dma.read_qtd(id).body;
        let active = QtdStatus::ACTIVE.bits() as u32;
        if qtd.token & active == 0 {
            return None;
        }

        let token = match exec {
            Exec::Complete => qtd.token & !active & !BYTES_MASK,
            Exec::Short(left) => (qtd.token & !active & !BYTES_MASK) | ((left as u32) << 16),
            Exec::Halt(bits) => {
                (qtd.token & !active) | (QtdStatus::HALTED | bits).bits() as u32
            }
        };
        self.dma.set_qtd_token(id, token);

        // Advance: the overlay keeps the next pointer as it was when the qTD
        // was fetched
        let overlay = RawOverlay {
            next_qtd: qtd.next_qtd,
            alt_next_qtd: qtd.alt_next_qtd,
            token,
            buffer: qtd.buffer,
        };
        self.dma.set_overlay(qh, &overlay);
        Some(id)
    }

    /// Complete qTDs until the queue head goes idle
    pub fn drain(&self, qh: QhRef) -> usize {
        let mut n = 0;
        while self.execute(qh, Exec::Complete).is_some() {
            n += 1;
        }
        n
    }

    /// Queue heads on the async ring after the head, in controller order
    pub fn walk_async(&self) -> Vec<QhRef> {
        let mut seen = Vec::new();
        let mut raw = self.dma.horizontal_link(QhRef::AsyncHead);
        for _ in 0..256 {
            match self.dma.decode_link(raw) {
                Some(Link::Qh(QhRef::AsyncHead)) | Some(Link::Terminate) | None => break,
                Some(Link::Qh(qh)) => {
                    seen.push(qh);
                    raw = self.dma.horizontal_link(qh);
                }
            }
        }
        seen
    }

    /// Queue heads the controller visits in `frame`
    pub fn walk_frame(&self, frame: usize) -> Vec<QhRef> {
        let mut seen = Vec::new();
        let mut raw = self.dma.frame_list_entry(frame);
        for _ in 0..256 {
            match self.dma.decode_link(raw) {
                Some(Link::Qh(qh)) => {
                    seen.push(qh);
                    raw = self.dma.horizontal_link(qh);
                }
                _ => break,
            }
        }
        seen
    }
}

impl HostController for FakeController {
    fn attach_schedules(&mut self, periodic_list_base: u32, async_list_addr: u32) {
        self.schedules = Some((periodic_list_base, async_list_addr));
    }

    fn ring_async_doorbell(&mut self) {
        self.doorbells_rung += 1;
        if self.auto_answer {
            self.latched |= UsbStatus::ASYNC_ADVANCE;
        } else {
            self.doorbell = true;
        }
    }

    fn frame_index(&self) -> u32 {
        let now = self.frindex.get();
        self.frindex.set((now + self.tick_per_read) & 0x3FFF);
        now
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn take_status(&mut self) -> UsbStatus {
        core::mem::replace(&mut self.latched, UsbStatus::empty())
    }
}

/// An `Hcd` over a leaked zeroed arena, driven by a fresh fake
pub fn new_hcd() -> Hcd<FakeController> {
    use zerocopy::FromZeros;

    let arena = NonNull::from(Box::leak(Box::new(DmaArena::new_zeroed())));
    unsafe {
        let fake = FakeController::new(arena, ARENA_PHYS);
        Hcd::new(fake, arena, ARENA_PHYS, HcdConfig::default())
    }
}

/// Run one interrupt and collect what it delivered
pub fn service(hcd: &mut Hcd<FakeController>, status: UsbStatus) -> Vec<HcdEvent> {
    let mut events = Vec::new();
    hcd.service_interrupt(status, &mut |e| events.push(e));
    events
}
