//! Fixed-capacity descriptor pools
//!
//! Queue heads are grouped in per-device slices of [`QH_PER_DEVICE`] slots;
//! qTDs come from one shared pool. Slots are claimed and released by flag,
//! nothing is allocated at run time.

use super::hw::QtdId;
use super::qh::QueueHead;
use super::qtd::Qtd;
use crate::config::{MAX_DEVICES, QH_PER_DEVICE, QH_POOL_LEN, QTD_POOL_SIZE};
use crate::drivers::usb::core::PipeHandle;

pub struct QhPool {
    slots: [QueueHead; QH_POOL_LEN],
    /// Bumped on every release; survives the slot being cleared
    generations: [u8; QH_POOL_LEN],
}

impl QhPool {
    pub const fn new() -> Self {
        Self {
            slots: [QueueHead::EMPTY; QH_POOL_LEN],
            generations: [0; QH_POOL_LEN],
        }
    }

    /// Pool index of a device's pipe-local slot
    pub fn pool_index(dev_addr: u8, index: u8) -> Option<u16> {
        if dev_addr as usize > MAX_DEVICES || index as usize >= QH_PER_DEVICE {
            return None;
        }
        Some((dev_addr as usize * QH_PER_DEVICE + index as usize) as u16)
    }

    /// Pool index a handle refers to
    pub fn handle_index(handle: PipeHandle) -> Option<u16> {
        Self::pool_index(handle.dev_addr, handle.index)
    }

    /// First free pipe-local index in a device's slice
    pub fn find_free(&self, dev_addr: u8) -> Option<u8> {
        (0..QH_PER_DEVICE as u8).find(|&i| {
            Self::pool_index(dev_addr, i).is_some_and(|idx| !self.slots[idx as usize].used())
        })
    }

    pub fn get(&self, idx: u16) -> &QueueHead {
        &self.slots[idx as usize]
    }

    pub fn get_mut(&mut self, idx: u16) -> &mut QueueHead {
        &mut self.slots[idx as usize]
    }

    /// Generation the next pipe opened in slot `idx` gets
    pub fn generation(&self, idx: u16) -> u8 {
        self.generations[idx as usize]
    }

    /// Live queue head behind a handle, if the handle still names the pipe
    /// that was opened in that slot
    pub fn lookup(&self, handle: PipeHandle) -> Option<u16> {
        let idx = Self::handle_index(handle)?;
        let qh = &self.slots[idx as usize];
        (qh.used() && qh.handle == handle).then_some(idx)
    }

    /// Indices of every used slot in a device's slice
    pub fn device_indices(&self, dev_addr: u8) -> impl Iterator<Item = u16> + '_ {
        (0..QH_PER_DEVICE as u8)
            .filter_map(move |i| Self::pool_index(dev_addr, i))
            .filter(|&idx| self.slots[idx as usize].used())
    }

    pub fn release(&mut self, idx: u16) {
        self.slots[idx as usize] = QueueHead::EMPTY;
        let generation = &mut self.generations[idx as usize];
        *generation = generation.wrapping_add(1);
    }
}

pub struct QtdPool {
    slots: [Qtd; QTD_POOL_SIZE],
    free: usize,
}

impl QtdPool {
    pub const fn new() -> Self {
        Self {
            slots: [Qtd::EMPTY; QTD_POOL_SIZE],
            free: QTD_POOL_SIZE,
        }
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    /// Claim a slot for `qtd`
    pub fn alloc(&mut self, qtd: Qtd) -> Option<QtdId> {
        let idx = self.slots.iter().position(|q| !q.used)?;
        self.slots[idx] = Qtd { used: true, ..qtd };
        self.free -= 1;
        Some(QtdId(idx as u16))
    }

    pub fn free(&mut self, id: QtdId) {
        let slot = &mut self.slots[id.idx()];
        if slot.used {
            *slot = Qtd::EMPTY;
            self.free += 1;
        }
    }

    pub fn get(&self, id: QtdId) -> &Qtd {
        &self.slots[id.idx()]
    }

    pub fn get_mut(&mut self, id: QtdId) -> &mut Qtd {
        &mut self.slots[id.idx()]
    }
}
