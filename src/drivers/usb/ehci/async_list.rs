//! Asynchronous ring
//!
//! Control and bulk queue heads live in a circular list anchored at a
//! permanent head the controller always polls. Removal splices a queue head
//! out of the ring but leaves its own link untouched; the slot is only
//! reused after the async-advance doorbell has been answered.

use super::Hcd;
use super::controller::HostController;
use super::hw::QhRef;
use crate::drivers::usb::core::UsbError;

impl<C: HostController> Hcd<C> {
    pub(super) fn async_link(&mut self, idx: u16) {
        self.insert_after(QhRef::AsyncHead, idx);
        log::debug!("EHCI: QH {} linked into async ring", idx);
    }

    pub(super) fn async_unlink(&mut self, idx: u16) -> Result<(), UsbError> {
        let target = QhRef::Pipe(idx);
        let pred = self
            .find_predecessor(QhRef::AsyncHead, target)
            .ok_or(UsbError::NotFound)?;
        let next = self.qhs.get(idx).next;
        self.set_next(pred, next);
        log::debug!("EHCI: QH {} spliced out of async ring", idx);
        Ok(())
    }

    /// Request an async-advance interrupt unless one is already outstanding
    ///
    /// Returns whether this call rang the doorbell.
    pub(super) fn ring_doorbell(&mut self) -> bool {
        if self.doorbell_pending {
            return false;
        }
        self.controller.ring_async_doorbell();
        self.doorbell_pending = true;
        log::trace!("EHCI: async advance doorbell rung");
        true
    }
}
