//! Transfer submission
//!
//! A submission becomes a chain of qTDs built entirely off-schedule, then
//! published to the queue head in one store: either the overlay's next
//! pointer (idle queue) or the current tail's next pointer (busy queue).

use heapless::Vec;

use super::Hcd;
use super::controller::HostController;
use super::hw::{QhRef, QtdId, QtdLink, RawOverlay};
use super::qh::QhState;
use super::qtd::{Pid, Qtd, TransferChunks};
use crate::config::QTD_POOL_SIZE;
use crate::drivers::usb::core::{Direction, EndpointType, PipeHandle, UsbError};

/// Bytes in a SETUP packet
const SETUP_LEN: u16 = 8;

/// A control transfer, by bus address of its pieces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// 8-byte SETUP packet
    pub setup: u32,
    /// Data stage buffer (ignored when `length` is 0)
    pub data: u32,
    pub length: u32,
    /// Data stage direction
    pub direction: Direction,
}

impl<C: HostController> Hcd<C> {
    /// Queue `length` bytes at bus address `buffer` on a bulk or interrupt
    /// pipe
    ///
    /// With `notify`, a `Success` carrying every byte moved since the last
    /// report is delivered once this submission has fully retired.
    pub fn submit(
        &mut self,
        pipe: PipeHandle,
        buffer: u32,
        length: u32,
        notify: bool,
    ) -> Result<(), UsbError> {
        let idx = self.submittable(pipe)?;
        if pipe.xfer_type == EndpointType::Control {
            return Err(UsbError::Unsupported);
        }

        let qh = self.qhs.get(idx);
        let pid = qh.pid;
        let chunks = TransferChunks::new(buffer, length);
        let count = chunks.clone().count();
        let parts = chunks.map(|(addr, len)| Qtd::new(pid, addr, len as u16, false));

        let (first, last) = self.build_chain(parts, count, notify)?;
        self.publish(idx, first, last, length);
        log::trace!(
            "EHCI: QH {} queued {} bytes at {:#x} in {} qTDs",
            idx,
            length,
            buffer,
            count
        );
        Ok(())
    }

    /// Queue a SETUP / DATA / STATUS sequence on a control pipe
    pub fn submit_control(
        &mut self,
        pipe: PipeHandle,
        request: ControlRequest,
        notify: bool,
    ) -> Result<(), UsbError> {
        let idx = self.submittable(pipe)?;
        if pipe.xfer_type != EndpointType::Control {
            return Err(UsbError::Unsupported);
        }

        let max_packet = self.qhs.get(idx).max_packet_size.max(1) as u32;
        let (data_pid, status_pid) = if request.length == 0 {
            (Pid::In, Pid::In)
        } else {
            (
                Pid::from(request.direction),
                Pid::from(request.direction.opposite()),
            )
        };

        let setup = Qtd::new(Pid::Setup, request.setup, SETUP_LEN, false);

        // Data stage starts at DATA1 and alternates per packet
        let mut packets = 0u32;
        let data = TransferChunks::new(request.data, request.length)
            .take_while(|_| request.length > 0)
            .map(|(addr, len)| {
                let toggle = packets % 2 == 0;
                packets += len.div_ceil(max_packet);
                Qtd::new(data_pid, addr, len as u16, toggle)
            });

        let status = Qtd::new(status_pid, 0, 0, true);

        let data_count = if request.length == 0 {
            0
        } else {
            TransferChunks::new(request.data, request.length).count()
        };
        let parts = core::iter::once(setup)
            .chain(data)
            .chain(core::iter::once(status));

        let (first, last) = self.build_chain(parts, data_count + 2, notify)?;
        self.publish(idx, first, last, SETUP_LEN as u32 + request.length);
        log::trace!(
            "EHCI: QH {} queued control transfer, {} data bytes",
            idx,
            request.length
        );
        Ok(())
    }

    /// Pool index of a pipe that can take new work
    fn submittable(&self, pipe: PipeHandle) -> Result<u16, UsbError> {
        let idx = self.qhs.lookup(pipe).ok_or(UsbError::InvalidPipe)?;
        match self.qhs.get(idx).state {
            QhState::Active => Ok(idx),
            QhState::Removing | QhState::Stuck => Err(UsbError::Busy),
            QhState::Free => Err(UsbError::InvalidPipe),
        }
    }

    /// Claim and write a chain of `count` qTDs, linked in order
    ///
    /// Only the last one gets the caller's interrupt-on-complete and a
    /// terminated next pointer. Nothing is claimed unless all of them fit.
    fn build_chain(
        &mut self,
        parts: impl Iterator<Item = Qtd>,
        count: usize,
        notify: bool,
    ) -> Result<(QtdId, QtdId), UsbError> {
        if count == 0 || count > self.qtds.free_count() {
            log::warn!(
                "EHCI: qTD pool exhausted ({} needed, {} free)",
                count,
                self.qtds.free_count()
            );
            return Err(UsbError::NoResource);
        }

        let mut ids: Vec<QtdId, QTD_POOL_SIZE> = Vec::new();
        for qtd in parts {
            match self.qtds.alloc(qtd) {
                Some(id) => {
                    // Capacity is the pool size
                    let _ = ids.push(id);
                }
                None => {
                    for &id in ids.iter() {
                        self.qtds.free(id);
                    }
                    return Err(UsbError::NoResource);
                }
            }
        }

        let (&first, &last) = match (ids.first(), ids.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(UsbError::NoResource),
        };

        for (i, &id) in ids.iter().enumerate() {
            let qtd = self.qtds.get_mut(id);
            match ids.get(i + 1) {
                Some(&next) => qtd.next = QtdLink::Qtd(next),
                None => {
                    qtd.next = QtdLink::Terminate;
                    qtd.int_on_complete = notify;
                }
            }
        }

        // Back to front, so every qTD is complete before anything links to it
        for &id in ids.iter().rev() {
            let raw = self.qtds.get(id).to_raw(&self.dma);
            self.dma.write_qtd(id, &raw);
        }

        Ok((first, last))
    }

    /// Hand a written chain to the queue head
    fn publish(&mut self, idx: u16, first: QtdId, last: QtdId, bytes: u32) {
        let qh_ref = QhRef::Pipe(idx);
        let first_raw = self.dma.encode_qtd_link(QtdLink::Qtd(first));

        if self.qhs.get(idx).faulted {
            // Halted overlay: drop the stale chain and restart from idle
            self.discard_chain(idx);
            let overlay = RawOverlay {
                next_qtd: first_raw,
                ..RawOverlay::idle()
            };
            self.dma.set_overlay(qh_ref, &overlay);
            log::debug!("EHCI: QH {} restarted after fault", idx);
        }

        let qh = self.qhs.get_mut(idx);
        match qh.qtd_tail {
            None => {
                qh.qtd_head = Some(first);
                qh.qtd_tail = Some(last);
                self.dma.set_overlay_next(qh_ref, first_raw);
            }
            Some(tail) => {
                qh.qtd_tail = Some(last);
                self.qtds.get_mut(tail).next = QtdLink::Qtd(first);
                self.dma.set_qtd_next(tail, first_raw);
                // The controller may have run the old tail before the link
                // landed
                self.rearm(idx);
            }
        }
        self.qhs.get_mut(idx).total_xferred_bytes += bytes;
    }

    /// Free every qTD on a queue head's shadow list and reset its counters
    pub(super) fn discard_chain(&mut self, idx: u16) -> bool {
        let mut had_ioc = false;
        let mut cursor = self.qhs.get(idx).qtd_head;
        while let Some(id) = cursor {
            let qtd = *self.qtds.get(id);
            had_ioc |= qtd.int_on_complete;
            cursor = match qtd.next {
                QtdLink::Qtd(next) => Some(next),
                QtdLink::Terminate => None,
            };
            self.qtds.free(id);
        }

        let qh = self.qhs.get_mut(idx);
        qh.qtd_head = None;
        qh.qtd_tail = None;
        qh.total_xferred_bytes = 0;
        qh.completed_bytes = 0;
        qh.faulted = false;
        had_ioc
    }
}
