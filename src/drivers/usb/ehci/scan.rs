//! Completion scan
//!
//! Walks every live queue head's shadow list front to back, retiring qTDs
//! the controller has written back as inactive. The scan stops at the
//! first still-active qTD (qTDs on one queue head execute strictly in
//! order) and at the first halted one, which is reported as a fault.

use super::controller::HostController;
use super::hw::{QhRef, QtdLink};
use super::qh::QhState;
use super::qtd::{Overlay, Pid, QtdStatus};
use super::{Hcd, HcdEvent, XferOutcome};
use crate::config::QH_POOL_LEN;

impl<C: HostController> Hcd<C> {
    /// Retire finished work on every queue head
    pub fn scan(&mut self, sink: &mut dyn FnMut(HcdEvent)) {
        for idx in 0..QH_POOL_LEN as u16 {
            let qh = self.qhs.get(idx);
            if matches!(qh.state, QhState::Active | QhState::Removing) && qh.has_pending() {
                self.scan_qh(idx, sink);
            }
        }
    }

    pub(super) fn scan_qh(&mut self, idx: u16, sink: &mut dyn FnMut(HcdEvent)) {
        if self.qhs.get(idx).faulted {
            return;
        }

        while let Some(id) = self.qhs.get(idx).qtd_head {
            let token = self.dma.qtd_token(id);
            let qtd = self.qtds.get_mut(id);
            qtd.apply_token(token);
            let qtd = *qtd;

            if qtd.status.is_halted() {
                let error = qtd.status.error_kind();
                let qh = self.qhs.get_mut(idx);
                qh.faulted = true;
                let bytes_before_fault = qh.completed_bytes + qtd.transferred();
                let (pipe, class) = (qh.handle, qh.class);
                log::debug!(
                    "EHCI: QH {} halted ({:?}) after {} bytes, status {:?}",
                    idx,
                    error,
                    bytes_before_fault,
                    qtd.status
                );
                sink(HcdEvent::Transfer {
                    pipe,
                    class,
                    outcome: XferOutcome::Fault {
                        bytes_before_fault,
                        error,
                    },
                });
                return;
            }

            if qtd.status.is_active() {
                break;
            }

            self.qtds.free(id);
            let qh = self.qhs.get_mut(idx);
            if qtd.pid != Pid::Setup {
                qh.completed_bytes += qtd.transferred();
            }
            qh.total_xferred_bytes = qh
                .total_xferred_bytes
                .saturating_sub(qtd.expected_bytes as u32);
            qh.qtd_head = match qtd.next {
                QtdLink::Qtd(next) => Some(next),
                QtdLink::Terminate => None,
            };
            if qh.qtd_head.is_none() {
                qh.qtd_tail = None;
                qh.total_xferred_bytes = 0;
            }

            if qtd.int_on_complete {
                let bytes = qh.completed_bytes;
                qh.completed_bytes = 0;
                let (pipe, class) = (qh.handle, qh.class);
                log::trace!("EHCI: QH {} completed {} bytes", idx, bytes);
                sink(HcdEvent::Transfer {
                    pipe,
                    class,
                    outcome: XferOutcome::Success { bytes },
                });
            }
        }

        self.rearm(idx);
    }

    /// Re-arm every queue head that went idle with work still queued
    ///
    /// Covers an append whose link landed after the controller had already
    /// copied the old tail's terminated next pointer, when that tail raised
    /// no interrupt of its own.
    pub(super) fn rearm_idle(&mut self) {
        for idx in 0..QH_POOL_LEN as u16 {
            let qh = self.qhs.get(idx);
            if matches!(qh.state, QhState::Active | QhState::Removing)
                && qh.has_pending()
                && !qh.faulted
            {
                self.rearm(idx);
            }
        }
    }

    /// Point an idle overlay at the first qTD the controller has not run
    pub(super) fn rearm(&mut self, idx: u16) {
        let qh_ref = QhRef::Pipe(idx);
        if !Overlay::decode(&self.dma.overlay(qh_ref), &self.dma).is_idle() {
            return;
        }

        let mut cursor = self.qhs.get(idx).qtd_head;
        while let Some(id) = cursor {
            let status = QtdStatus::from_bits_truncate(self.dma.qtd_token(id) as u8);
            if status.is_active() {
                let raw = self.dma.encode_qtd_link(QtdLink::Qtd(id));
                self.dma.set_overlay_next(qh_ref, raw);
                log::trace!("EHCI: QH {} re-armed at qTD {}", idx, id.0);
                return;
            }
            cursor = match self.qtds.get(id).next {
                QtdLink::Qtd(next) => Some(next),
                QtdLink::Terminate => None,
            };
        }
    }
}
