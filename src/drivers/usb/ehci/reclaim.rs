//! Queue head reclamation
//!
//! Closing a pipe unlinks its queue head at once but the slot stays
//! `Removing` until the controller can no longer be holding a pointer to
//! it:
//!
//! - async queue heads wait for the async-advance doorbell to be answered
//!   (one doorbell outstanding at a time; later closes ride the next one)
//! - periodic queue heads wait for a full pass over the interval tree,
//!   measured on FRINDEX
//!
//! A halted controller holds no pointers, so everything pending is released
//! on the next poll. A queue head still `Removing` after the configured
//! timeout is parked as `Stuck` and never handed out again.
//!
//! # Locking
//!
//! When the `Hcd` sits in a `spin::Mutex` shared with an interrupt handler,
//! the handler must call [`try_poll`] and never `lock()`: on a single core
//! the handler would otherwise spin on a lock its own preempted producer
//! holds. Causes it cannot handle stay latched in USBSTS and are picked up
//! by the next [`Hcd::poll`], which [`close_and_wait`] issues itself.

use heapless::Vec;

use super::controller::{HostController, UsbStatus, frame_number, frames_since};
use super::pool::QhPool;
use super::hw::QtdLink;
use super::qh::QhState;
use super::{Hcd, HcdEvent, XferOutcome};
use crate::config::QH_POOL_LEN;
use crate::drivers::usb::core::{PipeHandle, TransferError, UsbError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ReclaimKind {
    /// Waiting on the doorbell; `rung` once a doorbell issued after the
    /// unlink is outstanding
    Async { rung: bool },
    /// Waiting out a full periodic cycle
    Periodic,
}

/// A queue head between unlink and release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Reclaim {
    pub qh: u16,
    pub kind: ReclaimKind,
    /// Frame number at unlink
    pub since: u16,
}

impl<C: HostController> Hcd<C> {
    /// Close a pipe
    ///
    /// The handle stops accepting submissions immediately. Work already
    /// queued keeps being scanned until the slot is released, at which point
    /// `PipeReclaimed` is delivered.
    pub fn close(&mut self, pipe: PipeHandle) -> Result<(), UsbError> {
        let idx = self.qhs.lookup(pipe).ok_or(UsbError::NotFound)?;
        let qh = self.qhs.get(idx);
        match qh.state {
            QhState::Active => {}
            QhState::Removing | QhState::Stuck => return Err(UsbError::Busy),
            QhState::Free => return Err(UsbError::NotFound),
        }
        let periodic = qh.is_periodic();

        if periodic {
            self.periodic_unlink(idx)?;
        } else {
            self.async_unlink(idx)?;
        }
        self.qhs.get_mut(idx).state = QhState::Removing;

        let kind = if periodic {
            ReclaimKind::Periodic
        } else if self.controller.is_running() {
            ReclaimKind::Async {
                rung: self.ring_doorbell(),
            }
        } else {
            ReclaimKind::Async { rung: false }
        };
        let since = frame_number(self.controller.frame_index());
        self.reclaim
            .push(Reclaim {
                qh: idx,
                kind,
                since,
            })
            .map_err(|_| UsbError::NoResource)?;

        log::debug!(
            "EHCI: closing QH {} ({}), frame {}",
            idx,
            if periodic { "periodic" } else { "async" },
            since
        );
        Ok(())
    }

    /// Handle the interrupt causes read from USBSTS
    pub fn service_interrupt(&mut self, status: UsbStatus, sink: &mut dyn FnMut(HcdEvent)) {
        if status.contains(UsbStatus::HOST_SYSTEM_ERROR) {
            log::error!("EHCI: host system error, controller halted");
        }
        if status.intersects(UsbStatus::USB_INTERRUPT | UsbStatus::ERROR_INTERRUPT) {
            self.scan(sink);
        }
        if status.contains(UsbStatus::ASYNC_ADVANCE) {
            self.async_advanced(sink);
        }
        self.rearm_idle();
        self.poll_reclamation(sink);
    }

    /// Take whatever causes the controller has latched and handle them
    pub fn poll(&mut self, sink: &mut dyn FnMut(HcdEvent)) {
        let status = self.controller.take_status();
        self.service_interrupt(status, sink);
    }

    /// The controller answered the doorbell: every async queue head unlinked
    /// before it was rung is now unreachable
    fn async_advanced(&mut self, sink: &mut dyn FnMut(HcdEvent)) {
        self.doorbell_pending = false;
        self.release_where(sink, |r| matches!(r.kind, ReclaimKind::Async { rung: true }));

        if self
            .reclaim
            .iter()
            .any(|r| matches!(r.kind, ReclaimKind::Async { rung: false }))
            && self.ring_doorbell()
        {
            for entry in self.reclaim.iter_mut() {
                if matches!(entry.kind, ReclaimKind::Async { rung: false }) {
                    entry.kind = ReclaimKind::Async { rung: true };
                }
            }
        }
    }

    /// Release periodic queue heads past quiescence, everything if the
    /// controller has stopped, and park queue heads past the timeout
    pub fn poll_reclamation(&mut self, sink: &mut dyn FnMut(HcdEvent)) {
        if self.reclaim.is_empty() {
            return;
        }

        if !self.controller.is_running() {
            self.doorbell_pending = false;
            self.release_where(sink, |_| true);
            return;
        }

        let now = frame_number(self.controller.frame_index());
        let quiescence = self.config.periodic_quiescence_frames;
        self.release_where(sink, |r| {
            r.kind == ReclaimKind::Periodic && frames_since(r.since, now) >= quiescence
        });

        let timeout = self.config.reclaim_timeout_frames;
        let mut stuck: Vec<u16, QH_POOL_LEN> = Vec::new();
        let mut lost_doorbell = false;
        self.reclaim.retain(|r| {
            if frames_since(r.since, now) >= timeout {
                let _ = stuck.push(r.qh);
                lost_doorbell |= matches!(r.kind, ReclaimKind::Async { rung: true });
                false
            } else {
                true
            }
        });
        // The doorbell this entry waited on is not coming; let the next
        // close ring a fresh one
        if lost_doorbell {
            self.doorbell_pending = false;
        }
        for idx in stuck {
            self.park(idx, sink);
        }
    }

    /// Retire a slot the controller never let go of
    ///
    /// Its qTDs stay allocated since the controller may still be reading
    /// them; a submission still waiting for a report is aborted here as it
    /// will never get one.
    fn park(&mut self, idx: u16, sink: &mut dyn FnMut(HcdEvent)) {
        self.scan_qh(idx, sink);

        let qh = *self.qhs.get(idx);
        if self.pending_ioc(idx) && !qh.faulted {
            sink(HcdEvent::Transfer {
                pipe: qh.handle,
                class: qh.class,
                outcome: XferOutcome::Fault {
                    bytes_before_fault: qh.completed_bytes,
                    error: TransferError::Aborted,
                },
            });
        }

        let qh = self.qhs.get_mut(idx);
        qh.state = QhState::Stuck;
        log::warn!("EHCI: QH {} never quiesced, retiring the slot", idx);
        sink(HcdEvent::ReclaimTimedOut { pipe: qh.handle });
    }

    /// Whether any queued qTD still owes its submitter a report
    fn pending_ioc(&self, idx: u16) -> bool {
        let mut cursor = self.qhs.get(idx).qtd_head;
        while let Some(id) = cursor {
            let qtd = self.qtds.get(id);
            if qtd.int_on_complete {
                return true;
            }
            cursor = match qtd.next {
                QtdLink::Qtd(next) => Some(next),
                QtdLink::Terminate => None,
            };
        }
        false
    }

    fn release_where(
        &mut self,
        sink: &mut dyn FnMut(HcdEvent),
        mut ready: impl FnMut(&Reclaim) -> bool,
    ) {
        let mut done: Vec<u16, QH_POOL_LEN> = Vec::new();
        self.reclaim.retain(|r| {
            if ready(r) {
                let _ = done.push(r.qh);
                false
            } else {
                true
            }
        });
        for idx in done {
            self.release(idx, sink);
        }
    }

    /// Final scan, abort whatever is left, free the slot
    fn release(&mut self, idx: u16, sink: &mut dyn FnMut(HcdEvent)) {
        self.scan_qh(idx, sink);

        let qh = *self.qhs.get(idx);
        let completed = qh.completed_bytes;
        let faulted = qh.faulted;
        let had_ioc = self.discard_chain(idx);
        if had_ioc && !faulted {
            sink(HcdEvent::Transfer {
                pipe: qh.handle,
                class: qh.class,
                outcome: XferOutcome::Fault {
                    bytes_before_fault: completed,
                    error: TransferError::Aborted,
                },
            });
        }

        self.qhs.release(idx);
        log::debug!("EHCI: QH {} reclaimed", idx);
        sink(HcdEvent::PipeReclaimed { pipe: qh.handle });
    }

    /// State of the slot a handle was opened in
    pub(super) fn slot_state(&self, pipe: PipeHandle) -> Option<QhState> {
        let idx = QhPool::handle_index(pipe)?;
        let qh = self.qhs.get(idx);
        if qh.handle != pipe {
            return Some(QhState::Free);
        }
        Some(qh.state)
    }
}

/// Interrupt-context entry point
///
/// Services the controller if the lock is free. Returns `false` without
/// touching USBSTS when it is held, leaving the causes latched for the
/// holder's next [`Hcd::poll`].
pub fn try_poll<C: HostController>(
    hcd: &spin::Mutex<Hcd<C>>,
    sink: &mut dyn FnMut(HcdEvent),
) -> bool {
    match hcd.try_lock() {
        Some(mut hcd) => {
            hcd.poll(sink);
            true
        }
        None => false,
    }
}

/// Close a pipe and wait until its queue head is reclaimed
///
/// Polls the controller itself, so it completes whether or not an
/// interrupt handler is running. The lock is dropped between polls. Must
/// not be called from interrupt context.
pub fn close_and_wait<C: HostController>(
    hcd: &spin::Mutex<Hcd<C>>,
    pipe: PipeHandle,
    sink: &mut dyn FnMut(HcdEvent),
) -> Result<(), UsbError> {
    hcd.lock().close(pipe)?;

    loop {
        {
            let mut hcd = hcd.lock();
            hcd.poll(sink);
            match hcd.slot_state(pipe) {
                Some(QhState::Removing) => {}
                Some(QhState::Stuck) => return Err(UsbError::ReclaimTimeout),
                _ => return Ok(()),
            }
        }
        core::hint::spin_loop();
    }
}
