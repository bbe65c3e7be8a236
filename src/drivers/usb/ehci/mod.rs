//! EHCI schedule core
//!
//! [`Hcd`] owns the DMA arena and the descriptor pools and implements the
//! pipe lifecycle on top of them:
//!
//! - `open`/`open_control` claim a queue head from the device's slice and
//!   link it into the async ring or the periodic interval tree
//! - `submit`/`submit_control` split a buffer into qTDs and publish the
//!   chain to the queue head
//! - `service_interrupt` (or `poll`, which reads USBSTS itself) runs the
//!   completion scan and drives reclamation
//! - `close` unlinks a queue head; its slot comes back only once the
//!   controller has provably stopped looking at it
//!
//! The controller walks the same memory concurrently and without locks.
//! Correctness rests on ordering: a qTD's token (with the active bit) is the
//! last word written, a removed queue head keeps a valid outbound link until
//! quiescence, and only qTDs the controller has retired are freed.
//!
//! # References
//! - EHCI Specification 1.0, chapter 4

mod async_list;
pub mod controller;
#[cfg(test)]
mod fake;
pub mod hw;
pub mod period;
pub mod pool;
pub mod qh;
pub mod qtd;
mod reclaim;
pub mod regs;
mod scan;
mod submit;
#[cfg(test)]
mod tests;

use core::ptr::NonNull;

use heapless::Vec;

pub use controller::{HostController, MmioController, UsbStatus};
pub use hw::DmaArena;
pub use reclaim::{close_and_wait, try_poll};
pub use submit::ControlRequest;

use self::hw::{BUCKET_COUNT, DmaRegion, Link, QhRef};
use self::period::{bucket_chain_next, bucket_index, frame_bucket, periodic_params};
use self::pool::{QhPool, QtdPool};
use self::qh::{QhState, QueueHead, async_head_raw, bucket_head_raw};
use self::qtd::Pid;
use self::reclaim::Reclaim;
use crate::config::{FRAME_LIST_LEN, HcdConfig, MAX_DEVICES, QH_PER_DEVICE, QH_POOL_LEN};
use crate::drivers::usb::core::{
    ClassCode, EndpointDescriptor, EndpointType, PipeHandle, TransferError, UsbError, UsbSpeed,
};

/// Routing information for an attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub speed: UsbSpeed,
    /// High-speed hub doing the split transactions (full/low speed only)
    pub hub_address: u8,
    pub hub_port: u8,
}

/// Result of a submission, reported once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferOutcome {
    Success {
        bytes: u32,
    },
    Fault {
        bytes_before_fault: u32,
        error: TransferError,
    },
}

/// Events delivered from interrupt context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcdEvent {
    Transfer {
        pipe: PipeHandle,
        class: ClassCode,
        outcome: XferOutcome,
    },
    /// The queue head is free again; the handle is dead
    PipeReclaimed { pipe: PipeHandle },
    /// The controller never confirmed it let go of the queue head
    ReclaimTimedOut { pipe: PipeHandle },
}

/// EHCI host controller schedule core
pub struct Hcd<C: HostController> {
    controller: C,
    dma: DmaRegion,
    config: HcdConfig,
    devices: [Option<DeviceInfo>; MAX_DEVICES + 1],
    qhs: QhPool,
    qtds: QtdPool,
    /// Model of the async head's and bucket heads' horizontal links
    async_next: Link,
    bucket_next: [Link; BUCKET_COUNT],
    reclaim: Vec<Reclaim, QH_POOL_LEN>,
    doorbell_pending: bool,
}

// Safety: the arena is only touched through `&mut self` (or `&self` reads)
// and the controller's own accesses are unsynchronized by nature.
unsafe impl<C: HostController + Send> Send for Hcd<C> {}

impl<C: HostController> Hcd<C> {
    /// Build both schedules in `arena` and hand them to the controller
    ///
    /// # Safety
    ///
    /// `arena` must be valid for the life of the returned value, reachable
    /// by the controller at bus address `arena_phys`, and not accessed by
    /// anything else while the `Hcd` exists.
    pub unsafe fn new(
        controller: C,
        arena: NonNull<DmaArena>,
        arena_phys: u32,
        config: HcdConfig,
    ) -> Self {
        let dma = DmaRegion::new(arena, arena_phys);
        let mut hcd = Self {
            controller,
            dma,
            config,
            devices: [None; MAX_DEVICES + 1],
            qhs: QhPool::new(),
            qtds: QtdPool::new(),
            async_next: Link::Qh(QhRef::AsyncHead),
            bucket_next: core::array::from_fn(|b| bucket_chain_next(b as u8)),
            reclaim: Vec::new(),
            doorbell_pending: false,
        };
        hcd.init_schedules();
        hcd
    }

    fn init_schedules(&mut self) {
        // Async ring: a lone head that links to itself
        self.dma
            .write_qh(QhRef::AsyncHead, &async_head_raw(&self.dma, self.async_next));

        // Interval tree: 32 -> 16 -> 8 -> 4 -> 2 -> 1 -> terminate
        for bucket in 0..BUCKET_COUNT {
            let raw = bucket_head_raw(&self.dma, self.bucket_next[bucket]);
            self.dma.write_qh(QhRef::Bucket(bucket as u8), &raw);
        }

        for frame in 0..FRAME_LIST_LEN {
            let entry = Link::Qh(QhRef::Bucket(frame_bucket(frame)));
            self.dma
                .set_frame_list_entry(frame, self.dma.encode_link(entry));
        }

        let periodic_base = self.dma.frame_list_phys();
        let async_base = self.dma.qh_phys(QhRef::AsyncHead);
        self.controller.attach_schedules(periodic_base, async_base);

        log::info!(
            "EHCI: schedules ready (frame list {:#x}, async head {:#x})",
            periodic_base,
            async_base
        );
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    /// Register a device address so pipes can be opened on it
    pub fn attach_device(&mut self, dev_addr: u8, info: DeviceInfo) -> Result<(), UsbError> {
        let slot = self
            .devices
            .get_mut(dev_addr as usize)
            .ok_or(UsbError::NoResource)?;
        if slot.is_some() && self.qhs.device_indices(dev_addr).next().is_some() {
            return Err(UsbError::Busy);
        }
        *slot = Some(info);
        log::debug!(
            "EHCI: device {} attached ({:?}, hub {} port {})",
            dev_addr,
            info.speed,
            info.hub_address,
            info.hub_port
        );
        Ok(())
    }

    /// Forget a device, closing every pipe it still has open
    pub fn remove_device(&mut self, dev_addr: u8) -> Result<(), UsbError> {
        self.device(dev_addr)?;

        let mut open: Vec<PipeHandle, QH_PER_DEVICE> = Vec::new();
        for idx in self.qhs.device_indices(dev_addr) {
            let qh = self.qhs.get(idx);
            if qh.state == QhState::Active {
                // Capacity equals the slice size
                let _ = open.push(qh.handle);
            }
        }
        for pipe in open {
            self.close(pipe)?;
        }

        self.devices[dev_addr as usize] = None;
        log::debug!("EHCI: device {} removed", dev_addr);
        Ok(())
    }

    fn device(&self, dev_addr: u8) -> Result<DeviceInfo, UsbError> {
        self.devices
            .get(dev_addr as usize)
            .copied()
            .flatten()
            .ok_or(UsbError::DeviceNotFound)
    }

    // ------------------------------------------------------------------
    // Pipe open
    // ------------------------------------------------------------------

    /// Open a pipe for an endpoint of an attached device
    pub fn open(
        &mut self,
        dev_addr: u8,
        desc: &EndpointDescriptor,
        class: ClassCode,
    ) -> Result<PipeHandle, UsbError> {
        let device = self.device(dev_addr)?;
        let xfer_type = desc.transfer_type();
        if xfer_type == EndpointType::Isochronous {
            return Err(UsbError::Unsupported);
        }

        let index = self.qhs.find_free(dev_addr).ok_or_else(|| {
            log::warn!("EHCI: device {} has no free queue head", dev_addr);
            UsbError::NoResource
        })?;
        let idx = QhPool::pool_index(dev_addr, index).ok_or(UsbError::NoResource)?;

        let handle = PipeHandle {
            dev_addr,
            xfer_type,
            index,
            generation: self.qhs.generation(idx),
        };
        let is_control = xfer_type == EndpointType::Control;
        let mut qh = QueueHead {
            state: QhState::Active,
            handle,
            class,
            device_address: dev_addr,
            endpoint: desc.number(),
            speed: device.speed,
            max_packet_size: desc.max_packet_size(),
            hub_address: device.hub_address,
            hub_port: device.hub_port,
            data_toggle_control: is_control,
            control_endpoint: is_control && device.speed != UsbSpeed::High,
            pid: Pid::from(desc.direction()),
            ..QueueHead::EMPTY
        };

        if xfer_type.is_periodic() {
            let params = periodic_params(device.speed, desc.interval);
            qh.interval_ms = params.interval_ms;
            qh.smask = params.smask;
            qh.cmask = params.cmask;
            qh.bucket = Some(bucket_index(params.interval_ms));
            if device.speed == UsbSpeed::High {
                qh.mult = desc.mult();
            }
        }

        *self.qhs.get_mut(idx) = qh;
        match qh.bucket {
            Some(bucket) => self.periodic_link(idx, bucket),
            None => self.async_link(idx),
        }

        log::debug!(
            "EHCI: opened {:?} pipe dev {} ep {} mps {} (QH {})",
            xfer_type,
            dev_addr,
            qh.endpoint,
            qh.max_packet_size,
            idx
        );
        Ok(handle)
    }

    /// Open the default control pipe (endpoint 0) of a device
    ///
    /// A `max_packet_size` of 0 means the device descriptor has not been
    /// read yet; the default for the device's speed is used.
    pub fn open_control(
        &mut self,
        dev_addr: u8,
        max_packet_size: u16,
    ) -> Result<PipeHandle, UsbError> {
        let max_packet_size = match max_packet_size {
            0 => self.device(dev_addr)?.speed.default_max_packet_size(),
            mps => mps,
        };
        let desc = EndpointDescriptor::new(0x00, 0x00, max_packet_size, 0);
        self.open(dev_addr, &desc, ClassCode::UNSPECIFIED)
    }

    // ------------------------------------------------------------------
    // Horizontal links
    // ------------------------------------------------------------------

    fn next_of(&self, qh: QhRef) -> Link {
        match qh {
            QhRef::AsyncHead => self.async_next,
            QhRef::Bucket(b) => self.bucket_next[b as usize],
            QhRef::Pipe(idx) => self.qhs.get(idx).next,
        }
    }

    /// Update a horizontal link in the model and in memory
    fn set_next(&mut self, qh: QhRef, link: Link) {
        match qh {
            QhRef::AsyncHead => self.async_next = link,
            QhRef::Bucket(b) => self.bucket_next[b as usize] = link,
            QhRef::Pipe(idx) => self.qhs.get_mut(idx).next = link,
        }
        self.dma.set_horizontal_link(qh, self.dma.encode_link(link));
    }

    /// Element whose link points at `target`, walking from `start`
    fn find_predecessor(&self, start: QhRef, target: QhRef) -> Option<QhRef> {
        let mut cur = start;
        for _ in 0..QH_POOL_LEN + BUCKET_COUNT + 1 {
            match self.next_of(cur) {
                Link::Qh(next) if next == target => return Some(cur),
                Link::Qh(next) if next == start => return None,
                Link::Qh(next) => cur = next,
                Link::Terminate => return None,
            }
        }
        None
    }

    /// Publish a queue head right after `pred`. The queue head is written
    /// whole while unreachable; only then does `pred` point at it.
    fn insert_after(&mut self, pred: QhRef, idx: u16) {
        let next = self.next_of(pred);
        let qh = self.qhs.get_mut(idx);
        qh.next = next;
        let raw = qh.to_raw(&self.dma);
        self.dma.write_qh(QhRef::Pipe(idx), &raw);
        self.set_next(pred, Link::Qh(QhRef::Pipe(idx)));
    }

    /// Bytes queued on a pipe and not yet retired
    pub fn pending_bytes(&self, pipe: PipeHandle) -> Result<u32, UsbError> {
        let idx = self.qhs.lookup(pipe).ok_or(UsbError::InvalidPipe)?;
        Ok(self.qhs.get(idx).total_xferred_bytes)
    }
}
