//! Controller boundary
//!
//! The schedule core needs very little from the register block: where to
//! point the two schedules, a way to ring the async-advance doorbell, and a
//! clock (FRINDEX) for periodic quiescence. [`HostController`] is that
//! boundary; [`MmioController`] is the real register-backed implementation.

use bitflags::bitflags;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

use super::regs::{
    CAPLENGTH_HCIVERSION, EhciCapRegs, EhciOpRegs, FRINDEX, HCCPARAMS, HCSPARAMS, USBCMD, USBINTR,
    USBSTS, USBSTS_W1C_MASK,
};

bitflags! {
    /// Interrupt causes latched in USBSTS
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbStatus: u32 {
        const USB_INTERRUPT = 1 << 0;
        const ERROR_INTERRUPT = 1 << 1;
        const PORT_CHANGE = 1 << 2;
        const FRAME_ROLLOVER = 1 << 3;
        const HOST_SYSTEM_ERROR = 1 << 4;
        const ASYNC_ADVANCE = 1 << 5;
    }
}

/// What the schedule core needs from the host controller
pub trait HostController {
    /// Program PERIODICLISTBASE / ASYNCLISTADDR and enable both schedules
    fn attach_schedules(&mut self, periodic_list_base: u32, async_list_addr: u32);

    /// Set USBCMD.IAAD; the controller answers with USBSTS.IAA once it no
    /// longer holds any pointer into the async ring cached before the ring.
    fn ring_async_doorbell(&mut self);

    /// Raw FRINDEX (microframe counter, 14 bits)
    fn frame_index(&self) -> u32;

    /// Whether the controller is walking its schedules at all
    fn is_running(&self) -> bool;

    /// Read and acknowledge the latched interrupt causes
    fn take_status(&mut self) -> UsbStatus;
}

/// Frame number (FRINDEX / 8, 11 bits) from a raw FRINDEX value
pub fn frame_number(frindex: u32) -> u16 {
    ((frindex >> 3) & 0x7FF) as u16
}

/// Frames elapsed between two frame numbers, modulo the FRINDEX wrap
pub fn frames_since(earlier: u16, now: u16) -> u16 {
    now.wrapping_sub(earlier) & 0x7FF
}

/// Register-backed controller
pub struct MmioController {
    op: *const EhciOpRegs,
    ports: u8,
}

// Safety: the register block is plain MMIO; exclusive use is enforced by
// whoever owns the `Hcd` (normally a `spin::Mutex`).
unsafe impl Send for MmioController {}

impl MmioController {
    /// Wrap an EHCI register block
    ///
    /// # Safety
    ///
    /// `mmio_base` must be the mapped base of an EHCI capability register
    /// block that stays mapped for the life of the returned value.
    pub unsafe fn new(mmio_base: usize) -> Self {
        let cap = &*(mmio_base as *const EhciCapRegs);
        let caplength = cap.caplength_hciversion.read(CAPLENGTH_HCIVERSION::CAPLENGTH) as usize;
        let version = cap.caplength_hciversion.read(CAPLENGTH_HCIVERSION::HCIVERSION);
        let ports = cap.hcsparams.read(HCSPARAMS::N_PORTS) as u8;
        log::info!(
            "EHCI version: {}.{:02}, ports: {}, operational registers at +{:#x}",
            (version >> 8) & 0xFF,
            version & 0xFF,
            ports,
            caplength
        );
        if cap.hccparams.is_set(HCCPARAMS::AC64) {
            log::debug!("EHCI: 64-bit capable, using segment 0 only");
        }
        Self {
            op: (mmio_base + caplength) as *const EhciOpRegs,
            ports,
        }
    }

    /// Root hub ports (HCSPARAMS.N_PORTS)
    pub fn port_count(&self) -> u8 {
        self.ports
    }

    fn regs(&self) -> &EhciOpRegs {
        // Safety: established by `new`
        unsafe { &*self.op }
    }
}

impl HostController for MmioController {
    fn attach_schedules(&mut self, periodic_list_base: u32, async_list_addr: u32) {
        let regs = self.regs();
        // 32-bit descriptors only
        regs.ctrldssegment.set(0);
        regs.periodiclistbase.set(periodic_list_base);
        regs.asynclistaddr.set(async_list_addr);
        // Frame list rollover keeps idle re-arm and reclaim ageing going
        // when no transfer interrupts arrive
        regs.usbintr.write(
            USBINTR::USBIE::SET
                + USBINTR::USBEIE::SET
                + USBINTR::FLRE::SET
                + USBINTR::HSEE::SET
                + USBINTR::IAAE::SET,
        );
        regs.usbcmd
            .modify(USBCMD::FLS::Size1024 + USBCMD::PSE::SET + USBCMD::ASE::SET);
        log::debug!(
            "EHCI schedules attached: periodic={:#x} async={:#x}",
            periodic_list_base,
            async_list_addr
        );
    }

    fn ring_async_doorbell(&mut self) {
        self.regs().usbcmd.modify(USBCMD::IAAD::SET);
    }

    fn frame_index(&self) -> u32 {
        self.regs().frindex.read(FRINDEX::INDEX)
    }

    fn is_running(&self) -> bool {
        !self.regs().usbsts.is_set(USBSTS::HCHALTED)
    }

    fn take_status(&mut self) -> UsbStatus {
        let raw = self.regs().usbsts.get();
        self.regs().usbsts.set(raw & USBSTS_W1C_MASK);
        UsbStatus::from_bits_truncate(raw)
    }
}
