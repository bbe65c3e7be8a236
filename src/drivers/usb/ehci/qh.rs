//! Queue heads
//!
//! A [`QueueHead`] is the software side of one pipe: its identity and
//! scheduling parameters (fixed at open), the shadow list of qTDs it owns,
//! and the reclamation state machine. The controller only ever sees the
//! [`RawQueueHead`] produced by [`QueueHead::to_raw`].

use super::hw::{DmaRegion, Link, QtdId, RawOverlay, RawQueueHead};
use super::qtd::{Pid, QtdStatus};
use crate::drivers::usb::core::{ClassCode, EndpointType, PipeHandle, UsbSpeed};

/// Endpoint characteristics (QH dword 1)
mod ep_chars {
    pub const DEVICE_ADDR_MASK: u32 = 0x7F;
    pub const ENDPOINT_SHIFT: u32 = 8;
    pub const EPS_SHIFT: u32 = 12;
    /// Data toggle from the qTD rather than the overlay
    pub const DTC: u32 = 1 << 14;
    /// Head of reclamation list
    pub const H: u32 = 1 << 15;
    pub const MAX_PACKET_SHIFT: u32 = 16;
    pub const MAX_PACKET_MASK: u32 = 0x7FF;
    /// Control endpoint flag (full/low speed only)
    pub const C: u32 = 1 << 27;
    pub const NAK_RELOAD_SHIFT: u32 = 28;
}

/// Endpoint capabilities (QH dword 2)
mod ep_caps {
    pub const CMASK_SHIFT: u32 = 8;
    pub const HUB_ADDR_SHIFT: u32 = 16;
    pub const PORT_SHIFT: u32 = 23;
    pub const MULT_SHIFT: u32 = 30;
}

/// NAK counter reload for async queue heads
const NAK_RELOAD: u32 = 4;

/// Where a queue head is in its life
///
/// `Removing` can only be left through a confirmed quiescence (to `Free`)
/// or a timeout (to `Stuck`, which is never reused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QhState {
    #[default]
    Free,
    Active,
    Removing,
    Stuck,
}

/// Software model of one pipe's queue head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueHead {
    pub state: QhState,
    pub handle: PipeHandle,
    pub class: ClassCode,

    pub device_address: u8,
    pub endpoint: u8,
    pub speed: UsbSpeed,
    pub max_packet_size: u16,
    pub hub_address: u8,
    pub hub_port: u8,
    pub mult: u8,

    pub interval_ms: u8,
    pub smask: u8,
    pub cmask: u8,
    /// Interval-tree bucket this queue head hangs under (periodic only)
    pub bucket: Option<u8>,

    pub data_toggle_control: bool,
    pub head_list_flag: bool,
    pub control_endpoint: bool,
    /// Transfer direction for non-control pipes
    pub pid: Pid,

    /// Horizontal link, mirrored from the hardware word
    pub next: Link,
    pub qtd_head: Option<QtdId>,
    pub qtd_tail: Option<QtdId>,
    /// Bytes queued and not yet retired
    pub total_xferred_bytes: u32,
    /// Bytes moved since the last completion report
    pub completed_bytes: u32,
    /// A fault was reported on the current chain; it is not rescanned
    pub faulted: bool,
}

impl QueueHead {
    pub const EMPTY: QueueHead = QueueHead {
        state: QhState::Free,
        handle: PipeHandle {
            dev_addr: 0,
            xfer_type: EndpointType::Control,
            index: 0,
            generation: 0,
        },
        class: ClassCode::UNSPECIFIED,
        device_address: 0,
        endpoint: 0,
        speed: UsbSpeed::Full,
        max_packet_size: 0,
        hub_address: 0,
        hub_port: 0,
        mult: 1,
        interval_ms: 0,
        smask: 0,
        cmask: 0,
        bucket: None,
        data_toggle_control: false,
        head_list_flag: false,
        control_endpoint: false,
        pid: Pid::Out,
        next: Link::Terminate,
        qtd_head: None,
        qtd_tail: None,
        total_xferred_bytes: 0,
        completed_bytes: 0,
        faulted: false,
    };

    /// Slot occupied (open, or waiting for reclamation)
    pub fn used(&self) -> bool {
        self.state != QhState::Free
    }

    pub fn is_removing(&self) -> bool {
        self.state == QhState::Removing
    }

    pub fn is_periodic(&self) -> bool {
        self.handle.xfer_type.is_periodic()
    }

    pub fn has_pending(&self) -> bool {
        self.qtd_head.is_some()
    }

    pub fn ep_chars(&self) -> u32 {
        let mut chars = (self.device_address as u32 & ep_chars::DEVICE_ADDR_MASK)
            | ((self.endpoint as u32 & 0xF) << ep_chars::ENDPOINT_SHIFT)
            | ((self.speed as u32) << ep_chars::EPS_SHIFT)
            | ((self.max_packet_size as u32 & ep_chars::MAX_PACKET_MASK)
                << ep_chars::MAX_PACKET_SHIFT);
        if self.data_toggle_control {
            chars |= ep_chars::DTC;
        }
        if self.head_list_flag {
            chars |= ep_chars::H;
        }
        if self.control_endpoint {
            chars |= ep_chars::C;
        }
        // Periodic queue heads must not use the NAK counter
        if !self.is_periodic() {
            chars |= NAK_RELOAD << ep_chars::NAK_RELOAD_SHIFT;
        }
        chars
    }

    pub fn ep_caps(&self) -> u32 {
        let mut caps = self.smask as u32
            | ((self.mult.clamp(1, 3) as u32) << ep_caps::MULT_SHIFT);
        if self.speed != UsbSpeed::High {
            caps |= ((self.cmask as u32) << ep_caps::CMASK_SHIFT)
                | ((self.hub_address as u32 & 0x7F) << ep_caps::HUB_ADDR_SHIFT)
                | ((self.hub_port as u32 & 0x7F) << ep_caps::PORT_SHIFT);
        }
        caps
    }

    /// Hardware image of a freshly opened queue head: quiescent overlay,
    /// both qTD pointers terminated
    pub fn to_raw(&self, dma: &DmaRegion) -> RawQueueHead {
        RawQueueHead::new(
            dma.encode_link(self.next),
            self.ep_chars(),
            self.ep_caps(),
            RawOverlay::idle(),
        )
    }
}

/// Permanent head of the async ring: H bit set, overlay halted so the
/// controller never executes it
pub fn async_head_raw(dma: &DmaRegion, next: Link) -> RawQueueHead {
    let chars = ep_chars::H | ((UsbSpeed::High as u32) << ep_chars::EPS_SHIFT);
    let mut overlay = RawOverlay::idle();
    overlay.token = QtdStatus::HALTED.bits() as u32;
    RawQueueHead::new(dma.encode_link(next), chars, 1 << ep_caps::MULT_SHIFT, overlay)
}

/// Interval-tree bucket head: S-mask empty, so it only carries the link
pub fn bucket_head_raw(dma: &DmaRegion, next: Link) -> RawQueueHead {
    let mut overlay = RawOverlay::idle();
    overlay.token = QtdStatus::HALTED.bits() as u32;
    RawQueueHead::new(
        dma.encode_link(next),
        (UsbSpeed::High as u32) << ep_chars::EPS_SHIFT,
        1 << ep_caps::MULT_SHIFT,
        overlay,
    )
}
