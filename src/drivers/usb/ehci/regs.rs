//! EHCI Register Definitions using tock-registers
//!
//! Only the registers the schedule core touches are described here: the
//! capability length (to find the operational block), USBCMD for schedule
//! enables and the async-advance doorbell, USBSTS for interrupt causes,
//! FRINDEX as the reclamation clock, and the two schedule base registers.
//!
//! # References
//! - EHCI Specification 1.0, section 2.3

use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite};

register_bitfields! [
    u32,
    /// Capability Register Length and Interface Version (offset 0x00)
    pub CAPLENGTH_HCIVERSION [
        /// Capability Registers Length (offset to operational registers)
        CAPLENGTH OFFSET(0) NUMBITS(8) [],
        /// Host Controller Interface Version Number
        HCIVERSION OFFSET(16) NUMBITS(16) []
    ],

    /// Structural Parameters (HCSPARAMS) - offset 0x04
    pub HCSPARAMS [
        /// Number of Ports
        N_PORTS OFFSET(0) NUMBITS(4) []
    ],

    /// Capability Parameters (HCCPARAMS) - offset 0x08
    pub HCCPARAMS [
        /// 64-bit Addressing Capability
        AC64 OFFSET(0) NUMBITS(1) [],
        /// Programmable Frame List Flag
        PFLF OFFSET(1) NUMBITS(1) []
    ]
];

register_bitfields! [
    u32,
    /// USB Command (USBCMD) - op offset 0x00
    pub USBCMD [
        /// Run/Stop
        RS OFFSET(0) NUMBITS(1) [],
        /// Frame List Size
        FLS OFFSET(2) NUMBITS(2) [
            Size1024 = 0,
            Size512 = 1,
            Size256 = 2
        ],
        /// Periodic Schedule Enable
        PSE OFFSET(4) NUMBITS(1) [],
        /// Asynchronous Schedule Enable
        ASE OFFSET(5) NUMBITS(1) [],
        /// Interrupt on Async Advance Doorbell
        IAAD OFFSET(6) NUMBITS(1) []
    ],

    /// USB Status (USBSTS) - op offset 0x04
    pub USBSTS [
        /// USB Interrupt (a qTD with IOC retired, or a short packet)
        USBINT OFFSET(0) NUMBITS(1) [],
        /// USB Error Interrupt
        USBERRINT OFFSET(1) NUMBITS(1) [],
        /// Port Change Detect
        PCD OFFSET(2) NUMBITS(1) [],
        /// Frame List Rollover
        FLR OFFSET(3) NUMBITS(1) [],
        /// Host System Error
        HSE OFFSET(4) NUMBITS(1) [],
        /// Interrupt on Async Advance
        IAA OFFSET(5) NUMBITS(1) [],
        /// HC Halted
        HCHALTED OFFSET(12) NUMBITS(1) [],
        /// Periodic Schedule Status
        PSS OFFSET(14) NUMBITS(1) [],
        /// Asynchronous Schedule Status
        ASS OFFSET(15) NUMBITS(1) []
    ],

    /// USB Interrupt Enable (USBINTR) - op offset 0x08
    pub USBINTR [
        USBIE OFFSET(0) NUMBITS(1) [],
        USBEIE OFFSET(1) NUMBITS(1) [],
        PCIE OFFSET(2) NUMBITS(1) [],
        FLRE OFFSET(3) NUMBITS(1) [],
        HSEE OFFSET(4) NUMBITS(1) [],
        IAAE OFFSET(5) NUMBITS(1) []
    ],

    /// Frame Index (FRINDEX) - op offset 0x0C
    pub FRINDEX [
        /// Microframe counter; bits 3.. are the frame number
        INDEX OFFSET(0) NUMBITS(14) []
    ]
];

/// EHCI Capability Registers (read-only, minimum 0x10 bytes)
#[repr(C)]
pub struct EhciCapRegs {
    /// Capability Register Length and Interface Version
    pub caplength_hciversion: ReadOnly<u32, CAPLENGTH_HCIVERSION::Register>,
    /// Structural Parameters
    pub hcsparams: ReadOnly<u32, HCSPARAMS::Register>,
    /// Capability Parameters
    pub hccparams: ReadOnly<u32, HCCPARAMS::Register>,
}

/// EHCI Operational Registers
#[repr(C)]
pub struct EhciOpRegs {
    /// USB Command
    pub usbcmd: ReadWrite<u32, USBCMD::Register>,
    /// USB Status
    pub usbsts: ReadWrite<u32, USBSTS::Register>,
    /// USB Interrupt Enable
    pub usbintr: ReadWrite<u32, USBINTR::Register>,
    /// USB Frame Index
    pub frindex: ReadWrite<u32, FRINDEX::Register>,
    /// 4G Segment Selector
    pub ctrldssegment: ReadWrite<u32>,
    /// Periodic Frame List Base Address
    pub periodiclistbase: ReadWrite<u32>,
    /// Current Asynchronous List Address
    pub asynclistaddr: ReadWrite<u32>,
}

/// Write-1-to-clear interrupt cause bits in USBSTS
pub const USBSTS_W1C_MASK: u32 = 0x3F;
