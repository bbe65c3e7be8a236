//! ehci-hcd - EHCI (USB 2.0) host controller schedule core
//!
//! This library turns "transfer this buffer on this pipe" requests into the
//! queue heads and queue transfer descriptors an EHCI controller walks, places
//! them into the asynchronous ring or the periodic interval tree, reports
//! completions from interrupt context, and reclaims queue heads only after the
//! controller has provably stopped referencing them.
//!
//! Class drivers (mass storage, CDC, HID), descriptor enumeration and the
//! register-level controller bring-up are outside this crate; they reach it
//! through [`drivers::usb::ehci::Hcd`]'s open/submit/close calls and the
//! [`drivers::usb::ehci::HcdEvent`] completion path.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod drivers;
pub mod logger;

pub use drivers::usb::core::{
    ClassCode, Direction, EndpointDescriptor, EndpointType, PipeHandle, TransferError, UsbError,
    UsbSpeed,
};
pub use drivers::usb::ehci::{
    ControlRequest, DeviceInfo, DmaArena, Hcd, HcdEvent, HostController, MmioController,
    UsbStatus, XferOutcome, close_and_wait, try_poll,
};
