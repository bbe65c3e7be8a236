//! Hardware drivers for ehci-hcd
//!
//! Only USB host support lives here; see [`usb::ehci`] for the schedule core.

pub mod usb;
