//! USB host support
//!
//! `core` holds the controller-independent vocabulary (speeds, endpoint
//! descriptors, pipe handles, errors); `ehci` is the EHCI schedule core.

pub mod core;
pub mod ehci;
