//! Capacities and timing knobs for the schedule core
//!
//! Pool sizes are compile-time constants so every descriptor table is a
//! fixed-size array; nothing in the hot path allocates.

/// Highest device address with a queue-head slice (address 0 is the
/// enumeration default address and gets its own slice).
pub const MAX_DEVICES: usize = 8;

/// Queue heads (pipes) per device, endpoint 0 included
pub const QH_PER_DEVICE: usize = 8;

/// Total queue heads in the per-device pool
pub const QH_POOL_LEN: usize = (MAX_DEVICES + 1) * QH_PER_DEVICE;

/// Shared queue transfer descriptor pool size
pub const QTD_POOL_SIZE: usize = 64;

/// Periodic frame list entries (EHCI USBCMD.FLS = 1024)
pub const FRAME_LIST_LEN: usize = 1024;

/// Run-time tuning for the reclamation protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcdConfig {
    /// Frames that must elapse after a periodic unlink before the slot is
    /// released. One full pass over the interval tree is 32 frames.
    pub periodic_quiescence_frames: u16,
    /// Frames a queue head may stay in the removing state before it is
    /// declared stuck.
    pub reclaim_timeout_frames: u16,
}

impl Default for HcdConfig {
    fn default() -> Self {
        Self {
            periodic_quiescence_frames: 32,
            reclaim_timeout_frames: 100,
        }
    }
}
