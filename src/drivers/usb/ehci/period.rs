//! Periodic interval tree
//!
//! Six bucket heads (1, 2, 4, 8, 16 and 32 ms) are chained from the longest
//! period down to the shortest and terminate after the 1 ms head. Frame `f`
//! of the frame list enters the chain at the bucket for
//! `2^min(trailing_zeros(f), 5)`, so bucket `k` is visited every `2^k`
//! frames. A periodic queue head sits directly after its bucket head.

use super::Hcd;
use super::controller::HostController;
use super::hw::{BUCKET_COUNT, Link, QhRef};
use crate::drivers::usb::core::{UsbError, UsbSpeed};

/// Period of each bucket in milliseconds, by bucket index
pub const BUCKET_MS: [u8; BUCKET_COUNT] = [1, 2, 4, 8, 16, 32];

/// Full/low-speed complete-split window: microframes 2, 3 and 4 after a
/// start-split in microframe 0
pub const SPLIT_CMASK: u8 = 0x1C;

/// Scheduling fields of a periodic queue head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicParams {
    /// 0 for high-speed endpoints polled more than once per frame
    pub interval_ms: u8,
    pub smask: u8,
    pub cmask: u8,
}

/// Encode an endpoint's bInterval
///
/// High speed: `interval` is an exponent, one transaction every
/// `2^(interval - 1)` microframes. Full/low speed: `interval` is already
/// in frames.
pub fn periodic_params(speed: UsbSpeed, interval: u8) -> PeriodicParams {
    match speed {
        UsbSpeed::High => {
            let exp = interval.clamp(1, 16);
            match exp {
                1 => PeriodicParams {
                    interval_ms: 0,
                    smask: 0xFF,
                    cmask: 0,
                },
                2 => PeriodicParams {
                    interval_ms: 0,
                    smask: 0x55,
                    cmask: 0,
                },
                3 => PeriodicParams {
                    interval_ms: 0,
                    smask: 0x11,
                    cmask: 0,
                },
                _ => PeriodicParams {
                    interval_ms: (1u32 << (exp - 4)).min(255) as u8,
                    smask: 0x01,
                    cmask: 0,
                },
            }
        }
        UsbSpeed::Full | UsbSpeed::Low => PeriodicParams {
            interval_ms: interval.max(1),
            smask: 0x01,
            cmask: SPLIT_CMASK,
        },
    }
}

/// Bucket for an interval: the largest power of two not above
/// `min(interval_ms, 32)`. Sub-frame intervals use the 1 ms bucket.
pub fn bucket_index(interval_ms: u8) -> u8 {
    let n = interval_ms.clamp(1, 32);
    (u8::BITS - 1 - n.leading_zeros()) as u8
}

/// Bucket a frame list entry points at
pub fn frame_bucket(frame: usize) -> u8 {
    if frame == 0 {
        (BUCKET_COUNT - 1) as u8
    } else {
        (frame.trailing_zeros() as usize).min(BUCKET_COUNT - 1) as u8
    }
}

/// Link each bucket head to the next shorter period
pub fn bucket_chain_next(bucket: u8) -> Link {
    match bucket {
        0 => Link::Terminate,
        b => Link::Qh(QhRef::Bucket(b - 1)),
    }
}

impl<C: HostController> Hcd<C> {
    /// Hang a freshly written queue head under its bucket head
    pub(super) fn periodic_link(&mut self, idx: u16, bucket: u8) {
        self.insert_after(QhRef::Bucket(bucket), idx);
        log::debug!(
            "EHCI: QH {} linked under {} ms bucket",
            idx,
            BUCKET_MS[bucket as usize]
        );
    }

    /// Route the bucket chain around a periodic queue head. Its own link is
    /// turned back at the predecessor so a controller already standing on
    /// it continues into the live chain.
    pub(super) fn periodic_unlink(&mut self, idx: u16) -> Result<(), UsbError> {
        let qh = self.qhs.get(idx);
        let bucket = qh.bucket.ok_or(UsbError::InvalidPipe)?;
        let next = qh.next;
        let target = QhRef::Pipe(idx);
        let pred = self
            .find_predecessor(QhRef::Bucket(bucket), target)
            .ok_or(UsbError::NotFound)?;

        self.set_next(pred, next);
        self.set_next(target, Link::Qh(pred));
        log::debug!("EHCI: QH {} unlinked from periodic schedule", idx);
        Ok(())
    }
}
