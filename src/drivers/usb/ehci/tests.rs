//! Schedule scenarios against the fake controller

use super::fake::{ARENA_PHYS, Exec, FakeController, new_hcd, service};
use super::hw::{Link, QhRef, QtdId, QtdLink};
use super::pool::QhPool;
use super::qh::QhState;
use super::qtd::{Pid, Qtd, QtdStatus, align4k, max_descriptor_bytes};
use super::*;
use crate::config::{QH_PER_DEVICE, QTD_POOL_SIZE};
use crate::drivers::usb::core::Direction;
use std::vec::Vec;

const HS: DeviceInfo = DeviceInfo {
    speed: UsbSpeed::High,
    hub_address: 0,
    hub_port: 0,
};

fn hcd_with_device() -> Hcd<FakeController> {
    let mut hcd = new_hcd();
    hcd.attach_device(1, HS).unwrap();
    hcd
}

fn open_bulk(hcd: &mut Hcd<FakeController>, address: u8) -> PipeHandle {
    let desc = EndpointDescriptor::new(address, 0x02, 512, 0);
    hcd.open(1, &desc, ClassCode::MASS_STORAGE).unwrap()
}

fn open_interrupt(hcd: &mut Hcd<FakeController>, dev: u8, interval: u8) -> PipeHandle {
    let desc = EndpointDescriptor::new(0x81, 0x03, 8, interval);
    hcd.open(dev, &desc, ClassCode::HID).unwrap()
}

fn qh_ref(pipe: PipeHandle) -> QhRef {
    QhRef::Pipe(QhPool::handle_index(pipe).unwrap())
}

fn qh(hcd: &Hcd<FakeController>, pipe: PipeHandle) -> QueueHead {
    *hcd.qhs.get(QhPool::handle_index(pipe).unwrap())
}

/// The shadow list, front to back
fn chain(hcd: &Hcd<FakeController>, pipe: PipeHandle) -> Vec<(QtdId, Qtd)> {
    let mut out = Vec::new();
    let mut cursor = qh(hcd, pipe).qtd_head;
    while let Some(id) = cursor {
        let qtd = *hcd.qtds.get(id);
        out.push((id, qtd));
        cursor = match qtd.next {
            QtdLink::Qtd(next) => Some(next),
            QtdLink::Terminate => None,
        };
    }
    out
}

fn success(pipe: PipeHandle, class: ClassCode, bytes: u32) -> HcdEvent {
    HcdEvent::Transfer {
        pipe,
        class,
        outcome: XferOutcome::Success { bytes },
    }
}

fn fault(pipe: PipeHandle, class: ClassCode, bytes: u32, error: TransferError) -> HcdEvent {
    HcdEvent::Transfer {
        pipe,
        class,
        outcome: XferOutcome::Fault {
            bytes_before_fault: bytes,
            error,
        },
    }
}

// ----------------------------------------------------------------------
// Bootstrap
// ----------------------------------------------------------------------

#[test]
fn test_schedules_bootstrap() {
    let hcd = new_hcd();
    let fake = hcd.controller();

    assert_eq!(
        fake.schedules,
        Some((ARENA_PHYS, hcd.dma.qh_phys(QhRef::AsyncHead)))
    );
    assert!(fake.walk_async().is_empty());

    let head = hcd.dma.read_qh(QhRef::AsyncHead);
    assert_ne!(head.ep_chars & (1 << 15), 0);
    assert_ne!(head.overlay.token & QtdStatus::HALTED.bits() as u32, 0);

    let all: Vec<_> = (0..6u8).rev().map(QhRef::Bucket).collect();
    assert_eq!(fake.walk_frame(0), all);
    assert_eq!(fake.walk_frame(1), vec![QhRef::Bucket(0)]);
    assert_eq!(
        fake.walk_frame(12),
        vec![QhRef::Bucket(2), QhRef::Bucket(1), QhRef::Bucket(0)]
    );
}

// ----------------------------------------------------------------------
// Open
// ----------------------------------------------------------------------

#[test]
fn test_open_links_into_async_ring() {
    let mut hcd = hcd_with_device();
    let out = open_bulk(&mut hcd, 0x02);
    let inp = open_bulk(&mut hcd, 0x81);

    assert_eq!(out.xfer_type, EndpointType::Bulk);
    assert_eq!(out.dev_addr, 1);
    assert_ne!(out.index, inp.index);
    assert_eq!(hcd.controller().walk_async(), vec![qh_ref(inp), qh_ref(out)]);

    let q = qh(&hcd, inp);
    assert_eq!(q.state, QhState::Active);
    assert_eq!(q.pid, Pid::In);
    assert!(!q.has_pending());

    let raw = hcd.dma.read_qh(qh_ref(inp));
    assert_eq!(raw.overlay.next_qtd & 1, 1);
    assert_eq!(raw.overlay.alt_next_qtd & 1, 1);
    assert_eq!(raw.overlay.token, 0);
    assert_eq!((raw.ep_chars >> 8) & 0xF, 1);
}

#[test]
fn test_open_errors() {
    let mut hcd = hcd_with_device();
    let desc = EndpointDescriptor::new(0x81, 0x02, 512, 0);
    assert_eq!(
        hcd.open(2, &desc, ClassCode::MASS_STORAGE),
        Err(UsbError::DeviceNotFound)
    );

    let iso = EndpointDescriptor::new(0x81, 0x01, 1024, 1);
    assert_eq!(
        hcd.open(1, &iso, ClassCode::UNSPECIFIED),
        Err(UsbError::Unsupported)
    );

    for _ in 0..QH_PER_DEVICE {
        open_bulk(&mut hcd, 0x81);
    }
    assert_eq!(
        hcd.open(1, &desc, ClassCode::MASS_STORAGE),
        Err(UsbError::NoResource)
    );
}

#[test]
fn test_interval_placement_high_speed() {
    let mut hcd = hcd_with_device();

    let every_uframe = open_interrupt(&mut hcd, 1, 1);
    let q = qh(&hcd, every_uframe);
    assert_eq!(q.interval_ms, 0);
    assert_eq!(q.smask, 0xFF);
    assert_eq!(hcd.dma.read_qh(qh_ref(every_uframe)).ep_caps & 0xFF, 0xFF);

    let one_ms = open_interrupt(&mut hcd, 1, 4);
    let q = qh(&hcd, one_ms);
    assert_eq!(q.interval_ms, 1);
    assert_eq!(q.smask.count_ones(), 1);
    assert_eq!(hcd.bucket_next[0], Link::Qh(qh_ref(one_ms)));

    let eight_ms = open_interrupt(&mut hcd, 1, 7);
    assert_eq!(qh(&hcd, eight_ms).interval_ms, 8);
    assert_eq!(hcd.bucket_next[3], Link::Qh(qh_ref(eight_ms)));
    assert_eq!(
        hcd.controller().walk_frame(8),
        vec![
            QhRef::Bucket(3),
            qh_ref(eight_ms),
            QhRef::Bucket(2),
            QhRef::Bucket(1),
            QhRef::Bucket(0),
            qh_ref(one_ms),
            qh_ref(every_uframe),
        ]
    );

    // 256 ms collapses into the 32 ms bucket
    let slow = open_interrupt(&mut hcd, 1, 12);
    assert_eq!(qh(&hcd, slow).interval_ms, 255);
    assert_eq!(hcd.bucket_next[5], Link::Qh(qh_ref(slow)));
    assert!(!hcd.controller().walk_frame(16).contains(&qh_ref(slow)));
    assert!(hcd.controller().walk_frame(32).contains(&qh_ref(slow)));
}

#[test]
fn test_interval_placement_full_speed_behind_hub() {
    let mut hcd = new_hcd();
    let info = DeviceInfo {
        speed: UsbSpeed::Full,
        hub_address: 3,
        hub_port: 4,
    };
    hcd.attach_device(2, info).unwrap();

    let pipe = open_interrupt(&mut hcd, 2, 10);
    let q = qh(&hcd, pipe);
    assert_eq!(q.interval_ms, 10);
    assert_eq!(q.bucket, Some(3));

    let caps = hcd.dma.read_qh(qh_ref(pipe)).ep_caps;
    assert_eq!(caps & 0xFF, 0x01);
    assert_eq!((caps >> 8) & 0xFF, 0x1C);
    assert_eq!((caps >> 16) & 0x7F, 3);
    assert_eq!((caps >> 23) & 0x7F, 4);
}

#[test]
fn test_high_bandwidth_mult() {
    let mut hcd = hcd_with_device();
    let desc = EndpointDescriptor::new(0x81, 0x03, 0x400 | (1 << 11), 4);
    let pipe = hcd.open(1, &desc, ClassCode::UNSPECIFIED).unwrap();
    assert_eq!(hcd.dma.read_qh(qh_ref(pipe)).ep_caps >> 30, 2);

    // Bulk stays at one transaction
    let bulk = open_bulk(&mut hcd, 0x82);
    assert_eq!(hcd.dma.read_qh(qh_ref(bulk)).ep_caps >> 30, 1);
}

// ----------------------------------------------------------------------
// Submission
// ----------------------------------------------------------------------

#[test]
fn test_single_descriptor_submission() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x81);
    hcd.submit(pipe, 0x2000_0010, 1000, true).unwrap();

    let qtds = chain(&hcd, pipe);
    assert_eq!(qtds.len(), 1);
    let (id, qtd) = qtds[0];
    assert_eq!(qtd.buffer[0], 0x2000_0010);
    assert_eq!(qtd.total_bytes, 1000);
    assert_eq!(qtd.expected_bytes, 1000);
    assert_eq!(qtd.pid, Pid::In);
    assert_eq!(qtd.cerr, 3);
    assert!(!qtd.data_toggle);
    assert!(qtd.int_on_complete);
    assert!(qtd.next.is_terminate());
    assert!(qtd.alternate.is_terminate());

    let raw = hcd.dma.read_qtd(id);
    assert_ne!(raw.body.token & QtdStatus::ACTIVE.bits() as u32, 0);
    assert_eq!(hcd.dma.overlay(qh_ref(pipe)).next_qtd, hcd.dma.qtd_phys(id));
    assert_eq!(hcd.pending_bytes(pipe), Ok(1000));
}

#[test]
fn test_large_submission_is_chained() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x02);
    let len = 3 * 20480 + 5;
    hcd.submit(pipe, 0x3000_0000, len, true).unwrap();

    let qtds = chain(&hcd, pipe);
    assert_eq!(qtds.len(), 4);
    for (i, (_, qtd)) in qtds.iter().enumerate() {
        let last = i == qtds.len() - 1;
        assert_eq!(qtd.int_on_complete, last);
        assert_eq!(qtd.next.is_terminate(), last);
        if !last {
            assert_eq!(qtd.next, QtdLink::Qtd(qtds[i + 1].0));
            assert_eq!(
                hcd.dma.read_qtd(qtds[i].0).body.next_qtd,
                hcd.dma.qtd_phys(qtds[i + 1].0)
            );
        }
        for page in 1..5 {
            assert_eq!(
                qtd.buffer[page],
                align4k(qtd.buffer[0] + 4096 * page as u32)
            );
        }
        assert_eq!(qtd.pid, Pid::Out);
    }
    assert_eq!(qtds[3].1.expected_bytes, 5);
    assert_eq!(hcd.pending_bytes(pipe), Ok(len));
}

#[test]
fn test_unaligned_split_fills_each_descriptor() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x02);
    let addr = 0x5000_0100;
    let limit = max_descriptor_bytes(addr);
    hcd.submit(pipe, addr, 2 * limit, false).unwrap();

    let qtds = chain(&hcd, pipe);
    assert_eq!(qtds.len(), 2);
    assert_eq!(qtds[0].1.expected_bytes as u32, limit);
    assert_eq!(qtds[1].1.buffer[0], addr + limit);
    assert_eq!(qtds[1].1.expected_bytes as u32, limit);
}

#[test]
fn test_submit_errors() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x81);

    let free = hcd.qtds.free_count();
    assert_eq!(
        hcd.submit(pipe, 0x2000_0000, 65 * 20480, true),
        Err(UsbError::NoResource)
    );
    assert_eq!(hcd.qtds.free_count(), free);
    assert!(!qh(&hcd, pipe).has_pending());

    let bogus = PipeHandle { index: 5, ..pipe };
    assert_eq!(
        hcd.submit(bogus, 0x2000_0000, 64, true),
        Err(UsbError::InvalidPipe)
    );
}

// ----------------------------------------------------------------------
// Completion
// ----------------------------------------------------------------------

#[test]
fn test_round_trip_reports_once() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x81);
    let len = 3 * 20480 + 5;
    hcd.submit(pipe, 0x3000_0000, len, true).unwrap();

    assert_eq!(hcd.controller().drain(qh_ref(pipe)), 4);
    let events = service(&mut hcd, UsbStatus::USB_INTERRUPT);
    assert_eq!(events, vec![success(pipe, ClassCode::MASS_STORAGE, len)]);

    assert_eq!(hcd.pending_bytes(pipe), Ok(0));
    assert!(!qh(&hcd, pipe).has_pending());
    assert_eq!(hcd.qtds.free_count(), QTD_POOL_SIZE);
    assert!(service(&mut hcd, UsbStatus::USB_INTERRUPT).is_empty());
}

#[test]
fn test_partial_progress_stops_at_active_qtd() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x81);
    hcd.submit(pipe, 0x3000_0000, 2 * 20480, true).unwrap();

    let fake = hcd.controller();
    fake.execute(qh_ref(pipe), Exec::Complete).unwrap();
    assert!(service(&mut hcd, UsbStatus::USB_INTERRUPT).is_empty());
    assert_eq!(chain(&hcd, pipe).len(), 1);
    assert_eq!(hcd.pending_bytes(pipe), Ok(20480));
}

#[test]
fn test_short_packet_counts_actual_bytes() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x81);
    hcd.submit(pipe, 0x3000_0000, 512, true).unwrap();

    hcd.controller()
        .execute(qh_ref(pipe), Exec::Short(12))
        .unwrap();
    let events = service(&mut hcd, UsbStatus::USB_INTERRUPT);
    assert_eq!(events, vec![success(pipe, ClassCode::MASS_STORAGE, 500)]);
}

#[test]
fn test_zero_length_packet() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x02);
    hcd.submit(pipe, 0x3000_0000, 0, true).unwrap();

    let qtds = chain(&hcd, pipe);
    assert_eq!(qtds.len(), 1);
    assert_eq!(qtds[0].1.expected_bytes, 0);
    assert!(qtds[0].1.int_on_complete);

    hcd.controller().drain(qh_ref(pipe));
    let events = service(&mut hcd, UsbStatus::USB_INTERRUPT);
    assert_eq!(events, vec![success(pipe, ClassCode::MASS_STORAGE, 0)]);
}

#[test]
fn test_transaction_fault_after_two_descriptors() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x81);
    hcd.submit(pipe, 0x3000_0000, 3 * 20480, true).unwrap();
    let third = chain(&hcd, pipe)[2].0;

    let fake = hcd.controller();
    let qh = qh_ref(pipe);
    fake.execute(qh, Exec::Complete).unwrap();
    fake.execute(qh, Exec::Complete).unwrap();
    fake.execute(qh, Exec::Halt(QtdStatus::XACT_ERR)).unwrap();

    let events = service(&mut hcd, UsbStatus::ERROR_INTERRUPT);
    assert_eq!(
        events,
        vec![fault(
            pipe,
            ClassCode::MASS_STORAGE,
            2 * 20480,
            TransferError::Transaction
        )]
    );

    // The halted descriptor is never retired
    assert!(hcd.qtds.get(third).used);
    assert_eq!(chain(&hcd, pipe)[0].0, third);
    assert!(service(&mut hcd, UsbStatus::USB_INTERRUPT).is_empty());
}

#[test]
fn test_stall_then_resubmit() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x81);
    hcd.submit(pipe, 0x3000_0000, 512, true).unwrap();

    hcd.controller()
        .execute(qh_ref(pipe), Exec::Halt(QtdStatus::empty()))
        .unwrap();
    let events = service(&mut hcd, UsbStatus::ERROR_INTERRUPT);
    assert_eq!(
        events,
        vec![fault(pipe, ClassCode::MASS_STORAGE, 0, TransferError::Stall)]
    );
    assert_eq!(hcd.qtds.free_count(), QTD_POOL_SIZE - 1);

    // Resubmission frees the stale chain and clears the halt
    hcd.submit(pipe, 0x3000_1000, 64, true).unwrap();
    assert_eq!(hcd.qtds.free_count(), QTD_POOL_SIZE - 1);
    let overlay = hcd.dma.overlay(qh_ref(pipe));
    assert_eq!(overlay.token & QtdStatus::HALTED.bits() as u32, 0);
    assert_eq!(overlay.next_qtd, hcd.dma.qtd_phys(chain(&hcd, pipe)[0].0));

    assert_eq!(hcd.controller().drain(qh_ref(pipe)), 1);
    let events = service(&mut hcd, UsbStatus::USB_INTERRUPT);
    assert_eq!(events, vec![success(pipe, ClassCode::MASS_STORAGE, 64)]);
}

#[test]
fn test_append_behind_drained_silent_chain() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x02);
    let qh = qh_ref(pipe);

    // No interrupt-on-complete, so the controller finishes it silently
    hcd.submit(pipe, 0x3000_0000, 512, false).unwrap();
    hcd.controller().execute(qh, Exec::Complete).unwrap();

    // Nothing is serviced between the append and execution
    hcd.submit(pipe, 0x3000_1000, 512, true).unwrap();
    assert!(hcd.controller().execute(qh, Exec::Complete).is_some());

    // One report covering both submissions
    let events = service(&mut hcd, UsbStatus::USB_INTERRUPT);
    assert_eq!(events, vec![success(pipe, ClassCode::MASS_STORAGE, 1024)]);
}

#[test]
fn test_rollover_rearms_idle_queue_head() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x02);
    let qh = qh_ref(pipe);

    hcd.submit(pipe, 0x3000_0000, 512, false).unwrap();
    hcd.controller().execute(qh, Exec::Complete).unwrap();
    hcd.submit(pipe, 0x3000_1000, 512, true).unwrap();

    // The controller had already copied the old tail's terminated next
    let terminate = hcd.dma.encode_qtd_link(QtdLink::Terminate);
    hcd.dma.set_overlay_next(qh, terminate);
    assert!(hcd.controller().execute(qh, Exec::Complete).is_none());

    assert!(service(&mut hcd, UsbStatus::FRAME_ROLLOVER).is_empty());
    assert!(hcd.controller().execute(qh, Exec::Complete).is_some());
    let events = service(&mut hcd, UsbStatus::USB_INTERRUPT);
    assert_eq!(events, vec![success(pipe, ClassCode::MASS_STORAGE, 1024)]);
}

#[test]
fn test_append_behind_pending_chain() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x02);
    hcd.submit(pipe, 0x3000_0000, 512, true).unwrap();
    hcd.submit(pipe, 0x3000_1000, 256, true).unwrap();

    let qtds = chain(&hcd, pipe);
    assert_eq!(qtds.len(), 2);
    assert_eq!(qtds[0].1.next, QtdLink::Qtd(qtds[1].0));
    assert_eq!(hcd.pending_bytes(pipe), Ok(768));

    assert_eq!(hcd.controller().drain(qh_ref(pipe)), 2);
    let events = service(&mut hcd, UsbStatus::USB_INTERRUPT);
    assert_eq!(
        events,
        vec![
            success(pipe, ClassCode::MASS_STORAGE, 512),
            success(pipe, ClassCode::MASS_STORAGE, 256),
        ]
    );
}

// ----------------------------------------------------------------------
// Control transfers
// ----------------------------------------------------------------------

#[test]
fn test_control_transfer_stages() {
    let mut hcd = hcd_with_device();
    let pipe = hcd.open_control(1, 64).unwrap();
    let raw = hcd.dma.read_qh(qh_ref(pipe));
    assert_ne!(raw.ep_chars & (1 << 14), 0);
    assert_eq!(raw.ep_chars & (1 << 27), 0);

    let request = ControlRequest {
        setup: 0x4000_0000,
        data: 0x4000_0100,
        length: 18,
        direction: Direction::In,
    };
    hcd.submit_control(pipe, request, true).unwrap();

    let qtds = chain(&hcd, pipe);
    assert_eq!(qtds.len(), 3);
    let (setup, data, status) = (qtds[0].1, qtds[1].1, qtds[2].1);
    assert_eq!((setup.pid, setup.expected_bytes, setup.data_toggle), (Pid::Setup, 8, false));
    assert_eq!((data.pid, data.expected_bytes, data.data_toggle), (Pid::In, 18, true));
    assert_eq!((status.pid, status.expected_bytes, status.data_toggle), (Pid::Out, 0, true));
    assert!(!setup.int_on_complete && !data.int_on_complete);
    assert!(status.int_on_complete);

    assert_eq!(hcd.controller().drain(qh_ref(pipe)), 3);
    let events = service(&mut hcd, UsbStatus::USB_INTERRUPT);
    assert_eq!(events, vec![success(pipe, ClassCode::UNSPECIFIED, 18)]);

    assert_eq!(
        hcd.submit(pipe, 0x4000_0000, 8, true),
        Err(UsbError::Unsupported)
    );
    let bulk = open_bulk(&mut hcd, 0x81);
    assert_eq!(
        hcd.submit_control(bulk, request, true),
        Err(UsbError::Unsupported)
    );
}

#[test]
fn test_control_without_data_stage() {
    let mut hcd = new_hcd();
    let info = DeviceInfo {
        speed: UsbSpeed::Full,
        ..Default::default()
    };
    hcd.attach_device(0, info).unwrap();
    let pipe = hcd.open_control(0, 8).unwrap();
    assert_ne!(hcd.dma.read_qh(qh_ref(pipe)).ep_chars & (1 << 27), 0);

    let request = ControlRequest {
        setup: 0x4000_0000,
        data: 0,
        length: 0,
        direction: Direction::Out,
    };
    hcd.submit_control(pipe, request, true).unwrap();
    let qtds = chain(&hcd, pipe);
    assert_eq!(qtds.len(), 2);
    assert_eq!(qtds[1].1.pid, Pid::In);
    assert!(qtds[1].1.int_on_complete);
}

// ----------------------------------------------------------------------
// Close and reclamation
// ----------------------------------------------------------------------

#[test]
fn test_periodic_close_keeps_back_link() {
    let mut hcd = hcd_with_device();
    let pipe = open_interrupt(&mut hcd, 1, 4);
    let removed = qh_ref(pipe);

    hcd.close(pipe).unwrap();
    assert_eq!(hcd.bucket_next[0], Link::Terminate);
    assert!(!hcd.controller().walk_frame(1).contains(&removed));
    assert_eq!(
        hcd.dma.decode_link(hcd.dma.horizontal_link(removed)),
        Some(Link::Qh(QhRef::Bucket(0)))
    );
    assert_eq!(qh(&hcd, pipe).state, QhState::Removing);
    assert_eq!(hcd.submit(pipe, 0x2000_0000, 8, true), Err(UsbError::Busy));
    assert_eq!(hcd.close(pipe), Err(UsbError::Busy));

    hcd.controller().advance_frames(31);
    assert!(service(&mut hcd, UsbStatus::empty()).is_empty());
    hcd.controller().advance_frames(1);
    let events = service(&mut hcd, UsbStatus::empty());
    assert_eq!(events, vec![HcdEvent::PipeReclaimed { pipe }]);

    assert_eq!(hcd.close(pipe), Err(UsbError::NotFound));
    assert_eq!(hcd.qhs.find_free(1), Some(pipe.index));
}

#[test]
fn test_async_close_waits_for_doorbell() {
    let mut hcd = hcd_with_device();
    let first = open_bulk(&mut hcd, 0x02);
    let second = open_bulk(&mut hcd, 0x81);

    hcd.close(second).unwrap();
    assert_eq!(hcd.controller().doorbells_rung, 1);
    assert_eq!(hcd.controller().walk_async(), vec![qh_ref(first)]);
    // The spliced-out queue head still leads back into the ring
    assert_eq!(
        hcd.dma.decode_link(hcd.dma.horizontal_link(qh_ref(second))),
        Some(Link::Qh(qh_ref(first)))
    );
    assert_eq!(hcd.submit(second, 0x2000_0000, 8, true), Err(UsbError::Busy));

    // Time alone does not release an async queue head
    hcd.controller().advance_frames(50);
    assert!(service(&mut hcd, UsbStatus::empty()).is_empty());

    let status = hcd.controller_mut().answer_doorbell();
    let events = service(&mut hcd, status);
    assert_eq!(events, vec![HcdEvent::PipeReclaimed { pipe: second }]);
    assert_eq!(
        hcd.submit(second, 0x2000_0000, 8, true),
        Err(UsbError::InvalidPipe)
    );
}

#[test]
fn test_reopened_slot_rejects_old_handle() {
    let mut hcd = hcd_with_device();
    let old = open_bulk(&mut hcd, 0x02);
    hcd.close(old).unwrap();
    let status = hcd.controller_mut().answer_doorbell();
    assert_eq!(service(&mut hcd, status), vec![HcdEvent::PipeReclaimed { pipe: old }]);

    let new = open_bulk(&mut hcd, 0x81);
    assert_eq!(new.index, old.index);
    assert_eq!(new.xfer_type, old.xfer_type);
    assert_ne!(new, old);

    assert_eq!(
        hcd.submit(old, 0x2000_0000, 64, true),
        Err(UsbError::InvalidPipe)
    );
    assert_eq!(hcd.close(old), Err(UsbError::NotFound));
    assert_eq!(hcd.pending_bytes(old), Err(UsbError::InvalidPipe));
    hcd.submit(new, 0x2000_0000, 64, true).unwrap();
}

#[test]
fn test_doorbell_batching() {
    let mut hcd = hcd_with_device();
    let a = open_bulk(&mut hcd, 0x02);
    let b = open_bulk(&mut hcd, 0x81);

    hcd.close(a).unwrap();
    hcd.close(b).unwrap();
    assert_eq!(hcd.controller().doorbells_rung, 1);
    assert!(hcd.controller().walk_async().is_empty());

    let status = hcd.controller_mut().answer_doorbell();
    assert_eq!(service(&mut hcd, status), vec![HcdEvent::PipeReclaimed { pipe: a }]);
    assert_eq!(hcd.controller().doorbells_rung, 2);
    assert_eq!(qh(&hcd, b).state, QhState::Removing);

    let status = hcd.controller_mut().answer_doorbell();
    assert_eq!(service(&mut hcd, status), vec![HcdEvent::PipeReclaimed { pipe: b }]);
}

#[test]
fn test_inflight_work_finishes_before_release() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x81);
    hcd.submit(pipe, 0x3000_0000, 512, true).unwrap();
    hcd.close(pipe).unwrap();

    hcd.controller().drain(qh_ref(pipe));
    let status = hcd.controller_mut().answer_doorbell();
    let events = service(&mut hcd, status);
    assert_eq!(
        events,
        vec![
            success(pipe, ClassCode::MASS_STORAGE, 512),
            HcdEvent::PipeReclaimed { pipe },
        ]
    );
}

#[test]
fn test_release_aborts_pending_notification() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x81);
    hcd.submit(pipe, 0x3000_0000, 512, true).unwrap();
    hcd.close(pipe).unwrap();

    let status = hcd.controller_mut().answer_doorbell();
    let events = service(&mut hcd, status);
    assert_eq!(
        events,
        vec![
            fault(pipe, ClassCode::MASS_STORAGE, 0, TransferError::Aborted),
            HcdEvent::PipeReclaimed { pipe },
        ]
    );
    assert_eq!(hcd.qtds.free_count(), QTD_POOL_SIZE);
}

#[test]
fn test_halted_controller_releases_immediately() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x81);
    hcd.controller_mut().running = false;

    hcd.close(pipe).unwrap();
    assert_eq!(hcd.controller().doorbells_rung, 0);
    let mut events = Vec::new();
    hcd.poll_reclamation(&mut |e| events.push(e));
    assert_eq!(events, vec![HcdEvent::PipeReclaimed { pipe }]);
}

#[test]
fn test_reclaim_timeout_parks_slot() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x81);
    hcd.close(pipe).unwrap();

    hcd.controller().advance_frames(99);
    assert!(service(&mut hcd, UsbStatus::empty()).is_empty());
    hcd.controller().advance_frames(1);
    let events = service(&mut hcd, UsbStatus::empty());
    assert_eq!(events, vec![HcdEvent::ReclaimTimedOut { pipe }]);

    assert_eq!(qh(&hcd, pipe).state, QhState::Stuck);
    assert_eq!(hcd.close(pipe), Err(UsbError::Busy));
    assert_ne!(hcd.qhs.find_free(1), Some(pipe.index));

    // A fresh close rings a new doorbell
    let other = open_bulk(&mut hcd, 0x82);
    hcd.close(other).unwrap();
    assert_eq!(hcd.controller().doorbells_rung, 2);
}

#[test]
fn test_reclaim_timeout_aborts_pending_notification() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x81);
    hcd.submit(pipe, 0x3000_0000, 512, true).unwrap();
    hcd.close(pipe).unwrap();

    hcd.controller().advance_frames(100);
    let events = service(&mut hcd, UsbStatus::empty());
    assert_eq!(
        events,
        vec![
            fault(pipe, ClassCode::MASS_STORAGE, 0, TransferError::Aborted),
            HcdEvent::ReclaimTimedOut { pipe },
        ]
    );

    // The qTD stays pinned and is never reported again
    assert_eq!(hcd.qtds.free_count(), QTD_POOL_SIZE - 1);
    hcd.controller().drain(qh_ref(pipe));
    assert!(service(&mut hcd, UsbStatus::USB_INTERRUPT).is_empty());
}

#[test]
fn test_remove_device_closes_pipes() {
    let mut hcd = hcd_with_device();
    let bulk = open_bulk(&mut hcd, 0x81);
    let int = open_interrupt(&mut hcd, 1, 4);

    hcd.remove_device(1).unwrap();
    assert_eq!(qh(&hcd, bulk).state, QhState::Removing);
    assert_eq!(qh(&hcd, int).state, QhState::Removing);
    assert_eq!(
        hcd.open_control(1, 64),
        Err(UsbError::DeviceNotFound)
    );
    assert_eq!(hcd.remove_device(1), Err(UsbError::DeviceNotFound));
}

#[test]
fn test_close_and_wait() {
    let mut hcd = hcd_with_device();
    let int = open_interrupt(&mut hcd, 1, 4);
    let bulk = open_bulk(&mut hcd, 0x81);
    hcd.controller_mut().tick_per_read = 8;
    let hcd = spin::Mutex::new(hcd);

    let mut events = Vec::new();
    assert_eq!(close_and_wait(&hcd, int, &mut |e| events.push(e)), Ok(()));
    assert_eq!(events, vec![HcdEvent::PipeReclaimed { pipe: int }]);

    // Nobody answers the doorbell
    events.clear();
    assert_eq!(
        close_and_wait(&hcd, bulk, &mut |e| events.push(e)),
        Err(UsbError::ReclaimTimeout)
    );
    assert_eq!(events, vec![HcdEvent::ReclaimTimedOut { pipe: bulk }]);
    assert_eq!(close_and_wait(&hcd, int, &mut |_| {}), Err(UsbError::NotFound));
}

#[test]
fn test_close_and_wait_reads_doorbell_itself() {
    let mut hcd = hcd_with_device();
    let bulk = open_bulk(&mut hcd, 0x81);
    hcd.controller_mut().auto_answer = true;
    let hcd = spin::Mutex::new(hcd);

    let mut events = Vec::new();
    assert_eq!(close_and_wait(&hcd, bulk, &mut |e| events.push(e)), Ok(()));
    assert_eq!(events, vec![HcdEvent::PipeReclaimed { pipe: bulk }]);
}

#[test]
fn test_try_poll_defers_while_locked() {
    let mut hcd = hcd_with_device();
    let pipe = open_bulk(&mut hcd, 0x81);
    hcd.submit(pipe, 0x3000_0000, 512, true).unwrap();
    hcd.controller().drain(qh_ref(pipe));
    hcd.controller_mut().latched = UsbStatus::USB_INTERRUPT;
    let hcd = spin::Mutex::new(hcd);

    let mut events = Vec::new();
    {
        let _producer = hcd.lock();
        assert!(!try_poll(&hcd, &mut |e| events.push(e)));
    }
    assert!(events.is_empty());
    assert_eq!(hcd.lock().controller().latched, UsbStatus::USB_INTERRUPT);

    assert!(try_poll(&hcd, &mut |e| events.push(e)));
    assert_eq!(events, vec![success(pipe, ClassCode::MASS_STORAGE, 512)]);
}
