// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for v4l2-clone-device
//!
//! These drive the full capture → output pipeline against scripted,
//! memfd-backed drivers:
//! - Session setup (format negotiation, pool creation, streaming)
//! - Frame relay over MMAP and DMABUF output queues
//! - Buffer ownership rules across enqueue/dequeue

use v4l2_clone_device::{
    CloneConfig, OutputKind, Session, SessionSetup, ShutdownToken, StopReason,
};
use video_device::testing::{DEFAULT_BUFFER_LENGTH, FakeDriver, MemfdAllocator};
use video_device::{
    BufferDevice, CaptureDeviceMmap, Direction, Error, Field, FormatMismatch, FourCc,
    OutputDeviceDmabuf, Readiness,
};

fn config() -> CloneConfig {
    CloneConfig::default()
}

fn ready(setup: SessionSetup) -> Session {
    match setup {
        SessionSetup::Ready(session) => session,
        SessionSetup::FormatRejected {
            direction,
            mismatch,
        } => panic!("{direction:?} rejected the format: {mismatch}"),
    }
}

/// Let exactly `frames` frames through, then report the capture side as
/// stopped.
fn stop_capture_after(driver: &FakeDriver, frames: usize) {
    let mut script = vec![Readiness::Ready; frames];
    script.push(Readiness::Stopped);
    driver.script_poll(&script);
}

// ============================================================================
// Session Setup Tests
// ============================================================================

#[test]
fn test_setup_negotiates_and_starts_both_devices() {
    let capture = FakeDriver::builder().build();
    let output = FakeDriver::builder().build();

    let session = ready(
        Session::setup(capture.clone(), output.clone(), OutputKind::Mmap, &config()).unwrap(),
    );

    let format = session.format();
    assert_eq!(format.fourcc, FourCc::YUYV);
    assert_eq!((format.width, format.height), (640, 360));
    assert_eq!(format.bytes_per_line, 1280);
    assert_eq!(format.size_image, 460_800);
    assert_eq!(output.current_format(), Some(format));

    assert_eq!(session.capture_buffers(), 10);
    assert_eq!(session.output_buffers(), 10);
    assert!(capture.is_streaming(Direction::Capture));
    assert!(output.is_streaming(Direction::Output));
    assert_eq!(capture.queued_count(), 10);
    assert_eq!(output.queued_count(), 10);

    session.shutdown().unwrap();
    assert!(!capture.is_streaming(Direction::Capture));
    assert!(!output.is_streaming(Direction::Output));
}

#[test]
fn test_setup_with_fewer_buffers_granted() {
    let capture = FakeDriver::builder().grant(4).build();
    let output = FakeDriver::builder().grant(3).build();

    let session = ready(
        Session::setup(capture.clone(), output.clone(), OutputKind::Mmap, &config()).unwrap(),
    );

    assert_eq!(session.capture_buffers(), 4);
    assert_eq!(session.output_buffers(), 3);
    let indices: Vec<u32> = capture.queued_log().iter().map(|q| q.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    let indices: Vec<u32> = output.queued_log().iter().map(|q| q.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    session.shutdown().unwrap();
}

#[test]
fn test_stride_accepted_for_capture_rejected_for_output() {
    let capture = FakeDriver::builder().stride_padding(64).build();
    let output = FakeDriver::builder().stride_padding(128).build();

    let setup = Session::setup(capture.clone(), output, OutputKind::Mmap, &config()).unwrap();
    match setup {
        SessionSetup::FormatRejected {
            direction,
            mismatch,
        } => {
            assert_eq!(direction, Direction::Output);
            assert_eq!(
                mismatch,
                FormatMismatch::BytesPerLine {
                    requested: 1344,
                    accepted: 1408,
                }
            );
        }
        SessionSetup::Ready(_) => panic!("output stride mismatch was accepted"),
    }
    assert_eq!(capture.current_format().unwrap().bytes_per_line, 1344);
    assert!(!capture.is_streaming(Direction::Capture));
}

#[test]
fn test_capture_encoding_mismatch_is_soft() {
    let capture = FakeDriver::builder().accepted_fourcc(FourCc::MJPG).build();
    let output = FakeDriver::builder().build();

    let setup = Session::setup(capture, output.clone(), OutputKind::Mmap, &config()).unwrap();
    assert!(matches!(
        setup,
        SessionSetup::FormatRejected {
            direction: Direction::Capture,
            mismatch: FormatMismatch::PixelFormat { .. },
        }
    ));
    assert_eq!(output.current_format(), None);
}

#[test]
fn test_interlaced_capture_is_fatal() {
    let capture = FakeDriver::builder().field(Field::Interlaced).build();
    let output = FakeDriver::builder().build();

    let result = Session::setup(capture, output, OutputKind::Mmap, &config());
    assert!(matches!(result, Err(Error::InterlacedUnsupported)));
}

#[test]
fn test_rejected_pool_request_is_fatal() {
    let capture = FakeDriver::builder().build();
    let output = FakeDriver::builder().grant(0).build();

    let result = Session::setup(capture.clone(), output, OutputKind::Mmap, &config());
    assert!(matches!(
        result,
        Err(Error::NoBuffersGranted { requested: 10 })
    ));
    assert!(!capture.is_streaming(Direction::Capture));
}

// ============================================================================
// Frame Relay Tests
// ============================================================================

#[test]
fn test_one_frame_end_to_end() {
    let capture = FakeDriver::builder().build();
    let output = FakeDriver::builder().build();
    let mut session = ready(
        Session::setup(capture.clone(), output.clone(), OutputKind::Mmap, &config()).unwrap(),
    );
    // Slot 0 is the first one the capture driver hands back.
    let frame: Vec<u8> = (0..DEFAULT_BUFFER_LENGTH).map(|i| (i % 251) as u8).collect();
    capture.write_slot(0, &frame).unwrap();
    stop_capture_after(&capture, 1);

    let stats = session.run(&ShutdownToken::new(), None).unwrap();
    assert_eq!(stats.frames, 1);
    assert_eq!(stats.stop_reason, StopReason::CaptureStopped);

    let relayed = *output.queued_log().last().unwrap();
    assert_eq!(relayed.bytes_used as usize, DEFAULT_BUFFER_LENGTH);
    assert_eq!(output.slot_contents(relayed.index), frame);

    // Both buffers went back to their queues.
    assert_eq!(capture.queued_count(), 10);
    assert_eq!(output.queued_count(), 10);
    session.shutdown().unwrap();
}

#[test]
fn test_interrupted_dequeue_is_retried() {
    let capture = FakeDriver::builder().capture_pattern(0x5a).build();
    let output = FakeDriver::builder().build();

    let mut session = ready(
        Session::setup(capture.clone(), output.clone(), OutputKind::Mmap, &config()).unwrap(),
    );
    capture.script_dequeue_errors(&[libc::EINTR]);
    output.script_dequeue_errors(&[libc::EAGAIN, libc::EINTR]);
    stop_capture_after(&capture, 1);

    let stats = session.run(&ShutdownToken::new(), None).unwrap();
    assert_eq!(stats.frames, 1);
    let relayed = *output.queued_log().last().unwrap();
    assert!(output.slot_contents(relayed.index).iter().all(|&b| b == 0x5a));
    session.shutdown().unwrap();
}

#[test]
fn test_export_capture_relays_frames() {
    let capture = FakeDriver::builder().capture_pattern(0x33).build();
    let output = FakeDriver::builder().build();
    let config = CloneConfig {
        export_capture: true,
        buffers: 4,
        ..config()
    };

    let mut session =
        ready(Session::setup(capture.clone(), output.clone(), OutputKind::Mmap, &config).unwrap());
    stop_capture_after(&capture, 5);

    let stats = session.run(&ShutdownToken::new(), None).unwrap();
    assert_eq!(stats.frames, 5);
    assert_eq!(capture.export_count(), 5);
    session.shutdown().unwrap();
}

#[test]
fn test_cancelled_token_relays_nothing() {
    let capture = FakeDriver::builder().build();
    let output = FakeDriver::builder().build();
    let mut session = ready(
        Session::setup(capture.clone(), output.clone(), OutputKind::Mmap, &config()).unwrap(),
    );
    let token = ShutdownToken::new();
    token.cancel();

    let stats = session.run(&token, None).unwrap();
    assert_eq!(stats.frames, 0);
    assert_eq!(stats.stop_reason, StopReason::Shutdown);
    assert_eq!(output.queued_log().len(), 10);
    session.shutdown().unwrap();
}

// ============================================================================
// DMABUF Output Tests
// ============================================================================

#[test]
fn test_dmabuf_output_end_to_end() {
    let capture = FakeDriver::builder().capture_pattern(0xc3).build();
    let output = FakeDriver::builder().build();
    let allocator = MemfdAllocator::default();

    let mut session = ready(
        Session::setup(
            capture.clone(),
            output.clone(),
            OutputKind::Dmabuf(Box::new(allocator.clone())),
            &config(),
        )
        .unwrap(),
    );
    assert_eq!(allocator.allocations(), 10);
    stop_capture_after(&capture, 3);

    let stats = session.run(&ShutdownToken::new(), None).unwrap();
    assert_eq!(stats.frames, 3);

    let log = output.queued_log();
    assert_eq!(log.len(), 13);
    assert!(log.iter().all(|q| q.dmabuf_fd.is_some()));
    assert!(log[..10].iter().all(|q| q.bytes_used == 0));
    assert!(
        log[10..]
            .iter()
            .all(|q| q.bytes_used as usize == DEFAULT_BUFFER_LENGTH)
    );
    session.shutdown().unwrap();
}

#[test]
fn test_dmabuf_mapping_released_on_enqueue() {
    let driver = FakeDriver::builder().build();
    let mut output = OutputDeviceDmabuf::new(driver.clone(), MemfdAllocator::default());
    output.initialize(2).unwrap();
    output.start().unwrap();

    let buffer = output.dequeue().unwrap();
    let index = buffer.index();
    assert!(output.is_mapped(index));

    driver.force_next_dequeue(index);
    assert!(matches!(output.dequeue(), Err(Error::AlreadyMapped(i)) if i == index));

    output.enqueue(buffer).unwrap();
    assert!(!output.is_mapped(index));
}

// ============================================================================
// Buffer Ownership Tests
// ============================================================================

#[test]
fn test_stale_buffer_enqueue_is_rejected() {
    let driver = FakeDriver::builder().build();
    let mut capture = CaptureDeviceMmap::new(driver);
    capture.initialize(2).unwrap();
    capture.start().unwrap();
    let stale = capture.dequeue().unwrap();
    assert_eq!(stale.index(), 0);

    // A fresh pool queues slot 0 again while the old lease is still out.
    capture.stop().unwrap();
    capture.initialize(2).unwrap();
    capture.start().unwrap();

    assert!(matches!(capture.enqueue(stale), Err(Error::NotDequeued(0))));
}

#[test]
fn test_open_missing_device() {
    let err = video_device::V4l2Driver::open("/nonexistent/video42").unwrap_err();
    assert!(matches!(err, Error::Open { .. }));
    assert!(err.to_string().starts_with("Failed to open /nonexistent/video42"));
}
