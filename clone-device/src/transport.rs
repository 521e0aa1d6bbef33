// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Frame transport loop
//!
//! One iteration moves one frame:
//!
//! ```text
//!   capture: wait_ready ─▶ dequeue ─────────────────────────────┐
//!                                                               │ copy
//!   output:  wait_ready ─▶ dequeue ◀────────────────────────────┘
//!                            │
//!                            ├─▶ enqueue(output, bytes_used = capture.len())
//!                            ├─▶ render(capture)            (optional)
//!                            └─▶ enqueue(capture)
//! ```
//!
//! The shutdown token is checked before each wait. Signals that interrupt a
//! wait only cause the token to be checked again.

use log::{debug, info};
use video_device::{
    BufferDevice, DeviceBuffer, Direction, Error, FourCc, PixFormat, Readiness, Result,
};

use crate::shutdown::ShutdownToken;

/// A captured frame handed to a [`FrameRenderer`].
#[derive(Debug, Clone, Copy)]
pub struct VideoFrame<'a> {
    pub fourcc: FourCc,
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes.
    pub stride: u32,
    pub data: &'a [u8],
}

/// Consumer of captured frames, e.g. an on-screen preview.
pub trait FrameRenderer {
    fn render(&mut self, frame: &VideoFrame<'_>);
}

/// Why the transport loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown token was cancelled.
    Shutdown,
    /// The capture device stopped producing frames.
    CaptureStopped,
    /// The output device stopped accepting frames.
    OutputStopped,
}

/// Outcome of one [`Transport::run_iteration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Relayed,
    Stopped(StopReason),
}

/// Summary of a completed [`Transport::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    pub frames: u64,
    pub stop_reason: StopReason,
}

/// Copy the payload of `capture` into `output` and declare it as the
/// output payload.
pub fn copy_frame(capture: &DeviceBuffer, output: &mut DeviceBuffer) -> Result<()> {
    let payload = capture.data();
    let destination = output.data_mut();
    if destination.len() < payload.len() {
        return Err(Error::BufferTooSmall {
            needed: payload.len(),
            capacity: destination.len(),
        });
    }
    destination[..payload.len()].copy_from_slice(payload);
    output.set_bytes_used(payload.len())
}

/// Relays frames from a capture device to an output device.
pub struct Transport<'a> {
    capture: &'a mut dyn BufferDevice,
    output: &'a mut dyn BufferDevice,
    renderer: Option<&'a mut dyn FrameRenderer>,
    format: PixFormat,
    report_interval: u64,
    frames: u64,
}

impl<'a> Transport<'a> {
    /// `format` is the format both devices agreed on.
    pub fn new(
        capture: &'a mut dyn BufferDevice,
        output: &'a mut dyn BufferDevice,
        format: PixFormat,
    ) -> Self {
        Self {
            capture,
            output,
            renderer: None,
            format,
            report_interval: 100,
            frames: 0,
        }
    }

    pub fn with_renderer(mut self, renderer: &'a mut dyn FrameRenderer) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Log progress every `frames` frames. Zero disables it.
    pub fn with_report_interval(mut self, frames: u64) -> Self {
        self.report_interval = frames;
        self
    }

    /// Frames relayed so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Move one frame from capture to output.
    pub fn run_iteration(&mut self, token: &ShutdownToken) -> Result<Step> {
        if let Some(reason) = wait(&mut *self.capture, token)? {
            return Ok(Step::Stopped(reason));
        }
        let capture_buffer = self.capture.dequeue()?;

        let reason = match wait(&mut *self.output, token) {
            Ok(reason) => reason,
            Err(e) => {
                self.capture.enqueue(capture_buffer)?;
                return Err(e);
            }
        };
        if let Some(reason) = reason {
            self.capture.enqueue(capture_buffer)?;
            return Ok(Step::Stopped(reason));
        }
        let mut output_buffer = self.output.dequeue()?;

        copy_frame(&capture_buffer, &mut output_buffer)?;
        self.output.enqueue(output_buffer)?;

        if let Some(renderer) = self.renderer.as_deref_mut() {
            renderer.render(&VideoFrame {
                fourcc: self.format.fourcc,
                width: self.format.width,
                height: self.format.height,
                stride: self.format.bytes_per_line,
                data: capture_buffer.data(),
            });
        }

        self.capture.enqueue(capture_buffer)?;

        self.frames += 1;
        if self.report_interval > 0 && self.frames.is_multiple_of(self.report_interval) {
            info!("Frames {}", self.frames);
        }
        Ok(Step::Relayed)
    }

    /// Relay frames until shutdown or until either device stops.
    pub fn run(&mut self, token: &ShutdownToken) -> Result<TransportStats> {
        loop {
            if let Step::Stopped(stop_reason) = self.run_iteration(token)? {
                match stop_reason {
                    StopReason::Shutdown => info!("Shutdown requested"),
                    StopReason::CaptureStopped => info!("Capture device stopped!"),
                    StopReason::OutputStopped => info!("Output device stopped!"),
                }
                return Ok(TransportStats {
                    frames: self.frames,
                    stop_reason,
                });
            }
        }
    }
}

/// Wait until `device` can be dequeued. `Some` means the loop must end.
fn wait(
    device: &mut dyn BufferDevice,
    token: &ShutdownToken,
) -> Result<Option<StopReason>> {
    loop {
        if token.is_cancelled() {
            return Ok(Some(StopReason::Shutdown));
        }
        match device.wait_ready()? {
            Readiness::Ready => return Ok(None),
            Readiness::Stopped => {
                return Ok(Some(match device.direction() {
                    Direction::Capture => StopReason::CaptureStopped,
                    Direction::Output => StopReason::OutputStopped,
                }));
            }
            Readiness::Interrupted => debug!("{:?} wait interrupted", device.direction()),
        }
    }
}
