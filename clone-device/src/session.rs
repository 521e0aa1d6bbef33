// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Capture/output device pair setup
//!
//! Setup order matters: the capture format is negotiated first, and the
//! output device must then accept exactly what the capture driver
//! confirmed, including its stride and image size. Only then are the pools
//! created and streaming started.

use log::{info, warn};
use video_device::{
    BufferAllocator, BufferDevice, CaptureDeviceMmap, Direction, Error, FormatMismatch,
    Negotiation, OutputDeviceDmabuf, OutputDeviceMmap, PixFormat, Result, VideoDriver,
    negotiate_format,
};

use crate::config::CloneConfig;
use crate::shutdown::ShutdownToken;
use crate::transport::{FrameRenderer, Transport, TransportStats};

/// Backing memory of the output queue.
pub enum OutputKind {
    /// Driver-allocated buffers.
    Mmap,
    /// Buffers from `allocator`, shared with the driver by descriptor.
    Dmabuf(Box<dyn BufferAllocator>),
}

/// Result of [`Session::setup`].
pub enum SessionSetup {
    /// Both devices are streaming.
    Ready(Session),
    /// A device answered with a format the pair cannot use.
    FormatRejected {
        direction: Direction,
        mismatch: FormatMismatch,
    },
}

/// A streaming capture/output pair sharing one negotiated format.
pub struct Session {
    capture: Box<dyn BufferDevice>,
    output: Box<dyn BufferDevice>,
    format: PixFormat,
    report_interval: u64,
}

fn describe<D: VideoDriver + ?Sized>(driver: &D, direction: Direction) -> Result<()> {
    let cap = driver
        .query_capability()
        .map_err(Error::QueryCapability)?;
    info!(
        "{direction:?} device: {} ({}, {}), capabilities {:?}",
        cap.card,
        cap.driver,
        cap.bus_info,
        cap.node_caps()
    );
    if !cap.supports(direction) {
        warn!("{} does not advertise {direction:?} streaming", cap.card);
    }
    Ok(())
}

impl Session {
    /// Negotiate formats, create both buffer pools and start streaming.
    pub fn setup<C, O>(
        capture_driver: C,
        output_driver: O,
        output_kind: OutputKind,
        config: &CloneConfig,
    ) -> Result<SessionSetup>
    where
        C: VideoDriver + 'static,
        O: VideoDriver + 'static,
    {
        describe(&capture_driver, Direction::Capture)?;
        describe(&output_driver, Direction::Output)?;

        let format = match negotiate_format(
            &capture_driver,
            Direction::Capture,
            &config.requested_format(),
        )? {
            Negotiation::Accepted(format) => format,
            Negotiation::Rejected(mismatch) => {
                return Ok(SessionSetup::FormatRejected {
                    direction: Direction::Capture,
                    mismatch,
                });
            }
        };

        let output_format = match negotiate_format(&output_driver, Direction::Output, &format)? {
            Negotiation::Accepted(format) => format,
            Negotiation::Rejected(mismatch) => {
                return Ok(SessionSetup::FormatRejected {
                    direction: Direction::Output,
                    mismatch,
                });
            }
        };
        if let Some(mismatch) = format.mismatch(&output_format, true) {
            warn!("Capture and output formats differ: {mismatch}");
            return Ok(SessionSetup::FormatRejected {
                direction: Direction::Output,
                mismatch,
            });
        }

        let mut capture: Box<dyn BufferDevice> = if config.export_capture {
            Box::new(CaptureDeviceMmap::with_export(capture_driver))
        } else {
            Box::new(CaptureDeviceMmap::new(capture_driver))
        };
        capture.initialize(config.buffers)?;
        capture.start()?;

        let mut output: Box<dyn BufferDevice> = match output_kind {
            OutputKind::Mmap => Box::new(OutputDeviceMmap::new(output_driver)),
            OutputKind::Dmabuf(allocator) => {
                Box::new(OutputDeviceDmabuf::new(output_driver, allocator))
            }
        };
        if let Err(e) = output
            .initialize(config.buffers)
            .and_then(|_| output.start())
        {
            if let Err(stop) = capture.stop() {
                warn!("Failed to stop capture device: {stop}");
            }
            return Err(e);
        }

        Ok(SessionSetup::Ready(Session {
            capture,
            output,
            format,
            report_interval: config.report_interval,
        }))
    }

    /// Format shared by both devices.
    pub fn format(&self) -> PixFormat {
        self.format
    }

    pub fn capture_buffers(&self) -> usize {
        self.capture.buffer_count()
    }

    pub fn output_buffers(&self) -> usize {
        self.output.buffer_count()
    }

    /// Relay frames until `token` is cancelled or a device stops.
    pub fn run(
        &mut self,
        token: &ShutdownToken,
        renderer: Option<&mut dyn FrameRenderer>,
    ) -> Result<TransportStats> {
        let mut transport = Transport::new(&mut *self.capture, &mut *self.output, self.format)
            .with_report_interval(self.report_interval);
        if let Some(renderer) = renderer {
            transport = transport.with_renderer(renderer);
        }
        transport.run(token)
    }

    /// Stop streaming on both devices. Both are stopped even if the first
    /// one fails, and the first failure is returned.
    pub fn shutdown(mut self) -> Result<()> {
        let capture = self.capture.stop();
        let output = self.output.stop();
        capture.and(output)
    }
}
