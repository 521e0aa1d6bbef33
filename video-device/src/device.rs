// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The buffer device contract
//!
//! ```text
//!   initialize(n) ─▶ start() ─▶ ┌─▶ wait_ready() ─▶ dequeue() ─┐
//!                               │                               │
//!                               └──────── enqueue(buffer) ◀─────┘
//!                                              │
//!                                          stop()
//! ```
//!
//! The three variants (capture over MMAP, output over MMAP, output over
//! DMABUF) differ only in how slot memory is obtained and when it is mapped.
//! The helpers below hold what they share.

use std::io;

use log::{info, trace};

use crate::driver::{Direction, DequeuedInfo, Memory, QueueRequest, Readiness, VideoDriver};
use crate::pool::DeviceBuffer;
use crate::{Error, Result};

/// A video queue that lends its buffers to user space one at a time.
pub trait BufferDevice: Send {
    fn direction(&self) -> Direction;

    fn memory(&self) -> Memory;

    /// Number of slots granted by the last [`initialize`](Self::initialize).
    fn buffer_count(&self) -> usize;

    /// Request `requested` buffers and set up every granted slot.
    ///
    /// Returns the number granted, which may be lower than requested.
    fn initialize(&mut self, requested: u32) -> Result<u32>;

    /// Queue the idle slots and start streaming.
    fn start(&mut self) -> Result<()>;

    /// Stop streaming. The driver drops every queued buffer.
    fn stop(&mut self) -> Result<()>;

    /// Take the next completed buffer. Blocks until one is available.
    fn dequeue(&mut self) -> Result<DeviceBuffer>;

    /// Hand `buffer` back to the driver.
    fn enqueue(&mut self, buffer: DeviceBuffer) -> Result<()>;

    /// Block until a buffer can be dequeued or the stream ends.
    fn wait_ready(&mut self) -> Result<Readiness>;
}

/// `VIDIOC_REQBUFS`, refusing an empty grant.
pub(crate) fn request_pool<D: VideoDriver + ?Sized>(
    driver: &D,
    direction: Direction,
    memory: Memory,
    requested: u32,
) -> Result<u32> {
    let granted = driver
        .request_buffers(direction, memory, requested)
        .map_err(Error::RequestBuffers)?;
    info!("Required buffers {requested}, created buffers {granted}");
    if granted == 0 {
        return Err(Error::NoBuffersGranted { requested });
    }
    Ok(granted)
}

/// `VIDIOC_DQBUF`, retried while the driver reports a transient condition.
pub(crate) fn dequeue_retrying<D: VideoDriver + ?Sized>(
    driver: &D,
    direction: Direction,
    memory: Memory,
) -> Result<DequeuedInfo> {
    loop {
        match driver.dequeue_buffer(direction, memory) {
            Ok(info) => return Ok(info),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                trace!("VIDIOC_DQBUF {direction:?}: {e}, retrying");
            }
            Err(e) => return Err(Error::DequeueBuffer(e)),
        }
    }
}

pub(crate) fn queue<D: VideoDriver + ?Sized>(driver: &D, request: &QueueRequest) -> Result<()> {
    driver
        .queue_buffer(request)
        .map_err(|source| Error::QueueBuffer {
            index: request.index,
            source,
        })
}

pub(crate) fn stream_on<D: VideoDriver + ?Sized>(driver: &D, direction: Direction) -> Result<()> {
    driver.stream_on(direction).map_err(Error::StreamOn)?;
    info!("Started {direction:?} streaming");
    Ok(())
}

pub(crate) fn stream_off<D: VideoDriver + ?Sized>(driver: &D, direction: Direction) -> Result<()> {
    driver.stream_off(direction).map_err(Error::StreamOff)?;
    info!("Stopped {direction:?} streaming");
    Ok(())
}

pub(crate) fn poll<D: VideoDriver + ?Sized>(driver: &D, direction: Direction) -> Result<Readiness> {
    driver.poll(direction).map_err(Error::Poll)
}
