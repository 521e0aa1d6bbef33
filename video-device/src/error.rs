// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types for buffer device operations.

use std::io;
use std::path::PathBuf;

/// Result type for buffer device operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Buffer device error types.
///
/// Every variant is fatal for the device that produced it: it means either
/// the driver rejected a request the setup depends on, or the caller broke
/// the queue/dequeue contract. Transient conditions (`EINTR`, `EAGAIN` on
/// dequeue) are retried internally and never show up here. Format
/// mismatches are reported through [`Negotiation`](crate::Negotiation), not
/// through this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening a device node failed.
    #[error("Failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `VIDIOC_QUERYCAP` failed.
    #[error("ioctl(VIDIOC_QUERYCAP) failed: {0}")]
    QueryCapability(#[source] io::Error),

    /// `VIDIOC_S_FMT` failed.
    #[error("ioctl(VIDIOC_S_FMT) failed: {0}")]
    SetFormat(#[source] io::Error),

    /// The driver negotiated an interlaced field order.
    #[error("Interlaced field order is not supported")]
    InterlacedUnsupported,

    /// `VIDIOC_REQBUFS` failed.
    #[error("ioctl(VIDIOC_REQBUFS) failed: {0}")]
    RequestBuffers(#[source] io::Error),

    /// The driver accepted the pool request but granted no buffers.
    #[error("Driver granted no buffers (requested {requested})")]
    NoBuffersGranted { requested: u32 },

    /// `VIDIOC_QUERYBUF` failed.
    #[error("ioctl(VIDIOC_QUERYBUF) failed for buffer {index}: {source}")]
    QueryBuffer {
        index: u32,
        #[source]
        source: io::Error,
    },

    /// `VIDIOC_EXPBUF` failed.
    #[error("ioctl(VIDIOC_EXPBUF) failed for buffer {index}: {source}")]
    ExportBuffer {
        index: u32,
        #[source]
        source: io::Error,
    },

    /// Mapping buffer memory into the process failed.
    #[error("Failed to map buffer {index}: {source}")]
    Map {
        index: u32,
        #[source]
        source: io::Error,
    },

    /// `VIDIOC_QBUF` failed.
    #[error("ioctl(VIDIOC_QBUF) failed for buffer {index}: {source}")]
    QueueBuffer {
        index: u32,
        #[source]
        source: io::Error,
    },

    /// `VIDIOC_DQBUF` failed with a non-transient error.
    #[error("ioctl(VIDIOC_DQBUF) failed: {0}")]
    DequeueBuffer(#[source] io::Error),

    /// `VIDIOC_STREAMON` failed.
    #[error("ioctl(VIDIOC_STREAMON) failed: {0}")]
    StreamOn(#[source] io::Error),

    /// `VIDIOC_STREAMOFF` failed.
    #[error("ioctl(VIDIOC_STREAMOFF) failed: {0}")]
    StreamOff(#[source] io::Error),

    /// `poll(2)` on the device failed.
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    /// A buffer index outside the granted pool.
    #[error("Buffer index {index} is outside the pool of {count} buffers")]
    InvalidIndex { index: u32, count: u32 },

    /// A buffer was handed back that is not currently held by user space.
    #[error("Buffer {0} is not dequeued")]
    NotDequeued(u32),

    /// The driver returned a buffer that user space already holds.
    #[error("Buffer {0} is already dequeued")]
    AlreadyDequeued(u32),

    /// A shareable-memory handle was mapped while its previous mapping is live.
    #[error("Buffer {0} already has a live mapping")]
    AlreadyMapped(u32),

    /// The output buffer cannot hold the capture payload.
    #[error("Output buffer too small: need {needed} bytes, capacity {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// A graphics-subsystem request failed.
    #[error("{op} failed: {source}")]
    Drm {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// An allocation request the allocator cannot serve.
    #[error("Invalid allocation size {0}")]
    InvalidAllocation(usize),
}
