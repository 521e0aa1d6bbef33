// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buffer lifecycle core for V4L2 capture/output device pairs
//!
//! ```text
//!                 ┌──────────────────────────┐
//!                 │   BufferDevice (trait)   │
//!                 └────────────┬─────────────┘
//!          ┌───────────────────┼────────────────────┐
//!          ▼                   ▼                    ▼
//!   CaptureDeviceMmap    OutputDeviceMmap    OutputDeviceDmabuf
//!          │                   │                    │
//!          └─────────┬─────────┘                    │ BufferAllocator
//!                    ▼                              ▼ (I915Allocator)
//!               BufferPool ◀──────────────────── DmaBuf
//!                    │
//!                    ▼
//!            VideoDriver (trait) ── V4l2Driver (ioctls on /dev/videoN)
//! ```
//!
//! Buffer memory belongs to the kernel driver. A [`DeviceBuffer`] returned
//! by [`BufferDevice::dequeue`] is a lease on one slot: it carries the CPU
//! view of the memory and must be handed back with
//! [`BufferDevice::enqueue`], which consumes it.

mod bindings;
mod capture_mmap;
mod device;
mod dmabuf;
mod driver;
mod error;
mod format;
mod output_dmabuf;
mod output_mmap;
mod pool;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use capture_mmap::CaptureDeviceMmap;
pub use device::BufferDevice;
pub use dmabuf::{BufferAllocator, DEFAULT_RENDER_NODE, DmaBuf, I915Allocator};
pub use driver::{
    BufferFlags, BufferQuery, Capabilities, DequeuedInfo, DeviceCapability, Direction, Memory,
    QueueRequest, Readiness, V4l2Driver, VideoDriver,
};
pub use error::{Error, Result};
pub use format::{Field, FormatMismatch, FourCc, Negotiation, PixFormat, negotiate_format};
pub use output_dmabuf::OutputDeviceDmabuf;
pub use output_mmap::OutputDeviceMmap;
pub use pool::{BufferPool, DeviceBuffer, Reclaimed, SlotState};
