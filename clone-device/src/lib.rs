// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! V4L2 clone device
//!
//! Relays every frame of a capture device (a webcam, a loopback node) into
//! an output device, typically a v4l2loopback node other applications read
//! from.
//!
//! ```text
//!   /dev/video0 ──DQBUF──▶ ┌───────────┐ ──QBUF──▶ /dev/video2
//!   (capture, MMAP)        │ Transport │           (output, MMAP or DMABUF)
//!              ◀──QBUF──── └─────┬─────┘ ◀──DQBUF──
//!                                │
//!                                ▼
//!                         FrameRenderer (optional preview)
//! ```

pub mod config;
pub mod session;
pub mod shutdown;
pub mod transport;

pub use config::{CloneConfig, ConfigError};
pub use session::{OutputKind, Session, SessionSetup};
pub use shutdown::{ShutdownToken, install_interrupt_handler};
pub use transport::{
    FrameRenderer, Step, StopReason, Transport, TransportStats, VideoFrame, copy_frame,
};
