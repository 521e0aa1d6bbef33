// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scripted test doubles
//!
//! [`FakeDriver`] behaves like a loopback video node with memfd-backed
//! buffers: queued indices come back in FIFO order, `S_FMT` answers with a
//! configurable layout, and individual dequeues or polls can be scripted to
//! fail. [`MemfdAllocator`] hands out memfds in place of GEM buffers.
//!
//! Available to unit tests and, through the `test-utils` feature, to the
//! tests of dependent crates.

use std::collections::VecDeque;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use memmap2::{MmapMut, MmapOptions};

use crate::dmabuf::{BufferAllocator, DmaBuf};
use crate::driver::{
    BufferFlags, BufferQuery, Capabilities, DeviceCapability, DequeuedInfo, Direction, Memory,
    QueueRequest, Readiness, VideoDriver,
};
use crate::format::{Field, FourCc, PixFormat};
use crate::{Error, Result};

const PAGE_SIZE: usize = 4096;

/// Bytes per pixel of the packed formats the fake lays out.
const BYTES_PER_PIXEL: u32 = 2;

/// Distance between the mapping cookies of consecutive slots.
const OFFSET_STEP: u32 = 0x0010_0000;

/// Default buffer length: one YUYV 640x360 frame.
pub const DEFAULT_BUFFER_LENGTH: usize = 640 * 360 * 2;

/// Create an anonymous memory file of `len` bytes.
pub fn memfd(name: &str, len: usize) -> io::Result<File> {
    let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `name` is a valid NUL-terminated string for the whole call.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: memfd_create just returned this descriptor and nothing else
    // owns it.
    let file = unsafe { File::from_raw_fd(fd) };
    file.set_len(len as u64)?;
    Ok(file)
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

#[derive(Debug, Clone)]
struct FakeConfig {
    card: String,
    grant: Option<u32>,
    buffer_length: usize,
    stride_padding: u32,
    accepted_fourcc: Option<FourCc>,
    max_size: Option<(u32, u32)>,
    field: Field,
    capture_pattern: Option<u8>,
    zero_length_on_dequeue: bool,
    reject_set_format: bool,
    reject_request_buffers: bool,
    reject_stream_on: bool,
    reject_map: bool,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            card: "Fake video device".to_string(),
            grant: None,
            buffer_length: DEFAULT_BUFFER_LENGTH,
            stride_padding: 0,
            accepted_fourcc: None,
            max_size: None,
            field: Field::None,
            capture_pattern: None,
            zero_length_on_dequeue: false,
            reject_set_format: false,
            reject_request_buffers: false,
            reject_stream_on: false,
            reject_map: false,
        }
    }
}

/// Builder for [`FakeDriver`].
#[derive(Debug, Default)]
pub struct FakeDriverBuilder {
    config: FakeConfig,
}

impl FakeDriverBuilder {
    pub fn card(mut self, card: &str) -> Self {
        self.config.card = card.to_string();
        self
    }

    /// Grant at most `count` buffers regardless of the request.
    pub fn grant(mut self, count: u32) -> Self {
        self.config.grant = Some(count);
        self
    }

    /// Length reported for every buffer.
    pub fn buffer_length(mut self, length: usize) -> Self {
        self.config.buffer_length = length;
        self
    }

    /// Pad every row by `padding` bytes beyond what the request asks for.
    pub fn stride_padding(mut self, padding: u32) -> Self {
        self.config.stride_padding = padding;
        self
    }

    /// Answer every format request with `fourcc`.
    pub fn accepted_fourcc(mut self, fourcc: FourCc) -> Self {
        self.config.accepted_fourcc = Some(fourcc);
        self
    }

    /// Clamp requested dimensions to `width`x`height`.
    pub fn max_size(mut self, width: u32, height: u32) -> Self {
        self.config.max_size = Some((width, height));
        self
    }

    /// Field order reported by `S_FMT`.
    pub fn field(mut self, field: Field) -> Self {
        self.config.field = field;
        self
    }

    /// Fill capture buffers with `byte` whenever they are dequeued.
    pub fn capture_pattern(mut self, byte: u8) -> Self {
        self.config.capture_pattern = Some(byte);
        self
    }

    /// Report a zero length on dequeue, as v4l2loopback does.
    pub fn zero_length_on_dequeue(mut self) -> Self {
        self.config.zero_length_on_dequeue = true;
        self
    }

    pub fn reject_set_format(mut self) -> Self {
        self.config.reject_set_format = true;
        self
    }

    pub fn reject_request_buffers(mut self) -> Self {
        self.config.reject_request_buffers = true;
        self
    }

    pub fn reject_stream_on(mut self) -> Self {
        self.config.reject_stream_on = true;
        self
    }

    pub fn reject_map(mut self) -> Self {
        self.config.reject_map = true;
        self
    }

    pub fn build(self) -> FakeDriver {
        FakeDriver {
            state: Arc::new(Mutex::new(FakeState {
                config: self.config,
                ..Default::default()
            })),
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    config: FakeConfig,
    format: Option<PixFormat>,
    slots: Vec<File>,
    pending: VecDeque<u32>,
    streaming: Vec<Direction>,
    queued_log: Vec<QueueRequest>,
    dequeue_errors: VecDeque<i32>,
    poll_script: VecDeque<Readiness>,
    forced_dequeue: Option<u32>,
    exports: usize,
    sequence: u32,
}

impl FakeState {
    fn slot(&self, index: u32) -> io::Result<&File> {
        self.slots
            .get(index as usize)
            .ok_or_else(|| errno(libc::EINVAL))
    }
}

/// In-memory stand-in for a V4L2 node. Clones share state, so a test can
/// keep one handle while a buffer device owns another.
#[derive(Debug, Clone)]
pub struct FakeDriver {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDriver {
    pub fn builder() -> FakeDriverBuilder {
        FakeDriverBuilder::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn buffer_length(&self) -> usize {
        self.state().config.buffer_length
    }

    /// Format accepted by the last successful `S_FMT`.
    pub fn current_format(&self) -> Option<PixFormat> {
        self.state().format
    }

    /// Every `QBUF` request so far, oldest first.
    pub fn queued_log(&self) -> Vec<QueueRequest> {
        self.state().queued_log.clone()
    }

    /// Number of buffers currently owned by the driver.
    pub fn queued_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_streaming(&self, direction: Direction) -> bool {
        self.state().streaming.contains(&direction)
    }

    pub fn export_count(&self) -> usize {
        self.state().exports
    }

    /// Current contents of slot `index`.
    pub fn slot_contents(&self, index: u32) -> Vec<u8> {
        let state = self.state();
        let mut data = vec![0u8; state.config.buffer_length];
        if let Ok(slot) = state.slot(index) {
            let _ = slot.read_exact_at(&mut data, 0);
        }
        data
    }

    /// Overwrite the start of slot `index` with `data`.
    pub fn write_slot(&self, index: u32, data: &[u8]) -> io::Result<()> {
        self.state().slot(index)?.write_all_at(data, 0)
    }

    /// Fail the next dequeues with these errno values, in order.
    pub fn script_dequeue_errors(&self, errnos: &[i32]) {
        self.state().dequeue_errors.extend(errnos);
    }

    /// Answer the next polls with these outcomes, then `Ready` again.
    pub fn script_poll(&self, outcomes: &[Readiness]) {
        self.state().poll_script.extend(outcomes);
    }

    /// Make the next dequeue return `index` whether or not it is queued.
    pub fn force_next_dequeue(&self, index: u32) {
        self.state().forced_dequeue = Some(index);
    }
}

impl VideoDriver for FakeDriver {
    fn query_capability(&self) -> io::Result<DeviceCapability> {
        let state = self.state();
        Ok(DeviceCapability {
            driver: "fake".to_string(),
            card: state.config.card.clone(),
            bus_info: "platform:fake-000".to_string(),
            version: 0x0006_0000,
            capabilities: Capabilities::DEVICE_CAPS
                | Capabilities::VIDEO_CAPTURE
                | Capabilities::VIDEO_OUTPUT
                | Capabilities::STREAMING,
            device_caps: Capabilities::VIDEO_CAPTURE
                | Capabilities::VIDEO_OUTPUT
                | Capabilities::STREAMING,
        })
    }

    fn set_format(&self, _direction: Direction, format: &PixFormat) -> io::Result<PixFormat> {
        let mut state = self.state();
        let config = &state.config;
        if config.reject_set_format {
            return Err(errno(libc::EINVAL));
        }

        let mut accepted = *format;
        if let Some(fourcc) = config.accepted_fourcc {
            accepted.fourcc = fourcc;
        }
        if let Some((width, height)) = config.max_size {
            accepted.width = accepted.width.min(width);
            accepted.height = accepted.height.min(height);
        }
        let natural = accepted.width * BYTES_PER_PIXEL + config.stride_padding;
        accepted.bytes_per_line = accepted.bytes_per_line.max(natural);
        accepted.size_image = accepted
            .size_image
            .max(accepted.bytes_per_line * accepted.height);
        accepted.field = config.field;

        state.format = Some(accepted);
        Ok(accepted)
    }

    fn request_buffers(&self, direction: Direction, _memory: Memory, count: u32) -> io::Result<u32> {
        let mut state = self.state();
        if state.config.reject_request_buffers {
            return Err(errno(libc::EINVAL));
        }
        if state.streaming.contains(&direction) {
            return Err(errno(libc::EBUSY));
        }

        let granted = state.config.grant.map_or(count, |grant| grant.min(count));
        let length = state.config.buffer_length;
        let mut slots = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            slots.push(memfd(&format!("fake-buffer-{index}"), length)?);
        }
        state.slots = slots;
        state.pending.clear();
        Ok(granted)
    }

    fn query_buffer(
        &self,
        _direction: Direction,
        _memory: Memory,
        index: u32,
    ) -> io::Result<BufferQuery> {
        let state = self.state();
        state.slot(index)?;
        Ok(BufferQuery {
            index,
            length: state.config.buffer_length as u32,
            offset: index * OFFSET_STEP,
        })
    }

    fn map_buffer(&self, query: &BufferQuery) -> io::Result<MmapMut> {
        let state = self.state();
        if state.config.reject_map {
            return Err(errno(libc::ENOMEM));
        }
        let slot = state.slot(query.index)?;
        // SAFETY: the memfd is private to this fake and sized to the buffer
        // length at creation.
        unsafe {
            MmapOptions::new()
                .len(query.length as usize)
                .map_mut(slot)
        }
    }

    fn export_buffer(&self, _direction: Direction, index: u32) -> io::Result<OwnedFd> {
        let mut state = self.state();
        let exported = state.slot(index)?.try_clone()?;
        state.exports += 1;
        Ok(OwnedFd::from(exported))
    }

    fn queue_buffer(&self, request: &QueueRequest) -> io::Result<()> {
        let mut state = self.state();
        state.slot(request.index)?;
        if state.pending.contains(&request.index) {
            return Err(errno(libc::EINVAL));
        }
        state.queued_log.push(*request);
        state.pending.push_back(request.index);
        Ok(())
    }

    fn dequeue_buffer(&self, direction: Direction, _memory: Memory) -> io::Result<DequeuedInfo> {
        let mut state = self.state();
        if let Some(code) = state.dequeue_errors.pop_front() {
            return Err(errno(code));
        }
        let index = match state.forced_dequeue.take() {
            Some(index) => index,
            None => {
                if !state.streaming.contains(&direction) {
                    return Err(errno(libc::EINVAL));
                }
                state.pending.pop_front().ok_or_else(|| errno(libc::EINVAL))?
            }
        };

        let length = state.config.buffer_length;
        if direction == Direction::Capture {
            if let Some(byte) = state.config.capture_pattern {
                state.slot(index)?.write_all_at(&vec![byte; length], 0)?;
            }
        }

        state.sequence += 1;
        let reported = if state.config.zero_length_on_dequeue {
            0
        } else {
            length as u32
        };
        Ok(DequeuedInfo {
            index,
            length: reported,
            bytes_used: match direction {
                Direction::Capture => length as u32,
                Direction::Output => 0,
            },
            sequence: state.sequence,
            flags: BufferFlags::MAPPED | BufferFlags::DONE,
        })
    }

    fn stream_on(&self, direction: Direction) -> io::Result<()> {
        let mut state = self.state();
        if state.config.reject_stream_on {
            return Err(errno(libc::EINVAL));
        }
        if !state.streaming.contains(&direction) {
            state.streaming.push(direction);
        }
        Ok(())
    }

    fn stream_off(&self, direction: Direction) -> io::Result<()> {
        let mut state = self.state();
        state.streaming.retain(|d| *d != direction);
        state.pending.clear();
        Ok(())
    }

    fn poll(&self, _direction: Direction) -> io::Result<Readiness> {
        Ok(self
            .state()
            .poll_script
            .pop_front()
            .unwrap_or(Readiness::Ready))
    }
}

/// Allocates memfds rounded up to whole pages.
#[derive(Debug, Default, Clone)]
pub struct MemfdAllocator {
    allocations: Arc<AtomicUsize>,
}

impl MemfdAllocator {
    /// Number of successful allocations so far, across clones.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }
}

impl BufferAllocator for MemfdAllocator {
    fn allocate(&self, size: usize) -> Result<DmaBuf> {
        if size == 0 {
            return Err(Error::InvalidAllocation(size));
        }
        let size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let file = memfd("fake-dmabuf", size).map_err(|source| Error::Drm {
            op: "memfd_create",
            source,
        })?;
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(DmaBuf::from_fd(OwnedFd::from(file), size))
    }
}
